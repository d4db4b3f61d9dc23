//! Pricing engine (component D, `spec.md` §4.1): a per-process in-memory
//! state machine computing the current quote for an (agent, context) pair
//! and recording activity under dry-run semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// `spec.md` §4.1 defaults.
#[derive(Debug, Clone)]
pub struct TrustDiscountConfig {
    pub enabled: bool,
    pub free_above: i32,
    pub discount_above: i32,
    pub discount_percent: u32,
}

impl Default for TrustDiscountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            free_above: 80,
            discount_above: 30,
            discount_percent: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub bonus_percent: u32,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            bonus_percent: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub base_sats: u64,
    pub progressive_multiplier: f64,
    pub progressive_cap: u64,
    pub trust_discount: TrustDiscountConfig,
    pub cooldown: CooldownConfig,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_sats: 1,
            progressive_multiplier: 1.5,
            progressive_cap: 50,
            trust_discount: TrustDiscountConfig::default(),
            cooldown: CooldownConfig::default(),
        }
    }
}

/// `spec.md` §6 "pricing breakdown object".
#[derive(Debug, Clone, PartialEq)]
pub struct Breakdown {
    pub base: u64,
    pub progressive: u64,
    pub prior_actions_in_context: u64,
    pub final_sats: u64,
    pub trust_score: Option<i32>,
    pub trust_discount: Option<u64>,
    pub cooldown_bonus: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub sats: u64,
    pub breakdown: Breakdown,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    pub contexts: usize,
    pub agents: usize,
    pub total_actions: usize,
}

const ANONYMOUS: &str = "anonymous";
const DEFAULT_CONTEXT: &str = "default";

/// Normalizes an optional raw agent id per `spec.md` §3: unknown/missing
/// agents collapse to `"anonymous"`.
pub fn normalize_agent(agent_id: Option<&str>) -> String {
    match agent_id {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => ANONYMOUS.to_string(),
    }
}

/// Normalizes an optional raw context id per `spec.md` §3: missing context
/// collapses to `"default"`.
pub fn normalize_context(context_id: Option<&str>) -> String {
    match context_id {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => DEFAULT_CONTEXT.to_string(),
    }
}

struct State {
    activity: HashMap<String, Vec<(String, u64)>>,
    last_action: HashMap<String, u64>,
}

/// The stateful quote/commit engine. Cloning shares the underlying state
/// (`Arc`-free here since the engine itself is usually held behind an
/// `Arc<Engine>` by callers, mirroring the teacher's `Arc<Mutex<_>>` handle
/// pattern for shared backend state).
pub struct Engine {
    config: PricingConfig,
    state: Mutex<State>,
}

impl Engine {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                activity: HashMap::new(),
                last_action: HashMap::new(),
            }),
        }
    }

    /// `spec.md` §4.1 "calculate". `now_ms` is supplied by the caller so
    /// tests can control time deterministically; production callers pass
    /// the current wall-clock time.
    pub fn calculate(
        &self,
        agent_id: &str,
        context_id: &str,
        trust_score: Option<i32>,
        dry_run: bool,
        now_ms: u64,
    ) -> Quote {
        let mut state = self.state.lock().expect("pricing state mutex poisoned");

        let k = state
            .activity
            .get(context_id)
            .map(|entries| entries.iter().filter(|(a, _)| a == agent_id).count())
            .unwrap_or(0) as u32;

        let progressive = if k == 0 {
            self.config.base_sats
        } else {
            let grown = (self.config.base_sats as f64) * self.config.progressive_multiplier.powi(k as i32);
            (grown.ceil() as u64).min(self.config.progressive_cap)
        };

        let mut price = progressive;
        let mut trust_discount = None;
        let mut cooldown_bonus = None;

        if self.config.trust_discount.enabled {
            if let Some(score) = trust_score {
                if score >= self.config.trust_discount.free_above {
                    trust_discount = Some(price);
                    price = 0;
                } else if score >= self.config.trust_discount.discount_above {
                    let discount = price * self.config.trust_discount.discount_percent as u64 / 100;
                    trust_discount = Some(discount);
                    price = price.saturating_sub(discount).max(1);
                }
            }
        }

        if self.config.cooldown.enabled && price > 0 {
            let last = state.last_action.get(agent_id).copied();
            let outside_window = match last {
                None => true,
                Some(last_ts) => now_ms.saturating_sub(last_ts) > self.config.cooldown.window_ms,
            };
            if outside_window {
                let bonus = price * self.config.cooldown.bonus_percent as u64 / 100;
                cooldown_bonus = Some(bonus);
                price = price.saturating_sub(bonus).max(1);
            }
        }

        let sats = price;

        if !dry_run {
            state
                .activity
                .entry(context_id.to_string())
                .or_default()
                .push((agent_id.to_string(), now_ms));
            state.last_action.insert(agent_id.to_string(), now_ms);
        }

        Quote {
            sats,
            breakdown: Breakdown {
                base: self.config.base_sats,
                progressive,
                prior_actions_in_context: k as u64,
                final_sats: sats,
                trust_score,
                trust_discount,
                cooldown_bonus,
            },
        }
    }

    /// Drops activity/last-action entries older than `max_age_ms`
    /// (`spec.md` §4.1 "cleanup", default 24h horizon per §3 "Activity
    /// record" lifecycle).
    pub fn cleanup(&self, max_age_ms: u64, now_ms: u64) {
        let mut state = self.state.lock().expect("pricing state mutex poisoned");
        let cutoff = now_ms.saturating_sub(max_age_ms);

        state.activity.retain(|_, entries| {
            entries.retain(|(_, ts)| *ts >= cutoff);
            !entries.is_empty()
        });
        state.last_action.retain(|_, ts| *ts >= cutoff);
    }

    pub fn stats(&self) -> Stats {
        let state = self.state.lock().expect("pricing state mutex poisoned");
        let total_actions = state.activity.values().map(|v| v.len()).sum();
        Stats {
            contexts: state.activity.len(),
            agents: state.last_action.len(),
            total_actions,
        }
    }

    /// Testing hook: erases all activity and last-action state
    /// (`spec.md` §4.1 "reset").
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("pricing state mutex poisoned");
        state.activity.clear();
        state.last_action.clear();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_cooldown_no_trust() -> PricingConfig {
        PricingConfig {
            trust_discount: TrustDiscountConfig {
                enabled: false,
                ..Default::default()
            },
            cooldown: CooldownConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn base_case_first_action() {
        let engine = Engine::new(no_cooldown_no_trust());
        let q = engine.calculate("a", "t", None, false, 0);
        assert_eq!(q.sats, 1);
        assert_eq!(q.breakdown.prior_actions_in_context, 0);
    }

    #[test]
    fn progression_matches_the_spec_sequence() {
        let engine = Engine::new(no_cooldown_no_trust());
        let expected = [1, 2, 3, 4, 6, 8, 12, 18, 26, 39];
        for (i, &want) in expected.iter().enumerate() {
            let q = engine.calculate("a", "t", None, false, i as u64);
            assert_eq!(q.sats, want, "call #{i}");
        }
        let eleventh = engine.calculate("a", "t", None, true, 100);
        assert_eq!(eleventh.sats, 50);
    }

    #[test]
    fn cross_context_independence() {
        let engine = Engine::new(no_cooldown_no_trust());
        for i in 0..3 {
            engine.calculate("a", "t1", None, false, i);
        }
        let q = engine.calculate("a", "t2", None, true, 100);
        assert_eq!(q.sats, 1);
    }

    #[test]
    fn trust_free_pass() {
        let mut config = no_cooldown_no_trust();
        config.base_sats = 10;
        config.trust_discount.enabled = true;
        let engine = Engine::new(config);
        let q = engine.calculate("a", "t", Some(85), false, 0);
        assert_eq!(q.sats, 0);
        assert_eq!(q.breakdown.trust_discount, Some(10));
    }

    #[test]
    fn trust_partial_discount() {
        let mut config = no_cooldown_no_trust();
        config.base_sats = 10;
        config.trust_discount.enabled = true;
        config.trust_discount.discount_percent = 50;
        let engine = Engine::new(config);
        let q = engine.calculate("a", "t", Some(50), false, 0);
        assert_eq!(q.sats, 5);
    }

    #[test]
    fn cooldown_bonus_on_first_ever_action() {
        let mut config = no_cooldown_no_trust();
        config.base_sats = 10;
        config.cooldown.enabled = true;
        config.cooldown.window_ms = 0;
        config.cooldown.bonus_percent = 25;
        let engine = Engine::new(config);
        let q = engine.calculate("a", "t", None, false, 0);
        assert_eq!(q.sats, 8);
    }

    #[test]
    fn dry_run_does_not_affect_stats_or_activity() {
        let engine = Engine::new(no_cooldown_no_trust());
        engine.calculate("a", "t", None, true, 0);
        let stats = engine.stats();
        assert_eq!(stats.total_actions, 0);
        assert_eq!(stats.contexts, 0);
    }

    #[test]
    fn committing_calculate_advances_stats() {
        let engine = Engine::new(no_cooldown_no_trust());
        engine.calculate("a", "t", None, false, 0);
        let stats = engine.stats();
        assert_eq!(stats.total_actions, 1);
        assert_eq!(stats.contexts, 1);
        assert_eq!(stats.agents, 1);
    }

    #[test]
    fn normalize_helpers_apply_spec_defaults() {
        assert_eq!(normalize_agent(None), "anonymous");
        assert_eq!(normalize_agent(Some("")), "anonymous");
        assert_eq!(normalize_context(None), "default");
        assert_eq!(normalize_context(Some("")), "default");
        assert_eq!(normalize_agent(Some("alice")), "alice");
    }

    #[test]
    fn cleanup_drops_entries_older_than_horizon() {
        let engine = Engine::new(no_cooldown_no_trust());
        engine.calculate("a", "t", None, false, 0);
        engine.cleanup(1_000, 10_000);
        let stats = engine.stats();
        assert_eq!(stats.total_actions, 0);
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.agents, 0);
    }

    #[test]
    fn reset_erases_all_state() {
        let engine = Engine::new(no_cooldown_no_trust());
        engine.calculate("a", "t", None, false, 0);
        engine.reset();
        assert_eq!(engine.stats().total_actions, 0);
    }

    #[test]
    fn unknown_trust_score_is_distinct_from_zero_but_treated_identically() {
        let mut config = no_cooldown_no_trust();
        config.base_sats = 10;
        config.trust_discount.enabled = true;
        let engine = Engine::new(config.clone());
        let without_score = engine.calculate("a", "t", None, true, 0);

        let engine2 = Engine::new(config);
        let with_zero = engine2.calculate("a", "t", Some(0), true, 0);
        assert_eq!(without_score.sats, with_zero.sats);
        assert_eq!(without_score.sats, 10);
    }
}
