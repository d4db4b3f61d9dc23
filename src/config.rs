//! Process configuration (`spec.md` §6 "Configuration surface", expanded
//! per `SPEC_FULL.md` §9.3), loaded the way the teacher's `bin/server.rs`
//! already does: a TOML file layered with `APP_`-prefixed environment
//! overrides via the `config` crate.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Deserialize;

use crate::pricing::{CooldownConfig, PricingConfig, TrustDiscountConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: Server,
    /// HMAC key: hex-64 or UTF-8 per `spec.md` §4.2 step 3.
    pub secret: String,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub pricing: Option<PricingOverrides>,
    #[serde(default = "TrustConfig::default_attestation")]
    pub trust: TrustConfig,
    #[serde(default)]
    pub invoice_ttl_secs: Option<u64>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    pub host: IpAddr,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalletConfig {
    /// Self-contained in-process wallet; used for demos and tests.
    Stub,
    /// A hosted Lightning node reachable over its REST interface.
    Hosted {
        base_url: String,
        macaroon_hex: String,
    },
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrustConfig {
    Static {
        scores: HashMap<String, i32>,
    },
    Rest {
        base_url: String,
    },
    Attestation {
        relays: Vec<String>,
        #[serde(default = "TrustConfig::default_domain_label")]
        domain_label: String,
    },
}

impl TrustConfig {
    fn default_domain_label() -> String {
        "toll-gate-reputation".to_string()
    }

    /// Default per `spec.md` §6 "trust (optional): resolver instance;
    /// default = attestation-network variant with preset relays."
    fn default_attestation() -> TrustConfig {
        TrustConfig::Attestation {
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
            ],
            domain_label: Self::default_domain_label(),
        }
    }
}

/// Any subset of `spec.md` §4.1's parameters may be overridden.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PricingOverrides {
    pub base_sats: Option<u64>,
    pub progressive_multiplier: Option<f64>,
    pub progressive_cap: Option<u64>,
    pub trust_discount: Option<TrustDiscountOverrides>,
    pub cooldown: Option<CooldownOverrides>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrustDiscountOverrides {
    pub enabled: Option<bool>,
    pub free_above: Option<i32>,
    pub discount_above: Option<i32>,
    pub discount_percent: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CooldownOverrides {
    pub enabled: Option<bool>,
    pub window_ms: Option<u64>,
    pub bonus_percent: Option<u32>,
}

impl PricingOverrides {
    pub fn apply(&self, mut base: PricingConfig) -> PricingConfig {
        if let Some(v) = self.base_sats {
            base.base_sats = v;
        }
        if let Some(v) = self.progressive_multiplier {
            base.progressive_multiplier = v;
        }
        if let Some(v) = self.progressive_cap {
            base.progressive_cap = v;
        }
        if let Some(t) = &self.trust_discount {
            base.trust_discount = TrustDiscountConfig {
                enabled: t.enabled.unwrap_or(base.trust_discount.enabled),
                free_above: t.free_above.unwrap_or(base.trust_discount.free_above),
                discount_above: t.discount_above.unwrap_or(base.trust_discount.discount_above),
                discount_percent: t
                    .discount_percent
                    .unwrap_or(base.trust_discount.discount_percent),
            };
        }
        if let Some(c) = &self.cooldown {
            base.cooldown = CooldownConfig {
                enabled: c.enabled.unwrap_or(base.cooldown.enabled),
                window_ms: c.window_ms.unwrap_or(base.cooldown.window_ms),
                bonus_percent: c.bonus_percent.unwrap_or(base.cooldown.bonus_percent),
            };
        }
        base
    }
}

/// Per-route configuration (`spec.md` §4.5). `context_from`/`agent_from` are
/// dotted paths into the request body; a missing path falls back to
/// conventional sources (`spec.md` §4.5 "fall back to conventional
/// sources (e.g. X-Agent-Id header; anonymous)").
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub context_from: Option<String>,
    #[serde(default)]
    pub agent_from: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RouteConfig {
    pub fn description_for(&self, context_id: &str) -> String {
        match &self.description {
            Some(d) => format!("{d}: {context_id}"),
            None => format!("{}: {context_id}", self.path),
        }
    }
}
