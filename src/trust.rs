//! Trust resolver (component E, `spec.md` §4.4): a pluggable
//! `getScore(agentId) -> 0..100 | unknown` contract with caching and
//! bounded latency, mirroring the teacher's TTL-cached backend lookups
//! (`lnd::Client`'s invoice cache) and the credential-cache pattern in
//! `other_examples/39f36b69_pretyflaco-openagents__crates-openagents-l402-src-lib.rs.rs`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use itertools::Itertools;
use nostr_sdk::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

/// Hard deadline for a trust lookup (`spec.md` §5 "trust lookup 3s hard").
pub const LOOKUP_DEADLINE: Duration = Duration::from_secs(3);

/// Default TTL for cached scores (`spec.md` §4.4 "Caching... default 5 min").
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("trust resolver backend error: {0}")]
    Backend(String),
    #[error("trust lookup timed out")]
    Timeout,
}

/// `getScore(agentId) -> integer in [0,100] | unknown`
/// (`spec.md` §4.4 "Contract").
#[async_trait]
pub trait TrustResolver: Send + Sync {
    async fn get_score(&self, agent_id: &str) -> Result<Option<i32>, TrustError>;

    /// Drops expired cache entries (`spec.md` §5 "MUST support a periodic
    /// sweep"). A no-op for resolvers with no cache of their own.
    fn sweep(&self) {}
}

/// Races `resolver.get_score(agent_id)` against [`LOOKUP_DEADLINE`] and
/// degrades any timeout or backend error to `unknown`, per `spec.md` §7
/// "Trust resolver error or timeout -> degrade: treat as unknown score".
pub async fn get_score_bounded(resolver: &dyn TrustResolver, agent_id: &str) -> Option<i32> {
    match tokio::time::timeout(LOOKUP_DEADLINE, resolver.get_score(agent_id)).await {
        Ok(Ok(score)) => score,
        Ok(Err(e)) => {
            warn!(error = %e, agent_id, "trust resolver error, degrading to unknown");
            None
        }
        Err(_) => {
            warn!(agent_id, "trust lookup exceeded 3s deadline, degrading to unknown");
            None
        }
    }
}

fn clamp_score(raw: f64) -> i32 {
    raw.round().clamp(0.0, 100.0) as i32
}

struct CacheEntry {
    score: Option<i32>,
    inserted_at: Instant,
}

/// Shared TTL cache wrapper: any [`TrustResolver`] can be wrapped to cache
/// its results, per `spec.md` §4.4 "Caching: LRU or plain map... with TTL".
/// On backend error, a stale entry is returned rather than `unknown`
/// ("on backend error, stale entries MAY be returned").
pub struct CachedResolver<R> {
    inner: R,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl<R: TrustResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            ttl: CACHE_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, agent_id: &str) -> Option<Option<i32>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(agent_id)?;
        if entry.inserted_at.elapsed() < self.ttl {
            Some(entry.score)
        } else {
            None
        }
    }

    fn stale(&self, agent_id: &str) -> Option<Option<i32>> {
        self.cache.read().ok()?.get(agent_id).map(|e| e.score)
    }

    fn store(&self, agent_id: &str, score: Option<i32>) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                agent_id.to_string(),
                CacheEntry {
                    score,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Removes cache entries whose TTL has expired
    /// (`spec.md` §5 "MUST support a periodic sweep").
    pub fn sweep(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        }
    }
}

#[async_trait]
impl<R: TrustResolver> TrustResolver for CachedResolver<R> {
    async fn get_score(&self, agent_id: &str) -> Result<Option<i32>, TrustError> {
        if let Some(score) = self.cached(agent_id) {
            return Ok(score);
        }
        match self.inner.get_score(agent_id).await {
            Ok(score) => {
                self.store(agent_id, score);
                Ok(score)
            }
            Err(e) => {
                if let Some(stale) = self.stale(agent_id) {
                    debug!(agent_id, "serving stale trust score after backend error");
                    return Ok(stale);
                }
                Err(e)
            }
        }
    }

    fn sweep(&self) {
        CachedResolver::sweep(self);
    }
}

/// In-memory map lookup; unknown if absent (`spec.md` §4.4 "Static").
#[derive(Default, Clone)]
pub struct StaticTrust {
    scores: HashMap<String, i32>,
}

impl StaticTrust {
    pub fn new(scores: HashMap<String, i32>) -> Self {
        Self {
            scores: scores
                .into_iter()
                .map(|(k, v)| (k, v.clamp(0, 100)))
                .collect(),
        }
    }
}

#[async_trait]
impl TrustResolver for StaticTrust {
    async fn get_score(&self, agent_id: &str) -> Result<Option<i32>, TrustError> {
        Ok(self.scores.get(agent_id).copied())
    }
}

/// `GET <base>/v1/score/<agentId>`; parse `{ score: number }`; unknown on
/// any non-200, timeout, or parse failure (`spec.md` §4.4 "REST").
pub struct RestTrust {
    base_url: String,
    client: reqwest::Client,
}

impl RestTrust {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(serde::Deserialize)]
struct ScoreResponse {
    score: f64,
}

#[async_trait]
impl TrustResolver for RestTrust {
    async fn get_score(&self, agent_id: &str) -> Result<Option<i32>, TrustError> {
        let url = format!("{}/v1/score/{agent_id}", self.base_url);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "rest trust resolver request failed");
                return Ok(None);
            }
        };
        if !resp.status().is_success() {
            return Ok(None);
        }
        match resp.json::<ScoreResponse>().await {
            Ok(body) => Ok(Some(clamp_score(body.score))),
            Err(_) => Ok(None),
        }
    }
}

/// Per-attestation-type weight used in the quality aggregate
/// (`spec.md` §4.4 "attestation-type weight").
fn type_weight(attestation_type: &str) -> f64 {
    match attestation_type {
        "service-quality" => 1.5,
        "identity-continuity" => 1.0,
        "general-trust" => 0.8,
        "work-completed" => 1.2,
        _ => 0.8,
    }
}

const HALF_LIFE_SECS: f64 = 90.0 * 24.0 * 60.0 * 60.0;
const NETWORK_SIZE_FOR_FULL_CONFIDENCE: f64 = 5.0;
const FETCH_LIMIT: usize = 50;

/// One attestation event relevant to scoring an agent.
#[derive(Debug, Clone)]
struct Attestation {
    attester: String,
    attestation_type: String,
    age_secs: f64,
}

/// Aggregates deduplicated attestations into a 0..100 score, per `spec.md`
/// §4.4's quality/networkFactor formula. Returns `None` when given no
/// attestations; callers distinguish "no events at all" (unknown) from
/// "events seen but all self-attested" (a real zero) before calling this.
fn aggregate_score(attestations: &[Attestation]) -> Option<i32> {
    if attestations.is_empty() {
        return None;
    }

    let deduped: Vec<&Attestation> = attestations
        .iter()
        .into_group_map_by(|a| a.attester.clone())
        .into_values()
        .map(|mut group| {
            group.sort_by(|a, b| a.age_secs.partial_cmp(&b.age_secs).unwrap());
            group.into_iter().next().unwrap()
        })
        .collect();

    let unique_attesters = deduped.len();
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for a in &deduped {
        let weight = type_weight(&a.attestation_type);
        let decay = 0.5_f64.powf(a.age_secs / HALF_LIFE_SECS);
        weighted_sum += weight * decay;
        weight_sum += weight;
    }

    if weight_sum == 0.0 {
        return Some(0);
    }

    let quality = weighted_sum / weight_sum;
    let network_factor = (unique_attesters as f64 / NETWORK_SIZE_FOR_FULL_CONFIDENCE).min(1.0);
    Some(clamp_score(network_factor * quality * 100.0))
}

/// Classifies a fetch result into `spec.md` §4.4's three outcomes: no events
/// fetched at all -> unknown; events fetched but all self-attested (and so
/// absent from `attestations`, already filtered by the caller) -> a real
/// zero; otherwise the aggregated score.
fn score_from_fetch(total_events_fetched: usize, attestations: &[Attestation]) -> Option<i32> {
    if total_events_fetched == 0 {
        return None;
    }
    Some(aggregate_score(attestations).unwrap_or(0))
}

/// Default trust resolver variant: subscribes to a set of Nostr relays for
/// attestation events about the subject agent's pubkey (`spec.md` §4.4
/// "Attestation network (default)").
pub struct AttestationTrust {
    client: Client,
    domain_label: String,
}

impl AttestationTrust {
    /// `relays` is the preset relay list; `domain_label` tags the
    /// attestation-event kind this resolver queries for.
    pub async fn new(relays: &[String], domain_label: impl Into<String>) -> Self {
        let client = Client::default();
        for relay in relays {
            if let Err(e) = client.add_relay(relay.as_str()).await {
                warn!(relay, error = %e, "failed to add attestation relay");
            }
        }
        client.connect().await;
        Self {
            client,
            domain_label: domain_label.into(),
        }
    }
}

#[async_trait]
impl TrustResolver for AttestationTrust {
    async fn get_score(&self, agent_id: &str) -> Result<Option<i32>, TrustError> {
        let subject = PublicKey::parse(agent_id)
            .map_err(|e| TrustError::Backend(format!("invalid agent pubkey: {e}")))?;

        let filter = Filter::new()
            .kind(Kind::Custom(30382))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::P), subject.to_hex())
            .custom_tag(SingleLetterTag::lowercase(Alphabet::D), self.domain_label.clone())
            .limit(FETCH_LIMIT);

        let events = self
            .client
            .fetch_events(filter, LOOKUP_DEADLINE)
            .await
            .map_err(|e| TrustError::Backend(e.to_string()))?;

        let now = Timestamp::now();
        let attestations: Vec<Attestation> = events
            .iter()
            .filter(|e| e.pubkey != subject)
            .map(|e| Attestation {
                attester: e.pubkey.to_hex(),
                attestation_type: tag_value(e, "attestation_type").unwrap_or_default(),
                age_secs: now.as_secs().saturating_sub(e.created_at.as_secs()) as f64,
            })
            .collect();

        Ok(score_from_fetch(events.len(), &attestations))
    }
}

fn tag_value(event: &Event, tag_name: &str) -> Option<String> {
    event
        .tags
        .iter()
        .find(|t| t.as_slice().first().map(|s| s.as_str()) == Some(tag_name))
        .and_then(|t| t.as_slice().get(1))
        .cloned()
}
