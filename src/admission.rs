//! Admission middleware (component F, `spec.md` §4.5): the per-request
//! state machine gluing components A-E together, mirroring the shape of
//! the teacher's `api::handle_protected` (inspect headers, mint or verify,
//! then hand off to downstream logic) but built around this spec's own
//! quote/commit and macaroon contracts instead of the `macaroon` crate.

use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::{error, info, warn};
use warp::http::{HeaderMap, HeaderValue, StatusCode};
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::Reply;

use crate::config::RouteConfig;
use crate::macaroon::{Caveat, Macaroon, VerifyContext};
use crate::pricing::{self, Engine};
use crate::trust::{self, TrustResolver};
use crate::wallet::Wallet;

/// Default invoice TTL (`spec.md` §4.5 "invoiceTtlSecs... default 600").
const DEFAULT_INVOICE_TTL_SECS: u64 = 600;

/// Shared state the admission middleware needs for every request.
pub struct AdmissionState {
    pub secret: String,
    pub pricing: Arc<Engine>,
    pub wallet: Arc<dyn Wallet>,
    pub trust: Arc<dyn TrustResolver>,
    pub invoice_ttl_secs: u64,
}

impl AdmissionState {
    pub fn new(
        secret: impl Into<String>,
        pricing: Arc<Engine>,
        wallet: Arc<dyn Wallet>,
        trust: Arc<dyn TrustResolver>,
        invoice_ttl_secs: Option<u64>,
    ) -> Self {
        Self {
            secret: secret.into(),
            pricing,
            wallet,
            trust,
            invoice_ttl_secs: invoice_ttl_secs.unwrap_or(DEFAULT_INVOICE_TTL_SECS),
        }
    }
}

/// What the admission layer decided, handed to the downstream handler
/// (`spec.md` §4.5: `req.tollPaid`, `req.tollFree`, `tollError`).
#[derive(Debug, Clone, Default)]
pub struct AdmissionOutcome {
    pub toll_paid: bool,
    pub toll_free: bool,
    pub toll_error: Option<String>,
    pub agent_id: String,
    pub context_id: String,
}

/// Extracts a dotted path (e.g. `"body.threadId"`) out of a JSON value.
/// `spec.md` §9 "Dynamic dotted-path extraction": modeled as a small
/// interpreter over the request's structured fields.
fn extract_dotted_path(indata: &Value, path: &str) -> Option<String> {
    let mut current = indata;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_agent_id(route: &RouteConfig, indata: &Value, headers: &HeaderMap) -> String {
    let from_path = route
        .agent_from
        .as_deref()
        .and_then(|p| extract_dotted_path(indata, p));
    let from_header = headers
        .get("X-Agent-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    pricing::normalize_agent(from_path.or(from_header).as_deref())
}

fn extract_context_id(route: &RouteConfig, indata: &Value) -> String {
    let from_path = route
        .context_from
        .as_deref()
        .and_then(|p| extract_dotted_path(indata, p));
    pricing::normalize_context(from_path.as_deref())
}

fn unauthorized(detail: impl Into<String>) -> Response {
    let detail = detail.into();
    warn!(detail, "L402 credential rejected");
    let body = json!({
        "error": "Invalid L402 credentials",
        "detail": detail,
    });
    let mut resp = warp::reply::json(&body).into_response();
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Parses `"L402 <base64-macaroon>:<hex-preimage>"`, case-insensitive
/// scheme tag, exactly one colon separating the two parts (`spec.md` §6
/// "HTTP retry").
#[allow(clippy::result_large_err)]
fn parse_l402_header(value: &str) -> Result<(&str, &str), Response> {
    let trimmed = value.trim();
    let rest = trimmed
        .strip_prefix("L402 ")
        .or_else(|| trimmed.strip_prefix("l402 "))
        .or_else(|| {
            if trimmed.len() > 5 && trimmed[..5].eq_ignore_ascii_case("l402 ") {
                Some(&trimmed[5..])
            } else {
                None
            }
        })
        .ok_or_else(|| unauthorized("Invalid L402 format: missing scheme"))?;

    let mut parts = rest.splitn(2, ':');
    let macaroon_b64 = parts.next().unwrap_or("");
    let preimage_hex = parts
        .next()
        .ok_or_else(|| unauthorized("Invalid L402 format: missing preimage"))?;

    if preimage_hex.contains(':') {
        return Err(unauthorized("Invalid L402 format: too many colons"));
    }
    if macaroon_b64.is_empty() || preimage_hex.is_empty() {
        return Err(unauthorized("Invalid L402 format: empty component"));
    }

    Ok((macaroon_b64, preimage_hex))
}

/// Drives the full state machine of `spec.md` §4.5 for one request, then
/// invokes `downstream` with the resulting [`AdmissionOutcome`] to produce
/// the final response — mirroring how the teacher's `handle_protected`
/// inlines the decision and the proxied call in one function.
pub async fn admit<F, Fut>(
    route: &RouteConfig,
    state: &AdmissionState,
    headers: &HeaderMap,
    indata: &Value,
    endpoint: &str,
    method: &str,
    downstream: F,
) -> Response
where
    F: FnOnce(AdmissionOutcome) -> Fut,
    Fut: Future<Output = Response>,
{
    let auth_header = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(auth) = auth_header {
        if auth.len() >= 5 && auth[..5].eq_ignore_ascii_case("l402 ") || auth.to_ascii_lowercase().starts_with("l402 ") {
            return admit_retry(route, state, headers, &auth, indata, endpoint, method, downstream).await;
        }
    }

    admit_challenge(route, state, headers, indata, endpoint, method, downstream).await
}

#[allow(clippy::too_many_arguments)]
async fn admit_retry<F, Fut>(
    route: &RouteConfig,
    state: &AdmissionState,
    headers: &HeaderMap,
    auth: &str,
    indata: &Value,
    endpoint: &str,
    method: &str,
    downstream: F,
) -> Response
where
    F: FnOnce(AdmissionOutcome) -> Fut,
    Fut: Future<Output = Response>,
{
    let (macaroon_b64, preimage_hex) = match parse_l402_header(auth) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };

    let macaroon = match Macaroon::decode(macaroon_b64) {
        Ok(m) => m,
        Err(_) => return unauthorized("Invalid macaroon encoding"),
    };

    if !crate::wallet::verify_preimage(preimage_hex, &macaroon.id) {
        return unauthorized("Preimage does not match payment hash");
    }

    let agent_id = extract_agent_id(route, indata, headers);
    let context_id = extract_context_id(route, indata);

    let verify_ctx = VerifyContext {
        endpoint,
        method,
        context_id: &context_id,
        agent_id: &agent_id,
    };

    if let Err(e) = macaroon.verify(&state.secret, &verify_ctx) {
        return unauthorized(e.to_string());
    }

    // The macaroon's caveats bind (context, agent); since verification just
    // passed, the retry's extracted identifiers agree with those caveats.
    // Commit pricing against the retry's own values, never a value embedded
    // in the macaroon (spec.md §4.5 "Quote/commit separation").
    let trust_score = trust::get_score_bounded(state.trust.as_ref(), &agent_id).await;
    state
        .pricing
        .calculate(&agent_id, &context_id, trust_score, false, pricing::now_ms());

    info!(agent_id, context_id, "L402 retry admitted, activity committed");

    downstream(AdmissionOutcome {
        toll_paid: true,
        toll_free: false,
        toll_error: None,
        agent_id,
        context_id,
    })
    .await
}

async fn admit_challenge<F, Fut>(
    route: &RouteConfig,
    state: &AdmissionState,
    headers: &HeaderMap,
    indata: &Value,
    endpoint: &str,
    method: &str,
    downstream: F,
) -> Response
where
    F: FnOnce(AdmissionOutcome) -> Fut,
    Fut: Future<Output = Response>,
{
    let agent_id = extract_agent_id(route, indata, headers);
    let context_id = extract_context_id(route, indata);

    let trust_score = trust::get_score_bounded(state.trust.as_ref(), &agent_id).await;
    let quote = state
        .pricing
        .calculate(&agent_id, &context_id, trust_score, true, pricing::now_ms());

    if quote.sats == 0 {
        info!(agent_id, context_id, "quote is zero, admitting toll-free");
        return downstream(AdmissionOutcome {
            toll_paid: false,
            toll_free: true,
            toll_error: None,
            agent_id,
            context_id,
        })
        .await;
    }

    let description = route.description_for(&context_id);

    // Fail-open policy (spec.md §7): any internal error minting the
    // challenge is a deliberate availability bias, not a 5xx.
    match mint_challenge(state, &agent_id, &context_id, endpoint, method, &quote, &description).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, agent_id, context_id, "challenge minting failed, failing open");
            downstream(AdmissionOutcome {
                toll_paid: false,
                toll_free: false,
                toll_error: Some(e.to_string()),
                agent_id,
                context_id,
            })
            .await
        }
    }
}

async fn mint_challenge(
    state: &AdmissionState,
    agent_id: &str,
    context_id: &str,
    endpoint: &str,
    method: &str,
    quote: &pricing::Quote,
    description: &str,
) -> Result<Response, anyhow::Error> {
    let sats = quote.sats;
    let invoice = state.wallet.create_invoice(sats, description).await?;

    let expires_at = now_secs() + state.invoice_ttl_secs as i64;
    let macaroon = Macaroon::create(
        &state.secret,
        &invoice.payment_hash,
        vec![
            Caveat::ExpiresAt(expires_at),
            Caveat::Endpoint(endpoint.to_string()),
            Caveat::Method(method.to_string()),
            Caveat::Context(context_id.to_string()),
            Caveat::Agent(agent_id.to_string()),
        ],
    );
    let encoded = macaroon.encode();

    let header_value = format!(
        r#"L402 invoice="{}", macaroon="{}""#,
        invoice.bolt11, encoded
    );

    let mut body = json!({
        "status": 402,
        "message": "Payment Required",
        "protocol": "L402",
        "paymentHash": invoice.payment_hash,
        "invoice": invoice.bolt11,
        "macaroon": encoded,
        "amountSats": sats,
        "contextId": context_id,
        "description": description,
        "pricing": {
            "base": quote.breakdown.base,
            "progressive": quote.breakdown.progressive,
            "priorActionsInContext": quote.breakdown.prior_actions_in_context,
            "final": quote.breakdown.final_sats,
        },
        "instructions": {
            "step1": "Pay the invoice via any Lightning wallet.",
            "step2": "Obtain the payment preimage from your wallet.",
            "step3": format!("Retry with 'Authorization: L402 {encoded}:<preimage>'."),
        },
    });

    if let Some(score) = quote.breakdown.trust_score {
        body["pricing"]["trustScore"] = json!(score);
    }
    if let Some(discount) = quote.breakdown.trust_discount {
        body["pricing"]["trustDiscount"] = json!(discount);
    }
    if let Some(bonus) = quote.breakdown.cooldown_bonus {
        body["pricing"]["cooldownBonus"] = json!(bonus);
    }

    let mut resp = warp::reply::json(&body).into_response();
    *resp.status_mut() = StatusCode::PAYMENT_REQUIRED;
    resp.headers_mut().insert(
        warp::http::header::WWW_AUTHENTICATE,
        HeaderValue::from_str(&header_value)?,
    );
    Ok(resp)
}

/// Parses a request body as JSON, defaulting to an empty object for bodies
/// that aren't present or aren't valid JSON (dotted-path extraction then
/// simply finds nothing and falls back per `spec.md` §4.5).
pub fn parse_body(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricingConfig;
    use crate::trust::StaticTrust;
    use crate::wallet::StubWallet;
    use std::collections::HashMap;

    fn route() -> RouteConfig {
        RouteConfig {
            path: "/thread/reply".to_string(),
            method: "POST".to_string(),
            context_from: Some("threadId".to_string()),
            agent_from: Some("agentId".to_string()),
            description: Some("post a reply".to_string()),
        }
    }

    fn state_with(wallet: StubWallet) -> AdmissionState {
        AdmissionState::new(
            "test-secret",
            Arc::new(Engine::new(PricingConfig::default())),
            Arc::new(wallet),
            Arc::new(StaticTrust::default()),
            None,
        )
    }

    #[tokio::test]
    async fn unauthenticated_request_yields_402_with_decodable_macaroon() {
        let state = state_with(StubWallet::new());
        let indata = json!({ "threadId": "t1", "agentId": "alice" });
        let resp = admit(
            &route(),
            &state,
            &HeaderMap::new(),
            &indata,
            "/thread/reply",
            "POST",
            |_outcome| async { warp::reply::with_status("ok", StatusCode::OK).into_response() },
        )
        .await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert!(resp.headers().contains_key(warp::http::header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn full_round_trip_admits_the_retry_and_commits_activity() {
        let wallet = StubWallet::new();
        let route = route();
        let indata = json!({ "threadId": "t1", "agentId": "alice" });

        let state = state_with(wallet.clone());
        let challenge = admit(
            &route,
            &state,
            &HeaderMap::new(),
            &indata,
            "/thread/reply",
            "POST",
            |_| async { warp::reply::with_status("ok", StatusCode::OK).into_response() },
        )
        .await;
        assert_eq!(challenge.status(), StatusCode::PAYMENT_REQUIRED);

        let body: Value = serde_json::from_slice(
            &warp::hyper::body::to_bytes(challenge.into_body())
                .await
                .unwrap(),
        )
        .unwrap();
        let payment_hash = body["paymentHash"].as_str().unwrap().to_string();
        let macaroon_b64 = body["macaroon"].as_str().unwrap().to_string();

        let invoice = wallet.lookup_invoice(&payment_hash).await.unwrap();
        let preimage = invoice.preimage.clone().unwrap();
        wallet.settle(&payment_hash, &preimage).await;

        let mut headers = HeaderMap::new();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("L402 {macaroon_b64}:{preimage}")).unwrap(),
        );

        let mut called = 0;
        let final_resp = admit(
            &route,
            &state,
            &headers,
            &indata,
            "/thread/reply",
            "POST",
            |outcome| {
                called += 1;
                assert!(outcome.toll_paid);
                async move { warp::reply::with_status("ok", StatusCode::OK).into_response() }
            },
        )
        .await;
        assert_eq!(final_resp.status(), StatusCode::OK);
        assert_eq!(called, 1);
        assert_eq!(state.pricing.stats().total_actions, 1);

        // A third unauthenticated request should now quote a higher price.
        let second_challenge = admit(
            &route,
            &state,
            &HeaderMap::new(),
            &indata,
            "/thread/reply",
            "POST",
            |_| async { warp::reply::with_status("ok", StatusCode::OK).into_response() },
        )
        .await;
        let body2: Value = serde_json::from_slice(
            &warp::hyper::body::to_bytes(second_challenge.into_body())
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(body2["amountSats"].as_u64().unwrap() >= 2);
    }

    #[tokio::test]
    async fn header_derived_agent_survives_the_paid_retry() {
        // agent_from is None, so the agent comes solely from X-Agent-Id
        // (spec.md §4.5's documented header fallback). Both the challenge
        // and the retry must see the same headers for the macaroon's `agent`
        // caveat to match on verification.
        let route = RouteConfig {
            path: "/thread/reply".to_string(),
            method: "POST".to_string(),
            context_from: Some("threadId".to_string()),
            agent_from: None,
            description: None,
        };
        let indata = json!({ "threadId": "t1" });
        let wallet = StubWallet::new();
        let state = state_with(wallet.clone());

        let mut headers = HeaderMap::new();
        headers.insert("X-Agent-Id", HeaderValue::from_static("alice"));

        let challenge = admit(
            &route,
            &state,
            &headers,
            &indata,
            "/thread/reply",
            "POST",
            |_| async { warp::reply::with_status("ok", StatusCode::OK).into_response() },
        )
        .await;
        assert_eq!(challenge.status(), StatusCode::PAYMENT_REQUIRED);

        let body: Value = serde_json::from_slice(
            &warp::hyper::body::to_bytes(challenge.into_body())
                .await
                .unwrap(),
        )
        .unwrap();
        let payment_hash = body["paymentHash"].as_str().unwrap().to_string();
        let macaroon_b64 = body["macaroon"].as_str().unwrap().to_string();

        let invoice = wallet.lookup_invoice(&payment_hash).await.unwrap();
        let preimage = invoice.preimage.clone().unwrap();
        wallet.settle(&payment_hash, &preimage).await;

        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("L402 {macaroon_b64}:{preimage}")).unwrap(),
        );

        let final_resp = admit(
            &route,
            &state,
            &headers,
            &indata,
            "/thread/reply",
            "POST",
            |outcome| {
                assert!(outcome.toll_paid);
                assert_eq!(outcome.agent_id, "alice");
                async move { warp::reply::with_status("ok", StatusCode::OK).into_response() }
            },
        )
        .await;
        assert_eq!(final_resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_authorization_header_yields_401() {
        let state = state_with(StubWallet::new());
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("L402 onlyonepart"));
        let resp = admit(
            &route(),
            &state,
            &headers,
            &json!({}),
            "/thread/reply",
            "POST",
            |_| async { warp::reply::with_status("ok", StatusCode::OK).into_response() },
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn agent_defaults_to_anonymous_and_context_to_default() {
        let route = RouteConfig {
            path: "/x".to_string(),
            method: "POST".to_string(),
            context_from: None,
            agent_from: None,
            description: None,
        };
        assert_eq!(extract_agent_id(&route, &json!({}), &HeaderMap::new()), "anonymous");
        assert_eq!(extract_context_id(&route, &json!({})), "default");
    }

    #[test]
    fn dotted_path_extraction_reads_nested_fields() {
        let indata = json!({ "body": { "threadId": "abc" } });
        assert_eq!(
            extract_dotted_path(&indata, "body.threadId"),
            Some("abc".to_string())
        );
        assert_eq!(extract_dotted_path(&indata, "body.missing"), None);
    }

    #[test]
    fn header_map_is_unused() {
        let _ = HashMap::<String, String>::new();
    }
}
