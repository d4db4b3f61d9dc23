use std::sync::Arc;

use tollgate::admission::{self, AdmissionState};
use tollgate::config::{Config, RouteConfig, TrustConfig, WalletConfig};
use tollgate::pricing::Engine;
use tollgate::trust::{AttestationTrust, CachedResolver, RestTrust, StaticTrust, TrustResolver};
use tollgate::wallet::{HostedWallet, StubWallet, Wallet};

use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::{http::HeaderValue, hyper::HeaderMap, path::FullPath, Filter, Reply};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // install global collector configured based on RUST_LOG env var.
    let subscriber = tracing_subscriber::fmt()
        // Use a more compact, abbreviated log format
        .compact()
        // base filter on RUST_LOG
        .with_env_filter(EnvFilter::from_default_env())
        // Display source code file paths
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        // Don't display the event's target (module path)
        .with_target(false)
        // Build the subscriber
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config: Config = config::Config::builder()
        // Add in `./Settings.toml`
        .add_source(config::File::with_name("config"))
        // Add in settings from the environment (with a prefix of APP)
        // Eg.. `APP_DEBUG=1 ./target/app` would set the `debug` key
        .add_source(config::Environment::with_prefix("APP"))
        .build()
        .expect("problem building the config")
        .try_deserialize()
        .expect("problem deserializing config");

    info!("Configuration loaded on startup: {:?}", config);

    let wallet: Arc<dyn Wallet> = match &config.wallet {
        WalletConfig::Stub => Arc::new(StubWallet::new()),
        WalletConfig::Hosted {
            base_url,
            macaroon_hex,
        } => Arc::new(HostedWallet::new(base_url.clone(), macaroon_hex.clone())),
    };

    let trust: Arc<dyn TrustResolver> = match &config.trust {
        TrustConfig::Static { scores } => Arc::new(StaticTrust::new(scores.clone())),
        TrustConfig::Rest { base_url } => {
            Arc::new(CachedResolver::new(RestTrust::new(base_url.clone())))
        }
        TrustConfig::Attestation {
            relays,
            domain_label,
        } => Arc::new(CachedResolver::new(
            AttestationTrust::new(relays, domain_label.clone()).await,
        )),
    };

    let pricing = Arc::new(match &config.pricing {
        Some(overrides) => Engine::new(overrides.apply(Default::default())),
        None => Engine::default(),
    });

    let state = Arc::new(AdmissionState::new(
        config.secret.clone(),
        pricing,
        wallet,
        trust,
        config.invoice_ttl_secs,
    ));

    spawn_sweep_task(state.clone());

    info!("Listening on {}:{}", config.server.host, config.server.port);

    let mut headers = HeaderMap::new();
    headers.insert(
        "Access-Control-Expose-Headers",
        HeaderValue::from_static("www-authenticate"),
    );
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "DELETE"])
        .allow_headers(vec!["accept-authenticate", "content-type", "authorization"]);

    let base = warp::any()
        .and(with_clone(config.clone()))
        .and(with_clone(state.clone()));

    let gated = base
        .and(warp::path::full())
        .and_then(gated_route)
        .and(warp::method())
        .and(warp::body::json())
        .and(warp::header::headers_cloned())
        .and(with_clone(state.clone()))
        .and_then(handle_gated);

    let admin_stats = warp::path!("admin" / "stats")
        .and(warp::get())
        .and(with_clone(state))
        .map(|state: Arc<AdmissionState>| warp::reply::json(&state.pricing.stats()));

    let routes = admin_stats
        .or(gated)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::reply::with::headers(headers));

    info!("Starting server...");
    warp::serve(routes)
        .run((config.server.host, config.server.port))
        .await;
    Ok(())
}

/// Looks up the matching route configuration for an incoming request path,
/// rejecting paths the operator never configured a toll for.
pub async fn gated_route(
    config: Config,
    _state: Arc<AdmissionState>,
    path: FullPath,
) -> Result<RouteConfig, warp::Rejection> {
    config
        .routes
        .iter()
        .find(|r| r.path == path.as_str())
        .cloned()
        .ok_or_else(warp::reject::not_found)
}

async fn handle_gated(
    route: RouteConfig,
    method: warp::http::Method,
    body: serde_json::Value,
    headers: HeaderMap,
    state: Arc<AdmissionState>,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let resp = admission::admit(
        &route,
        &state,
        &headers,
        &body,
        &route.path,
        method.as_str(),
        |outcome| async move {
            // Downstream business logic lives outside this crate's scope;
            // acknowledging admission is the demo server's whole job.
            let body = serde_json::json!({
                "ok": true,
                "tollPaid": outcome.toll_paid,
                "tollFree": outcome.toll_free,
                "tollError": outcome.toll_error,
                "agentId": outcome.agent_id,
                "contextId": outcome.context_id,
            });
            warp::reply::json(&body).into_response()
        },
    )
    .await;
    Ok(resp)
}

async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    if err.is_not_found() {
        Ok(warp::reply::with_status(
            "no route is configured for this path",
            warp::http::StatusCode::NOT_FOUND,
        ))
    } else {
        Ok(warp::reply::with_status(
            "internal error",
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        ))
    }
}

/// Default activity/trust-cache retention horizon (`spec.md` §3 "Activity
/// record... eligible for garbage collection once older than a configurable
/// horizon (default 24 h)").
const SWEEP_HORIZON: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// How often the sweep runs. Not spec-mandated; chosen so the horizon above
/// is enforced promptly without sweeping on every request.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Periodically drops expired pricing activity and trust-cache entries
/// (`spec.md` §5 "Activity/trust caches MUST support a periodic sweep
/// removing entries older than a configurable horizon").
fn spawn_sweep_task(state: Arc<AdmissionState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            state
                .pricing
                .cleanup(SWEEP_HORIZON.as_millis() as u64, tollgate::pricing::now_ms());
            state.trust.sweep();
            info!("swept expired pricing activity and trust-cache entries");
        }
    });
}

/// Warp helper for cloning configuration and state references so they can
/// be passed into request handlers.
pub fn with_clone<C: Clone + Send>(
    c: C,
) -> impl Filter<Extract = (C,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || c.clone())
}
