//! verdikta_api: the HTTP surface of the arbitration oracle.
//!
//! Public endpoints (JSON):
//! - POST /evaluate   evaluate a request: `{id, data:{cid}, mode?}` ->
//!                    success / committed / errored envelope
//! - GET  /health     liveness -> { status, timestamp }
//! - GET  /ready      readiness; 503 when the content-store gateways are down
//! - GET  /version    build/feature report
//!
//! Notes:
//! - The oracle node reads `statusCode` from the body; the HTTP status is
//!   set to the same value for everyone else.
//! - Commit-store durability is selected at startup via COMMIT_STORE_MODE
//!   (`memory` | `file`); stale commitments are purged on a timer.
//! - Provider adapters are registered only for providers with credentials in
//!   the environment; jury slots naming anything else fail at slot level.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use verdikta::caps::CapabilityMatrix;
use verdikta::commit::{CommitMode, CommitStore, DEFAULT_COMMIT_TTL};
use verdikta::jury::{JuryConfig, JuryEngine};
use verdikta::orchestrator::{
    ArbiterError, ErrorKind, EvaluateRequest, EvaluateResponse, Orchestrator, OrchestratorConfig,
};
use verdikta::provider::{Anthropic, OpenAiCompatible, ProviderRegistry, RateLimited};
use verdikta::store::{StoreClient, StoreConfig};

// ------------------------------ Types ------------------------------

#[derive(Serialize)]
struct Health {
    status: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
struct Ready {
    status: &'static str,
}

#[derive(Serialize)]
struct Version {
    api: &'static str,
    features: VersionFeatures,
}

#[derive(Serialize)]
struct VersionFeatures {
    memory_commits_only: bool,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

// ------------------------------ Helpers ------------------------------

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// ------------------------------ Handlers ------------------------------

async fn health() -> impl IntoResponse {
    Json(Health {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn ready(State(st): State<AppState>) -> impl IntoResponse {
    if st.orchestrator.ready().await {
        (StatusCode::OK, Json(Ready { status: "ready" }))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(Ready { status: "degraded" }))
    }
}

async fn version() -> impl IntoResponse {
    Json(Version {
        api: concat!("verdikta-api/", env!("CARGO_PKG_VERSION")),
        features: VersionFeatures {
            memory_commits_only: cfg!(feature = "memory-commits-only"),
        },
    })
}

async fn evaluate(
    State(st): State<AppState>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let resp = EvaluateResponse::errored(
                "unknown",
                ArbiterError::new(ErrorKind::InvalidRequest, rejection.body_text()),
            );
            return (StatusCode::BAD_REQUEST, Json(resp));
        }
    };
    let resp = st.orchestrator.evaluate(req).await;
    let status =
        StatusCode::from_u16(resp.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(resp))
}

// ------------------------------ Wiring ------------------------------

fn build_store() -> StoreClient {
    let gateways: Vec<String> = std::env::var("IPFS_GATEWAYS")
        .map(|s| {
            s.split(',')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| StoreConfig::default().gateways);
    let defaults = StoreConfig::default();
    StoreClient::new(StoreConfig {
        gateways,
        pin_url: env_string("IPFS_PINNING_SERVICE", &defaults.pin_url),
        pin_token: env_string("IPFS_PINNING_KEY", ""),
        ..defaults
    })
}

fn build_registry(matrix: &Arc<CapabilityMatrix>) -> ProviderRegistry {
    let max_in_flight = std::env::var("PROVIDER_MAX_IN_FLIGHT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8usize);
    let mut registry = ProviderRegistry::new();
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        registry.insert(Arc::new(RateLimited::new(
            OpenAiCompatible::new(
                "OpenAI",
                env_string("OPENAI_API_URL", "https://api.openai.com/v1"),
                key,
                matrix.clone(),
            ),
            max_in_flight,
        )));
    }
    if let Ok(key) = std::env::var("XAI_API_KEY") {
        registry.insert(Arc::new(RateLimited::new(
            OpenAiCompatible::new(
                "xAI",
                env_string("XAI_API_URL", "https://api.x.ai/v1"),
                key,
                matrix.clone(),
            ),
            max_in_flight,
        )));
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        registry.insert(Arc::new(RateLimited::new(
            Anthropic::new(
                env_string("ANTHROPIC_API_URL", "https://api.anthropic.com"),
                key,
                matrix.clone(),
            ),
            max_in_flight,
        )));
    }
    if let Ok(url) = std::env::var("OLLAMA_URL") {
        // Local servers speak the same wire format, keyless.
        registry.insert(Arc::new(RateLimited::new(
            OpenAiCompatible::new("Ollama", url, String::new(), matrix.clone()),
            max_in_flight,
        )));
    }
    registry
}

fn build_commit_store() -> anyhow::Result<CommitStore> {
    let mode = env_string("COMMIT_STORE_MODE", "memory");
    match mode.as_str() {
        "memory" => Ok(CommitStore::open(CommitMode::Memory)),
        "file" => {
            if cfg!(feature = "memory-commits-only") {
                anyhow::bail!(
                    "COMMIT_STORE_MODE=file but this build carries memory-commits-only"
                );
            }
            let path = PathBuf::from(env_string("COMMIT_STORE_PATH", "commits.json"));
            Ok(CommitStore::open(CommitMode::File(path)))
        }
        other => anyhow::bail!("COMMIT_STORE_MODE must be memory|file (got {other})"),
    }
}

// ------------------------------ Main ------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "verdikta_api=info,tower_http=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    info!("Starting Verdikta arbiter API server");

    let addr: SocketAddr = std::env::var("VERDIKTA_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

    let matrix = match std::env::var("CAPABILITY_MATRIX_PATH") {
        Ok(path) => {
            let m = CapabilityMatrix::from_file(std::path::Path::new(&path))?;
            info!(path, "loaded operator capability matrix");
            Arc::new(m)
        }
        Err(_) => Arc::new(CapabilityMatrix::builtin().clone()),
    };

    let store = build_store();
    let registry = build_registry(&matrix);
    if registry.names().is_empty() {
        warn!("no provider credentials configured; every jury slot will fail");
    } else {
        info!(providers = ?registry.names(), "provider adapters registered");
    }

    let jury_cfg = JuryConfig {
        model_timeout: env_ms("MODEL_TIMEOUT_MS", Duration::from_secs(120)),
        justifier_timeout: env_ms("JUSTIFICATION_TIMEOUT_MS", Duration::from_secs(45)),
        min_success_percent: env_f64("MIN_SUCCESSFUL_MODELS_PERCENT", 0.5),
        ..JuryConfig::default()
    }
    .with_justifier(&env_string("JUSTIFIER_MODEL", "OpenAI:gpt-4o"));

    let commits = Arc::new(build_commit_store()?);
    let orchestrator = Orchestrator::new(
        store,
        JuryEngine::new(registry, jury_cfg),
        matrix,
        commits,
        OrchestratorConfig {
            request_timeout: env_ms("REQUEST_TIMEOUT_MS", Duration::from_secs(240)),
            scratch_root: std::env::var("VERDIKTA_SCRATCH_ROOT").ok().map(PathBuf::from),
            commit_ttl: env_ms("COMMIT_TTL_MS", DEFAULT_COMMIT_TTL),
        },
    );

    // Stale-commitment purge schedule.
    {
        let orch = orchestrator.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let purged = orch.purge_commits();
                if purged > 0 {
                    info!(purged, "purged stale commitments");
                }
            }
        });
    }

    let allowed_origins = env_string("CORS_ALLOWED_ORIGINS", "");
    let cors = if allowed_origins == "*" {
        warn!("CORS set to permissive mode (*); not recommended for production");
        CorsLayer::permissive()
    } else if allowed_origins.is_empty() {
        // The oracle node is a same-host collaborator; browsers are not
        // expected here.
        CorsLayer::new()
    } else {
        let origins: Vec<_> = allowed_origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        info!(?origins, "CORS configured");
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
            .max_age(Duration::from_secs(3600))
    };

    let governor_conf = Box::leak(Box::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(30)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("governor config"),
    ));

    let app = Router::new()
        .route("/evaluate", post(evaluate))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/version", get(version))
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024))
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .with_state(AppState { orchestrator })
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!(%addr, "verdikta API listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
