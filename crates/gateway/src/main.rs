use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method},
    middleware::{from_fn, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use moka::future::Cache;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod challenge;
pub mod config;
pub mod db;
pub mod error;
pub mod geofence;
pub mod handlers;
pub mod models;
pub mod policy;
pub mod risk;
pub mod session;
pub mod token;

use challenge::ChallengeFactory;
use config::AppConfig;
use error::GatewayError;
use models::{ChallengePayload, PolicyRecord, VerificationPayload};
use policy::{NeverFlagged, PolicyFilter};
use session::SessionStore;
use token::{TokenKind, TokenService};

const POLICY_CACHE_TTL: Duration = Duration::from_secs(30);
const CHALLENGE_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

pub struct AppState {
    pub db: sqlx::PgPool,
    pub session_store: SessionStore,
    pub challenge_tokens: TokenService<ChallengePayload>,
    pub verification_tokens: TokenService<VerificationPayload>,
    pub config_tokens: TokenService<()>,
    pub challenge_factory: ChallengeFactory,
    pub policy_filter: PolicyFilter,
    policy_cache: Cache<String, Arc<PolicyRecord>>,
    pub environment: String,
}

impl AppState {
    /// Read-through cache over the durable policy table (§6's "Persisted
    /// state"), so a widget polling `/security-config` doesn't hit Postgres
    /// on every request.
    pub async fn policy(&self, sitekey: &str) -> Result<Option<PolicyRecord>, GatewayError> {
        if let Some(cached) = self.policy_cache.get(sitekey).await {
            return Ok(Some((*cached).clone()));
        }
        match db::fetch_policy(&self.db, sitekey).await? {
            Some(record) => {
                self.policy_cache.insert(sitekey.to_string(), Arc::new(record.clone())).await;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new().max_connections(50).connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Connected to database and migrations applied.");

    let server_secret = Arc::new(config.server_secret.clone());
    let geo = Arc::new(geofence::GeoFenceManager::new());

    let shared_state = Arc::new(AppState {
        db: pool,
        session_store: SessionStore::new(),
        challenge_tokens: TokenService::new(server_secret.clone(), TokenKind::Challenge, CHALLENGE_TOKEN_TTL),
        verification_tokens: TokenService::new(server_secret.clone(), TokenKind::Verification, Duration::from_secs(60)),
        config_tokens: TokenService::new(server_secret, TokenKind::Config, Duration::from_secs(60)),
        challenge_factory: ChallengeFactory::new(),
        policy_filter: PolicyFilter::new(geo, Arc::new(NeverFlagged)),
        policy_cache: Cache::builder().time_to_live(POLICY_CACHE_TTL).build(),
        environment: config.environment.clone(),
    });

    {
        let state = Arc::clone(&shared_state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                state.session_store.sweep().await;
            }
        });
    }

    let allowed_origins = parse_allowed_origins(&config.allowed_origins_raw);
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION])
        .allow_credentials(true);

    let app = Router::new()
        .route("/readyz", get(health_check))
        .route("/api/health", get(health_check))
        .route("/handshake", post(handlers::handshake::handshake))
        .route("/security-config", post(handlers::security_config::security_config))
        .route("/challenge", post(handlers::challenge::issue_challenge))
        .route("/verify", post(handlers::verify::verify))
        .route("/siteverify", post(handlers::siteverify::siteverify))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(from_fn(security_headers))
        .with_state(shared_state);

    info!("CAPTCHA gateway listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let db_ok = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.db).await.map(|v| v == 1).unwrap_or(false);

    Json(serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "ok": db_ok,
        "service": "captcha-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.environment,
    }))
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert("permissions-policy", HeaderValue::from_static("camera=(), microphone=(), geolocation=()"));
    response
}

fn parse_allowed_origins(raw: &str) -> Vec<HeaderValue> {
    let mut parsed = Vec::new();
    for origin in raw.split(',').map(|v| v.trim()).filter(|v| !v.is_empty()) {
        match origin.parse::<HeaderValue>() {
            Ok(value) => parsed.push(value),
            Err(_) => tracing::warn!("Ignoring invalid origin in ALLOWED_ORIGINS: {}", origin),
        }
    }
    if parsed.is_empty() {
        tracing::warn!("ALLOWED_ORIGINS produced no valid origins, falling back to localhost-only");
        parsed.push("http://localhost:5173".parse().unwrap());
    }
    parsed
}
