//! Credential Governor
//!
//! Single-binary service that hosts the credential pool and rate limiter
//! for operators:
//! 1. Connects to the shared cache (Redis, or memory for local runs)
//! 2. Opens the durable credential store and runs migrations
//! 3. Loads the payload encryption key
//! 4. Serves the admin API, health, and Prometheus metrics

mod admin;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use cache::{Cache, MemoryCache, RedisCache};
use credential_pool::CredentialPool;
use credential_store::{CredentialStore, PayloadCipher, SqliteCredentialStore};
use metrics_exporter_prometheus::PrometheusHandle;
use rate_limiter::RateLimiter;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::{CacheBackend, Config};

/// Upper bound on draining in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from the health and metrics handlers
#[derive(Clone)]
struct AppState {
    cache: Arc<dyn Cache>,
    store: Arc<dyn CredentialStore>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, admin: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(build_admin_router(admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting credential-governor");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        cache_backend = ?config.cache.backend,
        quotas = config.quotas.len(),
        arenas = config.rate_limits.len(),
        "configuration loaded"
    );

    let cache: Arc<dyn Cache> = match config.cache.backend {
        CacheBackend::Redis => {
            let url = config
                .cache
                .redis_url
                .as_deref()
                .context("cache.redis_url is required for the redis backend")?;
            Arc::new(
                RedisCache::connect(url)
                    .await
                    .context("failed to connect to redis")?,
            )
        }
        CacheBackend::Memory => {
            warn!("using process-local memory cache; state is not shared between processes");
            Arc::new(MemoryCache::new())
        }
    };

    let store: Arc<dyn CredentialStore> = Arc::new(
        SqliteCredentialStore::connect(&config.store.database_url)
            .await
            .context("failed to open credential store")?,
    );
    info!("credential store ready");

    let key = config
        .encryption
        .key
        .as_ref()
        .context("encryption key not loaded")?;
    let cipher = Arc::new(
        PayloadCipher::from_key(key.expose()).context("failed to parse encryption key")?,
    );
    info!(recipient = %cipher.recipient(), "payload cipher ready");

    let pool = Arc::new(CredentialPool::new(
        cache.clone(),
        store.clone(),
        cipher.clone(),
        config.pool_config(),
    ));
    let limiter = Arc::new(RateLimiter::new(cache.clone(), config.rate_limit_table()));

    let app_state = AppState {
        cache,
        store: store.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let admin_state = AdminState::new(pool, store, cipher, limiter);

    let app = build_router(app_state, admin_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 when the store answers, 503 otherwise. A cache
/// outage only degrades, since the pool and limiter fail open.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let cache_ok = match state.cache.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "health check: cache unreachable");
            false
        }
    };
    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "health check: store unreachable");
            false
        }
    };

    let (status_code, status) = match (store_ok, cache_ok) {
        (true, true) => (axum::http::StatusCode::OK, "healthy"),
        (true, false) => (axum::http::StatusCode::OK, "degraded"),
        (false, _) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    let body = serde_json::json!({
        "status": status,
        "cache": if cache_ok { "connected" } else { "unreachable" },
        "store": if store_ok { "connected" } else { "unreachable" },
        "uptime_seconds": uptime,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use credential_pool::PoolConfig;
    use credential_store::{CredentialRecord, NewCredential, StoreError, StoreFuture, Tier};
    use rate_limiter::RateLimitTable;
    use std::collections::HashMap;
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// Store whose every call fails, standing in for an unreachable database.
    struct DownStore;

    fn down<'a, T: Send + 'a>() -> StoreFuture<'a, T> {
        Box::pin(async {
            Err(StoreError::Corrupt {
                id: "*".into(),
                detail: "database offline".into(),
            })
        })
    }

    impl CredentialStore for DownStore {
        fn active_candidates<'a>(
            &'a self,
            _platform: &'a str,
            _tier: Tier,
        ) -> StoreFuture<'a, Vec<CredentialRecord>> {
            down()
        }
        fn get<'a>(&'a self, _id: &'a str) -> StoreFuture<'a, Option<CredentialRecord>> {
            down()
        }
        fn list<'a>(&'a self, _platform: Option<&'a str>) -> StoreFuture<'a, Vec<CredentialRecord>> {
            down()
        }
        fn insert(&self, _new: NewCredential) -> StoreFuture<'_, CredentialRecord> {
            down()
        }
        fn touch_last_used<'a>(
            &'a self,
            _id: &'a str,
            _at: chrono::DateTime<chrono::Utc>,
        ) -> StoreFuture<'a, ()> {
            down()
        }
        fn increment_error_count<'a>(&'a self, _id: &'a str) -> StoreFuture<'a, Option<u32>> {
            down()
        }
        fn open_circuit<'a>(&'a self, _id: &'a str) -> StoreFuture<'a, bool> {
            down()
        }
        fn reset_error_count<'a>(&'a self, _id: &'a str) -> StoreFuture<'a, bool> {
            down()
        }
        fn set_active<'a>(&'a self, _id: &'a str, _active: bool) -> StoreFuture<'a, bool> {
            down()
        }
        fn ping(&self) -> StoreFuture<'_, ()> {
            down()
        }
    }

    async fn test_app(cache: Arc<MemoryCache>, store: Arc<dyn CredentialStore>) -> Router {
        let cipher = Arc::new(PayloadCipher::generate());
        let pool = Arc::new(
            CredentialPool::new(
                cache.clone(),
                store.clone(),
                cipher.clone(),
                PoolConfig::default(),
            )
            .with_env_source(Arc::new(HashMap::<String, String>::new())),
        );
        let limiter = Arc::new(RateLimiter::new(cache.clone(), RateLimitTable::default()));
        let state = AppState {
            cache,
            store: store.clone(),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        build_router(state, AdminState::new(pool, store, cipher, limiter), 1000)
    }

    async fn sqlite() -> Arc<dyn CredentialStore> {
        Arc::new(SqliteCredentialStore::in_memory().await.unwrap())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let app = test_app(Arc::new(MemoryCache::new()), sqlite().await).await;
        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["cache"], "connected");
        assert_eq!(json["store"], "connected");
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_degraded_when_cache_unreachable() {
        let cache = Arc::new(MemoryCache::new());
        cache.set_available(false);
        let app = test_app(cache, sqlite().await).await;
        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["cache"], "unreachable");
    }

    #[tokio::test]
    async fn health_unhealthy_when_store_unreachable() {
        let app = test_app(Arc::new(MemoryCache::new()), Arc::new(DownStore)).await;
        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["store"], "unreachable");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let app = test_app(Arc::new(MemoryCache::new()), sqlite().await).await;
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn admin_routes_are_mounted() {
        let app = test_app(Arc::new(MemoryCache::new()), sqlite().await).await;
        let (status, json) = get_json(app, "/admin/credentials").await;

        assert_eq!(status, StatusCode::OK);
        assert!(json["credentials"].is_array());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = test_app(Arc::new(MemoryCache::new()), sqlite().await).await;
        let response = app
            .oneshot(Request::builder().uri("/v1/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
