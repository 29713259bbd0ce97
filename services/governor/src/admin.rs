//! Admin API for credential operations
//!
//! Operators add credentials, re-admit credentials after the circuit breaker
//! opened, and inspect leases, pool health, and rate limit state. Payloads and
//! decrypted fields are never returned.
//!
//! Endpoints:
//! - GET    /admin/credentials?platform=         list credentials
//! - POST   /admin/credentials                   encrypt and store a credential
//! - POST   /admin/credentials/{id}/reset        zero error_count, clear cooldown
//! - POST   /admin/credentials/{id}/activate     return to rotation
//! - POST   /admin/credentials/{id}/deactivate   remove from rotation
//! - GET    /admin/credentials/{id}/leases       task ids holding a lease
//! - DELETE /admin/credentials/{id}/leases       release every lease
//! - GET    /admin/pool/{platform}/{tier}        per-credential eligibility
//! - DELETE /admin/rate-limits/{key}             delete every window of a key

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_TYPE, HeaderName};
use axum::routing::{delete, get, post};
use credential_pool::CredentialPool;
use credential_store::{
    CredentialFields, CredentialStore, NewCredential, PayloadCipher, StoreError, Tier,
};
use rate_limiter::RateLimiter;
use serde::Deserialize;
use tracing::{info, warn};

use crate::metrics::record_admin_request;

type JsonResponse = (StatusCode, [(HeaderName, &'static str); 1], String);

fn json_response(route: &'static str, status: StatusCode, body: serde_json::Value) -> JsonResponse {
    record_admin_request(route, status.as_u16());
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

fn error_response(route: &'static str, status: StatusCode, message: String) -> JsonResponse {
    json_response(route, status, serde_json::json!({ "error": message }))
}

fn store_error(route: &'static str, e: StoreError) -> JsonResponse {
    warn!(route, error = %e, "credential store request failed");
    let status = match e {
        StoreError::Duplicate { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(route, status, e.to_string())
}

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<CredentialPool>,
    store: Arc<dyn CredentialStore>,
    cipher: Arc<PayloadCipher>,
    limiter: Arc<RateLimiter>,
}

impl AdminState {
    pub fn new(
        pool: Arc<CredentialPool>,
        store: Arc<dyn CredentialStore>,
        cipher: Arc<PayloadCipher>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            pool,
            store,
            cipher,
            limiter,
        }
    }
}

/// Build the admin axum router with all credential management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/admin/credentials",
            get(list_credentials).post(create_credential),
        )
        .route("/admin/credentials/{id}/reset", post(reset_credential))
        .route("/admin/credentials/{id}/activate", post(activate_credential))
        .route(
            "/admin/credentials/{id}/deactivate",
            post(deactivate_credential),
        )
        .route(
            "/admin/credentials/{id}/leases",
            get(list_leases).delete(release_leases),
        )
        .route("/admin/pool/{platform}/{tier}", get(pool_status))
        .route("/admin/rate-limits/{key}", delete(reset_rate_limit))
        .with_state(state)
}

#[derive(Deserialize)]
struct ListParams {
    platform: Option<String>,
}

/// GET /admin/credentials: all credentials, optionally for one platform.
async fn list_credentials(
    State(state): State<AdminState>,
    Query(params): Query<ListParams>,
) -> JsonResponse {
    match state.store.list(params.platform.as_deref()).await {
        Ok(records) => json_response(
            "list_credentials",
            StatusCode::OK,
            serde_json::json!({ "credentials": records }),
        ),
        Err(e) => store_error("list_credentials", e),
    }
}

/// Request body for creating a credential. Non-string field values are
/// stored as their JSON text.
#[derive(Deserialize)]
struct CreateCredentialRequest {
    platform: String,
    tier: Tier,
    account: String,
    fields: BTreeMap<String, serde_json::Value>,
}

/// POST /admin/credentials: encrypt the fields and store a new credential.
async fn create_credential(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CreateCredentialRequest>,
) -> JsonResponse {
    const ROUTE: &str = "create_credential";

    if body.platform.trim().is_empty() || body.account.trim().is_empty() {
        return error_response(
            ROUTE,
            StatusCode::BAD_REQUEST,
            "platform and account must not be empty".into(),
        );
    }
    if body.fields.is_empty() {
        return error_response(
            ROUTE,
            StatusCode::BAD_REQUEST,
            "fields must contain at least one secret".into(),
        );
    }

    let fields: CredentialFields = body
        .fields
        .into_iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect();

    let encrypted_payload = match state.cipher.encrypt(&fields) {
        Ok(ciphertext) => ciphertext,
        Err(e) => {
            warn!(error = %e, "credential encryption failed");
            return error_response(ROUTE, StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let new = NewCredential {
        platform: body.platform.trim().to_string(),
        tier: body.tier,
        account: body.account.trim().to_string(),
        encrypted_payload,
    };
    match state.store.insert(new).await {
        Ok(record) => {
            info!(
                credential_id = %record.id,
                platform = %record.platform,
                tier = %record.tier,
                fields = fields.len(),
                "credential added"
            );
            json_response(
                ROUTE,
                StatusCode::CREATED,
                serde_json::to_value(&record).unwrap_or_default(),
            )
        }
        Err(e) => store_error(ROUTE, e),
    }
}

/// POST /admin/credentials/{id}/reset: circuit breaker re-admission.
async fn reset_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> JsonResponse {
    const ROUTE: &str = "reset_credential";
    match state.pool.reset_errors(&id).await {
        Ok(true) => json_response(
            ROUTE,
            StatusCode::OK,
            serde_json::json!({ "credential_id": id, "status": "reset" }),
        ),
        Ok(false) => error_response(ROUTE, StatusCode::NOT_FOUND, format!("credential not found: {id}")),
        Err(e) => {
            warn!(credential_id = %id, error = %e, "credential reset failed");
            error_response(ROUTE, StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn activate_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> JsonResponse {
    set_active(&state, "activate_credential", id, true).await
}

async fn deactivate_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> JsonResponse {
    set_active(&state, "deactivate_credential", id, false).await
}

async fn set_active(
    state: &AdminState,
    route: &'static str,
    id: String,
    active: bool,
) -> JsonResponse {
    match state.store.set_active(&id, active).await {
        Ok(true) => {
            info!(credential_id = %id, active, "credential activation changed");
            json_response(
                route,
                StatusCode::OK,
                serde_json::json!({ "credential_id": id, "is_active": active }),
            )
        }
        Ok(false) => error_response(route, StatusCode::NOT_FOUND, format!("credential not found: {id}")),
        Err(e) => store_error(route, e),
    }
}

/// GET /admin/credentials/{id}/leases: task ids currently holding a lease.
async fn list_leases(State(state): State<AdminState>, Path(id): Path<String>) -> JsonResponse {
    match state.pool.leases(&id).await {
        Ok(leases) => json_response(
            "list_leases",
            StatusCode::OK,
            serde_json::json!({ "credential_id": id, "leases": leases }),
        ),
        Err(e) => error_response("list_leases", StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// DELETE /admin/credentials/{id}/leases: release every lease.
async fn release_leases(State(state): State<AdminState>, Path(id): Path<String>) -> JsonResponse {
    let released = state.pool.release_all(&id).await;
    json_response(
        "release_leases",
        StatusCode::OK,
        serde_json::json!({ "credential_id": id, "released": released }),
    )
}

/// GET /admin/pool/{platform}/{tier}: per-credential eligibility and health.
async fn pool_status(
    State(state): State<AdminState>,
    Path((platform, tier)): Path<(String, String)>,
) -> JsonResponse {
    const ROUTE: &str = "pool_status";
    let tier: Tier = match tier.parse() {
        Ok(tier) => tier,
        Err(e) => return error_response(ROUTE, StatusCode::BAD_REQUEST, format!("{e}")),
    };
    match state.pool.status(&platform, tier).await {
        Ok(status) => json_response(
            ROUTE,
            StatusCode::OK,
            serde_json::to_value(&status).unwrap_or_default(),
        ),
        Err(e) => {
            warn!(platform = %platform, tier = %tier, error = %e, "pool status failed");
            json_response(ROUTE, StatusCode::INTERNAL_SERVER_ERROR, e.to_json())
        }
    }
}

/// DELETE /admin/rate-limits/{key}: forget all windows of a key.
async fn reset_rate_limit(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> JsonResponse {
    state.limiter.reset(&key).await;
    json_response(
        "reset_rate_limit",
        StatusCode::OK,
        serde_json::json!({ "key": key, "status": "reset" }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cache::MemoryCache;
    use credential_pool::{ErrorCategory, PoolConfig};
    use credential_store::SqliteCredentialStore;
    use rate_limiter::RateLimitTable;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct TestApp {
        state: AdminState,
        pool: Arc<CredentialPool>,
        store: Arc<dyn CredentialStore>,
        limiter: Arc<RateLimiter>,
    }

    /// Admin state over an in-memory cache and database, with an empty
    /// environment so host variables never leak into the pool.
    async fn test_app() -> TestApp {
        let cache = Arc::new(MemoryCache::new());
        let store: Arc<dyn CredentialStore> =
            Arc::new(SqliteCredentialStore::in_memory().await.unwrap());
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
        let limiter = Arc::new(RateLimiter::new(cache, RateLimitTable::default()));
        TestApp {
            state: AdminState::new(pool.clone(), store.clone(), cipher, limiter.clone()),
            pool,
            store,
            limiter,
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = build_admin_router(app.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn method_req(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn create_req(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/admin/credentials")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn create(app: &TestApp, account: &str) -> String {
        let (status, json) = send(
            app,
            create_req(serde_json::json!({
                "platform": "reddit",
                "tier": "free",
                "account": account,
                "fields": { "client_id": "cid", "client_secret": "s3cret", "scopes": ["read"] }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn list_credentials_empty() {
        let app = test_app().await;
        let (status, json) = send(&app, get_req("/admin/credentials")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["credentials"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn created_credential_is_listed_without_secrets() {
        let app = test_app().await;
        let id = create(&app, "research-1").await;

        let (status, json) = send(&app, get_req("/admin/credentials?platform=reddit")).await;
        assert_eq!(status, StatusCode::OK);
        let credentials = json["credentials"].as_array().unwrap();
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0]["id"], id);
        assert_eq!(credentials[0]["tier"], "free");
        assert_eq!(credentials[0]["error_count"], 0);
        assert!(credentials[0].get("encrypted_payload").is_none());
        assert!(!json.to_string().contains("s3cret"));

        let (_, other) = send(&app, get_req("/admin/credentials?platform=tiktok")).await;
        assert_eq!(other["credentials"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn created_credential_is_leasable_with_its_fields() {
        let app = test_app().await;
        let id = create(&app, "research-1").await;

        let handle = app.pool.acquire("reddit", Tier::Free, "t1").await.unwrap();
        assert_eq!(handle.id, id);
        assert_eq!(handle.field("client_secret"), Some("s3cret"));
        assert_eq!(handle.field("scopes"), Some(r#"["read"]"#));
    }

    #[tokio::test]
    async fn duplicate_credential_returns_409() {
        let app = test_app().await;
        create(&app, "research-1").await;
        let (status, _) = send(
            &app,
            create_req(serde_json::json!({
                "platform": "reddit",
                "tier": "free",
                "account": "research-1",
                "fields": { "api_key": "other" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn create_without_fields_returns_400() {
        let app = test_app().await;
        let (status, json) = send(
            &app,
            create_req(serde_json::json!({
                "platform": "reddit",
                "tier": "free",
                "account": "a",
                "fields": {}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("fields"));
    }

    #[tokio::test]
    async fn create_with_unknown_tier_is_rejected() {
        let app = test_app().await;
        let (status, _) = send(
            &app,
            create_req(serde_json::json!({
                "platform": "reddit",
                "tier": "gold",
                "account": "a",
                "fields": { "api_key": "k" }
            })),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn reset_readmits_credential_after_circuit_opens() {
        let app = test_app().await;
        let id = create(&app, "a").await;
        for _ in 0..5 {
            app.pool
                .report_error(&id, ErrorCategory::AuthFailed, "reddit")
                .await;
        }
        assert!(app.pool.acquire("reddit", Tier::Free, "t1").await.is_err());
        let (_, listed) = send(&app, get_req("/admin/credentials")).await;
        assert_eq!(listed["credentials"][0]["circuit_open"], true);

        let (status, json) = send(&app, method_req("POST", &format!("/admin/credentials/{id}/reset"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "reset");

        let record = app.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.error_count, 0);
        assert!(!record.circuit_open);
        assert_eq!(app.pool.acquire("reddit", Tier::Free, "t2").await.unwrap().id, id);
    }

    #[tokio::test]
    async fn reset_unknown_credential_returns_404() {
        let app = test_app().await;
        let (status, _) = send(&app, method_req("POST", "/admin/credentials/missing/reset")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deactivate_and_activate_toggle_rotation() {
        let app = test_app().await;
        let id = create(&app, "a").await;

        let (status, json) = send(&app, method_req("POST", &format!("/admin/credentials/{id}/deactivate"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["is_active"], false);
        assert!(app.pool.acquire("reddit", Tier::Free, "t1").await.is_err());

        let (status, _) = send(&app, method_req("POST", &format!("/admin/credentials/{id}/activate"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.pool.acquire("reddit", Tier::Free, "t2").await.is_ok());

        let (status, _) = send(&app, method_req("POST", "/admin/credentials/missing/activate")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn leases_can_be_listed_and_released() {
        let app = test_app().await;
        let id = create(&app, "a").await;
        app.pool.acquire("reddit", Tier::Free, "task-1").await.unwrap();
        app.pool.acquire("reddit", Tier::Free, "task-2").await.unwrap();

        let uri = format!("/admin/credentials/{id}/leases");
        let (status, json) = send(&app, get_req(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["leases"], serde_json::json!(["task-1", "task-2"]));

        let (status, json) = send(&app, method_req("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["released"], 2);

        let (_, json) = send(&app, get_req(&uri)).await;
        assert_eq!(json["leases"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn pool_status_reports_health() {
        let app = test_app().await;
        let (status, json) = send(&app, get_req("/admin/pool/reddit/free")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["credentials_total"], 0);

        let id = create(&app, "a").await;
        create(&app, "b").await;
        app.pool
            .report_error(&id, ErrorCategory::RateLimited, "reddit")
            .await;

        let (_, json) = send(&app, get_req("/admin/pool/reddit/free")).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["credentials_available"], 1);
    }

    #[tokio::test]
    async fn pool_status_rejects_unknown_tier() {
        let app = test_app().await;
        let (status, json) = send(&app, get_req("/admin/pool/reddit/gold")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("gold"));
    }

    #[tokio::test]
    async fn rate_limit_reset_frees_the_key() {
        let app = test_app().await;
        assert!(app.limiter.acquire("social:reddit:c1", 1, 60).await);
        assert!(!app.limiter.acquire("social:reddit:c1", 1, 60).await);

        let (status, json) = send(&app, method_req("DELETE", "/admin/rate-limits/social:reddit:c1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["key"], "social:reddit:c1");

        assert!(app.limiter.acquire("social:reddit:c1", 1, 60).await);
    }
}
