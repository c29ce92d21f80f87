//! Crypto Gate Service
//!
//! The only component allowed to touch mailbox credential plaintext.
//! Exposes a single encrypt/decrypt endpoint guarded by a service token
//! and a fail-open rate limit, with an append-only audit trail of every
//! call. AES-256-GCM with a per-call random nonce; payloads travel as
//! base64(nonce ‖ ciphertext ‖ tag).

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    response::Json,
    routing::{get, post},
    Router,
};
use common::{config::ServiceConfig, HealthResponse, ServiceError, ServiceResult};
use models::{CryptoOperation, CryptoRequest, CryptoResponse};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};

mod crypto;
mod store;

use crypto::CredentialCipher;
use store::GateStore;

/// Calls allowed per actor per window.
const RATE_LIMIT: i32 = 60;
const RATE_WINDOW_SECS: i64 = 60;

#[derive(Clone)]
struct AppState {
    config: ServiceConfig,
    cipher: Arc<CredentialCipher>,
    store: GateStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = ServiceConfig::from_env("crypto-gate-service", 8004);

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    let database_url = config
        .database_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;

    let store = GateStore::new(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;
    store
        .migrate()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    let cipher = CredentialCipher::from_env(config.service_token.as_deref())?;
    info!("Crypto gate using key version {}", cipher.version());

    let state = AppState {
        config: config.clone(),
        cipher: Arc::new(cipher),
        store,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/crypto", post(crypto_gate))
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Crypto Gate Service listening on port {}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[instrument]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::new("crypto-gate-service"))
}

#[instrument(skip(state, headers, request))]
async fn crypto_gate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CryptoRequest>,
) -> ServiceResult<Json<CryptoResponse>> {
    let actor = authorize(&state.config, &headers)?;

    if request.data.is_empty() {
        return Err(ServiceError::BadRequest("data is required".to_string()));
    }

    // Rate-limit per target mailbox where known, per actor otherwise.
    // The check fails open: an unavailable counter store must not take
    // credential access down with it.
    let rate_key = request
        .mailbox_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| actor.clone());
    match state
        .store
        .check_rate_limit(&rate_key, RATE_LIMIT, RATE_WINDOW_SECS)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return Err(ServiceError::RateLimited(
                "Crypto gate rate limit exceeded".to_string(),
            ))
        }
        Err(e) => warn!("Rate limit check failed, allowing request: {}", e),
    }

    // Audit the attempt before the operation so failed calls leave a trace
    // too. Best-effort: a broken audit table must not block the result.
    if let Err(e) = state
        .store
        .record_audit(&actor, request.operation, request.mailbox_id)
        .await
    {
        warn!("Audit append failed: {}", e);
    }

    let result = match request.operation {
        CryptoOperation::Encrypt => state.cipher.encrypt(&request.data)?,
        CryptoOperation::Decrypt => state.cipher.decrypt(&request.data)?,
    };

    Ok(Json(CryptoResponse {
        result,
        version: state.cipher.version(),
    }))
}

/// Bearer service-token check. Fails closed when no token is configured:
/// an unauthenticated crypto gate would hand out plaintext credentials.
fn authorize(config: &ServiceConfig, headers: &HeaderMap) -> ServiceResult<String> {
    let expected = config.service_token.as_deref().ok_or_else(|| {
        ServiceError::Unauthorized("Service token not configured".to_string())
    })?;

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("Missing authorization header".to_string()))?;

    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        ServiceError::Unauthorized("Malformed authorization header".to_string())
    })?;

    if token != expected {
        return Err(ServiceError::Unauthorized("Invalid service token".to_string()));
    }

    Ok("service".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with_token(token: Option<&str>) -> ServiceConfig {
        ServiceConfig {
            service_name: "crypto-gate-service".to_string(),
            port: 8004,
            database_url: None,
            openai_api_key: None,
            service_token: token.map(|t| t.to_string()),
            log_level: "info".to_string(),
        }
    }

    fn headers_with(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(v) = value {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[test]
    fn test_authorize_accepts_matching_bearer_token() {
        let config = config_with_token(Some("sekrit"));
        let headers = headers_with(Some("Bearer sekrit"));
        assert_eq!(authorize(&config, &headers).unwrap(), "service");
    }

    #[test]
    fn test_authorize_rejects_wrong_token() {
        let config = config_with_token(Some("sekrit"));
        let headers = headers_with(Some("Bearer wrong"));
        assert!(authorize(&config, &headers).is_err());
    }

    #[test]
    fn test_authorize_rejects_missing_header() {
        let config = config_with_token(Some("sekrit"));
        assert!(authorize(&config, &headers_with(None)).is_err());
    }

    #[test]
    fn test_authorize_rejects_non_bearer_scheme() {
        let config = config_with_token(Some("sekrit"));
        let headers = headers_with(Some("Basic sekrit"));
        assert!(authorize(&config, &headers).is_err());
    }

    #[test]
    fn test_authorize_fails_closed_without_configured_token() {
        let config = config_with_token(None);
        let headers = headers_with(Some("Bearer anything"));
        assert!(authorize(&config, &headers).is_err());
    }
}
