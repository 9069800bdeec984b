//! Payment backend for the Lingua language-learning app.
//!
//! Exposes order creation, the two payment reconciliation entry points
//! (synchronous confirm and asynchronous gateway webhook), an access-code
//! gate, and an operator metrics endpoint. State lives in sled-backed
//! stores; the payment gateway and auth provider sit behind trait objects
//! so tests can swap them out.

use std::{env, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lingua_common::{LevelCatalog, PaymentGateway};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

pub mod auth;
pub mod gateway;
pub mod metrics;
pub mod payments;
pub mod store;

use auth::{AuthProvider, TokenRegistry};
use gateway::RestGateway;
use store::{AccountStore, TransactionLedger};

const LISTEN_ADDR_ENV: &str = "LINGUA_LISTEN_ADDR";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const CURRENCY_ENV: &str = "LINGUA_CURRENCY";
const DEFAULT_CURRENCY: &str = "INR";
const CATALOG_PATH_ENV: &str = "LINGUA_CATALOG_PATH";
const GATEWAY_KEY_SECRET_ENV: &str = "LINGUA_GATEWAY_KEY_SECRET";
const WEBHOOK_SECRET_ENV: &str = "LINGUA_WEBHOOK_SECRET";
const ACCESS_CODE_ENV: &str = "LINGUA_ACCESS_CODE";
const ADMIN_TOKEN_ENV: &str = "LINGUA_ADMIN_TOKEN";

pub const CODE_UNAUTHORIZED: &str = "unauthorized";
pub const CODE_FORBIDDEN: &str = "forbidden";
pub const CODE_INVALID_INPUT: &str = "invalid_input";
pub const CODE_UNKNOWN_LEVEL: &str = "unknown_level";
pub const CODE_ALREADY_OWNED: &str = "already_owned";
pub const CODE_ZERO_AMOUNT: &str = "zero_amount_order";
pub const CODE_ACCOUNT_NOT_FOUND: &str = "account_not_found";
pub const CODE_GATEWAY_ERROR: &str = "gateway_error";
pub const CODE_INVALID_SIGNATURE: &str = "invalid_signature";
pub const CODE_PERSISTENCE: &str = "persistence_failure";
pub const CODE_INCONSISTENT_ORDER: &str = "inconsistent_order";
pub const CODE_ACCESS_DENIED: &str = "access_denied";
pub const CODE_METRICS_FAILURE: &str = "metrics_failure";

/// Secrets and fixed settings, loaded once at startup.
pub struct AppConfig {
    pub currency: String,
    /// Signs the sync confirmation message `"{order_id}|{payment_id}"`.
    pub gateway_key_secret: String,
    /// Signs raw webhook bodies; distinct from the key secret.
    pub webhook_secret: String,
    pub access_code: String,
    pub admin_token: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            currency: env::var(CURRENCY_ENV).unwrap_or_else(|_| DEFAULT_CURRENCY.to_string()),
            gateway_key_secret: require_env(GATEWAY_KEY_SECRET_ENV),
            webhook_secret: require_env(WEBHOOK_SECRET_ENV),
            access_code: require_env(ACCESS_CODE_ENV),
            admin_token: require_env(ADMIN_TOKEN_ENV),
        }
    }
}

fn require_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    catalog: Arc<LevelCatalog>,
    accounts: AccountStore,
    ledger: TransactionLedger,
    auth: Arc<dyn AuthProvider>,
    gateway: Arc<dyn PaymentGateway>,
}

impl AppState {
    pub fn with_components(
        config: AppConfig,
        catalog: LevelCatalog,
        accounts: AccountStore,
        ledger: TransactionLedger,
        auth: Arc<dyn AuthProvider>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            accounts,
            ledger,
            auth,
            gateway,
        }
    }

    pub fn from_env() -> Self {
        let catalog = match env::var(CATALOG_PATH_ENV) {
            Ok(path) => LevelCatalog::from_path(path),
            Err(_) => LevelCatalog::builtin(),
        };
        Self::with_components(
            AppConfig::from_env(),
            catalog,
            AccountStore::from_env(),
            TransactionLedger::from_env(),
            Arc::new(TokenRegistry::from_env()),
            Arc::new(RestGateway::from_env()),
        )
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn catalog(&self) -> &LevelCatalog {
        &self.catalog
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn auth(&self) -> &dyn AuthProvider {
        self.auth.as_ref()
    }

    pub fn gateway(&self) -> &dyn PaymentGateway {
        self.gateway.as_ref()
    }
}

/// Constant-time shared-secret comparison; a length mismatch is simply
/// "not equal".
pub(crate) fn secret_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            CODE_UNAUTHORIZED,
            "missing or invalid credentials",
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, CODE_FORBIDDEN, message)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn upstream(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_PERSISTENCE, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            error_code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Access gate
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AccessCheckRequest {
    #[serde(default)]
    code: String,
}

#[derive(Serialize)]
struct AccessCheckResponse {
    ok: bool,
}

async fn access_check_handler(
    State(state): State<AppState>,
    Json(req): Json<AccessCheckRequest>,
) -> Result<Json<AccessCheckResponse>, ApiError> {
    let presented = req.code.trim();
    if presented.is_empty() {
        return Err(ApiError::bad_request(CODE_INVALID_INPUT, "code is required"));
    }
    if !secret_matches(presented, &state.config().access_code) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            CODE_ACCESS_DENIED,
            "access code does not match",
        ));
    }
    Ok(Json(AccessCheckResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/payments/order", post(payments::create_order_handler))
        .route(
            "/api/payments/confirm",
            post(payments::confirm_payment_handler),
        )
        .route("/api/payments/webhook", post(payments::webhook_handler))
        .route("/api/access/check", post(access_check_handler))
        .route("/api/admin/metrics", get(metrics::metrics_handler))
        .with_state(state)
}

pub async fn serve() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = app_router(AppState::from_env()).layer(cors);
    let addr = env::var(LISTEN_ADDR_ENV).unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    tracing::info!(%addr, "listening");
    let listener = TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app.into_make_service())
        .await
        .unwrap();
}
