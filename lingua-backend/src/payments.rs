//! Order creation and payment reconciliation.
//!
//! A purchase flows through three HTTP surfaces: the client asks for a
//! gateway order, pays at the gateway, and then the paid order reaches us on
//! either of two paths. The synchronous confirm call carries a client-held
//! signature over the order/payment pairing; the asynchronous webhook carries
//! the gateway's own signature over the raw body. Both converge on
//! [`reconcile`], which fetches the authoritative order from the gateway,
//! applies the credit/entitlement delta once, and appends the ledger row
//! whose description doubles as the idempotency key. Replays and duplicate
//! deliveries resolve against that key and change nothing.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use lingua_common::{
    pricing::sanitize_token_redemption, verify_confirmation, verify_webhook_body, GatewayError,
    GatewayOrderRequest, Level, NotesError, OrderNotes,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::{
    auth::bearer_token,
    store::{epoch_secs, ClaimOutcome, Transaction, UserAccount},
    ApiError, AppState, CODE_ACCOUNT_NOT_FOUND, CODE_ALREADY_OWNED, CODE_GATEWAY_ERROR,
    CODE_INCONSISTENT_ORDER, CODE_INVALID_INPUT, CODE_INVALID_SIGNATURE, CODE_UNKNOWN_LEVEL,
    CODE_ZERO_AMOUNT,
};

/// Header carrying the gateway's HMAC over the raw webhook body.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-gateway-signature";

const EVENT_PAYMENT_CAPTURED: &str = "payment.captured";
const STATUS_CAPTURED: &str = "captured";
const CHECKOUT_NAME: &str = "Lingua";

/// The ledger description for a reconciled payment.
///
/// This string is the idempotency key for the (user, payment) pair, and
/// AdminMetrics parses the level back out of it; keep both sides in sync.
pub fn reconciliation_description(level: Level, payment_id: &str) -> String {
    format!("LEVEL_{} | Gateway {}", level.as_str(), payment_id)
}

/// Inverse of [`reconciliation_description`], used by metrics aggregation.
pub fn level_from_description(description: &str) -> Option<Level> {
    let rest = description.strip_prefix("LEVEL_")?;
    let (level, _) = rest.split_once(' ')?;
    Level::parse(level)
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub level: String,
    /// Client-requested token redemption; sanitized server-side, so any
    /// finite non-negative number is acceptable here.
    #[serde(default)]
    pub tokens_redeemed: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    pub gateway_key_id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub payment_id: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub level: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentResponse {
    pub success: bool,
    pub credit_balance: i64,
    pub owned_entitlements: Vec<String>,
    pub transaction_id: Uuid,
}

/// Webhook acknowledgement. Everything except a signature failure is a 200;
/// non-2xx responses would make the gateway retry into duplicate work.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookAck {
    fn ok() -> Self {
        Self {
            received: true,
            ok: Some(true),
            ignored: None,
            duplicate: None,
            reason: None,
        }
    }

    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            received: true,
            ok: None,
            ignored: Some(true),
            duplicate: None,
            reason: Some(reason.into()),
        }
    }

    fn duplicate() -> Self {
        Self {
            received: true,
            ok: None,
            ignored: None,
            duplicate: Some(true),
            reason: None,
        }
    }
}

// Gateway-defined webhook payload; only the capture fields matter here.
#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(default)]
    event: String,
    payload: Option<WebhookPayload>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    payment: Option<WebhookPayment>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    entity: Option<PaymentEntity>,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    #[serde(default)]
    id: String,
    #[serde(default)]
    order_id: String,
    status: Option<String>,
}

// ---------------------------------------------------------------------------
// Order creation
// ---------------------------------------------------------------------------

pub async fn create_order_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;

    let level = Level::parse(&req.level)
        .filter(|level| state.catalog().contains(*level))
        .ok_or_else(|| {
            ApiError::bad_request(CODE_UNKNOWN_LEVEL, format!("unknown level '{}'", req.level))
        })?;
    // contains() above guarantees the price exists.
    let base_price = state.catalog().base_price(level).ok_or_else(|| {
        ApiError::bad_request(CODE_UNKNOWN_LEVEL, format!("level {} not for sale", level))
    })?;

    let account = state
        .accounts()
        .get(&user_id)
        .map_err(ApiError::persistence)?
        .ok_or_else(|| {
            ApiError::not_found(CODE_ACCOUNT_NOT_FOUND, "profile not found for this user")
        })?;

    if account.owned_levels.contains(&level) {
        return Err(ApiError::bad_request(
            CODE_ALREADY_OWNED,
            format!("level {} is already unlocked", level),
        ));
    }

    let safe_tokens = sanitize_token_redemption(
        req.tokens_redeemed,
        account.credit_balance,
        base_price,
        account.streak_count,
    );
    let amount_due = base_price - safe_tokens;
    if amount_due <= 0 {
        // The gateway cannot create a zero-value order; a fully discounted
        // purchase has no path through this flow.
        return Err(ApiError::bad_request(
            CODE_ZERO_AMOUNT,
            "discounted amount must be positive",
        ));
    }

    let notes = OrderNotes {
        user_id: user_id.clone(),
        level,
        tokens_redeemed: safe_tokens,
    };
    let order_req = GatewayOrderRequest {
        amount: amount_due,
        currency: state.config().currency.clone(),
        receipt: format!("lingua_{}", Uuid::new_v4().simple()),
        notes: notes.to_map(),
    };
    let order = state
        .gateway()
        .create_order(&order_req)
        .await
        .map_err(|err| ApiError::upstream(CODE_GATEWAY_ERROR, err.to_string()))?;

    Ok(Json(CreateOrderResponse {
        order_id: order.id,
        amount: order.amount,
        currency: order.currency,
        gateway_key_id: state.gateway().key_id().to_string(),
        name: CHECKOUT_NAME.to_string(),
        description: format!("{} level unlock", level),
    }))
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum ReconcileError {
    #[error("gateway order fetch failed: {0}")]
    GatewayFetch(GatewayError),
    #[error("{0}")]
    BadNotes(NotesError),
    #[error("level {0} is not in the catalog")]
    LevelNotForSale(Level),
    #[error("order belongs to another user")]
    UserMismatch,
    #[error("account '{0}' not found")]
    AccountMissing(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

enum ReconcileOutcome {
    Applied {
        account: UserAccount,
        transaction_id: Uuid,
    },
    AlreadyReconciled {
        transaction: Transaction,
    },
}

/// Shared reconciliation procedure for both entry points.
///
/// `authenticated_user` is set on the confirm path, where the caller's
/// identity must match the order's embedded user; the webhook path trusts
/// the order notes instead because the gateway itself is the caller.
async fn reconcile(
    state: &AppState,
    order_id: &str,
    payment_id: &str,
    authenticated_user: Option<&str>,
) -> Result<ReconcileOutcome, ReconcileError> {
    // The order record at the gateway is the authority for who is buying
    // what and how much was actually charged. Client-supplied amounts are
    // never trusted.
    let order = state
        .gateway()
        .fetch_order(order_id)
        .await
        .map_err(ReconcileError::GatewayFetch)?;

    let notes = OrderNotes::from_map(&order.notes).map_err(ReconcileError::BadNotes)?;
    let base_price = state
        .catalog()
        .base_price(notes.level)
        .ok_or(ReconcileError::LevelNotForSale(notes.level))?;

    if let Some(caller) = authenticated_user {
        if caller != notes.user_id {
            return Err(ReconcileError::UserMismatch);
        }
    }

    let description = reconciliation_description(notes.level, payment_id);
    if let Some(existing) = state
        .ledger()
        .find_reconciled(&notes.user_id, &description)
        .map_err(ReconcileError::Persistence)?
    {
        return Ok(ReconcileOutcome::AlreadyReconciled {
            transaction: existing,
        });
    }

    // Fresh snapshot: balance and streak may have moved since order creation.
    let mut account = state
        .accounts()
        .get(&notes.user_id)
        .map_err(ReconcileError::Persistence)?
        .ok_or_else(|| ReconcileError::AccountMissing(notes.user_id.clone()))?;

    let amount_paid = order.amount;
    let tokens_owed = (base_price - amount_paid).max(0);
    let tokens_consumed = sanitize_token_redemption(
        tokens_owed as f64,
        account.credit_balance,
        base_price,
        account.streak_count,
    );

    account.owned_levels.insert(notes.level);
    account.credit_balance = (account.credit_balance - tokens_consumed).max(0);
    account.last_active_at = epoch_secs();
    state
        .accounts()
        .upsert(account.clone())
        .map_err(ReconcileError::Persistence)?;

    // Account first, ledger second: if this insert fails the payment shows
    // up as applied-but-unledgered, and a retry re-runs the duplicate check,
    // finds no row, and knowingly re-applies. Narrow at-least-once window,
    // accepted over a multi-tree atomic transaction.
    let row = Transaction {
        id: Uuid::new_v4(),
        user_id: notes.user_id.clone(),
        description,
        amount_charged: amount_paid,
        tokens_redeemed: tokens_consumed,
        created_at: epoch_secs(),
    };
    let transaction_id = row.id;
    match state
        .ledger()
        .claim(row)
        .map_err(ReconcileError::Persistence)?
    {
        ClaimOutcome::Recorded => Ok(ReconcileOutcome::Applied {
            account,
            transaction_id,
        }),
        ClaimOutcome::Duplicate(existing) => Ok(ReconcileOutcome::AlreadyReconciled {
            transaction: existing,
        }),
    }
}

pub async fn confirm_payment_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConfirmPaymentRequest>,
) -> Result<Json<ConfirmPaymentResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;

    for (value, field) in [
        (&req.order_id, "orderId"),
        (&req.payment_id, "paymentId"),
        (&req.signature, "signature"),
        (&req.level, "level"),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::bad_request(
                CODE_INVALID_INPUT,
                format!("{field} is required"),
            ));
        }
    }

    verify_confirmation(
        &req.order_id,
        &req.payment_id,
        &req.signature,
        &state.config().gateway_key_secret,
    )
    .map_err(|_| ApiError::bad_request(CODE_INVALID_SIGNATURE, "payment signature mismatch"))?;

    // The claimed level must at least be a known catalog entry; the order
    // notes remain the authority on what was actually purchased.
    Level::parse(&req.level)
        .filter(|level| state.catalog().contains(*level))
        .ok_or_else(|| {
            ApiError::bad_request(CODE_UNKNOWN_LEVEL, format!("unknown level '{}'", req.level))
        })?;

    let outcome = reconcile(&state, &req.order_id, &req.payment_id, Some(&user_id))
        .await
        .map_err(|err| confirm_error(&err))?;

    let (account, transaction_id) = match outcome {
        ReconcileOutcome::Applied {
            account,
            transaction_id,
        } => (account, transaction_id),
        ReconcileOutcome::AlreadyReconciled { transaction } => {
            // Already applied by the other path; report the current state.
            let account = state
                .accounts()
                .get(&user_id)
                .map_err(ApiError::persistence)?
                .ok_or_else(|| {
                    ApiError::not_found(CODE_ACCOUNT_NOT_FOUND, "profile not found for this user")
                })?;
            (account, transaction.id)
        }
    };

    Ok(Json(ConfirmPaymentResponse {
        success: true,
        credit_balance: account.credit_balance,
        owned_entitlements: account
            .owned_levels
            .iter()
            .map(|level| level.as_str().to_string())
            .collect(),
        transaction_id,
    }))
}

fn confirm_error(err: &ReconcileError) -> ApiError {
    match err {
        ReconcileError::GatewayFetch(inner) => {
            ApiError::upstream(CODE_GATEWAY_ERROR, inner.to_string())
        }
        ReconcileError::BadNotes(_) | ReconcileError::LevelNotForSale(_) => {
            ApiError::bad_request(CODE_INCONSISTENT_ORDER, err.to_string())
        }
        ReconcileError::UserMismatch => ApiError::forbidden(err.to_string()),
        ReconcileError::AccountMissing(_) => {
            ApiError::not_found(CODE_ACCOUNT_NOT_FOUND, err.to_string())
        }
        ReconcileError::Persistence(inner) => ApiError::persistence(inner.clone()),
    }
}

pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    // A bad or missing signature is a security event and the one webhook
    // failure that is not absorbed into a 200.
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ApiError::bad_request(CODE_INVALID_SIGNATURE, "missing webhook signature header")
        })?;
    verify_webhook_body(&body, signature, &state.config().webhook_secret)
        .map_err(|_| ApiError::bad_request(CODE_INVALID_SIGNATURE, "webhook signature mismatch"))?;

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "webhook body did not parse");
            return Ok(Json(WebhookAck::ignored("unparseable payload")));
        }
    };

    if envelope.event != EVENT_PAYMENT_CAPTURED {
        return Ok(Json(WebhookAck::ignored(format!(
            "event '{}' not handled",
            envelope.event
        ))));
    }

    let Some(entity) = envelope
        .payload
        .and_then(|p| p.payment)
        .and_then(|p| p.entity)
    else {
        return Ok(Json(WebhookAck::ignored("payment entity missing")));
    };
    if entity.id.is_empty() || entity.order_id.is_empty() {
        return Ok(Json(WebhookAck::ignored("payment or order id missing")));
    }
    if let Some(status) = entity.status.as_deref() {
        if status != STATUS_CAPTURED {
            return Ok(Json(WebhookAck::ignored(format!(
                "payment status '{status}' is not captured"
            ))));
        }
    }

    // From here on, every failure is acknowledged rather than errored: the
    // gateway retries non-2xx deliveries, and the dedup claim already makes
    // its retries safe. The reason is logged for operators.
    match reconcile(&state, &entity.order_id, &entity.id, None).await {
        Ok(ReconcileOutcome::Applied { .. }) => Ok(Json(WebhookAck::ok())),
        Ok(ReconcileOutcome::AlreadyReconciled { .. }) => Ok(Json(WebhookAck::duplicate())),
        Err(err) => {
            warn!(
                order_id = %entity.order_id,
                payment_id = %entity.id,
                error = %err,
                "webhook reconciliation skipped"
            );
            Ok(Json(WebhookAck::ignored(err.to_string())))
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    bearer_token(headers)
        .and_then(|token| state.auth().resolve(token))
        .ok_or_else(ApiError::unauthorized)
}
