//! End-to-end tests over the HTTP surface: order creation, both
//! reconciliation paths, the access gate, and the metrics endpoint, all
//! against in-memory stores and the fixture gateway.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use lingua_backend::{
    app_router,
    auth::TokenRegistry,
    metrics::ADMIN_TOKEN_HEADER,
    payments::WEBHOOK_SIGNATURE_HEADER,
    store::{AccountStore, TransactionLedger, UserAccount},
    AppConfig, AppState,
};
use lingua_common::{sign_confirmation, Level, LevelCatalog};
use lingua_test_fixtures::{
    signed_webhook, webhook_body, StaticGateway, TEST_KEY_ID, TEST_KEY_SECRET, TEST_WEBHOOK_SECRET,
};
use serde_json::{json, Value};
use tower::ServiceExt;

const ACCESS_CODE: &str = "open-sesame";
const ADMIN_TOKEN: &str = "metrics_secret";

struct TestApp {
    state: AppState,
    gateway: Arc<StaticGateway>,
}

/// Fresh app: alice has 200 credits and a 10-day streak, bob is a blank
/// account, `tok_ghost` resolves to a user with no profile row.
fn test_app() -> TestApp {
    let gateway = Arc::new(StaticGateway::new());

    let auth = TokenRegistry::in_memory();
    auth.insert("tok_alice", "alice");
    auth.insert("tok_bob", "bob");
    auth.insert("tok_ghost", "ghost");

    let accounts = AccountStore::in_memory();
    let mut alice = UserAccount::new("alice");
    alice.credit_balance = 200;
    alice.streak_count = 10;
    accounts.upsert(alice).unwrap();
    accounts.upsert(UserAccount::new("bob")).unwrap();

    let config = AppConfig {
        currency: "INR".to_string(),
        gateway_key_secret: TEST_KEY_SECRET.to_string(),
        webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        access_code: ACCESS_CODE.to_string(),
        admin_token: ADMIN_TOKEN.to_string(),
    };
    let state = AppState::with_components(
        config,
        LevelCatalog::builtin(),
        accounts,
        TransactionLedger::in_memory(),
        Arc::new(auth),
        gateway.clone(),
    );
    TestApp { state, gateway }
}

impl TestApp {
    fn router(&self) -> Router {
        app_router(self.state.clone())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn post_json(
        &self,
        uri: &str,
        bearer: Option<&str>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn deliver_webhook(
        &self,
        body: Vec<u8>,
        signature: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header(WEBHOOK_SIGNATURE_HEADER, signature);
        }
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    /// Create an order, mark it paid at the gateway, and return
    /// (order_id, payment_id, confirmation signature).
    async fn paid_order(
        &self,
        bearer: &str,
        level: &str,
        tokens: f64,
    ) -> (String, String, String) {
        let (status, body) = self
            .post_json(
                "/api/payments/order",
                Some(bearer),
                json!({"level": level, "tokensRedeemed": tokens}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "order creation failed: {body}");
        let order_id = body["orderId"].as_str().unwrap().to_string();
        self.gateway.mark_paid(&order_id);
        let payment_id = format!("pay_{order_id}");
        let signature = sign_confirmation(&order_id, &payment_id, TEST_KEY_SECRET);
        (order_id, payment_id, signature)
    }

    fn account(&self, user_id: &str) -> UserAccount {
        self.state.accounts().get(user_id).unwrap().unwrap()
    }

    fn ledger_len(&self) -> usize {
        self.state.ledger().all().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Order creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_order_applies_discount_cap() {
    let app = test_app();
    // 500 requested, but min(balance 200, floor(2999 * 0.25) = 749) = 200.
    let (status, body) = app
        .post_json(
            "/api/payments/order",
            Some("tok_alice"),
            json!({"level": "A2", "tokensRedeemed": 500.0}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amount"], 2799);
    assert_eq!(body["currency"], "INR");
    assert_eq!(body["gatewayKeyId"], TEST_KEY_ID);

    let order = app.gateway.order(body["orderId"].as_str().unwrap()).unwrap();
    assert_eq!(order.amount, 2799);
    assert_eq!(order.notes.get("user_id").map(String::as_str), Some("alice"));
    assert_eq!(order.notes.get("level").map(String::as_str), Some("A2"));
}

#[tokio::test]
async fn create_order_requires_bearer_token() {
    let app = test_app();
    let (status, body) = app
        .post_json("/api/payments/order", None, json!({"level": "A2"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "unauthorized");

    let (status, _) = app
        .post_json("/api/payments/order", Some("tok_nobody"), json!({"level": "A2"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_order_rejects_unknown_level() {
    let app = test_app();
    let (status, body) = app
        .post_json(
            "/api/payments/order",
            Some("tok_alice"),
            json!({"level": "Z9"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "unknown_level");
}

#[tokio::test]
async fn create_order_rejects_already_owned_level() {
    let app = test_app();
    let mut alice = app.account("alice");
    alice.owned_levels.insert(Level::A2);
    app.state.accounts().upsert(alice).unwrap();

    let (status, body) = app
        .post_json(
            "/api/payments/order",
            Some("tok_alice"),
            json!({"level": "A2"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "already_owned");
}

#[tokio::test]
async fn create_order_without_profile_is_not_found() {
    let app = test_app();
    let (status, body) = app
        .post_json(
            "/api/payments/order",
            Some("tok_ghost"),
            json!({"level": "A2"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "account_not_found");
}

#[tokio::test]
async fn create_order_surfaces_gateway_outage() {
    let app = test_app();
    app.gateway.set_fail_creates(true);
    let (status, body) = app
        .post_json(
            "/api/payments/order",
            Some("tok_alice"),
            json!({"level": "A2"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error_code"], "gateway_error");
}

// ---------------------------------------------------------------------------
// Confirm path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirm_applies_credit_and_entitlement() {
    let app = test_app();
    let (order_id, payment_id, signature) = app.paid_order("tok_alice", "A2", 500.0).await;

    let (status, body) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_alice"),
            json!({
                "orderId": order_id,
                "paymentId": payment_id,
                "signature": signature,
                "level": "A2",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "confirm failed: {body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["creditBalance"], 0);
    assert_eq!(body["ownedEntitlements"], json!(["A2"]));

    let alice = app.account("alice");
    assert_eq!(alice.credit_balance, 0);
    assert!(alice.owned_levels.contains(&Level::A2));

    let rows = app.state.ledger().all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount_charged, 2799);
    assert_eq!(rows[0].tokens_redeemed, 200);
    assert_eq!(
        rows[0].description,
        format!("LEVEL_A2 | Gateway {payment_id}")
    );
}

#[tokio::test]
async fn confirm_is_idempotent() {
    let app = test_app();
    let (order_id, payment_id, signature) = app.paid_order("tok_alice", "A2", 500.0).await;
    let request = json!({
        "orderId": order_id,
        "paymentId": payment_id,
        "signature": signature,
        "level": "A2",
    });

    let (status, first) = app
        .post_json("/api/payments/confirm", Some("tok_alice"), request.clone())
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = app
        .post_json("/api/payments/confirm", Some("tok_alice"), request)
        .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(first["transactionId"], second["transactionId"]);
    assert_eq!(second["creditBalance"], 0);
    assert_eq!(app.account("alice").credit_balance, 0);
    assert_eq!(app.ledger_len(), 1);
}

#[tokio::test]
async fn confirm_rejects_tampered_signature() {
    let app = test_app();
    let (order_id, payment_id, _) = app.paid_order("tok_alice", "A2", 500.0).await;

    let (status, body) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_alice"),
            json!({
                "orderId": order_id,
                "paymentId": payment_id,
                "signature": "ab".repeat(32),
                "level": "A2",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "invalid_signature");

    let alice = app.account("alice");
    assert_eq!(alice.credit_balance, 200);
    assert!(alice.owned_levels.is_empty());
    assert_eq!(app.ledger_len(), 0);
}

#[tokio::test]
async fn confirm_rejects_missing_fields() {
    let app = test_app();
    let (status, body) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_alice"),
            json!({"orderId": "order_0001"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "invalid_input");
}

#[tokio::test]
async fn confirm_by_another_user_is_forbidden() {
    let app = test_app();
    let (order_id, payment_id, signature) = app.paid_order("tok_alice", "A2", 0.0).await;

    let (status, body) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_bob"),
            json!({
                "orderId": order_id,
                "paymentId": payment_id,
                "signature": signature,
                "level": "A2",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "forbidden");

    assert!(app.account("bob").owned_levels.is_empty());
    assert!(app.account("alice").owned_levels.is_empty());
    assert_eq!(app.ledger_len(), 0);
}

#[tokio::test]
async fn confirm_surfaces_gateway_fetch_failure() {
    let app = test_app();
    let (order_id, payment_id, signature) = app.paid_order("tok_alice", "A2", 500.0).await;
    app.gateway.set_fail_fetches(true);

    let (status, body) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_alice"),
            json!({
                "orderId": order_id,
                "paymentId": payment_id,
                "signature": signature,
                "level": "A2",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error_code"], "gateway_error");
    assert_eq!(app.account("alice").credit_balance, 200);
}

#[tokio::test]
async fn confirm_resanitizes_against_current_balance() {
    let app = test_app();
    // Order priced while alice held 200 tokens.
    let (order_id, payment_id, signature) = app.paid_order("tok_alice", "A2", 500.0).await;

    // Balance drops before the confirmation lands.
    let mut alice = app.account("alice");
    alice.credit_balance = 50;
    app.state.accounts().upsert(alice).unwrap();

    let (status, body) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_alice"),
            json!({
                "orderId": order_id,
                "paymentId": payment_id,
                "signature": signature,
                "level": "A2",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "confirm failed: {body}");

    // Only the 50 still held are consumed; the balance never goes negative.
    assert_eq!(app.account("alice").credit_balance, 0);
    let rows = app.state.ledger().all().unwrap();
    assert_eq!(rows[0].tokens_redeemed, 50);
    assert_eq!(rows[0].amount_charged, 2799);
}

// ---------------------------------------------------------------------------
// Webhook path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn webhook_reconciles_captured_payment() {
    let app = test_app();
    let (order_id, payment_id, _) = app.paid_order("tok_alice", "A2", 500.0).await;

    let (body, signature) = signed_webhook("payment.captured", &payment_id, &order_id, "captured");
    let (status, ack) = app.deliver_webhook(body, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["received"], true);
    assert_eq!(ack["ok"], true);

    let alice = app.account("alice");
    assert_eq!(alice.credit_balance, 0);
    assert!(alice.owned_levels.contains(&Level::A2));
    assert_eq!(app.ledger_len(), 1);
}

#[tokio::test]
async fn webhook_duplicate_delivery_is_acknowledged_without_effect() {
    let app = test_app();
    let (order_id, payment_id, _) = app.paid_order("tok_alice", "A2", 500.0).await;
    let (body, signature) = signed_webhook("payment.captured", &payment_id, &order_id, "captured");

    let (status, first) = app
        .deliver_webhook(body.clone(), Some(&signature))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["ok"], true);

    let (status, second) = app.deliver_webhook(body, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);

    assert_eq!(app.account("alice").credit_balance, 0);
    assert_eq!(app.ledger_len(), 1);
}

#[tokio::test]
async fn webhook_rejects_bad_or_missing_signature() {
    let app = test_app();
    let (order_id, payment_id, _) = app.paid_order("tok_alice", "A2", 500.0).await;
    let body = webhook_body("payment.captured", &payment_id, &order_id, "captured");

    let (status, response) = app
        .deliver_webhook(body.clone(), Some(&"ab".repeat(32)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error_code"], "invalid_signature");

    let (status, _) = app.deliver_webhook(body, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(app.account("alice").credit_balance, 200);
    assert_eq!(app.ledger_len(), 0);
}

#[tokio::test]
async fn webhook_ignores_unhandled_events() {
    let app = test_app();
    let (order_id, payment_id, _) = app.paid_order("tok_alice", "A2", 500.0).await;

    let (body, signature) = signed_webhook("refund.created", &payment_id, &order_id, "captured");
    let (status, ack) = app.deliver_webhook(body, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ignored"], true);

    assert_eq!(app.account("alice").credit_balance, 200);
    assert_eq!(app.ledger_len(), 0);
}

#[tokio::test]
async fn webhook_ignores_payload_without_ids() {
    let app = test_app();
    let (body, signature) = signed_webhook("payment.captured", "", "", "captured");
    let (status, ack) = app.deliver_webhook(body, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ignored"], true);
}

#[tokio::test]
async fn webhook_ignores_uncaptured_status() {
    let app = test_app();
    let (order_id, payment_id, _) = app.paid_order("tok_alice", "A2", 500.0).await;

    let (body, signature) = signed_webhook("payment.captured", &payment_id, &order_id, "failed");
    let (status, ack) = app.deliver_webhook(body, Some(&signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ignored"], true);
    assert_eq!(app.ledger_len(), 0);
}

#[tokio::test]
async fn webhook_absorbs_gateway_fetch_failure() {
    let app = test_app();
    let (order_id, payment_id, _) = app.paid_order("tok_alice", "A2", 500.0).await;
    app.gateway.set_fail_fetches(true);

    let (body, signature) = signed_webhook("payment.captured", &payment_id, &order_id, "captured");
    let (status, ack) = app.deliver_webhook(body, Some(&signature)).await;
    // A 200 with an ignored body, never an error status the gateway would retry.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ignored"], true);
    assert!(ack["reason"].as_str().unwrap().contains("fetch"));
    assert_eq!(app.account("alice").credit_balance, 200);
}

#[tokio::test]
async fn confirm_after_webhook_converges() {
    let app = test_app();
    let (order_id, payment_id, signature) = app.paid_order("tok_alice", "A2", 500.0).await;

    let (body, webhook_sig) =
        signed_webhook("payment.captured", &payment_id, &order_id, "captured");
    let (status, _) = app.deliver_webhook(body, Some(&webhook_sig)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, response) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_alice"),
            json!({
                "orderId": order_id,
                "paymentId": payment_id,
                "signature": signature,
                "level": "A2",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["success"], true);
    assert_eq!(response["creditBalance"], 0);

    let rows = app.state.ledger().all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        response["transactionId"].as_str().unwrap(),
        rows[0].id.to_string()
    );
}

// ---------------------------------------------------------------------------
// Access gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn access_gate_checks_the_code() {
    let app = test_app();

    let (status, body) = app
        .post_json("/api/access/check", None, json!({"code": ACCESS_CODE}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // Surrounding whitespace is tolerated.
    let (status, _) = app
        .post_json(
            "/api/access/check",
            None,
            json!({"code": format!("  {ACCESS_CODE} ")}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .post_json("/api/access/check", None, json!({"code": "wrong"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "access_denied");

    let (status, body) = app.post_json("/api/access/check", None, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "invalid_input");
}

// ---------------------------------------------------------------------------
// Admin metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_aggregate_revenue_and_activity() {
    let app = test_app();
    let (order_id, payment_id, signature) = app.paid_order("tok_alice", "A2", 500.0).await;
    let (status, _) = app
        .post_json(
            "/api/payments/confirm",
            Some("tok_alice"),
            json!({
                "orderId": order_id,
                "paymentId": payment_id,
                "signature": signature,
                "level": "A2",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/api/admin/metrics")
        .header(ADMIN_TOKEN_HEADER, ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["totalRevenue"], 2799);
    assert_eq!(body["revenueByEntitlement"]["A2"], 2799);
    // Both fixture accounts were created and active just now.
    assert_eq!(body["activeAccounts"], 2);
    assert_eq!(body["newSignups"], 2);
}

#[tokio::test]
async fn metrics_require_the_admin_token() {
    let app = test_app();

    let request = Request::builder()
        .method("GET")
        .uri("/api/admin/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "unauthorized");

    let request = Request::builder()
        .method("GET")
        .uri("/api/admin/metrics")
        .header(ADMIN_TOKEN_HEADER, "nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
