//! Shared fixtures for exercising the payment pipeline without a live
//! gateway: an in-process [`PaymentGateway`] with scriptable failures, plus
//! helpers for building signed webhook deliveries.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use lingua_common::{
    sign_webhook_body, GatewayError, GatewayOrder, GatewayOrderRequest, PaymentGateway,
    ORDER_STATUS_PAID,
};

/// Key secret the test configuration signs confirmations with.
pub const TEST_KEY_SECRET: &str = "key_secret_fixture";
/// Webhook signing secret for the test configuration.
pub const TEST_WEBHOOK_SECRET: &str = "whsec_fixture";
/// Publishable key id the fixture gateway reports.
pub const TEST_KEY_ID: &str = "key_id_fixture";

const STATUS_CREATED: &str = "created";

/// In-memory stand-in for the hosted gateway.
///
/// Orders are held in a map keyed by generated id; tests drive the payment
/// lifecycle by calling [`mark_paid`](StaticGateway::mark_paid) between
/// order creation and reconciliation. Flipping the failure switches makes
/// the corresponding call return a request error, for outage tests.
pub struct StaticGateway {
    orders: Mutex<HashMap<String, GatewayOrder>>,
    next_order: AtomicU64,
    fail_creates: AtomicBool,
    fail_fetches: AtomicBool,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            next_order: AtomicU64::new(1),
            fail_creates: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
        }
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Move an order to the paid state, as the hosted checkout would after
    /// a successful charge.
    pub fn mark_paid(&self, order_id: &str) {
        let mut orders = self.orders.lock().expect("fixture gateway poisoned");
        if let Some(order) = orders.get_mut(order_id) {
            order.status = ORDER_STATUS_PAID.to_string();
        }
    }

    /// Seed an order directly, bypassing `create_order`.
    pub fn insert_order(&self, order: GatewayOrder) {
        self.orders
            .lock()
            .expect("fixture gateway poisoned")
            .insert(order.id.clone(), order);
    }

    pub fn order(&self, order_id: &str) -> Option<GatewayOrder> {
        self.orders
            .lock()
            .expect("fixture gateway poisoned")
            .get(order_id)
            .cloned()
    }
}

impl Default for StaticGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for StaticGateway {
    async fn create_order(&self, req: &GatewayOrderRequest) -> Result<GatewayOrder, GatewayError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(GatewayError::Request("fixture gateway is down".to_string()));
        }
        let seq = self.next_order.fetch_add(1, Ordering::SeqCst);
        let order = GatewayOrder {
            id: format!("order_{seq:04}"),
            amount: req.amount,
            currency: req.currency.clone(),
            status: STATUS_CREATED.to_string(),
            receipt: Some(req.receipt.clone()),
            notes: req.notes.clone(),
        };
        self.orders
            .lock()
            .expect("fixture gateway poisoned")
            .insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(GatewayError::Request("fixture gateway is down".to_string()));
        }
        self.order(order_id).ok_or(GatewayError::Status {
            status: 404,
            body: format!("order {order_id} not found"),
        })
    }

    fn key_id(&self) -> &str {
        TEST_KEY_ID
    }
}

/// Serialize a `payment.captured`-shaped webhook body.
pub fn webhook_body(event: &str, payment_id: &str, order_id: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "event": event,
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": order_id,
                    "status": status,
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

/// A webhook body plus the matching signature under [`TEST_WEBHOOK_SECRET`].
pub fn signed_webhook(
    event: &str,
    payment_id: &str,
    order_id: &str,
    status: &str,
) -> (Vec<u8>, String) {
    let body = webhook_body(event, payment_id, order_id, status);
    let signature = sign_webhook_body(&body, TEST_WEBHOOK_SECRET);
    (body, signature)
}
