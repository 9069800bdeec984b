//! Payment gateway types and the client seam.
//!
//! Orders live in the gateway, not in this system; the notes attached at
//! creation time are the only durable bridge between order creation and
//! webhook arrival once the originating request context is gone. They must
//! carry the purchasing user's id and the target level.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::Level;

pub const NOTE_USER_ID: &str = "user_id";
pub const NOTE_LEVEL: &str = "level";
pub const NOTE_TOKENS_REDEEMED: &str = "tokens_redeemed";

/// Order status reported by the gateway once the charge is captured.
pub const ORDER_STATUS_PAID: &str = "paid";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Request(String),
    #[error("gateway returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode gateway response: {0}")]
    Decode(String),
}

/// Typed view of the notes attachment written at order creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderNotes {
    pub user_id: String,
    pub level: Level,
    pub tokens_redeemed: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotesError {
    #[error("order notes missing field '{0}'")]
    MissingField(&'static str),
    #[error("order notes carry unknown level '{0}'")]
    UnknownLevel(String),
}

impl OrderNotes {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NOTE_USER_ID.to_string(), self.user_id.clone()),
            (NOTE_LEVEL.to_string(), self.level.as_str().to_string()),
            (
                NOTE_TOKENS_REDEEMED.to_string(),
                self.tokens_redeemed.to_string(),
            ),
        ])
    }

    /// Read the notes back out of a fetched order.
    ///
    /// `tokens_redeemed` is informational only; the charged amount on the
    /// order is the authority for how many tokens were consumed, so a missing
    /// or garbled value falls back to zero instead of failing the order.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, NotesError> {
        let user_id = map
            .get(NOTE_USER_ID)
            .filter(|v| !v.trim().is_empty())
            .ok_or(NotesError::MissingField(NOTE_USER_ID))?
            .clone();
        let level_raw = map
            .get(NOTE_LEVEL)
            .ok_or(NotesError::MissingField(NOTE_LEVEL))?;
        let level =
            Level::parse(level_raw).ok_or_else(|| NotesError::UnknownLevel(level_raw.clone()))?;
        let tokens_redeemed = map
            .get(NOTE_TOKENS_REDEEMED)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(Self {
            user_id,
            level,
            tokens_redeemed,
        })
    }
}

/// Request body for creating a gateway order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayOrderRequest {
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: BTreeMap<String, String>,
}

/// An order as the gateway reports it. Read-only on our side after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub receipt: Option<String>,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

/// The external payment processor, behind a trait so tests can run against an
/// in-memory double.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, req: &GatewayOrderRequest) -> Result<GatewayOrder, GatewayError>;

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder, GatewayError>;

    /// Public key identifier the browser checkout widget needs.
    fn key_id(&self) -> &str;
}
