//! Shared pure logic for the lingua payment pipeline.
//!
//! Everything in this crate is I/O-free: the level catalog, the discount
//! pricing policy, and the HMAC signature construction used by both the
//! synchronous confirmation path and the asynchronous gateway webhook. The
//! backend crate wires these into HTTP handlers and stores.

pub mod catalog;
pub mod gateway;
pub mod pricing;
pub mod signature;

pub use catalog::{Level, LevelCatalog};
pub use gateway::{
    GatewayError, GatewayOrder, GatewayOrderRequest, NotesError, OrderNotes, PaymentGateway,
    ORDER_STATUS_PAID,
};
pub use signature::{
    sign_confirmation, sign_webhook_body, verify_confirmation, verify_webhook_body, SignatureError,
};
