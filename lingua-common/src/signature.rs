//! HMAC-SHA256 signatures for the two payment verification modes.
//!
//! The confirmation signature binds a gateway order id to a payment id and is
//! keyed with the gateway key secret; the client forwards it after checkout.
//! A match proves only the order/payment pairing, never the amount, so the
//! reconciler still fetches authoritative order data from the gateway.
//!
//! The webhook signature is computed by the gateway over the raw request body
//! and keyed with a separate webhook secret. It must be checked against the
//! byte-exact body; re-serializing the JSON can change the byte layout and
//! break the signature.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature mismatch")]
    Mismatch,
}

fn hmac_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of two hex digests.
///
/// A length mismatch is "not equal", never an error: `ct_eq` on slices of
/// differing length yields false without early exit.
fn digests_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Sign an order/payment pairing the way the gateway does after checkout.
pub fn sign_confirmation(order_id: &str, payment_id: &str, key_secret: &str) -> String {
    let message = format!("{order_id}|{payment_id}");
    hmac_hex(key_secret, message.as_bytes())
}

/// Verify a client-forwarded confirmation signature.
pub fn verify_confirmation(
    order_id: &str,
    payment_id: &str,
    signature: &str,
    key_secret: &str,
) -> Result<(), SignatureError> {
    let expected = sign_confirmation(order_id, payment_id, key_secret);
    if digests_match(&expected, signature) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Sign a webhook body the way the gateway does on delivery.
pub fn sign_webhook_body(body: &[u8], webhook_secret: &str) -> String {
    hmac_hex(webhook_secret, body)
}

/// Verify a gateway webhook signature over the raw, byte-exact request body.
pub fn verify_webhook_body(
    body: &[u8],
    signature: &str,
    webhook_secret: &str,
) -> Result<(), SignatureError> {
    let expected = sign_webhook_body(body, webhook_secret);
    if digests_match(&expected, signature) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
