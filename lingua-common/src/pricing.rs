//! Discount pricing policy.
//!
//! Tokens earned through practice can offset part of a level purchase, capped
//! at a fraction of the base price that grows with the account's streak. The
//! same sanitization runs on the order-creation path and again on the
//! reconciliation path against a fresh account snapshot, so a client can
//! never claim a larger discount than policy allows.

/// Maximum fraction of the base price that tokens may cover.
pub fn max_discount_ratio(streak_count: u32) -> f64 {
    if streak_count >= 30 {
        0.30
    } else if streak_count >= 7 {
        0.25
    } else {
        0.20
    }
}

/// Largest token amount the account may redeem against `base_price`.
pub fn max_usable_tokens(credit_balance: i64, base_price: i64, streak_count: u32) -> i64 {
    let cap = (base_price as f64 * max_discount_ratio(streak_count)).floor() as i64;
    credit_balance.min(cap).max(0)
}

/// Clamp a client-requested token redemption to policy.
///
/// Non-finite or negative requests collapse to zero rather than erroring;
/// fractional requests round down. The result is always within both the
/// account balance and the streak-based discount cap.
pub fn sanitize_token_redemption(
    requested: f64,
    credit_balance: i64,
    base_price: i64,
    streak_count: u32,
) -> i64 {
    if !requested.is_finite() || requested < 0.0 {
        return 0;
    }
    let whole = requested.floor();
    let requested_tokens = if whole >= i64::MAX as f64 {
        i64::MAX
    } else {
        whole as i64
    };
    requested_tokens.min(max_usable_tokens(credit_balance, base_price, streak_count))
}
