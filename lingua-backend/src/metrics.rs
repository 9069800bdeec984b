//! Read-only revenue and activity aggregation for operators.
//!
//! Sums over the full transaction ledger plus a trailing-window view of the
//! account base. Gated by its own shared secret, separate from the access
//! gate the app itself uses.

use std::collections::BTreeMap;

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;

use crate::{
    payments::level_from_description, secret_matches, store::epoch_secs, ApiError, AppState,
    CODE_METRICS_FAILURE,
};

/// Header carrying the operator's shared secret.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

const ACTIVITY_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub ok: bool,
    pub total_revenue: i64,
    pub active_accounts: usize,
    pub new_signups: usize,
    pub revenue_by_entitlement: BTreeMap<String, i64>,
}

pub async fn metrics_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsResponse>, ApiError> {
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if presented.is_empty() || !secret_matches(presented, &state.config().admin_token) {
        return Err(ApiError::unauthorized());
    }

    let transactions = state
        .ledger()
        .all()
        .map_err(|err| ApiError::internal(CODE_METRICS_FAILURE, err))?;
    let accounts = state
        .accounts()
        .all()
        .map_err(|err| ApiError::internal(CODE_METRICS_FAILURE, err))?;

    let mut total_revenue = 0i64;
    let mut revenue_by_entitlement: BTreeMap<String, i64> = BTreeMap::new();
    for tx in &transactions {
        total_revenue += tx.amount_charged;
        // Rows whose description predates the current encoding, or that were
        // written by manual adjustment, simply do not group by level.
        if let Some(level) = level_from_description(&tx.description) {
            *revenue_by_entitlement
                .entry(level.as_str().to_string())
                .or_default() += tx.amount_charged;
        }
    }

    let cutoff = epoch_secs().saturating_sub(ACTIVITY_WINDOW_SECS);
    let active_accounts = accounts
        .iter()
        .filter(|account| account.last_active_at >= cutoff)
        .count();
    let new_signups = accounts
        .iter()
        .filter(|account| account.created_at >= cutoff)
        .count();

    Ok(Json(MetricsResponse {
        ok: true,
        total_revenue,
        active_accounts,
        new_signups,
        revenue_by_entitlement,
    }))
}
