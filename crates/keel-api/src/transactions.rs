use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::warn;

use keel_types::error::ErrorKind;
use keel_types::models::{TransactionRecord, TxPurpose};

use crate::{ApiError, AppState, run_blocking};

/// Verification-status lookup for an anchored transaction.
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let key = hash.to_ascii_lowercase();
    let row = run_blocking(move || db.get_transaction(&key)).await?;

    let row = row.ok_or(ApiError::Kind(ErrorKind::NotFound))?;

    Ok(Json(TransactionRecord {
        hash: row.hash.clone(),
        purpose: parse_purpose(&row.purpose, &row.hash),
        sender: row.sender,
        verified: row.verified,
        verified_at: row.verified_at.as_deref().and_then(parse_ts),
        created_at: parse_ts(&row.created_at).unwrap_or_default(),
    }))
}

fn parse_purpose(s: &str, hash: &str) -> TxPurpose {
    match s {
        "message" => TxPurpose::Message,
        "call" => TxPurpose::Call,
        "status" => TxPurpose::Status,
        "payment" => TxPurpose::Payment,
        other => {
            warn!("Corrupt purpose '{}' on transaction '{}'", other, hash);
            TxPurpose::Message
        }
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
