use chrono::Utc;
use tracing::info;

use keel_chain::RelayAction;
use keel_db::queries::fmt_ts;
use keel_types::error::ErrorKind;
use keel_types::models::TxPurpose;

use crate::{ApiError, AppState, run_blocking};

#[derive(Debug, Clone, PartialEq)]
pub enum AnchorOutcome {
    /// Ledger transaction confirmed and recorded as verified.
    Anchored { tx_ref: String },
    /// No path to the chain; the action proceeds off-chain.
    OffChain,
}

impl AnchorOutcome {
    pub fn tx_ref(&self) -> Option<&str> {
        match self {
            Self::Anchored { tx_ref } => Some(tx_ref),
            Self::OffChain => None,
        }
    }

    pub fn on_chain(&self) -> bool {
        matches!(self, Self::Anchored { .. })
    }
}

/// The on-chain/off-chain decision table for every anchored action.
///
/// - A client-submitted transaction (`client_tx_ref`) is verified against the
///   authenticated sender and the anchor contract. Failures surface;
///   retrying a mismatched transaction cannot succeed.
/// - Otherwise the relay submits on the user's behalf. `NotConfigured` and
///   `Timeout` degrade to the off-chain path so the product action still
///   succeeds; everything else surfaces.
///
/// On the anchored path the TransactionRecord is inserted and flipped to
/// verified before this function returns, so callers persist rows only after
/// verification.
pub async fn resolve_anchor(
    state: &AppState,
    action: RelayAction,
    purpose: TxPurpose,
    sender: &str,
    payload: &[u8],
    client_tx_ref: Option<&str>,
) -> Result<AnchorOutcome, ApiError> {
    if let Some(tx_ref) = client_tx_ref {
        state
            .verifier
            .verify(tx_ref, sender, state.anchor_contract())
            .await
            .map_err(ApiError::Kind)?;

        record_verified(state, tx_ref, purpose, sender).await?;
        return Ok(AnchorOutcome::Anchored {
            tx_ref: tx_ref.to_string(),
        });
    }

    match state.relay.submit(action, payload).await {
        Ok(tx_ref) => {
            let relay_address = state
                .relay
                .relay_address()
                .ok_or(ApiError::Kind(ErrorKind::NotConfigured))?
                .to_string();

            // Confirm through the verifier so the record only flips to
            // verified after an independent read of the ledger.
            match state
                .verifier
                .verify(&tx_ref, &relay_address, state.anchor_contract())
                .await
            {
                Ok(()) => {
                    record_verified(state, &tx_ref, purpose, &relay_address).await?;
                    Ok(AnchorOutcome::Anchored { tx_ref })
                }
                Err(kind) if kind.falls_back() => {
                    info!(
                        "anchor confirmation unavailable ({}), continuing off-chain",
                        kind
                    );
                    Ok(AnchorOutcome::OffChain)
                }
                Err(kind) => Err(ApiError::Kind(kind)),
            }
        }
        Err(kind) if kind.falls_back() => {
            info!(
                "anchoring unavailable ({}), continuing off-chain",
                kind
            );
            Ok(AnchorOutcome::OffChain)
        }
        Err(kind) => Err(ApiError::Kind(kind)),
    }
}

async fn record_verified(
    state: &AppState,
    tx_ref: &str,
    purpose: TxPurpose,
    sender: &str,
) -> Result<(), ApiError> {
    let db = state.db.clone();
    let hash = tx_ref.to_string();
    let sender = sender.to_string();
    run_blocking(move || {
        let now = fmt_ts(Utc::now());
        db.insert_transaction(&hash, purpose.as_str(), &sender, &now)?;
        db.mark_transaction_verified(&hash, &now)?;
        Ok(())
    })
    .await
}
