use std::time::Duration;

use keel_types::error::ErrorKind;
use tracing::{debug, warn};

use crate::rpc::{NodeClient, ReceiptObject, RpcError};

/// Read-only transaction verification. No mutation anywhere; every check is
/// idempotent and safe to retry.
#[derive(Debug, Clone)]
pub struct TransactionVerifier {
    node: NodeClient,
    receipt_deadline: Duration,
    poll_interval: Duration,
}

impl TransactionVerifier {
    pub fn new(node: NodeClient, receipt_deadline: Duration, poll_interval: Duration) -> Self {
        Self {
            node,
            receipt_deadline,
            poll_interval,
        }
    }

    /// Confirm that `tx_ref` exists, succeeded, was sent by `expected_sender`
    /// and — when `expected_contract` is given — targeted that contract.
    ///
    /// The contract check rejects transactions that succeeded but were sent
    /// elsewhere; the sender check binds a self-reported transaction to the
    /// authenticated identity claiming credit for it.
    pub async fn verify(
        &self,
        tx_ref: &str,
        expected_sender: &str,
        expected_contract: Option<&str>,
    ) -> Result<(), ErrorKind> {
        let tx = match self.node.transaction_by_hash(tx_ref).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return Err(ErrorKind::NotFound),
            Err(e) => return Err(map_rpc_error(e)),
        };

        let receipt = wait_for_receipt(
            &self.node,
            tx_ref,
            self.receipt_deadline,
            self.poll_interval,
        )
        .await?;

        if !receipt.succeeded() {
            warn!("transaction {} has unsuccessful receipt", tx_ref);
            return Err(ErrorKind::ExecutionFailed);
        }

        if let Some(contract) = expected_contract {
            let target = receipt.to.as_deref().unwrap_or_default();
            if !target.eq_ignore_ascii_case(contract) {
                warn!(
                    "transaction {} targeted {} instead of expected contract",
                    tx_ref, target
                );
                return Err(ErrorKind::WrongTarget);
            }
        }

        if !tx.from.eq_ignore_ascii_case(expected_sender) {
            warn!("transaction {} sender mismatch", tx_ref);
            return Err(ErrorKind::SenderMismatch);
        }

        debug!("transaction {} verified", tx_ref);
        Ok(())
    }
}

/// Poll for the inclusion receipt until `deadline` elapses.
pub async fn wait_for_receipt(
    node: &NodeClient,
    tx_hash: &str,
    deadline: Duration,
    interval: Duration,
) -> Result<ReceiptObject, ErrorKind> {
    let started = tokio::time::Instant::now();

    loop {
        match node.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => return Ok(receipt),
            Ok(None) => {}
            Err(e) => return Err(map_rpc_error(e)),
        }

        if started.elapsed() >= deadline {
            warn!("no receipt for {} within {:?}", tx_hash, deadline);
            return Err(ErrorKind::Timeout);
        }

        tokio::time::sleep(interval).await;
    }
}

pub(crate) fn map_rpc_error(e: RpcError) -> ErrorKind {
    match e {
        // Node unreachable or slow: callers may degrade to the off-chain path.
        RpcError::Transport(err) => {
            warn!("RPC transport failure: {}", err);
            ErrorKind::Timeout
        }
        RpcError::Node { code, message } => {
            warn!("node error {}: {}", code, message);
            ErrorKind::ExecutionFailed
        }
        RpcError::BadPayload(detail) => {
            warn!("malformed node response: {}", detail);
            ErrorKind::ExecutionFailed
        }
    }
}
