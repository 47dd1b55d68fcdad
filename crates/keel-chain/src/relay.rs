use std::time::Duration;

use keel_types::error::ErrorKind;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::rpc::{NodeClient, RpcError};
use crate::verifier::wait_for_receipt;

/// Ledger-mutating actions the relay can perform on a user's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    SendMessage,
    InitiateCall,
    PostStatus,
    CreateConversation,
}

impl RelayAction {
    /// Leading calldata byte identifying the action on the anchor contract.
    pub fn tag(&self) -> u8 {
        match self {
            Self::SendMessage => 0x01,
            Self::InitiateCall => 0x02,
            Self::PostStatus => 0x03,
            Self::CreateConversation => 0x04,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::InitiateCall => "initiate_call",
            Self::PostStatus => "post_status",
            Self::CreateConversation => "create_conversation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Node-custodied account the relay submits from.
    pub relay_address: String,
    /// Anchor contract all relayed actions target.
    pub anchor_contract: String,
}

/// Custodial signer: submits anchor transactions for users who have no
/// direct path to the chain, waits for finality, and classifies the outcome.
///
/// Not idempotent. On an ambiguous timeout the caller must check whether the
/// earlier attempt landed (via TransactionVerifier) before submitting again.
pub struct RelaySigner {
    node: NodeClient,
    config: Option<RelayConfig>,
    /// One in-flight submission per credential keeps the account's nonce
    /// sequence intact.
    submit_lock: Mutex<()>,
    receipt_deadline: Duration,
    poll_interval: Duration,
}

impl RelaySigner {
    pub fn new(
        node: NodeClient,
        config: Option<RelayConfig>,
        receipt_deadline: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            node,
            config,
            submit_lock: Mutex::new(()),
            receipt_deadline,
            poll_interval,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn relay_address(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.relay_address.as_str())
    }

    pub fn anchor_contract(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.anchor_contract.as_str())
    }

    /// Submit an anchor transaction and block until its inclusion receipt is
    /// available. Returns the transaction hash.
    pub async fn submit(&self, action: RelayAction, payload: &[u8]) -> Result<String, ErrorKind> {
        let Some(cfg) = self.config.as_ref() else {
            // Fail fast so callers can fall back to the off-chain path
            // without paying for an RPC round-trip.
            return Err(ErrorKind::NotConfigured);
        };

        let _guard = self.submit_lock.lock().await;

        let data = anchor_calldata(action, payload);
        let tx_hash = match self
            .node
            .send_transaction(&cfg.relay_address, &cfg.anchor_contract, &data)
            .await
        {
            Ok(hash) => hash,
            Err(RpcError::Node { code, message }) => {
                warn!("relay {} rejected ({}): {}", action.as_str(), code, message);
                return Err(classify_node_error(&message));
            }
            Err(e) => {
                warn!("relay {} submission failed: {}", action.as_str(), e);
                return Err(ErrorKind::Timeout);
            }
        };

        let receipt = wait_for_receipt(
            &self.node,
            &tx_hash,
            self.receipt_deadline,
            self.poll_interval,
        )
        .await?;

        if !receipt.succeeded() {
            warn!("relay {} tx {} reverted", action.as_str(), tx_hash);
            return Err(ErrorKind::ExecutionFailed);
        }

        info!("relay {} anchored as {}", action.as_str(), tx_hash);
        Ok(tx_hash)
    }
}

/// Calldata for an anchor transaction: the action tag byte followed by a
/// sha256 digest of the payload. Only the digest goes on chain; the payload
/// itself stays off-chain.
pub fn anchor_calldata(action: RelayAction, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update([action.tag()]);
    hasher.update(payload);
    let digest = hasher.finalize();
    format!("0x{:02x}{}", action.tag(), hex::encode(digest))
}

/// Map raw node error text onto the small user-facing taxonomy.
fn classify_node_error(message: &str) -> ErrorKind {
    let m = message.to_ascii_lowercase();
    if m.contains("insufficient funds") || m.contains("insufficient balance") {
        ErrorKind::InsufficientFunds
    } else if m.contains("revert") || m.contains("execution") {
        ErrorKind::ExecutionFailed
    } else if m.contains("rejected")
        || m.contains("denied")
        || m.contains("unauthorized")
        || m.contains("locked")
    {
        ErrorKind::Rejected
    } else {
        ErrorKind::ExecutionFailed
    }
}
