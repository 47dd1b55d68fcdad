use thiserror::Error;

/// The failure taxonomy shared by the chain, store and call layers.
///
/// Display strings are the user-facing wording; raw node and store errors are
/// logged, never returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("on-chain delivery is not set up")]
    NotConfigured,

    #[error("not found")]
    NotFound,

    #[error("transaction was not sent by your wallet")]
    SenderMismatch,

    #[error("transaction was sent to the wrong contract")]
    WrongTarget,

    #[error("transaction failed on the ledger")]
    ExecutionFailed,

    #[error("relay wallet is out of funds")]
    InsufficientFunds,

    #[error("signing was rejected")]
    Rejected,

    #[error("ledger node did not respond in time")]
    Timeout,

    #[error("call already ended")]
    Conflict,
}

impl ErrorKind {
    /// Failures that degrade the action to the off-chain path instead of
    /// surfacing an error. Mismatched or reverted transactions are never
    /// retried; resubmitting them cannot succeed.
    pub fn falls_back(&self) -> bool {
        matches!(self, Self::NotConfigured | Self::Timeout)
    }
}
