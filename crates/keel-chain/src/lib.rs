//! Ledger-facing plumbing: a JSON-RPC node client, read-only transaction
//! verification, and the custodial relay signer.
//!
//! Transaction hashes, addresses and calldata are opaque strings here; the
//! only interpretation applied is case-insensitive address equality.

pub mod relay;
pub mod rpc;
pub mod verifier;

pub use relay::{RelayAction, RelayConfig, RelaySigner};
pub use rpc::{NodeClient, ReceiptObject, RpcError, TransactionObject};
pub use verifier::TransactionVerifier;
