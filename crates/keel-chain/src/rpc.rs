use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("malformed RPC response: {0}")]
    BadPayload(String),
}

/// A ledger transaction as returned by the node.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionObject {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

/// The node's inclusion receipt for a submitted transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptObject {
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    /// "0x1" on success, "0x0" on revert.
    pub status: Option<String>,
    pub to: Option<String>,
}

impl ReceiptObject {
    pub fn succeeded(&self) -> bool {
        matches!(self.status.as_deref(), Some("0x1"))
    }
}

/// Thin JSON-RPC client over the ledger node's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    url: String,
    auth_key: Option<String>,
}

impl NodeClient {
    /// `timeout` bounds every individual RPC round-trip; receipt polling
    /// deadlines are layered on top by the caller.
    pub fn new(url: &str, auth_key: Option<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            auth_key,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!("RPC {} -> {}", method, self.url);

        let mut req = self.http.post(&self.url).json(&payload);
        if let Some(key) = &self.auth_key {
            req = req.bearer_auth(key);
        }

        let body: Value = req.send().await?.error_for_status()?.json().await?;

        if let Some(err) = body.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Err(RpcError::Node { code, message });
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| RpcError::BadPayload("response missing result".into()))
    }

    /// Fetch a transaction by hash. `None` when the node has never seen it.
    pub async fn transaction_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionObject>, RpcError> {
        let result = self.call("eth_getTransactionByHash", json!([hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| RpcError::BadPayload(e.to_string()))
    }

    /// Fetch the inclusion receipt. `None` while the transaction is pending.
    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<ReceiptObject>, RpcError> {
        let result = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| RpcError::BadPayload(e.to_string()))
    }

    /// Submit a transaction signed by a node-custodied account.
    /// Returns the transaction hash.
    pub async fn send_transaction(
        &self,
        from: &str,
        to: &str,
        data: &str,
    ) -> Result<String, RpcError> {
        let result = self
            .call(
                "eth_sendTransaction",
                json!([{ "from": from, "to": to, "data": data }]),
            )
            .await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| RpcError::BadPayload("eth_sendTransaction returned non-string".into()))
    }

    /// Read-only contract call. Returns the raw hex-encoded return data.
    pub async fn call_contract(&self, to: &str, data: &str) -> Result<String, RpcError> {
        let result = self
            .call("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| RpcError::BadPayload("eth_call returned non-string".into()))
    }
}
