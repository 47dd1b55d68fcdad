/// Integration tests: run verifier and relay against a stub ledger node
/// speaking just enough JSON-RPC over a loopback port.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, extract::State, routing::post};
use serde_json::{Value, json};

use keel_chain::{NodeClient, RelayAction, RelayConfig, RelaySigner, TransactionVerifier};
use keel_types::error::ErrorKind;

const SENDER: &str = "0xAAaa111111111111111111111111111111111111";
const CONTRACT: &str = "0xCCcc333333333333333333333333333333333333";
const RELAY: &str = "0xDDdd444444444444444444444444444444444444";

#[derive(Default)]
struct StubLedger {
    transactions: HashMap<String, Value>,
    receipts: HashMap<String, Value>,
    /// eth_sendTransaction behavior: Ok(hash) or Err(node error message).
    submit: Option<Result<String, String>>,
}

impl StubLedger {
    fn with_transaction(mut self, hash: &str, from: &str, to: &str, status: &str) -> Self {
        self.transactions.insert(
            hash.to_string(),
            json!({ "hash": hash, "from": from, "to": to }),
        );
        self.receipts.insert(
            hash.to_string(),
            json!({ "transactionHash": hash, "status": status, "to": to }),
        );
        self
    }

    fn with_submit(mut self, outcome: Result<String, String>) -> Self {
        self.submit = Some(outcome);
        self
    }
}

async fn rpc_handler(State(stub): State<Arc<StubLedger>>, Json(req): Json<Value>) -> Json<Value> {
    let method = req["method"].as_str().unwrap_or_default();
    let first_param = req["params"][0].clone();

    let result = match method {
        "eth_getTransactionByHash" => {
            let hash = first_param.as_str().unwrap_or_default();
            stub.transactions.get(hash).cloned().unwrap_or(Value::Null)
        }
        "eth_getTransactionReceipt" => {
            let hash = first_param.as_str().unwrap_or_default();
            stub.receipts.get(hash).cloned().unwrap_or(Value::Null)
        }
        "eth_sendTransaction" => match &stub.submit {
            Some(Ok(hash)) => json!(hash),
            Some(Err(message)) => {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": { "code": -32000, "message": message },
                }));
            }
            None => Value::Null,
        },
        _ => Value::Null,
    };

    Json(json!({ "jsonrpc": "2.0", "id": req["id"], "result": result }))
}

async fn spawn_stub(stub: StubLedger) -> String {
    let app = Router::new()
        .route("/", post(rpc_handler))
        .with_state(Arc::new(stub));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(url: &str) -> NodeClient {
    NodeClient::new(url, None, Duration::from_secs(2)).unwrap()
}

fn verifier(url: &str) -> TransactionVerifier {
    TransactionVerifier::new(
        client(url),
        Duration::from_secs(1),
        Duration::from_millis(20),
    )
}

fn relay(url: &str, config: Option<RelayConfig>) -> RelaySigner {
    RelaySigner::new(
        client(url),
        config,
        Duration::from_secs(1),
        Duration::from_millis(20),
    )
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        relay_address: RELAY.to_string(),
        anchor_contract: CONTRACT.to_string(),
    }
}

#[tokio::test]
async fn verify_accepts_matching_transaction() {
    let url = spawn_stub(StubLedger::default().with_transaction("0xt1", SENDER, CONTRACT, "0x1"))
        .await;

    // Address comparison is case-insensitive.
    let result = verifier(&url)
        .verify("0xt1", &SENDER.to_lowercase(), Some(&CONTRACT.to_uppercase()))
        .await;
    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn verify_rejects_unknown_transaction() {
    let url = spawn_stub(StubLedger::default()).await;

    let result = verifier(&url).verify("0xmissing", SENDER, None).await;
    assert_eq!(result, Err(ErrorKind::NotFound));
}

#[tokio::test]
async fn verify_rejects_unsuccessful_receipt() {
    let url = spawn_stub(StubLedger::default().with_transaction("0xt1", SENDER, CONTRACT, "0x0"))
        .await;

    let result = verifier(&url).verify("0xt1", SENDER, Some(CONTRACT)).await;
    assert_eq!(result, Err(ErrorKind::ExecutionFailed));
}

#[tokio::test]
async fn verify_rejects_wrong_target_despite_success() {
    let elsewhere = "0xEEee555555555555555555555555555555555555";
    let url = spawn_stub(StubLedger::default().with_transaction("0xt1", SENDER, elsewhere, "0x1"))
        .await;

    // Receipt status is success, but the destination is not the expected
    // contract: a replayed/misdirected transaction earns no credit.
    let result = verifier(&url).verify("0xt1", SENDER, Some(CONTRACT)).await;
    assert_eq!(result, Err(ErrorKind::WrongTarget));
}

#[tokio::test]
async fn verify_rejects_sender_mismatch() {
    let url = spawn_stub(StubLedger::default().with_transaction("0xt1", SENDER, CONTRACT, "0x1"))
        .await;

    let other = "0x9999999999999999999999999999999999999999";
    let result = verifier(&url).verify("0xt1", other, Some(CONTRACT)).await;
    assert_eq!(result, Err(ErrorKind::SenderMismatch));
}

#[tokio::test]
async fn unconfigured_relay_fails_fast() {
    // Deliberately unroutable URL: the call must fail before any transport.
    let signer = relay("http://127.0.0.1:1", None);

    let result = signer.submit(RelayAction::SendMessage, b"digest-me").await;
    assert_eq!(result, Err(ErrorKind::NotConfigured));
}

#[tokio::test]
async fn relay_submits_and_waits_for_receipt() {
    let stub = StubLedger::default()
        .with_transaction("0xanchored", RELAY, CONTRACT, "0x1")
        .with_submit(Ok("0xanchored".to_string()));
    let url = spawn_stub(stub).await;

    let signer = relay(&url, Some(relay_config()));
    let hash = signer
        .submit(RelayAction::SendMessage, b"digest-me")
        .await
        .unwrap();
    assert_eq!(hash, "0xanchored");
}

#[tokio::test]
async fn relay_classifies_insufficient_funds() {
    let stub = StubLedger::default()
        .with_submit(Err("insufficient funds for gas * price + value".into()));
    let url = spawn_stub(stub).await;

    let signer = relay(&url, Some(relay_config()));
    let result = signer.submit(RelayAction::InitiateCall, b"x").await;
    assert_eq!(result, Err(ErrorKind::InsufficientFunds));
}

#[tokio::test]
async fn relay_times_out_when_node_is_down() {
    // Nothing listens here; transport failures degrade to Timeout so the
    // caller can take the off-chain path.
    let signer = relay("http://127.0.0.1:9", Some(relay_config()));

    let result = signer.submit(RelayAction::PostStatus, b"x").await;
    assert_eq!(result, Err(ErrorKind::Timeout));
}

#[tokio::test]
async fn relay_times_out_without_receipt() {
    // Submission lands but no receipt ever appears.
    let stub = StubLedger::default().with_submit(Ok("0xpending".to_string()));
    let url = spawn_stub(stub).await;

    let signer = relay(&url, Some(relay_config()));
    let result = signer.submit(RelayAction::SendMessage, b"x").await;
    assert_eq!(result, Err(ErrorKind::Timeout));
}
