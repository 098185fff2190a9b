//! coordinator client against a stub coordinator served by axum

use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use maci_coordinator::abi::Address;
use maci_coordinator::auth::{eip191_digest, AUTH_MESSAGE};
use maci_coordinator::coordinator::{Coordinator, CoordinatorClient, GenerateProofsArgs};
use maci_coordinator::error::{Operation, ServiceError};
use maci_coordinator::sim::SimulatedChain;
use maci_coordinator::Config;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct Canned {
    status: StatusCode,
    body: String,
    delay: Option<Duration>,
}

#[derive(Debug, Clone)]
struct Recorded {
    op: String,
    authorization: Option<String>,
    body: Value,
}

#[derive(Default)]
struct Stub {
    responses: Mutex<HashMap<String, Canned>>,
    requests: Mutex<Vec<Recorded>>,
}

impl Stub {
    fn respond(&self, op: &str, status: StatusCode, body: impl Into<String>) {
        self.responses.lock().unwrap().insert(
            op.to_string(),
            Canned {
                status,
                body: body.into(),
                delay: None,
            },
        );
    }

    fn respond_late(&self, op: &str, delay: Duration) {
        self.responses.lock().unwrap().insert(
            op.to_string(),
            Canned {
                status: StatusCode::OK,
                body: "true".into(),
                delay: Some(delay),
            },
        );
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

async fn proof(
    State(stub): State<Arc<Stub>>,
    Path(op): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    stub.requests.lock().unwrap().push(Recorded {
        op: op.clone(),
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        body,
    });
    let canned = stub.responses.lock().unwrap().get(&op).cloned();
    let Some(canned) = canned else {
        return (StatusCode::NOT_FOUND, "no canned response").into_response();
    };
    if let Some(delay) = canned.delay {
        tokio::time::sleep(delay).await;
    }
    (canned.status, [(CONTENT_TYPE, "application/json")], canned.body).into_response()
}

async fn serve(stub: Arc<Stub>) -> String {
    let app = Router::new()
        .route("/v1/proof/{op}", post(proof))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

fn config(url: String) -> Config {
    Config {
        coordinator_url: url,
        auth_token: Some("Bearer test-token".into()),
        maci_address: "0x00000000000000000000000000000000000000aa".parse().unwrap(),
        chain_name: "arbitrumSepolia".into(),
        blocks_per_batch: 50,
        timeout_secs: 1,
        ..Config::default()
    }
}

fn tally_data_json() -> Value {
    json!({
        "maci": "0x00000000000000000000000000000000000000aa",
        "pollId": "2",
        "mode": 1,
        "tallyAddress": "0x00000000000000000000000000000000000000cc",
        "newTallyCommitment": "0x1234",
        "results": { "tally": ["4", "1", "0"], "salt": "0x1", "commitment": "0x2" },
        "totalSpentVoiceCredits": { "spent": "5", "salt": "0x3", "commitment": "0x4" }
    })
}

#[tokio::test]
async fn test_merge_request_shape() {
    let stub = Arc::new(Stub::default());
    stub.respond("merge", StatusCode::OK, "true");
    let client = CoordinatorClient::new(&config(serve(stub.clone()).await)).unwrap();

    assert!(client.merge(2).await.unwrap());

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].op, "merge");
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(
        requests[0].body,
        json!({
            "maciContractAddress": "0x00000000000000000000000000000000000000aa",
            "pollId": 2,
            "chain": "arbitrum-sepolia"
        })
    );
}

#[tokio::test]
async fn test_merge_falsy_body() {
    let stub = Arc::new(Stub::default());
    stub.respond("merge", StatusCode::OK, "false");
    let client = CoordinatorClient::new(&config(serve(stub).await)).unwrap();
    assert!(!client.merge(2).await.unwrap());
}

#[tokio::test]
async fn test_generate_sends_block_range() {
    let stub = Arc::new(Stub::default());
    let body = json!({
        "processProofs": [],
        "tallyProofs": [],
        "tallyData": tally_data_json(),
    });
    stub.respond("generate", StatusCode::OK, body.to_string());
    let client = CoordinatorClient::new(&config(serve(stub.clone()).await)).unwrap();

    let response = client
        .generate_proofs(GenerateProofsArgs {
            poll_id: 2,
            start_block: 100,
            end_block: 180,
        })
        .await
        .unwrap();
    assert_eq!(response.tally_data.results.tally, vec!["4", "1", "0"]);

    let sent = &stub.requests()[0].body;
    assert_eq!(sent["poll"], json!(2));
    assert_eq!(sent["startBlock"], json!(100));
    assert_eq!(sent["endBlock"], json!(180));
    assert_eq!(sent["blocksPerBatch"], json!(50));
    assert_eq!(sent["mode"], json!(1));
    assert_eq!(sent["chain"], json!("arbitrum-sepolia"));
}

#[tokio::test]
async fn test_http_error_uses_body_message() {
    let stub = Arc::new(Stub::default());
    stub.respond(
        "merge",
        StatusCode::INTERNAL_SERVER_ERROR,
        r#"{"statusCode":500,"message":"poll not found"}"#,
    );
    let client = CoordinatorClient::new(&config(serve(stub).await)).unwrap();

    let err = client.merge(2).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Http { status: 500, ref message, .. } if message.as_deref() == Some("poll not found")
    ));
    assert_eq!(
        err.to_string(),
        "Failed to merge: 500 - Internal Server Error. poll not found"
    );
}

#[tokio::test]
async fn test_http_error_without_json_body() {
    let stub = Arc::new(Stub::default());
    stub.respond("submit", StatusCode::BAD_GATEWAY, "<html>upstream down</html>");
    let client = CoordinatorClient::new(&config(serve(stub).await)).unwrap();

    let err = client.submit(2).await.unwrap_err();
    assert_eq!(err.to_string(), "Failed to submit: 502 - Bad Gateway");
}

#[tokio::test]
async fn test_malformed_generate_rejected() {
    let stub = Arc::new(Stub::default());
    let mut tally = tally_data_json();
    tally["results"].as_object_mut().unwrap().remove("tally");
    let body = json!({ "processProofs": [], "tallyProofs": [], "tallyData": tally });
    stub.respond("generate", StatusCode::OK, body.to_string());
    let client = CoordinatorClient::new(&config(serve(stub).await)).unwrap();

    let err = client
        .generate_proofs(GenerateProofsArgs {
            poll_id: 2,
            start_block: 0,
            end_block: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Schema {
            op: Operation::GenerateProofs,
            ..
        }
    ));
}

#[tokio::test]
async fn test_submit_parses_tally() {
    let stub = Arc::new(Stub::default());
    stub.respond("submit", StatusCode::OK, tally_data_json().to_string());
    let client = CoordinatorClient::new(&config(serve(stub.clone()).await)).unwrap();

    let tally = client.submit(2).await.unwrap();
    assert_eq!(tally.total_spent_voice_credits.spent, "5");
    assert_eq!(
        stub.requests()[0].body,
        json!({
            "pollId": 2,
            "maciContractAddress": "0x00000000000000000000000000000000000000aa",
            "chain": "arbitrum-sepolia"
        })
    );
}

#[tokio::test]
async fn test_slow_coordinator_times_out() {
    let stub = Arc::new(Stub::default());
    stub.respond_late("merge", Duration::from_secs(3));
    let client = CoordinatorClient::new(&config(serve(stub).await)).unwrap();

    let err = client.merge(2).await.unwrap_err();
    assert_eq!(
        err,
        ServiceError::Timeout {
            op: Operation::Merge,
            after: Duration::from_secs(1),
        }
    );
}

#[tokio::test]
async fn test_signed_authorization_header() {
    let stub = Arc::new(Stub::default());
    stub.respond("merge", StatusCode::OK, "{}");
    let chain = Arc::new(SimulatedChain::new(0, 1).with_signer(Address([7; 20])));
    let client = CoordinatorClient::new(&config(serve(stub.clone()).await))
        .unwrap()
        .with_signer_auth(chain);

    assert!(client.merge(2).await.unwrap());

    let header = stub.requests()[0].authorization.clone().unwrap();
    assert!(header.starts_with("Bearer 0x"));
    assert!(header.ends_with(&format!(":{}", hex::encode(eip191_digest(AUTH_MESSAGE)))));
}
