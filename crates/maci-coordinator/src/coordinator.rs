//! http client for the maci coordinator service
//!
//! three operations, each a json POST under `{base}/proof/`:
//! merge the state tree, generate process/tally proofs, submit them on-chain.
//! every failure is folded into [`ServiceError`].

use crate::abi::Address;
use crate::auth::authorization_header;
use crate::config::Config;
use crate::error::{Error, Operation, Result, ServiceError, ServiceResult};
use crate::rpc::ChainProvider;
use crate::schema::{ErrorBody, GenerateResponse, SubmitResponse, VoteMode};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// block range handed to proof generation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerateProofsArgs {
    pub poll_id: u64,
    /// first block to scan for events (maci deployment block)
    pub start_block: u64,
    /// block at the poll end date
    pub end_block: u64,
}

/// the coordinator's three finalize operations
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// merge the poll state tree, true when the coordinator reports success
    async fn merge(&self, poll_id: u64) -> ServiceResult<bool>;

    async fn generate_proofs(&self, args: GenerateProofsArgs) -> ServiceResult<GenerateResponse>;

    async fn submit(&self, poll_id: u64) -> ServiceResult<SubmitResponse>;
}

/// merge request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MergeRequest<'a> {
    maci_contract_address: Address,
    poll_id: u64,
    chain: &'a str,
}

/// generate request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    poll: u64,
    maci_contract_address: Address,
    mode: VoteMode,
    start_block: u64,
    end_block: u64,
    blocks_per_batch: u64,
    chain: &'a str,
}

/// submit request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    poll_id: u64,
    maci_contract_address: Address,
    chain: &'a str,
}

/// where the authorization header comes from
#[derive(Clone)]
pub enum AuthSource {
    /// sent verbatim
    Static(String),
    /// signed per request by the provider's account
    Signer(Arc<dyn ChainProvider>),
}

pub struct CoordinatorClient {
    base_url: String,
    maci_address: Address,
    /// chain name in the coordinator's format
    chain: String,
    mode: VoteMode,
    blocks_per_batch: u64,
    auth: Option<AuthSource>,
    timeout: Duration,
    http: Client,
}

impl CoordinatorClient {
    pub fn new(config: &Config) -> Result<Self> {
        let timeout = config.request_timeout();
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;

        Ok(Self {
            base_url: config.coordinator_url.trim_end_matches('/').to_string(),
            maci_address: config.maci_address,
            chain: config.backend_chain(),
            mode: config.mode,
            blocks_per_batch: config.blocks_per_batch,
            auth: config.auth_token.clone().map(AuthSource::Static),
            timeout,
            http,
        })
    }

    /// sign each request with the provider's account instead of a static token
    pub fn with_signer_auth(mut self, provider: Arc<dyn ChainProvider>) -> Self {
        self.auth = Some(AuthSource::Signer(provider));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn authorization(&self, op: Operation) -> ServiceResult<Option<String>> {
        match &self.auth {
            None => Ok(None),
            Some(AuthSource::Static(token)) => Ok(Some(token.clone())),
            Some(AuthSource::Signer(provider)) => authorization_header(&**provider)
                .await
                .map(Some)
                .map_err(|e| ServiceError::Transport {
                    op,
                    reason: format!("authorization: {}", e),
                }),
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        op: Operation,
        path: &str,
        body: &B,
    ) -> ServiceResult<Value> {
        let url = format!("{}/proof/{}", self.base_url, path);
        tracing::debug!("POST {}", url);

        let mut request = self.http.post(&url).json(body);
        if let Some(header) = self.authorization(op).await? {
            request = request.header(AUTHORIZATION, header);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout {
                    op,
                    after: self.timeout,
                }
            } else {
                ServiceError::Transport {
                    op,
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            // non-json error bodies fall back to the status line alone
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|body| body.message);
            let err = ServiceError::Http {
                op,
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                message,
            };
            tracing::warn!("{}", err);
            return Err(err);
        }

        response.json::<Value>().await.map_err(|e| ServiceError::Schema {
            op,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn merge(&self, poll_id: u64) -> ServiceResult<bool> {
        let body = MergeRequest {
            maci_contract_address: self.maci_address,
            poll_id,
            chain: &self.chain,
        };
        let value = self.post(Operation::Merge, "merge", &body).await?;
        Ok(is_truthy(&value))
    }

    async fn generate_proofs(&self, args: GenerateProofsArgs) -> ServiceResult<GenerateResponse> {
        let body = GenerateRequest {
            poll: args.poll_id,
            maci_contract_address: self.maci_address,
            mode: self.mode,
            start_block: args.start_block,
            end_block: args.end_block,
            blocks_per_batch: self.blocks_per_batch,
            chain: &self.chain,
        };
        let value = self.post(Operation::GenerateProofs, "generate", &body).await?;
        parse(Operation::GenerateProofs, value)
    }

    async fn submit(&self, poll_id: u64) -> ServiceResult<SubmitResponse> {
        let body = SubmitRequest {
            poll_id,
            maci_contract_address: self.maci_address,
            chain: &self.chain,
        };
        let value = self.post(Operation::Submit, "submit", &body).await?;
        parse(Operation::Submit, value)
    }
}

fn parse<T: serde::de::DeserializeOwned>(op: Operation, value: Value) -> ServiceResult<T> {
    serde_json::from_value(value).map_err(|e| ServiceError::Schema {
        op,
        reason: e.to_string(),
    })
}

/// javascript truthiness of a json value
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
