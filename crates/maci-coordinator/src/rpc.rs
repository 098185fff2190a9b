//! chain capability and its json-rpc implementation
//!
//! everything above this layer talks to the chain through [`ChainProvider`],
//! so tests can swap in an in-memory chain.

use crate::abi::{decode_hex, parse_quantity, Address};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// block selector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

impl BlockTag {
    fn to_param(self) -> Value {
        match self {
            BlockTag::Latest => json!("latest"),
            BlockTag::Number(n) => json!(format!("0x{:x}", n)),
        }
    }
}

/// the block fields we read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub timestamp: u64,
    pub hash: String,
}

/// event log filter
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub address: Option<Address>,
    /// topic slots, `None` matches anything
    pub topics: Vec<Option<String>>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
}

/// transaction hash as returned by the node
pub type TxHash = String;

/// wallet/chain capability: reads, writes and message signing
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn get_block(&self, tag: BlockTag) -> Result<Block>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>>;

    /// read-only contract call, returns raw return data
    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>>;

    /// state-changing contract call from the signer account
    async fn send_transaction(&self, to: Address, data: Vec<u8>) -> Result<TxHash>;

    /// eip-191 personal signature from the signer account, hex encoded
    async fn sign_message(&self, message: &str) -> Result<String>;

    /// signer account, if any
    fn signer(&self) -> Option<Address>;
}

/// json-rpc provider using a node-managed signer account
#[derive(Clone)]
pub struct RpcProvider {
    url: String,
    from: Option<Address>,
    http: Client,
}

impl RpcProvider {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            from: None,
            http: Client::new(),
        }
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Rpc(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            from: None,
            http,
        })
    }

    /// use `account` (unlocked on the node) for writes and signatures
    pub fn with_signer(mut self, account: Address) -> Self {
        self.from = Some(account);
        self
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!("rpc {}", method);

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(Error::RpcResponse {
                code: error.code,
                message: match error.data {
                    Some(data) => format!("{} ({})", error.message, data),
                    None => error.message,
                },
            });
        }

        body.result
            .ok_or_else(|| Error::Rpc(format!("no result for {}", method)))
    }

    fn require_signer(&self) -> Result<Address> {
        self.from.ok_or(Error::NoSigner)
    }
}

#[async_trait]
impl ChainProvider for RpcProvider {
    async fn block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(as_str(&result, "block number")?)
    }

    async fn get_block(&self, tag: BlockTag) -> Result<Block> {
        let result = self
            .request("eth_getBlockByNumber", json!([tag.to_param(), false]))
            .await?;
        if result.is_null() {
            return Err(Error::Rpc(format!("block {:?} not found", tag)));
        }
        let raw: RawBlock =
            serde_json::from_value(result).map_err(|e| Error::Rpc(e.to_string()))?;
        Ok(Block {
            number: parse_quantity(&raw.number)?,
            timestamp: parse_quantity(&raw.timestamp)?,
            hash: raw.hash,
        })
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        let mut params = serde_json::Map::new();
        if let Some(address) = filter.address {
            params.insert("address".into(), json!(address.to_string()));
        }
        if !filter.topics.is_empty() {
            params.insert("topics".into(), json!(filter.topics));
        }
        if let Some(from) = filter.from_block {
            params.insert("fromBlock".into(), BlockTag::Number(from).to_param());
        }
        if let Some(to) = filter.to_block {
            params.insert("toBlock".into(), BlockTag::Number(to).to_param());
        }

        let result = self
            .request("eth_getLogs", json!([Value::Object(params)]))
            .await?;
        let raw: Vec<RawLog> =
            serde_json::from_value(result).map_err(|e| Error::Rpc(e.to_string()))?;

        raw.into_iter()
            .map(|log| {
                Ok(Log {
                    address: log.address.parse()?,
                    topics: log.topics,
                    data: decode_hex(&log.data)?,
                    block_number: log.block_number.as_deref().map(parse_quantity).transpose()?,
                    transaction_hash: log.transaction_hash,
                })
            })
            .collect()
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let tx = json!({
            "to": to.to_string(),
            "data": format!("0x{}", hex::encode(&data)),
        });
        let result = self.request("eth_call", json!([tx, "latest"])).await?;
        decode_hex(as_str(&result, "call result")?)
    }

    async fn send_transaction(&self, to: Address, data: Vec<u8>) -> Result<TxHash> {
        let from = self.require_signer()?;
        let tx = json!({
            "from": from.to_string(),
            "to": to.to_string(),
            "data": format!("0x{}", hex::encode(&data)),
        });
        let result = self.request("eth_sendTransaction", json!([tx])).await?;
        tracing::info!("sent transaction to {}", to);
        Ok(as_str(&result, "transaction hash")?.to_string())
    }

    async fn sign_message(&self, message: &str) -> Result<String> {
        let from = self.require_signer()?;
        let encoded = format!("0x{}", hex::encode(message.as_bytes()));
        let result = self
            .request("personal_sign", json!([encoded, from.to_string()]))
            .await?;
        Ok(as_str(&result, "signature")?.to_string())
    }

    fn signer(&self) -> Option<Address> {
        self.from
    }
}

fn as_str<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::Rpc(format!("{} is not a string: {}", what, value)))
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    number: String,
    timestamp: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    transaction_hash: Option<String>,
}
