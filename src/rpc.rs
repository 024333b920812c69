// src/rpc.rs
use alloy::primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// ERC20 Transfer event topic keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connectivity: {0}")]
    Connectivity(#[from] reqwest::Error),
    #[error("rpc endpoint returned HTTP {0}")]
    Status(StatusCode),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Raw log as returned by `eth_getLogs`. Fields the node may omit for
/// pending logs are optional; the parser rejects those.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,

    #[serde(rename = "blockNumber")]
    pub block_number_hex: Option<String>,

    #[serde(rename = "transactionHash")]
    pub tx_hash: Option<String>,

    #[serde(rename = "logIndex")]
    pub log_index_hex: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawTransaction {
    pub from: String,
    #[serde(rename = "gasPrice")]
    pub gas_price: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawReceipt {
    #[serde(rename = "gasUsed")]
    pub gas_used: Option<String>,
    #[serde(rename = "effectiveGasPrice")]
    pub effective_gas_price: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    number: String,
    timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
}

/// Filter for a single `eth_getLogs` call. `None` topics are wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: String,
    pub topics: Vec<Option<String>>,
    pub from_block: u64,
    pub to_block: u64,
}

/// Read-only ledger primitives the scanner, poller and locator depend on.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn current_height(&self) -> Result<u64, GatewayError>;

    async fn block_by_height(&self, height: u64) -> Result<Option<BlockHeader>, GatewayError>;

    async fn logs_in_range(&self, query: &LogQuery) -> Result<Vec<RawLog>, GatewayError>;

    async fn transaction_by_hash(&self, hash: &str)
        -> Result<Option<RawTransaction>, GatewayError>;

    async fn receipt_by_hash(&self, hash: &str) -> Result<Option<RawReceipt>, GatewayError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcResponse<T> {
    // Error first: a missing `result` would otherwise decode as `None`.
    Error { error: RpcErrorObject },
    Success { result: T },
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Ethereum JSON-RPC over HTTP.
#[derive(Debug, Clone)]
pub struct RpcGateway {
    client: Client,
    url: String,
}

impl RpcGateway {
    pub fn new(url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Single JSON-RPC call. Transport failures are retried, RPC-level
    /// errors are returned immediately.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, GatewayError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut attempt = 1;
        let text = loop {
            debug!("📡 Sending {} → {}", method, self.url);
            match self.client.post(&self.url).json(&payload).send().await {
                Ok(resp) => {
                    if resp.status() != StatusCode::OK {
                        return Err(GatewayError::Status(resp.status()));
                    }
                    break resp.text().await?;
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        "RPC {} failed (attempt {}/{}): {}. Retrying...",
                        method, attempt, MAX_ATTEMPTS, e
                    );
                    attempt += 1;
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        debug!("📩 Raw {} response: {} bytes", method, text.len());

        match serde_json::from_str::<RpcResponse<T>>(&text) {
            Ok(RpcResponse::Success { result }) => Ok(result),
            Ok(RpcResponse::Error { error }) => Err(GatewayError::Rpc {
                code: error.code,
                message: error.message,
            }),
            Err(e) => Err(GatewayError::Malformed(format!("{method}: {e}"))),
        }
    }
}

#[async_trait]
impl LedgerGateway for RpcGateway {
    async fn current_height(&self) -> Result<u64, GatewayError> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&hex)
            .ok_or_else(|| GatewayError::Malformed(format!("block number {hex:?}")))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<BlockHeader>, GatewayError> {
        let block: Option<RawBlock> = self
            .call("eth_getBlockByNumber", json!([format!("0x{:x}", height), false]))
            .await?;

        let Some(block) = block else {
            return Ok(None);
        };
        let number = parse_quantity(&block.number)
            .ok_or_else(|| GatewayError::Malformed(format!("block number {:?}", block.number)))?;
        let timestamp = parse_quantity(&block.timestamp)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| {
                GatewayError::Malformed(format!("block timestamp {:?}", block.timestamp))
            })?;

        Ok(Some(BlockHeader {
            height: number,
            timestamp,
        }))
    }

    async fn logs_in_range(&self, query: &LogQuery) -> Result<Vec<RawLog>, GatewayError> {
        debug!(
            "eth_getLogs range {} → {} (address {})",
            query.from_block, query.to_block, query.address
        );
        self.call(
            "eth_getLogs",
            json!([{
                "fromBlock": format!("0x{:x}", query.from_block),
                "toBlock": format!("0x{:x}", query.to_block),
                "address": query.address,
                "topics": query.topics,
            }]),
        )
        .await
    }

    async fn transaction_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<RawTransaction>, GatewayError> {
        self.call("eth_getTransactionByHash", json!([hash])).await
    }

    async fn receipt_by_hash(&self, hash: &str) -> Result<Option<RawReceipt>, GatewayError> {
        self.call("eth_getTransactionReceipt", json!([hash])).await
    }
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(hex: &str) -> Option<u64> {
    let digits = hex.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a `0x`-prefixed hex quantity that may exceed 64 bits.
pub fn parse_big_quantity(hex: &str) -> Option<U256> {
    let digits = hex.strip_prefix("0x")?;
    U256::from_str_radix(digits, 16).ok()
}
