//! Scriptable in-memory ledger used by the unit tests.

use crate::rpc::{
    BlockHeader, GatewayError, LedgerGateway, LogQuery, RawLog, RawReceipt, RawTransaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    height: u64,
    height_fails: bool,
    blocks: HashMap<u64, BlockHeader>,
    missing_blocks: HashSet<u64>,
    logs: Vec<RawLog>,
    txs: HashMap<String, RawTransaction>,
    receipts: HashMap<String, RawReceipt>,
    failing_log_calls: u32,
    log_queries: Vec<LogQuery>,
    block_probes: Vec<u64>,
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

fn offline() -> GatewayError {
    GatewayError::Rpc {
        code: -32000,
        message: "mock gateway offline".to_string(),
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_height(&self, height: u64) {
        self.with(|s| s.height = height);
    }

    pub fn set_height_fails(&self, fails: bool) {
        self.with(|s| s.height_fails = fails);
    }

    /// Blocks `0..=last` spaced `spacing_secs` apart starting at `genesis`.
    pub fn add_chain(&self, last: u64, genesis: DateTime<Utc>, spacing_secs: i64) {
        self.with(|s| {
            for h in 0..=last {
                let timestamp = genesis + chrono::TimeDelta::seconds(h as i64 * spacing_secs);
                s.blocks.insert(h, BlockHeader { height: h, timestamp });
            }
            s.height = s.height.max(last);
        });
    }

    /// Make a block lookup fail even though the block is scripted.
    pub fn hide_block(&self, height: u64) {
        self.with(|s| {
            s.missing_blocks.insert(height);
        });
    }

    /// Add a raw log as-is, without any transaction or receipt.
    pub fn add_raw_log(&self, log: RawLog) {
        self.with(|s| s.logs.push(log));
    }

    /// Add a transfer log together with its transaction and receipt.
    pub fn add_transfer(&self, log: RawLog, initiator: &str) {
        let hash = log.tx_hash.clone().unwrap_or_default();
        self.with(|s| {
            s.txs.insert(
                hash.clone(),
                RawTransaction {
                    from: initiator.to_string(),
                    gas_price: Some("0x6fc23ac00".to_string()),
                },
            );
            s.receipts.insert(
                hash,
                RawReceipt {
                    gas_used: Some("0xfde8".to_string()),
                    effective_gas_price: None,
                    status: Some("0x1".to_string()),
                },
            );
            s.logs.push(log);
        });
    }

    pub fn drop_transaction(&self, hash: &str) {
        self.with(|s| {
            s.txs.remove(hash);
        });
    }

    pub fn fail_next_log_calls(&self, n: u32) {
        self.with(|s| s.failing_log_calls = n);
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.with(|s| s.log_queries.clone())
    }

    pub fn block_probes(&self) -> Vec<u64> {
        self.with(|s| s.block_probes.clone())
    }
}

#[async_trait]
impl LedgerGateway for MockGateway {
    async fn current_height(&self) -> Result<u64, GatewayError> {
        self.with(|s| if s.height_fails { Err(offline()) } else { Ok(s.height) })
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<BlockHeader>, GatewayError> {
        self.with(|s| {
            s.block_probes.push(height);
            if s.missing_blocks.contains(&height) {
                return Err(offline());
            }
            Ok(s.blocks.get(&height).copied())
        })
    }

    async fn logs_in_range(&self, query: &LogQuery) -> Result<Vec<RawLog>, GatewayError> {
        self.with(|s| {
            s.log_queries.push(query.clone());
            if s.failing_log_calls > 0 {
                s.failing_log_calls -= 1;
                return Err(offline());
            }
            let to_filter = query.topics.get(2).cloned().flatten();
            Ok(s.logs
                .iter()
                .filter(|log| log.address.eq_ignore_ascii_case(&query.address))
                .filter(|log| {
                    let height = log
                        .block_number_hex
                        .as_deref()
                        .and_then(crate::rpc::parse_quantity);
                    matches!(height, Some(h) if h >= query.from_block && h <= query.to_block)
                })
                .filter(|log| match &to_filter {
                    Some(topic) => log
                        .topics
                        .get(2)
                        .is_some_and(|t| t.eq_ignore_ascii_case(topic)),
                    None => true,
                })
                .cloned()
                .collect())
        })
    }

    async fn transaction_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<RawTransaction>, GatewayError> {
        Ok(self.with(|s| s.txs.get(hash).cloned()))
    }

    async fn receipt_by_hash(&self, hash: &str) -> Result<Option<RawReceipt>, GatewayError> {
        Ok(self.with(|s| s.receipts.get(hash).cloned()))
    }
}
