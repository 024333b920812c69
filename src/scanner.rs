// src/scanner.rs
use crate::config::Config;
use crate::models::TransferRecord;
use crate::parser::{address_topic, decode_transfer, format_address, DecodedTransfer};
use crate::rpc::{
    parse_big_quantity, parse_quantity, GatewayError, LedgerGateway, LogQuery, TRANSFER_TOPIC,
};
use alloy::primitives::{Address, U256};
use futures_util::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("logs query for blocks {from}..={to} failed: {source}")]
    Logs {
        from: u64,
        to: u64,
        #[source]
        source: GatewayError,
    },
    #[error("chain height query failed: {0}")]
    Height(#[source] GatewayError),
}

/// What the scanner matches: one token, one recipient, one exact amount.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub token: Address,
    pub recipient: Address,
    pub target_amount: U256,
    pub max_block_range: u64,
    pub server_side_recipient_filter: bool,
}

impl ScannerConfig {
    pub fn from_config(cfg: &Config) -> eyre::Result<Self> {
        Ok(Self {
            token: cfg.token_address.parse()?,
            recipient: cfg.recipient_address.parse()?,
            target_amount: cfg.target_amount,
            max_block_range: cfg.max_block_range.max(1),
            server_side_recipient_filter: cfg.server_side_recipient_filter,
        })
    }
}

/// Turns block ranges into validated, enriched transfer records.
pub struct EventScanner<G> {
    gateway: Arc<G>,
    config: ScannerConfig,
}

impl<G: LedgerGateway> EventScanner<G> {
    pub fn new(gateway: Arc<G>, config: ScannerConfig) -> Self {
        Self { gateway, config }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Scan `[start, end]` inclusive. Ranges wider than `max_block_range`
    /// are queried in consecutive chunks; any failed logs query fails the
    /// whole call. Per-log decode and enrichment failures only shrink the
    /// result.
    pub async fn scan(&self, start: u64, end: u64) -> Result<Vec<TransferRecord>, ScanError> {
        if start > end {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut chunk_start = start;
        loop {
            let chunk_end = chunk_start
                .saturating_add(self.config.max_block_range - 1)
                .min(end);
            records.extend(self.scan_chunk(chunk_start, chunk_end).await?);
            if chunk_end >= end {
                break;
            }
            chunk_start = chunk_end + 1;
        }
        Ok(records)
    }

    async fn scan_chunk(&self, from: u64, to: u64) -> Result<Vec<TransferRecord>, ScanError> {
        let mut topics = vec![Some(TRANSFER_TOPIC.to_string())];
        if self.config.server_side_recipient_filter {
            topics.push(None);
            topics.push(address_topic(&format_address(&self.config.recipient)));
        }
        let query = LogQuery {
            address: format_address(&self.config.token),
            topics,
            from_block: from,
            to_block: to,
        };

        let logs = self
            .gateway
            .logs_in_range(&query)
            .await
            .map_err(|source| ScanError::Logs { from, to, source })?;

        let candidates: Vec<DecodedTransfer> = logs
            .iter()
            .filter_map(|log| match decode_transfer(log) {
                Ok(t) => Some(t),
                Err(reason) => {
                    debug!("Skipping log in tx {:?}: {}", log.tx_hash, reason);
                    None
                }
            })
            .filter(|t| self.matches(t))
            .collect();

        // lookups run concurrently; join_all keeps log order
        let enriched = join_all(candidates.iter().map(|c| self.enrich(c))).await;
        let records: Vec<TransferRecord> = enriched.into_iter().flatten().collect();

        info!(
            "Scanned blocks {} → {}: {} logs, {} matches, {} records",
            from,
            to,
            logs.len(),
            candidates.len(),
            records.len()
        );
        Ok(records)
    }

    fn matches(&self, t: &DecodedTransfer) -> bool {
        t.token_address == format_address(&self.config.token)
            && t.to == self.config.recipient
            && t.value == self.config.target_amount
    }

    async fn enrich(&self, c: &DecodedTransfer) -> Option<TransferRecord> {
        let (tx, receipt, block) = tokio::join!(
            self.gateway.transaction_by_hash(&c.tx_hash),
            self.gateway.receipt_by_hash(&c.tx_hash),
            self.gateway.block_by_height(c.block_height),
        );

        let tx = match tx {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                warn!("Dropping match {}: transaction not found", c.tx_hash);
                return None;
            }
            Err(e) => {
                warn!("Dropping match {}: transaction lookup failed: {}", c.tx_hash, e);
                return None;
            }
        };
        let receipt = match receipt {
            Ok(Some(r)) => r,
            Ok(None) => {
                warn!("Dropping match {}: receipt not found", c.tx_hash);
                return None;
            }
            Err(e) => {
                warn!("Dropping match {}: receipt lookup failed: {}", c.tx_hash, e);
                return None;
            }
        };
        let block = match block {
            Ok(Some(b)) => b,
            Ok(None) => {
                warn!("Dropping match {}: block {} not found", c.tx_hash, c.block_height);
                return None;
            }
            Err(e) => {
                warn!(
                    "Dropping match {}: block {} lookup failed: {}",
                    c.tx_hash, c.block_height, e
                );
                return None;
            }
        };

        let gas_price = receipt
            .effective_gas_price
            .as_deref()
            .or(tx.gas_price.as_deref())
            .and_then(parse_big_quantity);

        Some(TransferRecord {
            tx_id: c.tx_hash.clone(),
            block_height: c.block_height,
            token_address: c.token_address.clone(),
            from_address: format_address(&c.from),
            to_address: format_address(&c.to),
            initiator_address: Some(tx.from.to_lowercase()),
            amount: c.value,
            timestamp: block.timestamp,
            gas_used: receipt.gas_used.as_deref().and_then(parse_quantity),
            gas_price,
            status: receipt.status.as_deref().and_then(parse_quantity).map(|s| s == 1),
        })
    }
}
