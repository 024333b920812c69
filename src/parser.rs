// src/parser.rs
use crate::rpc::{parse_quantity, RawLog, TRANSFER_TOPIC};
use alloy::primitives::{Address, U256};
use thiserror::Error;

/// A decoded ERC20 Transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub token_address: String,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_height: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

/// Why a log is not a well-formed Transfer event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("expected 3 topics, got {0}")]
    TopicCount(usize),
    #[error("topic0 is not the Transfer signature")]
    SignatureMismatch,
    #[error("topic {0} is not a left-padded address word")]
    BadTopic(usize),
    #[error("data is not a single 32-byte word")]
    BadData,
    #[error("log has no {0}")]
    MissingField(&'static str),
}

fn decode_word(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str.strip_prefix("0x")?).ok()?;
    bytes.try_into().ok()
}

fn topic_to_address(topic: &str) -> Option<Address> {
    // 32-byte word; the address is the last 20 bytes, the rest must be zero
    let word = decode_word(topic)?;
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

/// Decode a single log into a `DecodedTransfer`, or say why it is not one.
pub fn decode_transfer(log: &RawLog) -> Result<DecodedTransfer, Rejection> {
    if log.topics.len() != 3 {
        return Err(Rejection::TopicCount(log.topics.len()));
    }
    if !log.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
        return Err(Rejection::SignatureMismatch);
    }

    let from = topic_to_address(&log.topics[1]).ok_or(Rejection::BadTopic(1))?;
    let to = topic_to_address(&log.topics[2]).ok_or(Rejection::BadTopic(2))?;

    let value = decode_word(&log.data)
        .map(|word| U256::from_be_bytes(word))
        .ok_or(Rejection::BadData)?;

    let block_height = log
        .block_number_hex
        .as_deref()
        .and_then(parse_quantity)
        .ok_or(Rejection::MissingField("blockNumber"))?;

    let tx_hash = log
        .tx_hash
        .clone()
        .ok_or(Rejection::MissingField("transactionHash"))?;

    let log_index = log
        .log_index_hex
        .as_deref()
        .and_then(parse_quantity)
        .ok_or(Rejection::MissingField("logIndex"))?;

    Ok(DecodedTransfer {
        token_address: log.address.to_lowercase(),
        from,
        to,
        value,
        block_height,
        tx_hash: tx_hash.to_lowercase(),
        log_index,
    })
}

/// Lowercase `0x` hex, the form addresses take in the store.
pub fn format_address(addr: &Address) -> String {
    addr.to_string().to_lowercase()
}

/// Left-pad an address into a 32-byte topic word.
pub fn address_topic(address: &str) -> Option<String> {
    let addr: Address = address.parse().ok()?;
    Some(format!("0x{:0>64}", hex::encode(addr.as_slice())))
}
