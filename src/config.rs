use alloy::primitives::{Address, U256};
use chrono::{DateTime, NaiveDate, Utc};
use dotenvy::dotenv;
use eyre::{eyre, Result, WrapErr};
use std::{env, fmt, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_http_url: String,
    pub db_path: String,
    pub port: u16,
    /// Watched token contract, lowercase `0x` hex.
    pub token_address: String,
    /// Watched recipient, lowercase `0x` hex.
    pub recipient_address: String,
    /// Exact transfer value in raw base units.
    pub target_amount: U256,
    pub token_decimals: u32,
    pub token_symbol: String,
    pub confirmations: u64,
    pub poll_interval: Duration,
    pub initial_window_blocks: u64,
    pub max_block_range: u64,
    pub seconds_per_block: f64,
    pub backfill_since: Option<DateTime<Utc>>,
    pub max_window_retries: u32,
    pub server_side_recipient_filter: bool,
    pub top_initiators: usize,
    pub moving_average_max_days: u32,
    pub telegram: Option<TelegramConfig>,
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // .env is optional
    from_lookup(|key| env::var(key).ok())
}

/// Build a config from an arbitrary key lookup (the process env in production).
pub fn from_lookup<F>(get: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let rpc_http_url = get("RPC_HTTP_URL")
        .or_else(|| get("POLYGON_RPC"))
        .unwrap_or_else(|| "https://polygon-rpc.com".to_string());

    let db_path = get("DATABASE_URL").unwrap_or_else(|| "transfers.db".to_string());

    let token_address = parse_address(
        &get("TOKEN_ADDRESS").ok_or_else(|| eyre!("TOKEN_ADDRESS is required"))?,
    )
    .wrap_err("TOKEN_ADDRESS")?;

    let recipient_address = parse_address(
        &get("RECIPIENT_ADDRESS").ok_or_else(|| eyre!("RECIPIENT_ADDRESS is required"))?,
    )
    .wrap_err("RECIPIENT_ADDRESS")?;

    let target_amount: U256 = get("TARGET_AMOUNT")
        .ok_or_else(|| eyre!("TARGET_AMOUNT is required"))?
        .parse()
        .map_err(|e| eyre!("TARGET_AMOUNT must be an unsigned integer in base units: {e}"))?;

    let backfill_since = get("BACKFILL_SINCE")
        .map(|s| parse_since(&s))
        .transpose()
        .wrap_err("BACKFILL_SINCE")?;

    let seconds_per_block: f64 = parse_or("SECONDS_PER_BLOCK", get("SECONDS_PER_BLOCK"), 2.0)?;
    if !(seconds_per_block > 0.0) {
        return Err(eyre!("SECONDS_PER_BLOCK must be positive"));
    }

    let max_block_range: u64 = parse_or("MAX_BLOCK_RANGE", get("MAX_BLOCK_RANGE"), 2000)?;
    if max_block_range == 0 {
        return Err(eyre!("MAX_BLOCK_RANGE must be at least 1"));
    }

    let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
        (Some(bot_token), Some(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
        _ => None,
    };

    Ok(Config {
        rpc_http_url,
        db_path,
        port: parse_or("PORT", get("PORT"), 8080)?,
        token_address,
        recipient_address,
        target_amount,
        token_decimals: parse_or("TOKEN_DECIMALS", get("TOKEN_DECIMALS"), 18)?,
        token_symbol: get("TOKEN_SYMBOL").unwrap_or_else(|| "TOKEN".to_string()),
        confirmations: parse_or("CONFIRMATIONS", get("CONFIRMATIONS"), 2)?,
        poll_interval: Duration::from_secs(parse_or(
            "POLL_INTERVAL_SECS",
            get("POLL_INTERVAL_SECS"),
            30,
        )?),
        initial_window_blocks: parse_or("INITIAL_WINDOW_BLOCKS", get("INITIAL_WINDOW_BLOCKS"), 150)?,
        max_block_range,
        seconds_per_block,
        backfill_since,
        max_window_retries: parse_or("MAX_WINDOW_RETRIES", get("MAX_WINDOW_RETRIES"), 5)?,
        server_side_recipient_filter: parse_or(
            "SERVER_SIDE_RECIPIENT_FILTER",
            get("SERVER_SIDE_RECIPIENT_FILTER"),
            true,
        )?,
        top_initiators: parse_or("TOP_INITIATORS", get("TOP_INITIATORS"), 10)?,
        moving_average_max_days: parse_or(
            "MOVING_AVERAGE_MAX_DAYS",
            get("MOVING_AVERAGE_MAX_DAYS"),
            90,
        )?,
        telegram,
    })
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(v) => v.parse().map_err(|e| eyre!("invalid {key}={v:?}: {e}")),
        None => Ok(default),
    }
}

/// Parse and normalise an address to lowercase `0x` hex.
pub fn parse_address(raw: &str) -> Result<String> {
    let addr: Address = raw
        .parse()
        .map_err(|e| eyre!("invalid address {raw:?}: {e}"))?;
    Ok(addr.to_string().to_lowercase())
}

/// Accepts a bare `YYYY-MM-DD` (UTC midnight) or a full RFC 3339 timestamp.
fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| eyre!("invalid date {raw:?}"))?;
        return Ok(midnight.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| eyre!("expected YYYY-MM-DD or RFC 3339, got {raw:?}: {e}"))
}
