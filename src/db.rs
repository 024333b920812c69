use crate::models::{format_timestamp, TransferRecord};
use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use eyre::Result;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::info;

const MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version    INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
"#;

const V1_TRANSFER_RECORDS: &str = r#"
CREATE TABLE transfer_records (
  id                INTEGER PRIMARY KEY AUTOINCREMENT,
  tx_id             TEXT NOT NULL,
  block_height      INTEGER NOT NULL,
  token_address     TEXT NOT NULL,
  from_address      TEXT NOT NULL,
  to_address        TEXT NOT NULL,
  initiator_address TEXT,
  amount            TEXT NOT NULL, -- base units, decimal text
  timestamp         TEXT NOT NULL, -- RFC 3339, UTC, second precision
  gas_used          INTEGER,
  gas_price         TEXT,
  status            INTEGER
);

CREATE UNIQUE INDEX idx_transfer_records_tx_id     ON transfer_records(tx_id);
CREATE INDEX idx_transfer_records_block_height     ON transfer_records(block_height);
CREATE INDEX idx_transfer_records_token_address    ON transfer_records(token_address);
CREATE INDEX idx_transfer_records_to_address       ON transfer_records(to_address);
CREATE INDEX idx_transfer_records_initiator        ON transfer_records(initiator_address);
"#;

/// Forward-only migrations, applied in order, each exactly once.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_TRANSFER_RECORDS)];

pub(crate) const RECORD_COLUMNS: &str = "tx_id, block_height, token_address, from_address, to_address, \
     initiator_address, amount, timestamp, gas_used, gas_price, status";

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Apply every migration newer than the recorded schema version.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(MIGRATIONS_TABLE_SQL)?;
    let current = schema_version(conn)?;

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, format_timestamp(&Utc::now())],
        )?;
        tx.commit()?;
        info!("Applied schema migration v{}", version);
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i64> {
    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |r| r.get(0))?;
    Ok(v.unwrap_or(0))
}

/// Optional narrowing of read paths to one token and/or one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub token_address: Option<String>,
    pub to_address: Option<String>,
}

impl RecordFilter {
    pub fn for_pair(token_address: &str, to_address: &str) -> Self {
        Self {
            token_address: Some(token_address.to_lowercase()),
            to_address: Some(to_address.to_lowercase()),
        }
    }
}

/// SQL fragment matching `RecordFilter`; binds `?1` (token) and `?2` (recipient).
pub(crate) const FILTER_SQL: &str =
    "(?1 IS NULL OR token_address = ?1) AND (?2 IS NULL OR to_address = ?2)";

/// Insert a transfer unless its `tx_id` is already stored.
/// Returns whether a new row was written.
pub fn insert_transfer(conn: &Connection, rec: &TransferRecord) -> Result<bool> {
    let changed = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO transfer_records ({RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            rec.tx_id,
            rec.block_height as i64,
            rec.token_address,
            rec.from_address,
            rec.to_address,
            rec.initiator_address,
            rec.amount.to_string(),
            format_timestamp(&rec.timestamp),
            rec.gas_used.map(|g| g as i64),
            rec.gas_price.map(|p| p.to_string()),
            rec.status,
        ],
    )?;
    Ok(changed == 1)
}

/// Insert many transfers in one transaction. Returns, per record, whether
/// it was new. Nothing is written if any insert fails.
pub fn insert_batch(conn: &mut Connection, recs: &[TransferRecord]) -> Result<Vec<bool>> {
    let tx = conn.transaction()?;
    let mut fresh = Vec::with_capacity(recs.len());
    for rec in recs {
        fresh.push(insert_transfer(&tx, rec)?);
    }
    tx.commit()?;
    Ok(fresh)
}

/// Like `insert_batch`, counting the new rows.
pub fn insert_transfers(conn: &mut Connection, recs: &[TransferRecord]) -> Result<usize> {
    Ok(insert_batch(conn, recs)?.into_iter().filter(|new| *new).count())
}

pub fn get_transfer(conn: &Connection, tx_id: &str) -> Result<Option<TransferRecord>> {
    let rec = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM transfer_records WHERE tx_id = ?1"),
            [tx_id],
            record_from_row,
        )
        .optional()?;
    Ok(rec)
}

/// Most recent transfers first.
pub fn latest_transfers(conn: &Connection, limit: u32) -> Result<Vec<TransferRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM transfer_records
         ORDER BY block_height DESC, timestamp DESC, id DESC
         LIMIT ?1"
    ))?;
    let rows = stmt.query_map([limit as i64], record_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every matching transfer in chronological `(block_height, timestamp)` order.
pub fn transfers_in_order(conn: &Connection, filter: &RecordFilter) -> Result<Vec<TransferRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM transfer_records
         WHERE {FILTER_SQL}
         ORDER BY block_height ASC, timestamp ASC, id ASC"
    ))?;
    let rows = stmt.query_map(
        params![filter.token_address, filter.to_address],
        record_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    let amount_text: String = row.get(6)?;
    let amount: U256 = amount_text
        .parse()
        .map_err(|e| conversion_error(6, format!("amount {amount_text:?}: {e}")))?;

    let ts_text: String = row.get(7)?;
    let timestamp = DateTime::parse_from_rfc3339(&ts_text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(7, format!("timestamp {ts_text:?}: {e}")))?;

    let gas_price = row
        .get::<_, Option<String>>(9)?
        .map(|p| {
            p.parse::<U256>()
                .map_err(|e| conversion_error(9, format!("gas_price {p:?}: {e}")))
        })
        .transpose()?;

    Ok(TransferRecord {
        tx_id: row.get(0)?,
        block_height: row.get::<_, i64>(1)? as u64,
        token_address: row.get(2)?,
        from_address: row.get(3)?,
        to_address: row.get(4)?,
        initiator_address: row.get(5)?,
        amount,
        timestamp,
        gas_used: row.get::<_, Option<i64>>(8)?.map(|g| g as u64),
        gas_price,
        status: row.get(10)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    pub(crate) fn memory_db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    /// Record at `hours` past 2024-01-01 00:00 UTC.
    pub(crate) fn record(tx: &str, block: u64, hours: i64, initiator: &str) -> TransferRecord {
        TransferRecord {
            tx_id: tx.to_string(),
            block_height: block,
            token_address: "0x455e53cbb86018ac2b8092fdcd39d8444affc3f6".to_string(),
            from_address: initiator.to_string(),
            to_address: "0x000000000000000000000000000000000000dead".to_string(),
            initiator_address: Some(initiator.to_string()),
            amount: U256::from(4000u64) * U256::from(10u64).pow(U256::from(18u64)),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + TimeDelta::hours(hours),
            gas_used: Some(65_000),
            gas_price: Some(U256::from(30_000_000_000u64)),
            status: Some(true),
        }
    }

    #[test]
    fn migrations_apply_once_and_are_recorded() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();

        let mut conn = connect(path).unwrap();
        run_migrations(&mut conn).unwrap();
        drop(conn);

        let mut conn = connect(path).unwrap();
        run_migrations(&mut conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, MIGRATIONS.len() as i64);
        assert_eq!(schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn read_path_indexes_exist() {
        let conn = memory_db();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'transfer_records'")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |r| r.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        for col in ["tx_id", "block_height", "token_address", "to_address", "initiator"] {
            assert!(
                names.iter().any(|n| n.ends_with(col)),
                "missing index on {col}: {names:?}"
            );
        }
    }

    #[test]
    fn duplicate_insert_keeps_one_row() {
        let conn = memory_db();
        let rec = record("0xaa", 10, 0, "0x1111111111111111111111111111111111111111");
        assert!(insert_transfer(&conn, &rec).unwrap());
        assert!(!insert_transfer(&conn, &rec).unwrap());

        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM transfer_records WHERE tx_id = '0xaa'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert!(get_transfer(&conn, "0xaa").unwrap().is_some());
        assert!(get_transfer(&conn, "0xbb").unwrap().is_none());
    }

    #[test]
    fn batch_with_duplicates_does_not_fail() {
        let mut conn = memory_db();
        let a = record("0xa", 1, 0, "0x1111111111111111111111111111111111111111");
        let b = record("0xb", 2, 1, "0x1111111111111111111111111111111111111111");
        insert_transfer(&conn, &a).unwrap();
        let inserted = insert_transfers(&mut conn, &[a.clone(), b, a]).unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(transfers_in_order(&conn, &RecordFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn failed_batch_writes_nothing() {
        let mut conn = memory_db();
        let a = record("0xa", 1, 0, "0x1111111111111111111111111111111111111111");
        let b = record("0xb", 2, 1, "0x1111111111111111111111111111111111111111");
        assert_eq!(insert_batch(&mut conn, &[a.clone()]).unwrap(), vec![true]);

        conn.execute_batch(
            "CREATE TRIGGER reject_0xb BEFORE INSERT ON transfer_records
             WHEN NEW.tx_id = '0xb' BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
        let c = record("0xc", 3, 2, "0x1111111111111111111111111111111111111111");
        assert!(insert_batch(&mut conn, &[c, b]).is_err());
        assert!(get_transfer(&conn, "0xc").unwrap().is_none());

        conn.execute_batch("DROP TRIGGER reject_0xb").unwrap();
        let d = record("0xd", 4, 3, "0x1111111111111111111111111111111111111111");
        assert_eq!(insert_batch(&mut conn, &[a, d]).unwrap(), vec![false, true]);
    }

    #[test]
    fn stored_record_reads_back_intact() {
        let conn = memory_db();
        let mut rec = record("0xcc", 77, 5, "0x1111111111111111111111111111111111111111");
        rec.amount = U256::MAX;
        rec.initiator_address = None;
        insert_transfer(&conn, &rec).unwrap();
        assert_eq!(get_transfer(&conn, "0xcc").unwrap(), Some(rec));
    }

    #[test]
    fn ordering_uses_height_then_timestamp() {
        let conn = memory_db();
        let who = "0x1111111111111111111111111111111111111111";
        insert_transfer(&conn, &record("0x3", 20, 1, who)).unwrap();
        insert_transfer(&conn, &record("0x1", 10, 5, who)).unwrap();
        insert_transfer(&conn, &record("0x2", 20, 0, who)).unwrap();

        let ids: Vec<String> = transfers_in_order(&conn, &RecordFilter::default())
            .unwrap()
            .into_iter()
            .map(|r| r.tx_id)
            .collect();
        assert_eq!(ids, vec!["0x1", "0x2", "0x3"]);

        let latest = latest_transfers(&conn, 2).unwrap();
        assert_eq!(latest[0].tx_id, "0x3");
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn filter_narrows_by_token_and_recipient() {
        let conn = memory_db();
        let who = "0x1111111111111111111111111111111111111111";
        let mut other = record("0x9", 1, 0, who);
        other.to_address = "0x000000000000000000000000000000000000beef".to_string();
        insert_transfer(&conn, &other).unwrap();
        insert_transfer(&conn, &record("0x8", 2, 0, who)).unwrap();

        let filter = RecordFilter::for_pair(
            "0x455E53CBB86018Ac2B8092FdCd39d8444aFFC3F6",
            "0x000000000000000000000000000000000000dEaD",
        );
        let rows = transfers_in_order(&conn, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tx_id, "0x8");
    }
}
