//! Statistics over the stored transfer set.
//!
//! Everything here is a read-through computation: nothing is cached, every
//! call reflects the store as it is at that moment.

use crate::db::{self, record_from_row, RecordFilter, FILTER_SQL, RECORD_COLUMNS};
use crate::models::{
    format_timestamp, AggregateSnapshot, InitiatorCount, InitiatorRank, MovingAveragePoint,
    TransferRecord, TransferStats,
};
use alloy::primitives::{U256, U512};
use chrono::{Days, NaiveDate, TimeDelta};
use eyre::{eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Trailing window of the moving average, in days.
pub const MOVING_AVERAGE_WINDOW_DAYS: i64 = 7;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Sum of all amounts. Accumulates in 512 bits, so no realistic number of
/// 256-bit values can overflow it.
pub fn total_amount(conn: &Connection, filter: &RecordFilter) -> Result<U512> {
    let mut stmt = conn.prepare(&format!(
        "SELECT amount FROM transfer_records WHERE {FILTER_SQL}"
    ))?;
    let mut rows = stmt.query(params![filter.token_address, filter.to_address])?;

    let mut total = U512::ZERO;
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        let amount: U256 = text
            .parse()
            .map_err(|e| eyre!("stored amount {text:?} is not an integer: {e}"))?;
        total = total
            .checked_add(U512::from(amount))
            .ok_or_else(|| eyre!("total amount overflowed 512 bits"))?;
    }
    Ok(total)
}

pub fn count(conn: &Connection, filter: &RecordFilter) -> Result<u64> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM transfer_records WHERE {FILTER_SQL}"),
        params![filter.token_address, filter.to_address],
        |r| r.get(0),
    )?;
    Ok(n as u64)
}

/// Records per initiator, most active first. Order among equal counts is
/// implementation-defined (currently address ascending); do not rely on it.
/// Records without an initiator are not counted.
pub fn initiator_counts(conn: &Connection, filter: &RecordFilter) -> Result<Vec<InitiatorCount>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT initiator_address, COUNT(*) AS n
         FROM transfer_records
         WHERE {FILTER_SQL} AND initiator_address IS NOT NULL
         GROUP BY initiator_address
         ORDER BY n DESC, initiator_address ASC"
    ))?;
    let rows = stmt.query_map(params![filter.token_address, filter.to_address], |r| {
        Ok(InitiatorCount {
            initiator_address: r.get(0)?,
            count: r.get::<_, i64>(1)? as u64,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn top_initiators(
    conn: &Connection,
    filter: &RecordFilter,
    n: usize,
) -> Result<Vec<InitiatorCount>> {
    let mut counts = initiator_counts(conn, filter)?;
    counts.truncate(n);
    Ok(counts)
}

/// Dense rank: ties share a rank and the next distinct count ranks one lower.
pub fn dense_rank(counts: &[InitiatorCount], initiator: &str) -> Option<InitiatorRank> {
    let mine = counts
        .iter()
        .find(|c| c.initiator_address.eq_ignore_ascii_case(initiator))?;

    let mut greater: Vec<u64> = counts
        .iter()
        .map(|c| c.count)
        .filter(|n| *n > mine.count)
        .collect();
    greater.sort_unstable();
    greater.dedup();

    Some(InitiatorRank {
        initiator_address: mine.initiator_address.clone(),
        count: mine.count,
        rank: greater.len() as u64 + 1,
        total_initiators: counts.len() as u64,
    })
}

pub fn initiator_rank(
    conn: &Connection,
    filter: &RecordFilter,
    initiator: &str,
) -> Result<Option<InitiatorRank>> {
    let counts = initiator_counts(conn, filter)?;
    Ok(dense_rank(&counts, initiator))
}

/// The record immediately before `pivot` in `(block_height, timestamp)`
/// order, excluding `pivot` itself.
pub fn previous_transfer(
    conn: &Connection,
    filter: &RecordFilter,
    pivot: &TransferRecord,
) -> Result<Option<TransferRecord>> {
    let rec = conn
        .query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM transfer_records
                 WHERE {FILTER_SQL}
                   AND tx_id != ?3
                   AND (block_height < ?4 OR (block_height = ?4 AND timestamp < ?5))
                 ORDER BY block_height DESC, timestamp DESC, id DESC
                 LIMIT 1"
            ),
            params![
                filter.token_address,
                filter.to_address,
                pivot.tx_id,
                pivot.block_height as i64,
                format_timestamp(&pivot.timestamp),
            ],
            record_from_row,
        )
        .optional()?;
    Ok(rec)
}

/// Mean of consecutive timestamp deltas over records already in
/// chronological order. `None` with fewer than two records.
pub fn average_gap(records: &[TransferRecord]) -> Option<TimeDelta> {
    if records.len() < 2 {
        return None;
    }
    let total_ms: i64 = records
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_milliseconds())
        .sum();
    Some(TimeDelta::milliseconds(total_ms / (records.len() as i64 - 1)))
}

/// Daily series of the 7-day moving average gap, in hours.
///
/// Runs from the first record's day (or the last `max_days` days, whichever
/// is shorter) through `today`. A day is `None` when fewer than two records
/// exist up to its end, or fewer than two fall inside its trailing window.
pub fn moving_average_series(
    records: &[TransferRecord],
    today: NaiveDate,
    max_days: u32,
) -> Vec<MovingAveragePoint> {
    let Some(first_day) = records.iter().map(|r| r.timestamp.date_naive()).min() else {
        return Vec::new();
    };
    let earliest_allowed = today
        .checked_sub_days(Days::new(u64::from(max_days.max(1)) - 1))
        .unwrap_or(NaiveDate::MIN);
    let start = first_day.max(earliest_allowed);

    start
        .iter_days()
        .take_while(|d| *d <= today)
        .map(|date| MovingAveragePoint {
            date,
            average_gap_hours: day_average(records, date),
        })
        .collect()
}

fn day_average(records: &[TransferRecord], date: NaiveDate) -> Option<f64> {
    let end = date.and_hms_opt(23, 59, 59)?.and_utc();
    let up_to: Vec<&TransferRecord> = records.iter().filter(|r| r.timestamp <= end).collect();
    if up_to.len() < 2 {
        return None;
    }
    let window_start = end - TimeDelta::days(MOVING_AVERAGE_WINDOW_DAYS);
    let windowed: Vec<TransferRecord> = up_to
        .into_iter()
        .filter(|r| r.timestamp >= window_start)
        .cloned()
        .collect();
    average_gap(&windowed).map(|gap| gap.num_milliseconds() as f64 / MS_PER_HOUR)
}

/// Figures for a single freshly stored record.
pub fn transfer_stats(
    conn: &Connection,
    filter: &RecordFilter,
    record: &TransferRecord,
) -> Result<TransferStats> {
    let initiator_rank = match &record.initiator_address {
        Some(who) => initiator_rank(conn, filter, who)?,
        None => None,
    };
    let since_previous =
        previous_transfer(conn, filter, record)?.map(|prev| record.timestamp - prev.timestamp);

    Ok(TransferStats {
        total_count: count(conn, filter)?,
        total_amount: total_amount(conn, filter)?,
        initiator_rank,
        since_previous,
    })
}

/// Full summary. The moving-average series is only computed when
/// `series_days` is given.
pub fn snapshot(
    conn: &Connection,
    filter: &RecordFilter,
    top_n: usize,
    today: NaiveDate,
    series_days: Option<u32>,
) -> Result<AggregateSnapshot> {
    let records = db::transfers_in_order(conn, filter)?;
    let counts = initiator_counts(conn, filter)?;

    Ok(AggregateSnapshot {
        total_amount: total_amount(conn, filter)?,
        total_count: records.len() as u64,
        distinct_initiators: counts.len() as u64,
        top_initiators: counts.into_iter().take(top_n).collect(),
        average_gap: average_gap(&records),
        moving_average: series_days
            .map(|days| moving_average_series(&records, today, days))
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::insert_transfer;
    use crate::db::tests::{memory_db, record};

    const A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const C: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

    fn seed(conn: &Connection, initiators: &[(&str, usize)]) {
        let mut block = 0;
        for (who, n) in initiators {
            for _ in 0..*n {
                block += 1;
                insert_transfer(conn, &record(&format!("0x{block:x}"), block, block as i64, who))
                    .unwrap();
            }
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn ranks_distinct_counts() {
        let conn = memory_db();
        seed(&conn, &[(A, 3), (B, 2), (C, 1)]);
        let all = RecordFilter::default();

        let ranks: Vec<u64> = [A, B, C]
            .iter()
            .map(|who| initiator_rank(&conn, &all, who).unwrap().unwrap().rank)
            .collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        let a = initiator_rank(&conn, &all, A).unwrap().unwrap();
        assert_eq!(a.total_initiators, 3);
        assert_eq!(a.count, 3);
    }

    #[test]
    fn ties_share_a_dense_rank() {
        let conn = memory_db();
        seed(&conn, &[(A, 2), (B, 2), (C, 1)]);
        let all = RecordFilter::default();

        let rank = |who| initiator_rank(&conn, &all, who).unwrap().unwrap().rank;
        assert_eq!(rank(A), 1);
        assert_eq!(rank(B), 1);
        assert_eq!(rank(C), 2);
    }

    #[test]
    fn unknown_initiator_has_no_rank() {
        let conn = memory_db();
        seed(&conn, &[(A, 1)]);
        assert!(initiator_rank(&conn, &RecordFilter::default(), B).unwrap().is_none());
    }

    #[test]
    fn rank_lookup_ignores_address_case() {
        let conn = memory_db();
        seed(&conn, &[(A, 1)]);
        let shouted = A.to_uppercase().replace("0X", "0x");
        let rank = initiator_rank(&conn, &RecordFilter::default(), &shouted)
            .unwrap()
            .unwrap();
        assert_eq!(rank.rank, 1);
    }

    #[test]
    fn top_initiators_orders_by_count() {
        let conn = memory_db();
        seed(&conn, &[(C, 1), (A, 3), (B, 2)]);
        let top = top_initiators(&conn, &RecordFilter::default(), 2).unwrap();
        assert_eq!(
            top,
            vec![
                InitiatorCount { initiator_address: A.to_string(), count: 3 },
                InitiatorCount { initiator_address: B.to_string(), count: 2 },
            ]
        );
    }

    #[test]
    fn average_gap_over_block_order() {
        let records = vec![
            record("0x1", 1, 0, A),
            record("0x2", 2, 24, A),
            record("0x3", 3, 72, A),
        ];
        let gap = average_gap(&records).unwrap();
        assert_eq!(gap.num_milliseconds(), 129_600_000);
    }

    #[test]
    fn fewer_than_two_records_are_unavailable() {
        assert!(average_gap(&[]).is_none());
        let one = vec![record("0x1", 1, 0, A)];
        assert!(average_gap(&one).is_none());

        let series = moving_average_series(&one, day(5), 90);
        assert_eq!(series.len(), 5);
        assert!(series.iter().all(|p| p.average_gap_hours.is_none()));
        assert!(moving_average_series(&[], day(5), 90).is_empty());
    }

    #[test]
    fn total_amount_is_exact_beyond_64_bits() {
        let conn = memory_db();
        seed(&conn, &[(A, 3)]);
        let total = total_amount(&conn, &RecordFilter::default()).unwrap();
        let expected = U512::from(12_000u64) * U512::from(10u64).pow(U512::from(18u64));
        assert_eq!(total, expected);
        assert_eq!(total.to_string(), "12000000000000000000000");
    }

    #[test]
    fn total_amount_survives_sums_past_256_bits() {
        let conn = memory_db();
        for i in 0..3u64 {
            let mut r = record(&format!("0x{i}"), i, i as i64, A);
            r.amount = U256::MAX;
            insert_transfer(&conn, &r).unwrap();
        }
        let total = total_amount(&conn, &RecordFilter::default()).unwrap();
        assert_eq!(total, U512::from(U256::MAX) * U512::from(3u64));
    }

    #[test]
    fn previous_uses_height_before_timestamp() {
        let conn = memory_db();
        // block 10 carries a later timestamp than block 20's records
        let early_block = record("0x1", 10, 5, A);
        let first_in_20 = record("0x2", 20, 0, B);
        let second_in_20 = record("0x3", 20, 1, C);
        for r in [&early_block, &first_in_20, &second_in_20] {
            insert_transfer(&conn, r).unwrap();
        }
        let all = RecordFilter::default();

        let prev = |r: &TransferRecord| previous_transfer(&conn, &all, r).unwrap().map(|p| p.tx_id);
        assert_eq!(prev(&second_in_20).as_deref(), Some("0x2"));
        assert_eq!(prev(&first_in_20).as_deref(), Some("0x1"));
        assert_eq!(prev(&early_block), None);
    }

    #[test]
    fn same_block_records_are_not_each_others_predecessor() {
        let conn = memory_db();
        // one block carries one timestamp for every record in it
        let earlier = record("0x1", 5, 0, A);
        let first = record("0x2", 10, 2, B);
        let second = record("0x3", 10, 2, C);
        for r in [&earlier, &first, &second] {
            insert_transfer(&conn, r).unwrap();
        }
        let all = RecordFilter::default();

        let prev = |r: &TransferRecord| previous_transfer(&conn, &all, r).unwrap().map(|p| p.tx_id);
        assert_eq!(prev(&first).as_deref(), Some("0x1"));
        assert_eq!(prev(&second).as_deref(), Some("0x1"));

        let stats = transfer_stats(&conn, &all, &second).unwrap();
        assert_eq!(stats.since_previous, Some(TimeDelta::hours(2)));
    }

    #[test]
    fn moving_average_follows_trailing_week() {
        // records at Jan 1, Jan 2 and Jan 4, all at midnight
        let records = vec![
            record("0x1", 1, 0, A),
            record("0x2", 2, 24, A),
            record("0x3", 3, 72, A),
        ];
        let series = moving_average_series(&records, day(12), 90);
        let values: Vec<Option<f64>> = series.iter().map(|p| p.average_gap_hours).collect();

        assert_eq!(series.first().unwrap().date, day(1));
        assert_eq!(series.last().unwrap().date, day(12));
        assert_eq!(
            values,
            vec![
                None,       // Jan 1: one record so far
                Some(24.0), // Jan 2
                Some(24.0), // Jan 3
                Some(36.0), // Jan 4
                Some(36.0),
                Some(36.0),
                Some(36.0),
                Some(48.0), // Jan 8: Jan 1 left the window
                None,       // Jan 9: only Jan 4 remains
                None,
                None,
                None,
            ]
        );
    }

    #[test]
    fn moving_average_is_capped_to_max_days() {
        let records = vec![record("0x1", 1, 0, A), record("0x2", 2, 24, A)];
        let series = moving_average_series(&records, day(12), 5);
        assert_eq!(series.len(), 5);
        assert_eq!(series[0].date, day(8));
    }

    #[test]
    fn snapshot_summarises_store() {
        let conn = memory_db();
        seed(&conn, &[(A, 2), (B, 1)]);
        let snap = snapshot(&conn, &RecordFilter::default(), 1, day(2), Some(30)).unwrap();
        assert_eq!(snap.total_count, 3);
        assert_eq!(snap.distinct_initiators, 2);
        assert_eq!(snap.top_initiators.len(), 1);
        assert_eq!(snap.top_initiators[0].initiator_address, A);
        assert_eq!(snap.average_gap, Some(TimeDelta::hours(1)));
        assert_eq!(snap.moving_average.len(), 2);
    }

    #[test]
    fn transfer_stats_for_new_record() {
        let conn = memory_db();
        seed(&conn, &[(A, 2), (B, 1)]);
        let latest = record("0x3", 3, 3, B);
        let stats = transfer_stats(&conn, &RecordFilter::default(), &latest).unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.initiator_rank.unwrap().rank, 2);
        assert_eq!(stats.since_previous, Some(TimeDelta::hours(1)));
    }
}
