//! Monthly traffic accounting. The on-host collector writes raw vnstat samples; this module
//! folds their monthly rollups into per-instance records and enforces user and host limits.

mod aggregator;

pub use aggregator::{spawn_traffic_sync, SyncReport, TrafficAggregator};

use crate::models::{now_ts, TrafficRecord};
use crate::state::{instances, traffic, StateDatabase};
use crate::Result;
use chrono::{DateTime, Datelike, NaiveDate, Utc};

const BYTES_PER_MB: i64 = 1024 * 1024;

/// `(year, month)` of a unix timestamp, in UTC.
pub fn month_of(ts: i64) -> (i32, u32) {
    let at = DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_default();
    (at.year(), at.month())
}

/// Midnight UTC on the first day of the month after `ts`.
pub fn next_reset_at(ts: i64) -> i64 {
    let (year, month) = month_of(ts);
    let (year, month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc().timestamp())
        .unwrap_or(ts)
}

/// Fold a cumulative reading into a record. A reading below the stored baseline means the
/// counters were reset on the instance; the version is bumped and the whole reading counts.
pub fn fold_reading(record: &mut TrafficRecord, rx_mb: i64, tx_mb: i64) {
    let reset = rx_mb < record.last_vnstat_rx_mb || tx_mb < record.last_vnstat_tx_mb;
    let (rx_delta, tx_delta) = if reset {
        record.vnstat_version += 1;
        (rx_mb, tx_mb)
    } else {
        (rx_mb - record.last_vnstat_rx_mb, tx_mb - record.last_vnstat_tx_mb)
    };
    record.traffic_in_mb += rx_delta;
    record.traffic_out_mb += tx_delta;
    record.total_used_mb = record.traffic_in_mb + record.traffic_out_mb;
    record.last_vnstat_rx_mb = rx_mb;
    record.last_vnstat_tx_mb = tx_mb;
}

/// Fold the current month's rollups of one instance into its traffic record. Returns `None`
/// when the collector has not reported anything for this month yet.
pub fn sync_instance(db: &StateDatabase, instance_id: i64) -> Result<Option<TrafficRecord>> {
    sync_instance_at(db, instance_id, now_ts())
}

pub(crate) fn sync_instance_at(
    db: &StateDatabase,
    instance_id: i64,
    now: i64,
) -> Result<Option<TrafficRecord>> {
    let (year, month) = month_of(now);
    db.write(|tx| {
        let rollups = traffic::monthly_rollups(tx, instance_id, year, month)?;
        if rollups.is_empty() {
            return Ok(None);
        }
        let rx_mb = rollups.iter().map(|(_, rx, _)| rx).sum::<i64>() / BYTES_PER_MB;
        let tx_mb = rollups.iter().map(|(_, _, tx)| tx).sum::<i64>() / BYTES_PER_MB;

        let instance = instances::get_unscoped(tx, instance_id)?;
        let mut record = match traffic::find(tx, instance_id, year, month)? {
            Some(record) => record,
            None => TrafficRecord {
                id: 0,
                user_id: instance.user_id,
                host_id: instance.host_id,
                instance_id,
                year,
                month,
                traffic_in_mb: 0,
                traffic_out_mb: 0,
                total_used_mb: 0,
                interface_name: String::new(),
                vnstat_version: 0,
                last_vnstat_rx_mb: 0,
                last_vnstat_tx_mb: 0,
                last_sync_at: None,
            },
        };
        let before = record.vnstat_version;
        fold_reading(&mut record, rx_mb, tx_mb);
        if record.vnstat_version != before {
            tracing::info!(
                instance = %instance.name,
                version = record.vnstat_version,
                "检测到vnStat计数重置"
            );
        }
        record.interface_name = instance
            .vnstat_interface
            .clone()
            .unwrap_or_else(|| rollups[0].0.clone());
        record.last_sync_at = Some(now);
        traffic::upsert(tx, &record)?;
        Ok(Some(record))
    })
}

#[cfg(test)]
#[path = "traffic_tests.rs"]
mod traffic_tests;
