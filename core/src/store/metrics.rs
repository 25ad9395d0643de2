use super::{parse_ts, sql_ts, LedgerStore};
use crate::{error::ShopResult, metrics::MetricsEvent, types::CustomerId};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl LedgerStore {
    /// Append one activity event. Events are never updated or removed.
    pub fn append_metric(&self, customer: CustomerId, at: DateTime<Utc>) -> ShopResult<()> {
        self.conn.execute(
            "INSERT INTO metrics_event (customer_id, recorded_at) VALUES (?1, ?2)",
            params![customer, sql_ts(at)],
        )?;
        Ok(())
    }

    /// Events recorded at or after `since`, in insertion order.
    pub fn metrics_since(&self, since: DateTime<Utc>) -> ShopResult<Vec<MetricsEvent>> {
        // Fixed-width RFC 3339 UTC text sorts the same as the instant it names.
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, recorded_at
             FROM metrics_event
             WHERE recorded_at >= ?1
             ORDER BY event_id",
        )?;
        let rows = stmt.query_map(params![sql_ts(since)], |row| {
            let raw_ts: String = row.get(1)?;
            Ok(MetricsEvent {
                customer_id: row.get(0)?,
                recorded_at: parse_ts(1, &raw_ts)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn metrics_event_count(&self) -> ShopResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM metrics_event", [], |row| row.get(0))?;
        Ok(n)
    }
}
