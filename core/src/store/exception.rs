use super::{parse_ts, sql_amount, sql_ts, LedgerStore, SettlementExceptionRow};
use crate::{
    error::{ShopError, ShopResult},
    types::{Amount, Days},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

impl LedgerStore {
    // ─────────────────────────────────────────────────────────────────
    // Manual-intervention queue
    // ─────────────────────────────────────────────────────────────────

    pub fn insert_settlement_exception(&self, ex: &SettlementExceptionRow) -> ShopResult<()> {
        self.conn.execute(
            "INSERT INTO settlement_exception
             (exception_id, customer_id, order_id, credential, days, amount,
              reason, detected_at, status, resolution_note, resolved_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                ex.exception_id,
                ex.customer_id,
                ex.order_id,
                ex.credential,
                i64::from(ex.days),
                sql_amount(ex.amount)?,
                ex.reason,
                sql_ts(ex.detected_at),
                ex.status,
                ex.resolution_note,
                ex.resolved_at.map(sql_ts),
            ],
        )?;
        Ok(())
    }

    pub fn open_settlement_exceptions(&self) -> ShopResult<Vec<SettlementExceptionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT exception_id, customer_id, order_id, credential, days, amount,
                    reason, detected_at, status, resolution_note, resolved_at
             FROM settlement_exception
             WHERE status = 'open'
             ORDER BY detected_at, exception_id",
        )?;
        let rows = stmt.query_map([], exception_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn settlement_exception_count(&self) -> ShopResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM settlement_exception",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Mark an open exception resolved. Unknown or already resolved ids are a validation error.
    pub fn resolve_settlement_exception(
        &self,
        exception_id: &str,
        note: &str,
        at: DateTime<Utc>,
    ) -> ShopResult<()> {
        let changed = self.conn.execute(
            "UPDATE settlement_exception
             SET status = 'resolved', resolution_note = ?2, resolved_at = ?3
             WHERE exception_id = ?1 AND status = 'open'",
            params![exception_id, note, sql_ts(at)],
        )?;
        if changed == 0 {
            return Err(ShopError::Validation(format!(
                "no open exception with id {exception_id}"
            )));
        }
        Ok(())
    }
}

fn exception_from_row(row: &Row<'_>) -> rusqlite::Result<SettlementExceptionRow> {
    let detected: String = row.get(7)?;
    let resolved: Option<String> = row.get(10)?;
    Ok(SettlementExceptionRow {
        exception_id: row.get(0)?,
        customer_id: row.get(1)?,
        order_id: row.get(2)?,
        credential: row.get(3)?,
        days: row.get::<_, i64>(4)? as Days,
        amount: row.get::<_, i64>(5)? as Amount,
        reason: row.get(6)?,
        detected_at: parse_ts(7, &detected)?,
        status: row.get(8)?,
        resolution_note: row.get(9)?,
        resolved_at: resolved.map(|raw| parse_ts(10, &raw)).transpose()?,
    })
}
