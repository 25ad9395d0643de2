use super::{parse_ts, JournalEntry, LedgerStore};
use crate::{error::ShopResult, types::{Amount, CustomerId}};
use rusqlite::params;

impl LedgerStore {
    /// All balance changes for one customer, oldest first.
    pub fn journal_for(&self, customer: CustomerId) -> ShopResult<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, customer_id, direction, amount, balance_after,
                    reason, reference, recorded_at
             FROM ledger_entry
             WHERE customer_id = ?1
             ORDER BY entry_id",
        )?;
        let rows = stmt.query_map(params![customer], |row| {
            let raw_ts: String = row.get(7)?;
            Ok(JournalEntry {
                entry_id: row.get(0)?,
                customer_id: row.get(1)?,
                direction: row.get(2)?,
                amount: row.get::<_, i64>(3)? as Amount,
                balance_after: row.get::<_, i64>(4)? as Amount,
                reason: row.get(5)?,
                reference: row.get(6)?,
                recorded_at: parse_ts(7, &raw_ts)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn ledger_entry_count(&self) -> ShopResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entry", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn is_order_settled(&self, order_id: &str) -> ShopResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM settled_order WHERE order_id = ?1",
            params![order_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}
