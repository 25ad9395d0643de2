use super::{sql_amount, sql_ts, EntryDirection, EntryReason, LedgerStore, PendingPurchase, WalletRecord};
use crate::{
    error::{ShopError, ShopResult},
    types::{Amount, Credential, CustomerId, Days},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

impl LedgerStore {
    // ── Wallet reads ──────────────────────────────────────────────

    pub fn wallet(&self, customer: CustomerId) -> ShopResult<Option<WalletRecord>> {
        load_wallet(&self.conn, customer)
    }

    /// Current balance, 0 for unknown customers.
    pub fn balance(&self, customer: CustomerId) -> ShopResult<Amount> {
        Ok(self.wallet(customer)?.map_or(0, |w| w.balance))
    }

    pub fn is_banned(&self, customer: CustomerId) -> ShopResult<bool> {
        Ok(self.wallet(customer)?.is_some_and(|w| w.banned))
    }

    pub fn has_used_trial(&self, customer: CustomerId) -> ShopResult<bool> {
        Ok(self.wallet(customer)?.is_some_and(|w| w.trial_used))
    }

    pub fn pending_purchase(&self, customer: CustomerId) -> ShopResult<Option<PendingPurchase>> {
        Ok(self.wallet(customer)?.and_then(|w| w.pending))
    }

    pub fn wallet_count(&self) -> ShopResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM wallet", [], |row| row.get(0))?;
        Ok(n)
    }

    // ── Balance mutations ─────────────────────────────────────────

    /// Add `amount` to the wallet, creating it if absent. Returns the new balance.
    pub fn credit(
        &self,
        customer: CustomerId,
        amount: Amount,
        reason: EntryReason,
        reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> ShopResult<Amount> {
        require_positive(amount)?;
        let tx = self.conn.unchecked_transaction()?;
        let balance = apply_credit(&tx, customer, amount, reason, reference, at)?;
        tx.commit()?;
        Ok(balance)
    }

    /// Credit a confirmed gateway order exactly once, journaled under `reason`.
    ///
    /// Returns `None` when the order was already credited earlier.
    pub fn credit_order(
        &self,
        customer: CustomerId,
        amount: Amount,
        reason: EntryReason,
        order_id: &str,
        at: DateTime<Utc>,
    ) -> ShopResult<Option<Amount>> {
        require_positive(amount)?;
        let tx = self.conn.unchecked_transaction()?;
        let seen: Option<String> = tx
            .query_row(
                "SELECT order_id FROM settled_order WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        if seen.is_some() {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO settled_order (order_id, customer_id, amount, settled_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![order_id, customer, sql_amount(amount)?, sql_ts(at)],
        )?;
        let balance = apply_credit(&tx, customer, amount, reason, Some(order_id), at)?;
        tx.commit()?;
        Ok(Some(balance))
    }

    /// Subtract `amount`, clamping at zero. Never fails on insufficient funds;
    /// callers check the balance first. Returns the new balance.
    pub fn debit(
        &self,
        customer: CustomerId,
        amount: Amount,
        reason: EntryReason,
        reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> ShopResult<Amount> {
        require_positive(amount)?;
        let tx = self.conn.unchecked_transaction()?;
        let mut wallet = load_wallet(&tx, customer)?.unwrap_or_else(|| WalletRecord::empty(customer));
        let taken = amount.min(wallet.balance);
        wallet.balance -= taken;
        save_wallet(&tx, &wallet, at)?;
        append_entry(
            &tx,
            customer,
            EntryDirection::Debit,
            taken,
            wallet.balance,
            reason,
            reference,
            at,
        )?;
        tx.commit()?;
        Ok(wallet.balance)
    }

    /// Debit the price of the parked purchase and empty the slot in one
    /// transaction. Returns the purchase that was taken and the new balance,
    /// or `None` if nothing was parked.
    pub fn take_pending_purchase(
        &self,
        customer: CustomerId,
        amount: Amount,
        reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> ShopResult<Option<(PendingPurchase, Amount)>> {
        require_positive(amount)?;
        let tx = self.conn.unchecked_transaction()?;
        let Some(mut wallet) = load_wallet(&tx, customer)? else {
            return Ok(None);
        };
        let Some(pending) = wallet.pending.take() else {
            return Ok(None);
        };
        let taken = amount.min(wallet.balance);
        wallet.balance -= taken;
        save_wallet(&tx, &wallet, at)?;
        append_entry(
            &tx,
            customer,
            EntryDirection::Debit,
            taken,
            wallet.balance,
            EntryReason::PendingPurchase,
            reference,
            at,
        )?;
        tx.commit()?;
        Ok(Some((pending, wallet.balance)))
    }

    // ── Flag and slot mutations ───────────────────────────────────

    pub fn set_banned(&self, customer: CustomerId, banned: bool, at: DateTime<Utc>) -> ShopResult<()> {
        self.modify(customer, at, |w| w.banned = banned)
    }

    /// Idempotent; the flag is never cleared.
    pub fn mark_trial_used(&self, customer: CustomerId, at: DateTime<Utc>) -> ShopResult<()> {
        self.modify(customer, at, |w| w.trial_used = true)
    }

    /// Park a purchase, replacing any earlier one.
    pub fn set_pending_purchase(
        &self,
        customer: CustomerId,
        credential: &Credential,
        days: Days,
        at: DateTime<Utc>,
    ) -> ShopResult<()> {
        if days == 0 {
            return Err(ShopError::Validation("duration must be at least one day".into()));
        }
        let pending = PendingPurchase {
            credential: credential.clone(),
            days,
        };
        self.modify(customer, at, |w| w.pending = Some(pending))
    }

    pub fn clear_pending_purchase(&self, customer: CustomerId, at: DateTime<Utc>) -> ShopResult<()> {
        if self.wallet(customer)?.is_none() {
            return Ok(());
        }
        self.modify(customer, at, |w| w.pending = None)
    }

    pub fn increment_created_count(&self, customer: CustomerId, at: DateTime<Utc>) -> ShopResult<()> {
        self.modify(customer, at, |w| w.created_count = w.created_count.saturating_add(1))
    }

    /// Load-or-create one wallet, mutate it and write it back in one transaction.
    fn modify(
        &self,
        customer: CustomerId,
        at: DateTime<Utc>,
        f: impl FnOnce(&mut WalletRecord),
    ) -> ShopResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        let mut wallet = load_wallet(&tx, customer)?.unwrap_or_else(|| WalletRecord::empty(customer));
        f(&mut wallet);
        save_wallet(&tx, &wallet, at)?;
        tx.commit()?;
        Ok(())
    }
}

fn require_positive(amount: Amount) -> ShopResult<()> {
    if amount == 0 {
        return Err(ShopError::Validation("amount must be positive".into()));
    }
    Ok(())
}

fn apply_credit(
    conn: &Connection,
    customer: CustomerId,
    amount: Amount,
    reason: EntryReason,
    reference: Option<&str>,
    at: DateTime<Utc>,
) -> ShopResult<Amount> {
    let mut wallet = load_wallet(conn, customer)?.unwrap_or_else(|| WalletRecord::empty(customer));
    wallet.balance = wallet
        .balance
        .checked_add(amount)
        .ok_or_else(|| ShopError::Validation("balance would overflow".into()))?;
    save_wallet(conn, &wallet, at)?;
    append_entry(
        conn,
        customer,
        EntryDirection::Credit,
        amount,
        wallet.balance,
        reason,
        reference,
        at,
    )?;
    Ok(wallet.balance)
}

fn load_wallet(conn: &Connection, customer: CustomerId) -> ShopResult<Option<WalletRecord>> {
    let row = conn
        .query_row(
            "SELECT customer_id, balance, trial_used, banned, created_count,
                    pending_credential, pending_days
             FROM wallet WHERE customer_id = ?1",
            params![customer],
            |row| {
                let credential: Option<String> = row.get(5)?;
                let days: Option<i64> = row.get(6)?;
                let pending = match (credential, days) {
                    (Some(c), Some(d)) => Some(PendingPurchase {
                        credential: Credential::from_stored(c),
                        days: d as Days,
                    }),
                    _ => None,
                };
                Ok(WalletRecord {
                    customer_id: row.get(0)?,
                    balance: row.get::<_, i64>(1)? as Amount,
                    trial_used: row.get::<_, i32>(2)? != 0,
                    banned: row.get::<_, i32>(3)? != 0,
                    created_count: row.get::<_, i64>(4)? as u32,
                    pending,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn save_wallet(conn: &Connection, w: &WalletRecord, at: DateTime<Utc>) -> ShopResult<()> {
    let (credential, days) = match &w.pending {
        Some(p) => (Some(p.credential.as_str()), Some(i64::from(p.days))),
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO wallet (
            customer_id, balance, trial_used, banned, created_count,
            pending_credential, pending_days, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(customer_id) DO UPDATE SET
            balance = excluded.balance,
            trial_used = excluded.trial_used,
            banned = excluded.banned,
            created_count = excluded.created_count,
            pending_credential = excluded.pending_credential,
            pending_days = excluded.pending_days,
            updated_at = excluded.updated_at",
        params![
            w.customer_id,
            sql_amount(w.balance)?,
            if w.trial_used { 1 } else { 0 },
            if w.banned { 1 } else { 0 },
            i64::from(w.created_count),
            credential,
            days,
            sql_ts(at),
        ],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn append_entry(
    conn: &Connection,
    customer: CustomerId,
    direction: EntryDirection,
    amount: Amount,
    balance_after: Amount,
    reason: EntryReason,
    reference: Option<&str>,
    at: DateTime<Utc>,
) -> ShopResult<()> {
    conn.execute(
        "INSERT INTO ledger_entry
         (customer_id, direction, amount, balance_after, reason, reference, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            customer,
            direction.as_str(),
            sql_amount(amount)?,
            sql_amount(balance_after)?,
            reason.as_str(),
            reference,
            sql_ts(at),
        ],
    )?;
    Ok(())
}
