//! Integration tests for the ledger store.
//!
//! Tests verify:
//! 1. Balances follow credits and debits, floored at zero per step
//! 2. Every balance change lands in the journal with the actual amount moved
//! 3. A confirmed order is credited at most once
//! 4. A failed write leaves the wallet exactly as it was
//! 5. Concurrent credits through the shared handle never lose an update
//! 6. File-backed stores survive a reopen

use chrono::{TimeZone, Utc};
use std::thread;
use zivpn_core::{
    error::{ErrorKind, ShopError},
    store::{EntryReason, Ledger, LedgerStore},
    types::Credential,
};

fn build() -> LedgerStore {
    let store = LedgerStore::in_memory().expect("in-memory store");
    store.migrate().expect("migrate failed");
    store
}

fn at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: balance arithmetic with a floor at zero
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn balance_is_credits_minus_debits_floored_each_step() {
    let store = build();
    assert_eq!(store.balance(9).unwrap(), 0, "unknown customer reads as zero");
    assert!(store.wallet(9).unwrap().is_none(), "reads must not create a wallet");

    store.credit(9, 100, EntryReason::Topup, None, at()).unwrap();
    store.debit(9, 30, EntryReason::Purchase, None, at()).unwrap();
    let after_overdraw = store.debit(9, 500, EntryReason::Purchase, None, at()).unwrap();
    assert_eq!(after_overdraw, 0, "overdraw clamps to zero without an error");

    // No inherited debt: the next credit starts from zero.
    let final_balance = store.credit(9, 50, EntryReason::Topup, None, at()).unwrap();
    assert_eq!(final_balance, 50);
    assert_eq!(store.balance(9).unwrap(), 50);
}

#[test]
fn journal_records_actual_amounts_moved() {
    let store = build();
    store.credit(9, 100, EntryReason::AdminAdjustment, None, at()).unwrap();
    store.debit(9, 250, EntryReason::Renew, Some("ref-1"), at()).unwrap();

    let journal = store.journal_for(9).unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].direction, "credit");
    assert_eq!(journal[0].reason, "admin_adjustment");
    assert_eq!(journal[1].direction, "debit");
    assert_eq!(journal[1].amount, 100, "clamped debit records what was really taken");
    assert_eq!(journal[1].balance_after, 0);
    assert_eq!(journal[1].reference.as_deref(), Some("ref-1"));
    assert_eq!(journal[1].recorded_at, at());
}

#[test]
fn zero_amounts_are_rejected_before_any_write() {
    let store = build();
    let err = store.credit(9, 0, EntryReason::Topup, None, at()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = store.debit(9, 0, EntryReason::Purchase, None, at()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(store.wallet_count().unwrap(), 0);
    assert_eq!(store.ledger_entry_count().unwrap(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: confirmed orders are credited once
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn order_credit_is_idempotent() {
    let store = build();
    let first = store.credit_order(9, 5_000, EntryReason::Topup, "TOPUP-9-1", at()).unwrap();
    assert_eq!(first, Some(5_000));
    let again = store.credit_order(9, 5_000, EntryReason::Topup, "TOPUP-9-1", at()).unwrap();
    assert_eq!(again, None, "second confirmation of the same order must be a no-op");
    assert_eq!(store.balance(9).unwrap(), 5_000);
    assert!(store.is_order_settled("TOPUP-9-1").unwrap());
    assert_eq!(store.journal_for(9).unwrap().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: flags and the pending-purchase slot
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn pending_slot_is_replaced_and_cleared_as_a_unit() {
    let store = build();
    let a = Credential::parse("alpha").unwrap();
    let b = Credential::parse("bravo").unwrap();

    store.set_pending_purchase(9, &a, 3, at()).unwrap();
    store.set_pending_purchase(9, &b, 5, at()).unwrap();
    let pending = store.pending_purchase(9).unwrap().expect("slot populated");
    assert_eq!(pending.credential, b);
    assert_eq!(pending.days, 5);

    store.clear_pending_purchase(9, at()).unwrap();
    assert!(store.pending_purchase(9).unwrap().is_none());

    // Clearing for an unknown customer does not create a wallet.
    store.clear_pending_purchase(77, at()).unwrap();
    assert!(store.wallet(77).unwrap().is_none());
}

#[test]
fn taking_pending_debits_and_empties_slot_together() {
    let store = build();
    let c = Credential::parse("charlie").unwrap();
    store.credit(9, 5_000, EntryReason::Topup, None, at()).unwrap();
    store.set_pending_purchase(9, &c, 3, at()).unwrap();

    let (taken, balance) = store
        .take_pending_purchase(9, 3_000, Some("TOPUP-9-2"), at())
        .unwrap()
        .expect("pending purchase present");
    assert_eq!(taken.credential, c);
    assert_eq!(balance, 2_000);
    assert!(store.pending_purchase(9).unwrap().is_none());

    let none = store.take_pending_purchase(9, 3_000, None, at()).unwrap();
    assert!(none.is_none(), "nothing left to take");
    assert_eq!(store.balance(9).unwrap(), 2_000);
}

#[test]
fn trial_and_ban_flags() {
    let store = build();
    assert!(!store.has_used_trial(9).unwrap());
    store.mark_trial_used(9, at()).unwrap();
    store.mark_trial_used(9, at()).unwrap();
    assert!(store.has_used_trial(9).unwrap());

    store.set_banned(9, true, at()).unwrap();
    assert!(store.is_banned(9).unwrap());
    store.set_banned(9, false, at()).unwrap();
    assert!(!store.is_banned(9).unwrap());
    assert!(store.has_used_trial(9).unwrap(), "trial flag is never cleared");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: failed writes roll back
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn failed_write_leaves_wallet_untouched() {
    let store = build();
    store.credit(9, 100, EntryReason::Topup, None, at()).unwrap();
    let entries_before = store.ledger_entry_count().unwrap();

    // Pushes the balance past what the database column can hold.
    let err = store
        .credit(9, i64::MAX as u64, EntryReason::Topup, None, at())
        .unwrap_err();
    assert!(matches!(err, ShopError::Validation(_)), "got {err:?}");

    assert_eq!(store.balance(9).unwrap(), 100, "balance must be the pre-failure value");
    assert_eq!(store.ledger_entry_count().unwrap(), entries_before);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: concurrent credits
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_credits_are_never_lost() {
    let ledger = Ledger::new(build());
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    let store = ledger.lock().expect("ledger lock");
                    store.credit(9, 100, EntryReason::Topup, None, at()).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().expect("worker panicked");
    }
    let store = ledger.lock().unwrap();
    assert_eq!(store.balance(9).unwrap(), 8_000);
    assert_eq!(store.journal_for(9).unwrap().len(), 80);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: persistence across reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn file_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!("zivpn-ledger-{}.db", uuid::Uuid::new_v4()));
    let path_str = path.to_string_lossy().to_string();
    {
        let store = LedgerStore::open(&path_str).expect("open file store");
        store.migrate().unwrap();
        store.credit(9, 4_200, EntryReason::Topup, None, at()).unwrap();
        store
            .set_pending_purchase(9, &Credential::parse("delta").unwrap(), 2, at())
            .unwrap();
    }
    {
        let store = LedgerStore::open(&path_str).expect("reopen file store");
        store.migrate().expect("migrations must be re-runnable");
        assert_eq!(store.balance(9).unwrap(), 4_200);
        assert_eq!(store.pending_purchase(9).unwrap().map(|p| p.days), Some(2));
        assert_eq!(store.path(), Some(path_str.as_str()));
    }
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
    }
}
