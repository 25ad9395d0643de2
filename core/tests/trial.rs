//! Integration tests for the trial policy: once per customer, but only
//! while the wallet is empty. The admin is never limited.

mod common;

use common::{build, build_on_file, ADMIN};
use zivpn_core::error::{ErrorKind, ShopError};

const CUSTOMER: i64 = 700;

#[test]
fn trial_succeeds_once_at_zero_balance() {
    let h = build();
    let account = h.shop.handle_trial_request(CUSTOMER, "try_1").unwrap();
    assert_eq!(
        account.expires_on,
        common::start().date_naive() + chrono::Duration::days(1)
    );
    assert!(h.shop.get_wallet_snapshot(CUSTOMER).unwrap().trial_used);

    let err = h.shop.handle_trial_request(CUSTOMER, "try_2").unwrap_err();
    assert!(matches!(err, ShopError::TrialUnavailable), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(h.provisioner.create_calls(), 1, "refused trial never reaches the backend");
}

#[test]
fn funded_customer_is_not_trial_limited() {
    let h = build();
    h.shop.handle_trial_request(CUSTOMER, "try_1").unwrap();
    h.topup_and_settle(CUSTOMER, 5_000);

    h.shop.handle_trial_request(CUSTOMER, "try_2").unwrap();
    h.shop.handle_trial_request(CUSTOMER, "try_3").unwrap();
    assert_eq!(h.provisioner.create_calls(), 3);
    assert_eq!(h.balance(CUSTOMER), 5_000, "trials are free");
}

#[test]
fn trial_with_balance_does_not_consume_the_flag() {
    let h = build();
    h.shop.admin_credit(ADMIN, CUSTOMER, 5_000).unwrap();
    h.shop.handle_trial_request(CUSTOMER, "try_1").unwrap();
    assert!(!h.shop.get_wallet_snapshot(CUSTOMER).unwrap().trial_used);

    // Back to zero: the one free trial is still available.
    h.shop.admin_debit(ADMIN, CUSTOMER, 5_000).unwrap();
    h.shop.handle_trial_request(CUSTOMER, "try_2").unwrap();
    let err = h.shop.handle_trial_request(CUSTOMER, "try_3").unwrap_err();
    assert!(matches!(err, ShopError::TrialUnavailable));
}

#[test]
fn admin_has_unlimited_trials() {
    let h = build();
    for i in 0..3 {
        h.shop
            .handle_trial_request(ADMIN, &format!("admin_{i}"))
            .expect("admin trial refused");
    }
    assert_eq!(h.provisioner.create_calls(), 3);
}

#[test]
fn trials_are_not_counted_as_sales() {
    let h = build();
    h.shop.handle_trial_request(CUSTOMER, "try_1").unwrap();
    let snap = h.shop.get_wallet_snapshot(CUSTOMER).unwrap();
    assert_eq!(snap.created_count, 0);
    assert_eq!(h.shop.activity().unwrap().today, 0);
}

#[test]
fn invalid_trial_credential_is_rejected() {
    let h = build();
    let err = h.shop.handle_trial_request(CUSTOMER, "x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!h.shop.get_wallet_snapshot(CUSTOMER).unwrap().trial_used);
    assert_eq!(h.provisioner.create_calls(), 0);
}

#[test]
fn trial_account_is_returned_even_if_the_flag_cannot_be_saved() {
    let (h, path) = build_on_file();
    let side = rusqlite::Connection::open(&path).expect("second connection");
    side.execute_batch(
        "CREATE TRIGGER refuse_trial_flag BEFORE INSERT ON wallet
         WHEN NEW.trial_used = 1
         BEGIN SELECT RAISE(ABORT, 'trial flag rejected'); END;",
    )
    .unwrap();

    let account = h
        .shop
        .handle_trial_request(CUSTOMER, "try_1")
        .expect("the created account must reach the customer");
    assert_eq!(account.credential.as_str(), "try_1");
    assert!(h.provisioner.expiry_of("try_1").is_some());
    assert!(!h.shop.get_wallet_snapshot(CUSTOMER).unwrap().trial_used);
}
