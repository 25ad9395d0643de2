//! Integration test for the background reconciler thread.

mod common;

use common::build;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use zivpn_core::scheduler::spawn_reconciler;

#[test]
fn reconciler_settles_payments_in_the_background() {
    let h = build();
    let session = h.shop.handle_topup_request(42, 42, 5_000).unwrap();
    h.payments.confirm(&session.order_id);

    let handle = spawn_reconciler(Arc::clone(&h.shop), Duration::from_millis(50))
        .expect("spawn reconciler");
    assert!(handle.is_running());

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.balance(42) != 5_000 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(h.balance(42), 5_000, "reconciler never credited the payment");

    handle.stop();
    let calls = h.payments.status_calls();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(h.payments.status_calls(), calls, "no ticks after stop");
}
