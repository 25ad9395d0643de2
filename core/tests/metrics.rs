//! Integration tests for activity counters.
//!
//! Buckets: same calendar day, same ISO week, same calendar month as "now",
//! all in the configured offset.

mod common;

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use common::{build, build_with, ADMIN};
use zivpn_core::{
    config::ShopConfig,
    metrics::{compute_metrics, ActivityCounts, MetricsEvent},
};

fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

fn event(y: i32, m: u32, d: u32, h: u32) -> MetricsEvent {
    MetricsEvent {
        customer_id: 1,
        recorded_at: Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap(),
    }
}

fn now(y: i32, m: u32, d: u32, h: u32) -> DateTime<FixedOffset> {
    utc().with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

#[test]
fn events_partition_by_day_week_and_month() {
    // Wednesday 2024-05-15.
    let events = vec![
        event(2024, 5, 15, 9),  // today
        event(2024, 5, 14, 22), // yesterday, same ISO week
        event(2024, 5, 13, 0),  // Monday, same ISO week
        event(2024, 5, 12, 23), // Sunday, previous ISO week, same month
        event(2024, 5, 1, 8),   // same month, earlier week
        event(2024, 4, 30, 12), // previous month
    ];
    let counts = compute_metrics(&events, now(2024, 5, 15, 12));
    assert_eq!(
        counts,
        ActivityCounts {
            today: 1,
            week: 3,
            month: 5
        }
    );
}

#[test]
fn yesterday_counts_for_week_but_not_today() {
    let counts = compute_metrics(&[event(2024, 5, 14, 23)], now(2024, 5, 15, 0));
    assert_eq!(counts.today, 0);
    assert_eq!(counts.week, 1);
    assert_eq!(counts.month, 1);
}

#[test]
fn iso_week_spans_the_year_boundary() {
    // 2024-12-30 (Monday) and 2025-01-01 (Wednesday) share ISO week 2025-W01.
    let counts = compute_metrics(&[event(2024, 12, 30, 10)], now(2025, 1, 1, 10));
    assert_eq!(counts.week, 1);
    assert_eq!(counts.month, 0, "different calendar month");
}

#[test]
fn week_before_month_start_is_still_counted() {
    // Wednesday 2024-05-01; Monday of that week is 2024-04-29.
    let h = build();
    h.clock.set(Utc.with_ymd_and_hms(2024, 4, 29, 12, 0, 0).unwrap());
    h.shop.admin_credit(ADMIN, 5, 10_000).unwrap();
    h.shop.handle_purchase_request(5, "early", 1).unwrap();

    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    let counts = h.shop.activity().unwrap();
    assert_eq!(counts.today, 0);
    assert_eq!(counts.week, 1, "shop must load events from the week start");
    assert_eq!(counts.month, 0);
}

#[test]
fn shop_buckets_in_configured_offset() {
    let h = build_with(ShopConfig {
        utc_offset_hours: 7,
        ..ShopConfig::default_test()
    });
    // 18:00 UTC on the 15th is 01:00 on the 16th in UTC+7.
    h.clock.set(Utc.with_ymd_and_hms(2024, 5, 15, 18, 0, 0).unwrap());
    h.shop.admin_credit(ADMIN, 5, 10_000).unwrap();
    h.shop.handle_purchase_request(5, "late", 1).unwrap();

    h.clock.advance(Duration::hours(2));
    assert_eq!(h.shop.activity().unwrap().today, 1);

    h.clock.advance(Duration::days(1));
    let counts = h.shop.activity().unwrap();
    assert_eq!(counts.today, 0);
    assert_eq!(counts.week, 1);
}
