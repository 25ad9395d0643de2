//! Shared wiring for the integration tests: an in-memory shop on sandbox
//! gateways, a recording transport and a pinned clock.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use zivpn_core::{
    chat::RecordingTransport,
    clock::ManualClock,
    config::ShopConfig,
    gateway::sandbox::{LocalProvisioner, SandboxPaymentGateway},
    settlement::TickReport,
    shop::{Collaborators, Shop},
    store::LedgerStore,
    types::{Amount, CustomerId},
};

pub const ADMIN: CustomerId = 1;

pub struct Harness {
    pub shop: Arc<Shop>,
    pub payments: Arc<SandboxPaymentGateway>,
    pub provisioner: Arc<LocalProvisioner>,
    pub transport: Arc<RecordingTransport>,
    pub clock: Arc<ManualClock>,
}

/// Wednesday 2024-05-15 10:00 UTC.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap()
}

pub fn build() -> Harness {
    build_with(ShopConfig::default_test())
}

pub fn build_with(config: ShopConfig) -> Harness {
    let store = LedgerStore::in_memory().expect("in-memory store");
    build_on(config, store)
}

/// A shop backed by a fresh database file, for tests that reach into the
/// file with a second connection. Returns the file path as well.
pub fn build_on_file() -> (Harness, String) {
    let path = std::env::temp_dir()
        .join(format!("zivpn-shop-{}.db", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();
    let store = LedgerStore::open(&path).expect("file store");
    (build_on(ShopConfig::default_test(), store), path)
}

pub fn build_on(config: ShopConfig, store: LedgerStore) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(start()));
    let payments = Arc::new(SandboxPaymentGateway::new(7, clock.clone()));
    let provisioner = Arc::new(LocalProvisioner::new(clock.clone(), config.offset()));
    let transport = Arc::new(RecordingTransport::new());
    let shop = Shop::new(
        config,
        store,
        Collaborators {
            payments: payments.clone(),
            provisioner: provisioner.clone(),
            transport: transport.clone(),
            clock: clock.clone(),
        },
    )
    .expect("shop wiring failed");
    Harness {
        shop: Arc::new(shop),
        payments,
        provisioner,
        transport,
        clock,
    }
}

impl Harness {
    pub fn balance(&self, customer: CustomerId) -> Amount {
        self.shop
            .get_wallet_snapshot(customer)
            .expect("snapshot failed")
            .balance
    }

    /// Open a top-up, have the gateway confirm it, and run one tick.
    pub fn topup_and_settle(&self, customer: CustomerId, amount: Amount) -> TickReport {
        let session = self
            .shop
            .handle_topup_request(customer, customer, amount)
            .expect("topup request failed");
        assert!(self.payments.confirm(&session.order_id), "sandbox lost the order");
        self.shop.tick().expect("tick failed")
    }

    pub fn journal_len(&self, customer: CustomerId) -> usize {
        self.shop
            .ledger()
            .lock()
            .expect("ledger lock")
            .journal_for(customer)
            .expect("journal read")
            .len()
    }
}
