//! In-process gateway implementations used by the runner and by tests.
//!
//! RULE: sandbox randomness flows through a seeded Pcg64Mcg so payment
//! references are reproducible for a given seed.

use super::{
    AccountInfo, AccountListing, AccountStatus, PaymentGateway, PaymentStatus, PaymentTransaction,
    Provisioner,
};
use crate::{
    clock::Clock,
    error::{ShopError, ShopResult},
    types::{Amount, Credential, Days},
};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

/// How long a sandbox QR stays payable.
pub const SANDBOX_PAYMENT_WINDOW_MINUTES: i64 = 30;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Payment gateway ────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SandboxTransaction {
    amount: Amount,
    status: PaymentStatus,
}

struct PaymentState {
    rng: Pcg64Mcg,
    transactions: HashMap<String, SandboxTransaction>,
    fail_next_status: u32,
    stall_next_status: Option<std::time::Duration>,
    stall_next_create: Option<std::time::Duration>,
}

/// A payment gateway whose transactions confirm only when told to.
pub struct SandboxPaymentGateway {
    state: Mutex<PaymentState>,
    clock: Arc<dyn Clock>,
    status_calls: AtomicUsize,
}

impl SandboxPaymentGateway {
    pub fn new(seed: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(PaymentState {
                rng: Pcg64Mcg::seed_from_u64(seed),
                transactions: HashMap::new(),
                fail_next_status: 0,
                stall_next_status: None,
                stall_next_create: None,
            }),
            clock,
            status_calls: AtomicUsize::new(0),
        }
    }

    /// Mark an order as paid. Returns false for unknown orders.
    pub fn confirm(&self, order_id: &str) -> bool {
        match guard(&self.state).transactions.get_mut(order_id) {
            Some(tx) => {
                tx.status = PaymentStatus::Confirmed;
                true
            }
            None => false,
        }
    }

    /// Make the next `n` status queries fail with a transient error.
    pub fn fail_next_status(&self, n: u32) {
        guard(&self.state).fail_next_status = n;
    }

    /// Make the next status query block for `delay` before answering.
    pub fn stall_next_status(&self, delay: std::time::Duration) {
        guard(&self.state).stall_next_status = Some(delay);
    }

    /// Make the next transaction creation block for `delay` first.
    pub fn stall_next_create(&self, delay: std::time::Duration) {
        guard(&self.state).stall_next_create = Some(delay);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn transaction_count(&self) -> usize {
        guard(&self.state).transactions.len()
    }
}

impl PaymentGateway for SandboxPaymentGateway {
    fn create_transaction(&self, order_id: &str, amount: Amount) -> ShopResult<PaymentTransaction> {
        let stall = guard(&self.state).stall_next_create.take();
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        let mut state = guard(&self.state);
        if state.transactions.contains_key(order_id) {
            return Err(ShopError::GatewayRejected(format!("duplicate order {order_id}")));
        }
        let reference = format!("QRIS-{:016X}", state.rng.next_u64());
        state.transactions.insert(
            order_id.to_string(),
            SandboxTransaction {
                amount,
                status: PaymentStatus::Pending,
            },
        );
        let expires_at: DateTime<Utc> =
            self.clock.now() + Duration::minutes(SANDBOX_PAYMENT_WINDOW_MINUTES);
        Ok(PaymentTransaction {
            payment_reference: reference,
            expires_at,
        })
    }

    fn get_status(&self, order_id: &str, amount: Amount) -> ShopResult<PaymentStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let stall = guard(&self.state).stall_next_status.take();
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        let mut state = guard(&self.state);
        if state.fail_next_status > 0 {
            state.fail_next_status -= 1;
            return Err(ShopError::GatewayTransient("sandbox status unavailable".into()));
        }
        let tx = state
            .transactions
            .get(order_id)
            .ok_or_else(|| ShopError::GatewayTransient(format!("unknown order {order_id}")))?;
        if tx.amount != amount {
            return Err(ShopError::GatewayTransient(format!(
                "amount mismatch for {order_id}: gateway has {}, asked {amount}",
                tx.amount
            )));
        }
        Ok(tx.status)
    }
}

// ── Provisioner ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Rejected,
}

/// Credential → expiry-date table standing in for the account backend.
pub struct LocalProvisioner {
    accounts: Mutex<BTreeMap<String, NaiveDate>>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    fail_next: Mutex<Option<InjectedFailure>>,
    create_calls: AtomicUsize,
    renew_calls: AtomicUsize,
}

impl LocalProvisioner {
    pub fn new(clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self {
            accounts: Mutex::new(BTreeMap::new()),
            clock,
            offset,
            fail_next: Mutex::new(None),
            create_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
        }
    }

    /// Make the next create or renew call fail.
    pub fn fail_next_call(&self, failure: InjectedFailure) {
        *guard(&self.fail_next) = Some(failure);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn expiry_of(&self, credential: &str) -> Option<NaiveDate> {
        guard(&self.accounts).get(credential).copied()
    }

    /// Seed an account directly, bypassing the call counters.
    pub fn insert(&self, credential: &Credential, expires_on: NaiveDate) {
        guard(&self.accounts).insert(credential.as_str().to_string(), expires_on);
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.offset).date_naive()
    }

    fn injected(&self) -> ShopResult<()> {
        match guard(&self.fail_next).take() {
            Some(InjectedFailure::Transient) => {
                Err(ShopError::GatewayTransient("provisioning backend timed out".into()))
            }
            Some(InjectedFailure::Rejected) => {
                Err(ShopError::GatewayRejected("provisioning backend refused".into()))
            }
            None => Ok(()),
        }
    }
}

impl Provisioner for LocalProvisioner {
    fn create(&self, credential: &Credential, days: Days) -> ShopResult<AccountInfo> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        let mut accounts = guard(&self.accounts);
        if accounts.contains_key(credential.as_str()) {
            return Err(ShopError::GatewayRejected("User already exists".into()));
        }
        let expires_on = self.today() + Duration::days(i64::from(days));
        accounts.insert(credential.as_str().to_string(), expires_on);
        log::info!("sandbox: created {credential} until {expires_on}");
        Ok(AccountInfo {
            credential: credential.clone(),
            expires_on,
        })
    }

    fn renew(&self, credential: &Credential, days: Days) -> ShopResult<AccountInfo> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        let today = self.today();
        let mut accounts = guard(&self.accounts);
        let current = accounts
            .get_mut(credential.as_str())
            .ok_or_else(|| ShopError::GatewayRejected("User not found".into()))?;
        *current = (*current).max(today) + Duration::days(i64::from(days));
        log::info!("sandbox: renewed {credential} until {current}");
        Ok(AccountInfo {
            credential: credential.clone(),
            expires_on: *current,
        })
    }

    fn delete(&self, credential: &Credential) -> ShopResult<()> {
        match guard(&self.accounts).remove(credential.as_str()) {
            Some(_) => Ok(()),
            None => Err(ShopError::GatewayRejected("User not found".into())),
        }
    }

    fn list(&self) -> ShopResult<Vec<AccountListing>> {
        let today = self.today();
        let accounts = guard(&self.accounts);
        Ok(accounts
            .iter()
            .map(|(credential, expires_on)| AccountListing {
                credential: Credential::from_stored(credential.clone()),
                expires_on: *expires_on,
                status: if *expires_on < today {
                    AccountStatus::Expired
                } else {
                    AccountStatus::Active
                },
            })
            .collect())
    }
}
