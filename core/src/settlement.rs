//! Settlement Engine: polls the payment gateway for every outstanding
//! session and applies confirmed payments to the ledger.
//!
//! RULE: a confirmed order is credited exactly once, and always before any
//! purchase it pays for is attempted.
//! RULE: lock order is ledger, then sessions. Nothing takes them the other way round.
//! RULE: payment gateway calls run on their own thread, bounded by the
//! configured timeout, and never while the session lock is held.
//!
//! Per confirmed session, under the ledger lock:
//!   1. credit the paid amount (idempotent on order id)
//!   2. topup: complete the parked purchase if the balance now covers it
//!      direct purchase: re-check the balance, debit, provision
//!   3. close the session, whatever the provisioning outcome
//!
//! A status query that errors or times out leaves the session open for the
//! next tick. A session past its expiry and grace period is dropped only once
//! the gateway has answered that it is still unpaid.

use crate::{
    chat::{ChatTransport, OutboundMessage},
    clock::Clock,
    config::ShopConfig,
    error::{ShopError, ShopResult},
    fulfil::{Fulfiller, PaidProvision, ProvisionKind},
    gateway::{AccountInfo, PaymentGateway, PaymentStatus},
    session::{PaymentIntent, PaymentSession, SessionRegistry},
    store::{EntryReason, Ledger, LedgerStore},
    types::{format_amount, Amount, Credential, CustomerId, Days, Destination},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicI64, Ordering},
        mpsc, Arc, Mutex, MutexGuard, TryLockError,
    },
    thread,
};

/// Summary of one settlement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Another tick was already running; nothing was done.
    pub skipped: bool,
    pub polled: usize,
    pub confirmed: usize,
    pub pending: usize,
    pub errors: usize,
    pub completed_purchases: usize,
    pub dropped_stale: usize,
    /// Orders not queried because an earlier status query is still running.
    pub in_flight: usize,
}

type QuerySet = Arc<Mutex<HashSet<String>>>;

fn queries(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks one order as having a status query on the wire. Dropping it,
/// whether the query answered or its thread never started, clears the mark.
struct InFlight {
    set: QuerySet,
    order_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        queries(&self.set).remove(&self.order_id);
    }
}

pub struct SettlementEngine {
    sessions: Mutex<SessionRegistry>,
    tick_guard: Mutex<()>,
    status_queries: QuerySet,
    last_order_stamp: AtomicI64,
    payments: Arc<dyn PaymentGateway>,
    ledger: Ledger,
    fulfiller: Arc<Fulfiller>,
    transport: Arc<dyn ChatTransport>,
    clock: Arc<dyn Clock>,
    config: Arc<ShopConfig>,
}

impl SettlementEngine {
    pub fn new(
        config: Arc<ShopConfig>,
        ledger: Ledger,
        payments: Arc<dyn PaymentGateway>,
        fulfiller: Arc<Fulfiller>,
        transport: Arc<dyn ChatTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: Mutex::new(SessionRegistry::new()),
            tick_guard: Mutex::new(()),
            status_queries: Arc::new(Mutex::new(HashSet::new())),
            last_order_stamp: AtomicI64::new(0),
            payments,
            ledger,
            fulfiller,
            transport,
            clock,
            config,
        }
    }

    fn sessions(&self) -> ShopResult<MutexGuard<'_, SessionRegistry>> {
        self.sessions.lock().map_err(|_| ShopError::LockPoisoned)
    }

    // ── Session lifecycle ─────────────────────────────────────────

    /// Create the gateway transaction and register the session.
    ///
    /// Refused with `SessionOutstanding` while the customer already has an
    /// active session; the gateway is not contacted in that case.
    pub fn open_session(
        &self,
        customer: CustomerId,
        destination: Destination,
        amount: Amount,
        intent: PaymentIntent,
    ) -> ShopResult<PaymentSession> {
        if let Some(active) = self.sessions()?.get_by_customer(customer) {
            return Err(ShopError::SessionOutstanding {
                order_id: active.order_id.clone(),
            });
        }

        let now = self.clock.now();
        let prefix = match intent {
            PaymentIntent::Topup => "TOPUP",
            PaymentIntent::DirectPurchase { .. } => "BUY",
        };
        let order_id = format!("{prefix}-{customer}-{}", self.next_order_stamp(now.timestamp_millis()));
        let payments = Arc::clone(&self.payments);
        let id = order_id.clone();
        let tx = self.call_gateway(format!("create-{order_id}"), move || {
            payments.create_transaction(&id, amount)
        })?;

        let session = PaymentSession {
            customer_id: customer,
            order_id,
            amount,
            destination,
            intent,
            payment_reference: tx.payment_reference,
            created_at: now,
            expires_at: tx.expires_at,
            detached: false,
        };
        // Another request may have registered a session while the gateway call ran.
        if let Err(e) = self.sessions()?.open(session.clone()) {
            log::warn!(
                "order {} created at the gateway but not registered: {e}",
                session.order_id
            );
            return Err(e);
        }
        log::info!(
            "session {} opened: customer {} {} {}",
            session.order_id,
            customer,
            session.intent.label(),
            format_amount(amount)
        );
        Ok(session)
    }

    /// Monotonic millisecond stamp so two orders never share an id.
    fn next_order_stamp(&self, now_millis: i64) -> i64 {
        let prev = self
            .last_order_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now_millis.max(prev + 1))
            })
            .unwrap_or(now_millis);
        now_millis.max(prev + 1)
    }

    pub fn active_session(&self, customer: CustomerId) -> ShopResult<Option<PaymentSession>> {
        Ok(self.sessions()?.get_by_customer(customer).cloned())
    }

    /// Stop tracking the customer's session as active. It keeps being polled.
    pub fn detach(&self, customer: CustomerId) -> ShopResult<Option<String>> {
        let order_id = self.sessions()?.detach(customer);
        if let Some(order_id) = &order_id {
            log::info!("session {order_id} detached by customer {customer}");
        }
        Ok(order_id)
    }

    pub fn outstanding(&self) -> ShopResult<Vec<PaymentSession>> {
        Ok(self.sessions()?.outstanding())
    }

    // ── Reconciliation ────────────────────────────────────────────

    /// One settlement pass over every outstanding session.
    ///
    /// Overlapping calls do not run concurrently: a second caller gets a
    /// report with `skipped` set.
    pub fn tick(&self) -> ShopResult<TickReport> {
        let _running = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log::debug!("settlement tick already running, skipping");
                return Ok(TickReport {
                    skipped: true,
                    ..TickReport::default()
                });
            }
            Err(TryLockError::Poisoned(_)) => return Err(ShopError::LockPoisoned),
        };

        let mut report = TickReport::default();
        let now = self.clock.now();
        let grace = self.config.late_confirmation_grace();
        let outstanding = self.sessions()?.outstanding();

        for session in outstanding {
            let status = match self.poll(&session) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    report.in_flight += 1;
                    log::debug!("status query for {} still running", session.order_id);
                    continue;
                }
                Err(e) => {
                    report.polled += 1;
                    report.errors += 1;
                    if session.is_stale(now, grace) {
                        log::error!(
                            "status check for expired order {} (customer {}, {}) failed, keeping it until the gateway answers: {e}",
                            session.order_id,
                            session.customer_id,
                            format_amount(session.amount)
                        );
                    } else {
                        log::warn!("status check for {} failed: {e}", session.order_id);
                    }
                    continue;
                }
            };
            report.polled += 1;

            match status {
                PaymentStatus::Pending if session.is_stale(now, grace) => {
                    self.sessions()?.close_order(&session.order_id);
                    log::warn!(
                        "dropping stale session {} for customer {} ({}), expired at {}",
                        session.order_id,
                        session.customer_id,
                        format_amount(session.amount),
                        session.expires_at
                    );
                    report.dropped_stale += 1;
                }
                PaymentStatus::Pending => report.pending += 1,
                PaymentStatus::Confirmed => {
                    report.confirmed += 1;
                    match self.settle(&session) {
                        Ok(completed) => {
                            if completed {
                                report.completed_purchases += 1;
                            }
                        }
                        Err(e) => {
                            report.errors += 1;
                            log::error!(
                                "settling {} for customer {} failed, will retry: {e}",
                                session.order_id,
                                session.customer_id
                            );
                        }
                    }
                }
            }
        }

        log::debug!(
            "settlement tick: polled={} confirmed={} pending={} errors={} completed={} dropped={} in_flight={}",
            report.polled,
            report.confirmed,
            report.pending,
            report.errors,
            report.completed_purchases,
            report.dropped_stale,
            report.in_flight
        );
        Ok(report)
    }

    /// Query the gateway for one session. `None` means an earlier query for
    /// the same order has not returned yet, so no new one was started.
    fn poll(&self, session: &PaymentSession) -> ShopResult<Option<PaymentStatus>> {
        if !queries(&self.status_queries).insert(session.order_id.clone()) {
            return Ok(None);
        }
        let marker = InFlight {
            set: Arc::clone(&self.status_queries),
            order_id: session.order_id.clone(),
        };
        let payments = Arc::clone(&self.payments);
        let amount = session.amount;
        self.call_gateway(format!("status-{}", session.order_id), move || {
            let status = payments.get_status(&marker.order_id, amount);
            drop(marker);
            status
        })
        .map(Some)
    }

    /// Run one gateway call on its own thread and wait at most the
    /// configured timeout for its answer. A call that times out is left to
    /// finish in the background.
    fn call_gateway<T, F>(&self, label: String, call: F) -> ShopResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ShopResult<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                let _ = tx.send(call());
            })
            .map_err(|e| ShopError::GatewayTransient(format!("cannot spawn {label}: {e}")))?;

        match rx.recv_timeout(self.config.gateway_timeout()) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ShopError::GatewayTransient(format!(
                "{label} timed out after {}s",
                self.config.gateway_timeout_secs
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(ShopError::GatewayTransient(format!("{label} died")))
            }
        }
    }

    /// Apply one confirmed session. Returns true if a purchase was provisioned.
    ///
    /// An error means the credit did not commit; the session stays open.
    fn settle(&self, session: &PaymentSession) -> ShopResult<bool> {
        let store = self.ledger.lock()?;
        let now = self.clock.now();
        let customer = session.customer_id;

        let reason = match session.intent {
            PaymentIntent::Topup => EntryReason::Topup,
            PaymentIntent::DirectPurchase { .. } => EntryReason::DirectPurchase,
        };
        match store.credit_order(customer, session.amount, reason, &session.order_id, now)? {
            Some(balance) => {
                log::info!(
                    "order {} confirmed: customer {} +{} (balance {})",
                    session.order_id,
                    customer,
                    format_amount(session.amount),
                    format_amount(balance)
                );
                self.notify(
                    session.destination,
                    format!(
                        "✅ Payment received: {}. Your balance is now {}.",
                        format_amount(session.amount),
                        format_amount(balance)
                    ),
                );
            }
            // An earlier tick credited it but failed before closing the session.
            None => log::info!("order {} was already credited, resuming", session.order_id),
        }

        let completed = match &session.intent {
            PaymentIntent::Topup => self
                .complete_pending(&store, customer, session.destination, Some(&session.order_id))?
                .is_some_and(|outcome| outcome.is_ok()),
            PaymentIntent::DirectPurchase { credential, days } => {
                self.settle_direct_purchase(&store, session, credential, *days)?
            }
        };

        self.sessions()?.close_order(&session.order_id);
        Ok(completed)
    }

    fn settle_direct_purchase(
        &self,
        store: &LedgerStore,
        session: &PaymentSession,
        credential: &Credential,
        days: Days,
    ) -> ShopResult<bool> {
        let customer = session.customer_id;
        let required = self.config.price_for(days)?;
        let balance = store.balance(customer)?;
        let req = PaidProvision {
            customer,
            credential,
            days,
            amount: required,
            order_id: Some(&session.order_id),
            kind: ProvisionKind::Create,
        };

        if session.detached {
            log::info!(
                "order {} was cancelled before payment, {credential} not created",
                session.order_id
            );
            self.notify(
                session.destination,
                format!(
                    "ℹ️ Payment for the cancelled purchase of {credential} was received. The funds stay in your wallet."
                ),
            );
            return Ok(false);
        }

        if store.is_banned(customer)? {
            self.fulfiller
                .record_exception(store, &req, "customer banned before the paid purchase settled");
            self.notify(
                session.destination,
                format!(
                    "⛔ Payment received, but your account is banned so {credential} was not created. The funds stay in your wallet and an admin has been notified."
                ),
            );
            return Ok(false);
        }

        if balance < required {
            self.fulfiller.record_exception(
                store,
                &req,
                &format!(
                    "paid direct purchase no longer covered: balance {balance}, required {required}"
                ),
            );
            self.notify(
                session.destination,
                format!(
                    "⚠️ Payment received, but your balance {} no longer covers {}. The funds stay in your wallet and an admin has been notified.",
                    format_amount(balance),
                    format_amount(required)
                ),
            );
            return Ok(false);
        }

        let balance_after = store.debit(
            customer,
            required,
            EntryReason::DirectPurchase,
            Some(&session.order_id),
            self.clock.now(),
        )?;
        let outcome = self.fulfiller.provision_after_debit(store, &req);
        self.report_provisioning(session.destination, &outcome, balance_after);
        Ok(outcome.is_ok())
    }

    /// Complete the customer's parked purchase if the balance now covers it.
    ///
    /// Returns the provisioning outcome when a purchase was attempted.
    /// Banned customers keep their parked purchase.
    pub fn complete_pending(
        &self,
        store: &LedgerStore,
        customer: CustomerId,
        destination: Destination,
        reference: Option<&str>,
    ) -> ShopResult<Option<ShopResult<AccountInfo>>> {
        let Some(wallet) = store.wallet(customer)? else {
            return Ok(None);
        };
        let Some(pending) = wallet.pending.clone() else {
            return Ok(None);
        };
        if wallet.banned {
            log::warn!("customer {customer} is banned, parked purchase left in place");
            return Ok(None);
        }

        let required = self.config.price_for(pending.days)?;
        if wallet.balance < required {
            self.notify(
                destination,
                format!(
                    "ℹ️ Your parked purchase of {} ({} days) needs {}. Top up {} more to complete it.",
                    pending.credential,
                    pending.days,
                    format_amount(required),
                    format_amount(required - wallet.balance)
                ),
            );
            return Ok(None);
        }

        let Some((taken, balance_after)) =
            store.take_pending_purchase(customer, required, reference, self.clock.now())?
        else {
            return Ok(None);
        };
        let req = PaidProvision {
            customer,
            credential: &taken.credential,
            days: taken.days,
            amount: required,
            order_id: reference,
            kind: ProvisionKind::Create,
        };
        let outcome = self.fulfiller.provision_after_debit(store, &req);
        self.report_provisioning(destination, &outcome, balance_after);
        Ok(Some(outcome))
    }

    fn report_provisioning(
        &self,
        destination: Destination,
        outcome: &ShopResult<AccountInfo>,
        balance_after: Amount,
    ) {
        let text = match outcome {
            Ok(account) => format!(
                "✅ Purchase completed.\n{}\nRemaining balance: {}",
                account_summary(account, &self.config.domain),
                format_amount(balance_after)
            ),
            Err(e) => format!(
                "{}\nYour payment was recorded and an admin will follow up.",
                e.user_message()
            ),
        };
        self.notify(destination, text);
    }

    fn notify(&self, destination: Destination, text: String) {
        self.transport.send(OutboundMessage::text(destination, text));
    }
}

/// Account details as shown to the customer.
pub fn account_summary(account: &AccountInfo, domain: &str) -> String {
    let domain = if domain.is_empty() {
        "(not configured)"
    } else {
        domain
    };
    format!(
        "🔑 Password: {}\n🌐 Domain: {}\n📅 Expires: {}",
        account.credential,
        domain,
        account.expires_on.format("%Y-%m-%d")
    )
}
