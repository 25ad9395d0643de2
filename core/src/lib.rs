//! zivpn-core: wallet ledger, payment settlement, and account sales for the
//! ZIVPN UDP chat bot.
//!
//! Layering, leaves first:
//!   store: SQLite ledger (wallets, journal, metrics, exceptions)
//!   session: outstanding payment intents
//!   settlement: gateway polling and confirmed-payment application
//!   shop: request handling (top-up, purchase, trial, renew, admin)
//!   dialog: chat conversation state machine on top of the shop

pub mod chat;
pub mod clock;
pub mod config;
pub mod dialog;
pub mod error;
pub mod fulfil;
pub mod gateway;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod settlement;
pub mod shop;
pub mod store;
pub mod types;
