//! herald-core
//!
//! Transactional outbox: events are written in the same transaction as the
//! business change that produced them, then relayed to a stream by a
//! background dispatcher with leases, retry and backoff. Delivery is at
//! least once; consumers dedupe on `outbox_id`.
//!
//! # Modules
//! - **domain**: ids, messages, rows, status, errors
//! - **ports**: `OutboxStore`, `Transaction`, `StreamPublisher`, `Clock`, `LeaseTokenGenerator`
//! - **impls**: in-memory and SQLite stores, in-memory and tracing publishers
//! - **typed**: `Event` trait, `EventHandler<E>`, `HandlerRegistry`
//! - **app**: `OutboxWriter`, `Dispatcher`, `DispatcherBuilder`, `BackoffPolicy`, config

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{
    BackoffPolicy, Dispatcher, DispatcherBuilder, DispatcherConfig, OutboxWriter, TickReport,
};
pub use domain::{Headers, OutboxId, OutboxMessage, OutboxStatus};
pub use typed::Event;
