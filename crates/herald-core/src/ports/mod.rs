//! Ports - abstraction layer.
//!
//! Each trait is the seam towards an external system (a database holding the
//! outbox table, a stream broker, the wall clock). Implementations live in
//! `impls`; the `app` layer only talks to these traits.
//!
//! # Design
//! - The outbox table is the only shared mutable resource. Dispatchers
//!   coordinate exclusively through the lease fields on each row.
//! - The business transaction belongs to the caller; the store only borrows it.

pub mod clock;
pub mod id_generator;
pub mod outbox_store;
pub mod publisher;

pub use self::clock::{Clock, FixedClock, SystemClock, offset_by};
pub use self::id_generator::{LeaseTokenGenerator, UlidTokenGenerator};
pub use self::outbox_store::{OutboxStore, Transaction};
pub use self::publisher::StreamPublisher;
