//! App - the writer and the dispatcher, built from the ports.

pub mod backoff;
pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod writer;

pub use self::backoff::BackoffPolicy;
pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::config::{ConfigError, DispatcherConfig, ExhaustedPolicy, UnknownEventPolicy};
pub use self::dispatcher::{Dispatcher, TickReport};
pub use self::writer::OutboxWriter;
