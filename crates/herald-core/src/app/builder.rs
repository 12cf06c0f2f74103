//! DispatcherBuilder - wiring plus start-up checks.
//!
//! # Fail-fast
//! - `expect_event_types()` lists the types this service must handle
//! - `build()` fails if any of them has no handler, or the config is invalid
//!
//! A producer that emits a type nobody registered would otherwise only be
//! noticed when its rows start piling up in the dead-letter state.

use std::sync::Arc;

use super::config::{ConfigError, DispatcherConfig};
use super::dispatcher::Dispatcher;
use crate::ports::{Clock, OutboxStore, StreamPublisher, SystemClock};
use crate::typed::{Event, EventHandler, HandlerRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers for event types: {0:?}")]
    MissingEventTypes(Vec<String>),

    #[error("invalid dispatcher config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

pub struct DispatcherBuilder<S: OutboxStore> {
    store: Arc<S>,
    registry: HandlerRegistry,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    expected: Option<Vec<String>>,
}

impl<S: OutboxStore> DispatcherBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            config: DispatcherConfig::default(),
            clock: Arc::new(SystemClock),
            expected: None,
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for backoff. Should be the store's clock too.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register<E: Event, H: EventHandler<E> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<E, H>(handler)?;
        Ok(self)
    }

    /// Forward `E` to `publisher` on `stream`.
    pub fn publish<E, P>(
        mut self,
        publisher: Arc<P>,
        stream: impl Into<String>,
    ) -> Result<Self, RegistryError>
    where
        E: Event,
        P: StreamPublisher + ?Sized + 'static,
    {
        self.registry.register_publisher::<E, P>(publisher, stream)?;
        Ok(self)
    }

    pub fn expect_event_types(mut self, event_types: &[&str]) -> Self {
        self.expected = Some(event_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Dispatcher<S>, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingEventTypes(missing));
            }
        }
        Ok(Dispatcher::new(
            self.store,
            Arc::new(self.registry),
            self.config,
            self.clock,
        ))
    }
}
