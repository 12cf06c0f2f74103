//! HandlerRegistry - explicit event_type -> handler table, built at startup.

use std::collections::HashMap;
use std::sync::Arc;

use super::event::Event;
use super::handler::{DynHandler, EventHandler, PublishHandler, TypedHandler};
use crate::ports::StreamPublisher;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for event type '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Event, H: EventHandler<E> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(Arc::new(TypedHandler::<E, H>::new(handler)))
    }

    /// Register the stock `PublishHandler` for `E`.
    pub fn register_publisher<E, P>(
        &mut self,
        publisher: Arc<P>,
        stream: impl Into<String>,
    ) -> Result<(), RegistryError>
    where
        E: Event,
        P: StreamPublisher + ?Sized + 'static,
    {
        self.register::<E, _>(PublishHandler::<E, P>::new(publisher, stream))
    }

    /// Register an already type-erased handler.
    pub fn insert(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let event_type = handler.event_type().to_string();
        if self.handlers.contains_key(&event_type) {
            return Err(RegistryError::AlreadyRegistered(event_type));
        }
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Sorted, so logs and error messages are stable.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
