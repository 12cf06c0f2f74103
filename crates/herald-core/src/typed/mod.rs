//! Typed - event types bound to handlers at compile time.
//!
//! - Surface: `Event`, `EventHandler<E>` (typed)
//! - Inside: `DynHandler` (object-safe) so one registry holds every type

pub mod event;
pub mod handler;
pub mod registry;

pub use self::event::Event;
pub use self::handler::{DynHandler, EventContext, EventHandler, PublishHandler, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
