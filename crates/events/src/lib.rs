//! Trigger events and the engine's pub/sub surface.
//!
//! The scheduler never performs side effects inline: it publishes
//! [`EngineNotification`]s on an [`EventBus`] and consumers (notification
//! service, chaining, dashboards) subscribe. This decouples failure domains —
//! a slow consumer cannot stall job execution.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;
pub mod trigger;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::InMemoryEventBus;
pub use notification::EngineNotification;
pub use trigger::{ChainContext, TriggerEvent};
