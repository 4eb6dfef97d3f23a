//! Real-time subscription subsystem
//!
//! The moving parts, wired together at startup:
//!
//! - [`broker::EventBroker`] — concurrent topic → handler registry with
//!   synchronous fan-out; the only shared mutable structure besides the
//!   registry's map.
//! - [`registry::SubscriptionRegistry`] — validates client requests, stores
//!   them, and installs broker handlers that re-execute the query engine per
//!   published event.
//! - [`protocol`] — the per-connection `graphql-ws` state machine, speaking
//!   frames over the [`transport`] seam.
//! - [`hooks::ConnectionEvents`] — the lifecycle interface the protocol
//!   handler calls into, keeping it ignorant of how subscriptions are stored.

pub mod broker;
pub mod error;
pub mod events;
pub mod hooks;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use broker::{EventBroker, HandlerId};
pub use error::SubscriptionError;
pub use events::DomainEvent;
pub use hooks::{ConnectionEvents, RegistryHooks};
pub use registry::{ConnectionId, Subscription, SubscriptionKey, SubscriptionRegistry};
