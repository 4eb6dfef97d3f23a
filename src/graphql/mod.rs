//! GraphQL API surface
//!
//! Queries and mutations are served over HTTP; subscription operations are
//! validated and re-executed through the subscription registry, which drives
//! the resolvers in `subscriptions.rs` once per published event.

mod schema;
mod subscriptions;
pub mod types;

pub use schema::{RosterSchema, build_schema};
