//! GraphQL subscription resolvers
//!
//! These resolvers are driven by the subscription registry's re-execution
//! path: each broker publish executes the stored request once with the domain
//! event attached as request data, so every resolver yields at most one item
//! per execution. They are not mounted on a streaming transport of their own.

use async_graphql::{Context, Result, Subscription};
use futures::Stream;

use crate::subscriptions::DomainEvent;

use super::types::User;

pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// Fires when a user is created
    async fn user_created(&self, ctx: &Context<'_>) -> Result<impl Stream<Item = User>> {
        let event = ctx.data::<DomainEvent>()?;
        let user = match event {
            DomainEvent::UserCreated(record) => Some(User::from(record.clone())),
            _ => None,
        };
        Ok(futures::stream::iter(user))
    }

    /// Fires when a user is updated; `id` narrows the stream to one user
    async fn user_updated(
        &self,
        ctx: &Context<'_>,
        id: Option<i64>,
    ) -> Result<impl Stream<Item = User>> {
        let event = ctx.data::<DomainEvent>()?;
        let user = match event {
            DomainEvent::UserUpdated(record) if id.is_none() || id == Some(record.id) => {
                Some(User::from(record.clone()))
            }
            _ => None,
        };
        Ok(futures::stream::iter(user))
    }

    /// Fires when a user is deleted
    async fn user_deleted(&self, ctx: &Context<'_>) -> Result<impl Stream<Item = User>> {
        let event = ctx.data::<DomainEvent>()?;
        let user = match event {
            DomainEvent::UserDeleted(record) => Some(User::from(record.clone())),
            _ => None,
        };
        Ok(futures::stream::iter(user))
    }
}
