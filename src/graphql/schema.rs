//! GraphQL schema definition with queries, mutations, and subscriptions

use std::sync::Arc;
use std::time::Duration;

use async_graphql::{Context, Object, Result, Schema};
use tokio::time::timeout;

use crate::db::Database;
use crate::subscriptions::{DomainEvent, EventBroker};

use super::subscriptions::SubscriptionRoot;
use super::types::{CreateUserInput, UpdateUserInput, User};

/// The GraphQL schema type
pub type RosterSchema = Schema<QueryRoot, MutationRoot, SubscriptionRoot>;

/// Upper bound on any single store call made from a query or mutation
/// resolver. The subscription re-execution path carries no such bound.
const STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// Build the GraphQL schema with all resolvers
pub fn build_schema(db: Database, broker: Arc<EventBroker>) -> RosterSchema {
    Schema::build(QueryRoot, MutationRoot, SubscriptionRoot)
        .data(db)
        .data(broker)
        .finish()
}

fn store_error(e: anyhow::Error) -> async_graphql::Error {
    async_graphql::Error::new(e.to_string())
}

fn store_timeout() -> async_graphql::Error {
    async_graphql::Error::new("store call timed out")
}

// ============================================================================
// Query Root
// ============================================================================

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Get list of users that match the given name
    async fn users(&self, ctx: &Context<'_>, name: Option<String>) -> Result<Vec<User>> {
        let db = ctx.data_unchecked::<Database>();
        let records = timeout(STORE_TIMEOUT, db.users().list_by_name(name.as_deref()))
            .await
            .map_err(|_| store_timeout())?
            .map_err(store_error)?;

        Ok(records.into_iter().map(User::from).collect())
    }

    /// Get a user by email
    async fn user(&self, ctx: &Context<'_>, email: String) -> Result<Option<User>> {
        let db = ctx.data_unchecked::<Database>();
        let record = timeout(STORE_TIMEOUT, db.users().get_by_email(&email))
            .await
            .map_err(|_| store_timeout())?
            .map_err(store_error)?;

        Ok(record.map(User::from))
    }
}

// ============================================================================
// Mutation Root
// ============================================================================

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Create a new user and notify `userCreated` subscribers
    async fn create_user(&self, ctx: &Context<'_>, input: CreateUserInput) -> Result<User> {
        let db = ctx.data_unchecked::<Database>();
        let broker = ctx.data_unchecked::<Arc<EventBroker>>();

        let record = timeout(STORE_TIMEOUT, db.users().create(input.into()))
            .await
            .map_err(|_| store_timeout())?
            .map_err(store_error)?;

        // Fan-out is synchronous: this resolver pays for delivery to every
        // subscriber before returning
        let delivered = broker
            .publish(DomainEvent::UserCreated(record.clone()))
            .await;
        tracing::debug!(user = record.id, delivered, "userCreated published");

        Ok(User::from(record))
    }

    /// Update the user that matches `id` with the given payload
    async fn update_user(
        &self,
        ctx: &Context<'_>,
        id: i64,
        input: UpdateUserInput,
    ) -> Result<User> {
        let db = ctx.data_unchecked::<Database>();
        let broker = ctx.data_unchecked::<Arc<EventBroker>>();

        let record = timeout(STORE_TIMEOUT, db.users().update(id, input.into()))
            .await
            .map_err(|_| store_timeout())?
            .map_err(store_error)?
            .ok_or_else(|| async_graphql::Error::new("user not found"))?;

        let delivered = broker
            .publish(DomainEvent::UserUpdated(record.clone()))
            .await;
        tracing::debug!(user = record.id, delivered, "userUpdated published");

        Ok(User::from(record))
    }

    /// Delete the user that matches `id`, returning the removed user
    async fn delete_user(&self, ctx: &Context<'_>, id: i64) -> Result<User> {
        let db = ctx.data_unchecked::<Database>();
        let broker = ctx.data_unchecked::<Arc<EventBroker>>();

        let record = timeout(STORE_TIMEOUT, db.users().delete(id))
            .await
            .map_err(|_| store_timeout())?
            .map_err(store_error)?
            .ok_or_else(|| async_graphql::Error::new("user not found"))?;

        let delivered = broker
            .publish(DomainEvent::UserDeleted(record.clone()))
            .await;
        tracing::debug!(user = record.id, delivered, "userDeleted published");

        Ok(User::from(record))
    }
}
