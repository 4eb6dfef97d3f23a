//! Subscription registry
//!
//! Bridges broker notifications to query-engine re-execution. A registered
//! subscription stores the client's original request; every matching publish
//! re-runs that request with the event attached as the execution root, and
//! the structured result is handed to the subscription's delivery callback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_graphql::parser::parse_query;
use async_graphql::parser::types::{
    DocumentOperations, ExecutableDocument, Field, OperationDefinition, OperationType, Selection,
};
use async_graphql::{Name, Request, Response, Variables};
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::graphql::RosterSchema;

use super::broker::{EventBroker, EventHandler, HandlerId};
use super::error::SubscriptionError;

/// Per-process identity of one physical connection
pub type ConnectionId = Uuid;

/// Receives the engine result for one delivery. Failure means the result
/// could not be handed to the client.
pub type DeliveryCallback =
    Arc<dyn Fn(Response) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One client's active interest in an event
pub struct Subscription {
    /// Owning connection; referenced for delivery, never managed from here
    pub connection: ConnectionId,
    /// Client-assigned operation identifier, unique per connection only
    pub operation_id: String,
    /// Raw request text as received in the start frame
    pub query: String,
    pub variables: Variables,
    pub operation_name: Option<String>,
    pub callback: DeliveryCallback,
}

/// Registry key: the operation id scoped by its connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub connection: ConnectionId,
    pub operation: String,
}

struct ActiveSubscription {
    /// Broker registration paired with this entry; removal must unsubscribe it
    handler: HandlerId,
    field: String,
    arguments: serde_json::Map<String, serde_json::Value>,
}

/// Maps active client subscriptions to their broker registrations
pub struct SubscriptionRegistry {
    schema: RosterSchema,
    broker: Arc<EventBroker>,
    /// Declared subscription fields, taken from the schema at construction
    fields: HashSet<String>,
    subscriptions: RwLock<HashMap<SubscriptionKey, ActiveSubscription>>,
}

impl SubscriptionRegistry {
    pub async fn new(schema: RosterSchema, broker: Arc<EventBroker>) -> Arc<Self> {
        let fields = declared_subscription_fields(&schema).await;
        Arc::new(Self {
            schema,
            broker,
            fields,
            subscriptions: RwLock::new(HashMap::new()),
        })
    }

    /// Validate a subscription request and wire it to the broker.
    ///
    /// The extracted root field name doubles as the broker topic, so a
    /// publish under that name re-executes exactly the requests interested
    /// in it.
    pub fn add_subscription(
        self: &Arc<Self>,
        subscription: Subscription,
    ) -> Result<(), SubscriptionError> {
        let document =
            parse_query(&subscription.query).map_err(|e| SubscriptionError::Parse(e.to_string()))?;
        let operation = resolve_operation(&document, subscription.operation_name.as_deref())?;
        if operation.ty != OperationType::Subscription {
            return Err(SubscriptionError::Validation(
                "only subscription operations can be started over this transport".to_string(),
            ));
        }

        let field = first_root_field(operation)?;
        let field_name = field.name.node.to_string();
        if !self.fields.contains(&field_name) {
            return Err(SubscriptionError::Validation(format!(
                "`{field_name}` is not a declared subscription field"
            )));
        }
        let arguments = resolve_arguments(field, &subscription.variables)?;

        let key = SubscriptionKey {
            connection: subscription.connection,
            operation: subscription.operation_id.clone(),
        };
        let handler = self.reexecution_handler(&key, &subscription);

        let mut subscriptions = self.subscriptions.write();
        if subscriptions.contains_key(&key) {
            return Err(SubscriptionError::Duplicate(subscription.operation_id));
        }
        let handler_id = self.broker.subscribe(&field_name, handler);
        tracing::debug!(
            connection = %key.connection,
            operation = %key.operation,
            field = %field_name,
            arguments = ?arguments,
            "subscription registered"
        );
        subscriptions.insert(
            key,
            ActiveSubscription {
                handler: handler_id,
                field: field_name,
                arguments,
            },
        );
        Ok(())
    }

    /// Remove one subscription and its broker registration. Removing an
    /// unknown key is a logged no-op. An invocation already snapshotted by an
    /// in-flight publish may still complete once; none happen afterwards.
    pub fn remove_subscription(&self, key: &SubscriptionKey) {
        let removed = self.subscriptions.write().remove(key);
        match removed {
            Some(active) => {
                self.broker.unsubscribe(active.handler);
                tracing::debug!(
                    connection = %key.connection,
                    operation = %key.operation,
                    field = %active.field,
                    "subscription removed"
                );
            }
            None => {
                tracing::warn!(
                    connection = %key.connection,
                    operation = %key.operation,
                    "removal requested for unknown subscription"
                );
            }
        }
    }

    /// Remove every subscription owned by a connection (close path)
    pub fn remove_connection(&self, connection: ConnectionId) -> usize {
        let drained: Vec<(SubscriptionKey, ActiveSubscription)> = {
            let mut subscriptions = self.subscriptions.write();
            let keys: Vec<SubscriptionKey> = subscriptions
                .keys()
                .filter(|key| key.connection == connection)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| subscriptions.remove_entry(&key))
                .collect()
        };

        let count = drained.len();
        for (key, active) in drained {
            self.broker.unsubscribe(active.handler);
            tracing::debug!(
                connection = %key.connection,
                operation = %key.operation,
                "subscription removed with connection"
            );
        }
        count
    }

    /// Number of currently registered subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Build the broker handler that re-executes this subscription's request
    /// for each published event and forwards the result to its callback.
    fn reexecution_handler(
        self: &Arc<Self>,
        key: &SubscriptionKey,
        subscription: &Subscription,
    ) -> EventHandler {
        let schema = self.schema.clone();
        let registry = Arc::downgrade(self);
        let key = key.clone();
        let query = subscription.query.clone();
        let variables = subscription.variables.clone();
        let operation_name = subscription.operation_name.clone();
        let callback = subscription.callback.clone();

        Arc::new(move |event| {
            let schema = schema.clone();
            let registry = registry.clone();
            let key = key.clone();
            let query = query.clone();
            let variables = variables.clone();
            let operation_name = operation_name.clone();
            let callback = callback.clone();

            Box::pin(async move {
                let mut request = Request::new(query).variables(variables).data(event);
                if let Some(operation_name) = operation_name {
                    request = request.operation_name(operation_name);
                }

                let mut stream = Box::pin(schema.execute_stream(request));
                let Some(response) = stream.next().await else {
                    // The resolver filtered this event out; nothing to deliver
                    return Ok(());
                };

                if let Err(error) = (callback.as_ref())(response).await {
                    // The connection's write side is gone; drop the
                    // subscription so the broker stops delivering to it.
                    if let Some(registry) = registry.upgrade() {
                        registry.remove_subscription(&key);
                    }
                    return Err(error);
                }
                Ok(())
            })
        })
    }
}

/// Ask the engine which subscription fields the live schema declares
async fn declared_subscription_fields(schema: &RosterSchema) -> HashSet<String> {
    let response = schema
        .execute("{ __schema { subscriptionType { fields { name } } } }")
        .await;

    let mut fields = HashSet::new();
    if let Ok(data) = response.data.into_json() {
        if let Some(list) = data["__schema"]["subscriptionType"]["fields"].as_array() {
            for field in list {
                if let Some(name) = field["name"].as_str() {
                    fields.insert(name.to_string());
                }
            }
        }
    }
    fields
}

fn resolve_operation<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<&'a OperationDefinition, SubscriptionError> {
    match (&document.operations, operation_name) {
        (DocumentOperations::Single(operation), _) => Ok(&operation.node),
        (DocumentOperations::Multiple(operations), Some(name)) => operations
            .get(name)
            .map(|operation| &operation.node)
            .ok_or_else(|| {
                SubscriptionError::Validation(format!("operation `{name}` not found in document"))
            }),
        (DocumentOperations::Multiple(operations), None) => match operations.values().next() {
            Some(operation) if operations.len() == 1 => Ok(&operation.node),
            _ => Err(SubscriptionError::Validation(
                "document defines multiple operations; operationName is required".to_string(),
            )),
        },
    }
}

/// Only the first top-level field is wired to the broker; additional root
/// fields are ignored rather than rejected.
fn first_root_field(operation: &OperationDefinition) -> Result<&Field, SubscriptionError> {
    operation
        .selection_set
        .node
        .items
        .iter()
        .find_map(|selection| match &selection.node {
            Selection::Field(field) => Some(&field.node),
            _ => None,
        })
        .ok_or_else(|| {
            SubscriptionError::Validation(
                "subscription must select at least one field".to_string(),
            )
        })
}

/// Resolve the field's argument literals against the supplied variables.
/// Type coercion against the declared argument types stays with the engine
/// at execution time.
fn resolve_arguments(
    field: &Field,
    variables: &Variables,
) -> Result<serde_json::Map<String, serde_json::Value>, SubscriptionError> {
    let mut resolved = serde_json::Map::new();
    for (name, value) in &field.arguments {
        let value = value.node.clone().into_const_with(|var: Name| {
            variables.get(&var).cloned().ok_or_else(|| {
                SubscriptionError::Validation(format!("variable `${var}` is not defined"))
            })
        })?;
        let json = value.into_json().map_err(|e| {
            SubscriptionError::Validation(format!(
                "argument `{}` is not representable: {e}",
                name.node
            ))
        })?;
        resolved.insert(name.node.to_string(), json);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, UserRecord};
    use crate::graphql::build_schema;
    use crate::subscriptions::events::{DomainEvent, USER_CREATED, USER_DELETED, USER_UPDATED};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    async fn harness() -> (Arc<SubscriptionRegistry>, Arc<EventBroker>) {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        db.ensure_schema().await.expect("schema bootstrap");
        let broker = Arc::new(EventBroker::new());
        let schema = build_schema(db, broker.clone());
        let registry = SubscriptionRegistry::new(schema, broker.clone()).await;
        (registry, broker)
    }

    fn user(id: i64, name: &str) -> UserRecord {
        UserRecord {
            id,
            name: name.to_string(),
            email: format!("{name}@example.com"),
            age: 30,
            profession: "tester".to_string(),
            friendly: true,
        }
    }

    fn capture_callback(store: Arc<Mutex<Vec<serde_json::Value>>>) -> DeliveryCallback {
        Arc::new(move |response| {
            let store = store.clone();
            Box::pin(async move {
                store.lock().push(serde_json::to_value(&response)?);
                Ok(())
            })
        })
    }

    fn failing_callback() -> DeliveryCallback {
        Arc::new(|_response| Box::pin(async { anyhow::bail!("peer went away") }))
    }

    fn subscription(
        connection: ConnectionId,
        operation_id: &str,
        query: &str,
        variables: serde_json::Value,
        callback: DeliveryCallback,
    ) -> Subscription {
        Subscription {
            connection,
            operation_id: operation_id.to_string(),
            query: query.to_string(),
            variables: Variables::from_json(variables),
            operation_name: None,
            callback,
        }
    }

    #[tokio::test]
    async fn add_then_remove_restores_handler_count() {
        let (registry, broker) = harness().await;
        let connection = Uuid::new_v4();
        assert_eq!(broker.handler_count(USER_CREATED), 0);

        registry
            .add_subscription(subscription(
                connection,
                "sub-1",
                "subscription { userCreated { id name } }",
                serde_json::json!({}),
                capture_callback(Arc::new(Mutex::new(Vec::new()))),
            ))
            .expect("valid subscription");
        assert_eq!(broker.handler_count(USER_CREATED), 1);
        assert_eq!(registry.subscription_count(), 1);

        registry.remove_subscription(&SubscriptionKey {
            connection,
            operation: "sub-1".to_string(),
        });
        assert_eq!(broker.handler_count(USER_CREATED), 0);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unknown_field_is_rejected_without_registration() {
        let (registry, broker) = harness().await;
        let result = registry.add_subscription(subscription(
            Uuid::new_v4(),
            "sub-1",
            "subscription { somethingElse { id } }",
            serde_json::json!({}),
            capture_callback(Arc::new(Mutex::new(Vec::new()))),
        ));

        assert_matches!(result, Err(SubscriptionError::Validation(_)));
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(broker.handler_count(USER_CREATED), 0);
    }

    #[tokio::test]
    async fn unparseable_query_is_rejected() {
        let (registry, _broker) = harness().await;
        let result = registry.add_subscription(subscription(
            Uuid::new_v4(),
            "sub-1",
            "subscription { userCreated {",
            serde_json::json!({}),
            capture_callback(Arc::new(Mutex::new(Vec::new()))),
        ));

        assert_matches!(result, Err(SubscriptionError::Parse(_)));
    }

    #[tokio::test]
    async fn non_subscription_operations_are_rejected() {
        let (registry, _broker) = harness().await;
        let result = registry.add_subscription(subscription(
            Uuid::new_v4(),
            "sub-1",
            "query { users { id } }",
            serde_json::json!({}),
            capture_callback(Arc::new(Mutex::new(Vec::new()))),
        ));

        assert_matches!(result, Err(SubscriptionError::Validation(_)));
    }

    #[tokio::test]
    async fn removing_an_unknown_subscription_is_a_safe_noop() {
        let (registry, broker) = harness().await;
        let connection = Uuid::new_v4();
        registry
            .add_subscription(subscription(
                connection,
                "sub-1",
                "subscription { userCreated { id } }",
                serde_json::json!({}),
                capture_callback(Arc::new(Mutex::new(Vec::new()))),
            ))
            .expect("valid subscription");

        registry.remove_subscription(&SubscriptionKey {
            connection,
            operation: "never-added".to_string(),
        });

        // The unrelated subscription is untouched
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(broker.handler_count(USER_CREATED), 1);
    }

    #[tokio::test]
    async fn only_the_first_root_field_is_wired() {
        let (registry, broker) = harness().await;
        registry
            .add_subscription(subscription(
                Uuid::new_v4(),
                "sub-1",
                "subscription { userCreated { id } userDeleted { id } }",
                serde_json::json!({}),
                capture_callback(Arc::new(Mutex::new(Vec::new()))),
            ))
            .expect("valid subscription");

        assert_eq!(broker.handler_count(USER_CREATED), 1);
        assert_eq!(broker.handler_count(USER_DELETED), 0);
    }

    #[tokio::test]
    async fn duplicate_operation_ids_are_rejected_per_connection() {
        let (registry, broker) = harness().await;
        let connection = Uuid::new_v4();
        let query = "subscription { userCreated { id } }";
        registry
            .add_subscription(subscription(
                connection,
                "sub-1",
                query,
                serde_json::json!({}),
                capture_callback(Arc::new(Mutex::new(Vec::new()))),
            ))
            .expect("valid subscription");

        let duplicate = registry.add_subscription(subscription(
            connection,
            "sub-1",
            query,
            serde_json::json!({}),
            capture_callback(Arc::new(Mutex::new(Vec::new()))),
        ));
        assert_matches!(duplicate, Err(SubscriptionError::Duplicate(_)));
        assert_eq!(broker.handler_count(USER_CREATED), 1);

        // The same operation id on another connection is fine
        registry
            .add_subscription(subscription(
                Uuid::new_v4(),
                "sub-1",
                query,
                serde_json::json!({}),
                capture_callback(Arc::new(Mutex::new(Vec::new()))),
            ))
            .expect("ids are scoped by connection");
        assert_eq!(broker.handler_count(USER_CREATED), 2);
    }

    #[tokio::test]
    async fn publish_reexecutes_and_delivers_the_engine_result() {
        let (registry, broker) = harness().await;
        let delivered = Arc::new(Mutex::new(Vec::new()));
        registry
            .add_subscription(subscription(
                Uuid::new_v4(),
                "sub-1",
                "subscription { userCreated { id name } }",
                serde_json::json!({}),
                capture_callback(delivered.clone()),
            ))
            .expect("valid subscription");

        broker
            .publish(DomainEvent::UserCreated(user(7, "Ada")))
            .await;

        let delivered = delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0]["data"]["userCreated"]["id"], 7);
        assert_eq!(delivered[0]["data"]["userCreated"]["name"], "Ada");
    }

    #[tokio::test]
    async fn variables_narrow_a_subscription_to_one_user() {
        let (registry, broker) = harness().await;
        let delivered = Arc::new(Mutex::new(Vec::new()));
        registry
            .add_subscription(subscription(
                Uuid::new_v4(),
                "sub-1",
                "subscription ($id: Int) { userUpdated(id: $id) { id name } }",
                serde_json::json!({ "id": 7 }),
                capture_callback(delivered.clone()),
            ))
            .expect("valid subscription");
        assert_eq!(broker.handler_count(USER_UPDATED), 1);

        broker
            .publish(DomainEvent::UserUpdated(user(8, "Grace")))
            .await;
        broker.publish(DomainEvent::UserUpdated(user(7, "Ada"))).await;

        let delivered = delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0]["data"]["userUpdated"]["id"], 7);
    }

    #[tokio::test]
    async fn missing_variables_fail_validation() {
        let (registry, broker) = harness().await;
        let result = registry.add_subscription(subscription(
            Uuid::new_v4(),
            "sub-1",
            "subscription { userUpdated(id: $id) { id } }",
            serde_json::json!({}),
            capture_callback(Arc::new(Mutex::new(Vec::new()))),
        ));

        assert_matches!(result, Err(SubscriptionError::Validation(message)) => {
            assert!(message.contains("$id"), "unexpected message: {message}");
        });
        assert_eq!(broker.handler_count(USER_UPDATED), 0);
    }

    #[tokio::test]
    async fn failed_delivery_drops_the_subscription() {
        let (registry, broker) = harness().await;
        registry
            .add_subscription(subscription(
                Uuid::new_v4(),
                "sub-1",
                "subscription { userCreated { id } }",
                serde_json::json!({}),
                failing_callback(),
            ))
            .expect("valid subscription");
        assert_eq!(broker.handler_count(USER_CREATED), 1);

        broker
            .publish(DomainEvent::UserCreated(user(1, "Ada")))
            .await;

        // Self-healing cleanup: the dead delivery path unregistered itself
        assert_eq!(broker.handler_count(USER_CREATED), 0);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn remove_connection_drains_only_that_connection() {
        let (registry, broker) = harness().await;
        let gone = Uuid::new_v4();
        let stays = Uuid::new_v4();
        for (connection, operation) in [(gone, "a"), (gone, "b"), (stays, "a")] {
            registry
                .add_subscription(subscription(
                    connection,
                    operation,
                    "subscription { userCreated { id } }",
                    serde_json::json!({}),
                    capture_callback(Arc::new(Mutex::new(Vec::new()))),
                ))
                .expect("valid subscription");
        }

        let removed = registry.remove_connection(gone);

        assert_eq!(removed, 2);
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(broker.handler_count(USER_CREATED), 1);
    }

    #[tokio::test]
    async fn named_operations_resolve_by_operation_name() {
        let (registry, broker) = harness().await;
        let mut sub = subscription(
            Uuid::new_v4(),
            "sub-1",
            "subscription OnCreate { userCreated { id } } subscription OnDelete { userDeleted { id } }",
            serde_json::json!({}),
            capture_callback(Arc::new(Mutex::new(Vec::new()))),
        );
        sub.operation_name = Some("OnDelete".to_string());

        registry.add_subscription(sub).expect("valid subscription");

        assert_eq!(broker.handler_count(USER_DELETED), 1);
        assert_eq!(broker.handler_count(USER_CREATED), 0);
    }
}
