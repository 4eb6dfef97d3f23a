//! Roster Backend - user directory service
//!
//! GraphQL queries and mutations are served at /graphql; real-time
//! subscriptions speak the graphql-ws protocol over /subscriptions.

mod api;
mod config;
mod db;
mod graphql;
mod subscriptions;

use std::net::SocketAddr;
use std::sync::Arc;

use async_graphql::http::GraphiQLSource;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::graphql::RosterSchema;
use crate::subscriptions::protocol::{GRAPHQL_WS_PROTOCOL, handle_connection};
use crate::subscriptions::transport::split_socket;
use crate::subscriptions::{ConnectionEvents, EventBroker, RegistryHooks, SubscriptionRegistry};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub schema: RosterSchema,
    pub registry: Arc<SubscriptionRegistry>,
    pub hooks: Arc<dyn ConnectionEvents>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Roster Backend");

    let db = Database::connect(&config.database_url).await?;
    db.ensure_schema().await?;
    tracing::info!("Database connected");

    // The broker and the registry are the single shared pub/sub instances for
    // the process; they are owned here and handed to everything that needs
    // them rather than living in global state.
    let broker = Arc::new(EventBroker::new());
    let schema = graphql::build_schema(db.clone(), broker.clone());
    tracing::info!("GraphQL schema built");

    let registry = SubscriptionRegistry::new(schema.clone(), broker).await;
    let hooks: Arc<dyn ConnectionEvents> =
        Arc::new(RegistryHooks::new(registry.clone(), config.close_grace));

    let state = AppState {
        config: config.clone(),
        db,
        schema,
        registry,
        hooks,
    };

    let app = Router::new()
        // Health endpoints
        .merge(api::health::router())
        // GraphQL endpoint (queries and mutations)
        .route("/graphql", get(graphiql).post(graphql_handler))
        // WebSocket endpoint for subscriptions
        .route("/subscriptions", get(subscriptions_ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);
    tracing::info!(
        "GraphQL playground: http://localhost:{}/graphql",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GraphQL query/mutation handler
async fn graphql_handler(State(state): State<AppState>, req: GraphQLRequest) -> GraphQLResponse {
    state.schema.execute(req.into_inner()).await.into()
}

/// GraphiQL interactive playground
async fn graphiql() -> impl IntoResponse {
    axum::response::Html(
        GraphiQLSource::build()
            .endpoint("/graphql")
            .subscription_endpoint("/subscriptions")
            .finish(),
    )
}

/// WebSocket upgrade into the graphql-ws protocol handler
async fn subscriptions_ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hooks = state.hooks.clone();
    ws.protocols([GRAPHQL_WS_PROTOCOL])
        .on_upgrade(move |socket| async move {
            let connection = Uuid::new_v4();
            let (frames, sink) = split_socket(socket);
            handle_connection(connection, frames, sink, hooks).await;
        })
}
