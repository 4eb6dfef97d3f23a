//! Subscription registration errors
//!
//! Surfaced to the protocol handler, which reports them back to the client as
//! an `error` frame tagged with the failing operation id. Nothing here is
//! terminal for the connection.

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The request text is not a parseable GraphQL document
    #[error("failed to parse subscription query: {0}")]
    Parse(String),

    /// The document parsed but is not a valid subscription against the schema
    #[error("subscription validation failed: {0}")]
    Validation(String),

    /// The connection already has an active operation under this id
    #[error("operation `{0}` is already active on this connection")]
    Duplicate(String),
}
