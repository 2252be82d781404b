//! Remote collaborators.
//!
//! The data store never talks to a network itself. Delivery of queued
//! mutations, initial sync and live subscriptions go through a
//! [`RemoteApi`], and every remote call carries a [`Token`] obtained from a
//! [`CredentialProvider`] just before the call.

use async_trait::async_trait;
use futures::stream::BoxStream;
use harbor_engine::{MutationKind, Predicate, Record, RemoteRecord, Schema, SchemaName, Version};

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(..)")
    }
}

/// One queued mutation sent to the remote.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub schema: SchemaName,
    pub record: Record,
    pub kind: MutationKind,
    /// Version the mutation was based on; `None` for never-synced records
    pub expected_version: Option<Version>,
    pub token: Token,
}

/// Errors reported by the remote.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// The expected version is stale; `remote` is the current state when
    /// the remote returned it
    #[error("Version conflict")]
    Conflict { remote: Option<RemoteRecord> },

    /// The remote refused the payload; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A server-side condition did not hold; never retried
    #[error("Condition check failed: {0}")]
    ConditionalCheck(String),

    /// The remote could not be reached; retried until it can
    #[error("Network error: {0}")]
    Network(String),

    /// The remote failed transiently; retried a bounded number of times
    #[error("Service error: {0}")]
    Service(String),

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String, terminal: bool },
}

/// A stream of records changed on the remote.
pub type RemoteStream = BoxStream<'static, Result<RemoteRecord, RemoteError>>;

/// The remote backend.
#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    /// Apply one mutation and return the resulting remote state.
    async fn mutate(&self, request: MutationRequest) -> Result<RemoteRecord, RemoteError>;

    /// Fetch every record of `schema` matching `predicate`.
    async fn query(
        &self,
        schema: &Schema,
        predicate: &Predicate,
        token: &Token,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Subscribe to changes of `schema` made by anyone.
    async fn subscribe(&self, schema: &Schema, token: &Token) -> Result<RemoteStream, RemoteError>;
}

/// Failure to obtain a token.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AuthError {
    pub message: String,
    /// Whether asking again cannot help
    pub terminal: bool,
}

impl AuthError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
        }
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn current_token(&self) -> Result<Token, AuthError>;
}

/// A fixed token never expires.
#[async_trait]
impl CredentialProvider for Token {
    async fn current_token(&self) -> Result<Token, AuthError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_debug_is_redacted() {
        let token = Token::new("secret");
        assert_eq!(format!("{:?}", token), "Token(..)");
        assert_eq!(token.as_str(), "secret");
    }

    #[tokio::test]
    async fn fixed_token_provider() {
        let provider = Token::new("abc");
        assert_eq!(provider.current_token().await.unwrap(), Token::new("abc"));
    }
}
