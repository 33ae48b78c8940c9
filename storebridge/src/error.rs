//! Error types
//!
//! The bridges know exactly one kind of failure: the opaque error reported by
//! the store. It is carried verbatim to the consumer. The catalog attaches the
//! identifier of the operation that produced it and nothing else.

use std::sync::Arc;

use crate::catalog::OperationId;

/// Opaque error reported by the store through a callback or query handler.
///
/// Cheap to clone: the wrapped error sits behind an `Arc`, so the same value
/// reaches every consumer that observes it.
#[derive(Debug, Clone, thiserror::Error)]
#[error(transparent)]
pub struct StoreError(Arc<dyn std::error::Error + Send + Sync>);

/// Errors the bridges synthesize when the store breaks the callback contract.
#[derive(Debug, thiserror::Error)]
enum ContractBreach {
    #[error("{0}")]
    Message(String),
    #[error("store reported neither a result nor an error")]
    MissingPayload,
    #[error("store released the completion without invoking it")]
    Abandoned,
}

impl StoreError {
    /// Wrap an error produced by the store.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ContractBreach::Message(message.into()))
    }

    /// The store invoked a handler with neither a payload nor an error.
    #[must_use]
    pub fn missing_payload() -> Self {
        Self::new(ContractBreach::MissingPayload)
    }

    /// The store dropped a completion without ever calling it.
    #[must_use]
    pub fn abandoned() -> Self {
        Self::new(ContractBreach::Abandoned)
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        matches!(
            self.0.downcast_ref::<ContractBreach>(),
            Some(ContractBreach::Abandoned)
        )
    }

    #[must_use]
    pub fn is_missing_payload(&self) -> bool {
        matches!(
            self.0.downcast_ref::<ContractBreach>(),
            Some(ContractBreach::MissingPayload)
        )
    }

    /// Access the store's concrete error type, if it is `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// True when both values wrap the very same store error instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A store error tagged with the operation that produced it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} failed: {source}")]
pub struct OperationError {
    pub operation: OperationId,
    #[source]
    pub source: StoreError,
}

impl OperationError {
    #[must_use]
    pub fn new(operation: OperationId, source: StoreError) -> Self {
        Self { operation, source }
    }

    /// The error exactly as the store reported it.
    #[must_use]
    pub fn store_error(&self) -> &StoreError {
        &self.source
    }
}
