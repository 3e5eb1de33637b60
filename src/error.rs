//! Pool error types.

use std::sync::Arc;
use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors produced by the pool and surfaced in response contexts and
/// entity streams.
///
/// Variants are cheap to clone because a single failure may have to reach
/// several places at once (the response context, the aborted entity stream,
/// the connection teardown log).
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The connection factory failed before the connection was established.
    #[error("connection attempt failed: {0}")]
    ConnectAttemptFailed(Arc<str>),

    /// An established connection failed or closed unexpectedly.
    #[error("connection failed: {0}")]
    ConnectionFailed(Arc<str>),

    /// The response entity stream failed mid-flight.
    #[error("response entity stream failed: {0}")]
    ResponseEntityStream(Arc<str>),

    /// The caller's request body failed while being sent.
    #[error("request entity stream failed: {0}")]
    RequestEntityStream(Arc<str>),

    /// The caller did not subscribe to the response entity in time.
    #[error("response entity was not subscribed to within {0:?}")]
    SubscriptionTimeout(std::time::Duration),

    /// No response arrived within the configured response timeout.
    #[error("no response received within {0:?}")]
    ResponseTimeout(std::time::Duration),

    /// The pool was shut down while the request was in flight.
    #[error("pool slot was shut down")]
    PoolShutdown,

    /// The request could not be accepted because the pool is gone.
    #[error("pool is no longer running")]
    PoolClosed,

    /// A slot hit an unrecoverable internal error and was recycled.
    #[error("pool slot failed internally: {0}")]
    Slot(Arc<str>),
}

impl PoolError {
    pub(crate) fn connect_attempt(message: impl Into<String>) -> Self {
        Self::ConnectAttemptFailed(message.into().into())
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into().into())
    }

    pub(crate) fn response_entity(message: impl Into<String>) -> Self {
        Self::ResponseEntityStream(message.into().into())
    }

    pub(crate) fn request_entity(message: impl Into<String>) -> Self {
        Self::RequestEntityStream(message.into().into())
    }

    pub(crate) fn slot(message: impl Into<String>) -> Self {
        Self::Slot(message.into().into())
    }

    /// Check whether a request that failed with this error may be retried
    /// on another connection.
    ///
    /// Failures after the response has been handed downstream are never
    /// retried; a half-sent request body is not replayable either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectAttemptFailed(_) => true,
            Self::ConnectionFailed(_) => true,
            Self::ResponseTimeout(_) => true,
            Self::RequestEntityStream(_) => false,
            Self::ResponseEntityStream(_) => false,
            Self::SubscriptionTimeout(_) => false,
            Self::PoolShutdown | Self::PoolClosed => false,
            Self::Slot(_) => true,
        }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout(_) | Self::SubscriptionTimeout(_))
    }

    /// Check if this error originates from connecting or from a live
    /// connection, as opposed to entity streaming or pool lifecycle.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectAttemptFailed(_) | Self::ConnectionFailed(_)
        )
    }
}
