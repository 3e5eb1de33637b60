//! # hostpool
//!
//! A bounded host connection pool for HTTP clients: a fixed number of
//! concurrent connections to one host, multiplexed across an unbounded
//! stream of requests with strict per-request response correspondence.
//!
//! ## Features
//!
//! - **Bounded concurrency**: a fixed slot vector with backpressure on
//!   both the request and the response side
//! - **Retries**: failed dispatches re-queue with a bounded budget, on any
//!   free slot
//! - **Connect backoff**: a pool-wide, jittered embargo after connection
//!   failures prevents retry storms
//! - **Connection recycling**: idle timeout and an optional maximum
//!   connection lifetime, never interrupting a response in flight
//! - **Warm pool**: a configurable minimum of pre-connected slots
//!
//! The pool is transport-agnostic: the wire lives behind a
//! [`ConnectionFactory`] you supply. Responses carry the opaque
//! correlation tag submitted with their request, so multiplexed callers
//! can pair them up.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hostpool::{Entity, HostPool, PoolConfig, Request};
//!
//! # async fn run(factory: impl hostpool::ConnectionFactory) -> hostpool::Result<()> {
//! let config = PoolConfig::builder()
//!     .max_connections(8)
//!     .max_retries(2)
//!     .build();
//!
//! let (pool, mut responses) = HostPool::spawn(config, factory)?;
//!
//! pool.send(Request::new(Entity::empty()), 1u64).await?;
//!
//! while let Some(response) = responses.recv().await {
//!     println!("request {} finished: {}", response.tag(), response.is_success());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! One pool serves one host. For a multi-host client, run one pool per
//! scheme and authority and route requests above them.

mod config;
mod connection;
mod context;
mod embargo;
mod entity;
mod error;
mod pool;
mod slot;
mod state;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use connection::{ConnectionEvent, ConnectionFactory, ConnectionIo};
pub use context::{RequestContext, ResponseContext};
pub use entity::{Entity, EntityStream};
pub use error::{PoolError, Result};
pub use pool::{HostPool, PoolHandle, PoolSnapshot};

// Re-export common types
pub use bytes::Bytes;
pub use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};

/// Prelude for common imports.
///
/// ```
/// use hostpool::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{PoolConfig, PoolConfigBuilder};
    pub use crate::connection::{ConnectionEvent, ConnectionFactory, ConnectionIo};
    pub use crate::context::{RequestContext, ResponseContext};
    pub use crate::entity::{Entity, EntityStream};
    pub use crate::error::{PoolError, Result};
    pub use crate::pool::{HostPool, PoolHandle, PoolSnapshot};
    pub use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
}
