//! Pool configuration.

use std::time::Duration;

/// Configuration for a host connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard upper bound on concurrent connections (slot count).
    pub max_connections: usize,
    /// Target number of warm connections kept open ahead of demand.
    pub min_connections: usize,
    /// How many times a failed request may be re-dispatched.
    pub max_retries: u32,
    /// Bound on requests buffered ahead of the pool (input port capacity).
    pub max_open_requests: usize,
    /// Outgoing request buffer per connection. Dispatch stays sequential
    /// per connection regardless of this value.
    pub pipelining_limit: usize,
    /// How long an idle connection is kept before it is closed.
    pub idle_timeout: Duration,
    /// Recycling horizon for a connection, with up to 10% jitter added.
    /// `None` keeps connections until they idle out or fail.
    pub max_connection_lifetime: Option<Duration>,
    /// Backoff applied after the first connection failure.
    pub base_connection_backoff: Duration,
    /// Ceiling for the connect backoff including its jitter. The doubling
    /// base is clamped to half of this so that jitter never exceeds it.
    pub max_connection_backoff: Duration,
    /// Deadline for the caller to start consuming a streamed response
    /// entity before the slot aborts it.
    pub response_entity_subscription_timeout: Duration,
    /// Deadline for the response head to arrive after a request was sent.
    /// `None` waits indefinitely.
    pub response_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            min_connections: 0,
            max_retries: 5,
            max_open_requests: 32,
            pipelining_limit: 1,
            idle_timeout: Duration::from_secs(30),
            max_connection_lifetime: None,
            base_connection_backoff: Duration::from_millis(100),
            max_connection_backoff: Duration::from_secs(120),
            response_entity_subscription_timeout: Duration::from_secs(1),
            response_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Effective minimum, never above the slot count.
    pub(crate) fn effective_min_connections(&self) -> usize {
        self.min_connections.min(self.max_connections)
    }

    /// Validate the configuration, normalizing where possible.
    pub fn validate(mut self) -> crate::Result<Self> {
        if self.max_connections == 0 {
            return Err(crate::PoolError::slot(
                "max_connections must be at least 1",
            ));
        }
        if self.pipelining_limit == 0 {
            self.pipelining_limit = 1;
        }
        if self.max_open_requests == 0 {
            self.max_open_requests = 1;
        }
        self.min_connections = self.min_connections.min(self.max_connections);
        Ok(self)
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the maximum number of concurrent connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the number of warm connections to maintain.
    pub fn min_connections(mut self, min: usize) -> Self {
        self.config.min_connections = min;
        self
    }

    /// Set the per-request retry budget.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the input buffer bound.
    pub fn max_open_requests(mut self, max: usize) -> Self {
        self.config.max_open_requests = max;
        self
    }

    /// Set the per-connection outgoing buffer size.
    pub fn pipelining_limit(mut self, limit: usize) -> Self {
        self.config.pipelining_limit = limit;
        self
    }

    /// Set how long idle connections are kept.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the connection recycling horizon.
    pub fn max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_connection_lifetime = Some(lifetime);
        self
    }

    /// Set the initial connect-failure backoff.
    pub fn base_connection_backoff(mut self, backoff: Duration) -> Self {
        self.config.base_connection_backoff = backoff;
        self
    }

    /// Set the connect-failure backoff ceiling.
    pub fn max_connection_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_connection_backoff = backoff;
        self
    }

    /// Set the response entity subscription deadline.
    pub fn response_entity_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_entity_subscription_timeout = timeout;
        self
    }

    /// Set the response head deadline.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        self.config
    }
}
