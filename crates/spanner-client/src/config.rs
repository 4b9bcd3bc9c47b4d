//! Client configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use spanner_session_pool::SessionPoolConfig;
use spanner_transport::Backoff;

use crate::error::Error;
use crate::request_id::{ClientIdAllocator, ProcessId, SequentialClientIds};

/// Default ceiling on bytes buffered between two resume tokens (128 MiB).
pub const DEFAULT_MAX_BYTES_BETWEEN_RESUME_TOKENS: usize = 128 * 1024 * 1024;

static DATABASE_PATH: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^projects/(?P<project>[^/]+)/instances/(?P<instance>[^/]+)/databases/(?P<database>[^/]+)$")
        .ok()
});

/// Retry policy for unary RPCs that fail with a transient error.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RpcRetryPolicy {
    /// Maximum number of attempts, including the first (default: 5).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
}

impl Default for RpcRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

impl RpcRetryPolicy {
    /// Create a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Database path, `projects/<p>/instances/<i>/databases/<d>`.
    pub database: String,
    /// Session pool settings.
    pub session_pool: SessionPoolConfig,
    /// Delay between re-issues of an interrupted stream.
    pub stream_backoff: Backoff,
    /// Bytes a stream may buffer without a resume token before it stops
    /// being retryable.
    pub max_bytes_between_resume_tokens: usize,
    /// Retries of unary RPCs.
    pub rpc_retry: RpcRetryPolicy,
    /// Delay before retrying an aborted transaction when the server gives
    /// no retry delay.
    pub abort_backoff: Backoff,
    /// Database role assumed by sessions.
    pub database_role: Option<String>,
    /// Labels attached to every session.
    pub session_labels: BTreeMap<String, String>,
    /// Do not ask for read-write traffic to be routed to the leader.
    pub disable_route_to_leader: bool,
    /// Extra user agent appended to the client identity header.
    pub user_agent: Option<String>,
    /// Source of this client's id.
    pub client_id_allocator: Arc<dyn ClientIdAllocator>,
    /// Process id stamped on request ids.
    pub process_id: ProcessId,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database: String::new(),
            session_pool: SessionPoolConfig::default(),
            stream_backoff: Backoff::default(),
            max_bytes_between_resume_tokens: DEFAULT_MAX_BYTES_BETWEEN_RESUME_TOKENS,
            rpc_retry: RpcRetryPolicy::default(),
            abort_backoff: Backoff::default(),
            database_role: None,
            session_labels: BTreeMap::new(),
            disable_route_to_leader: false,
            user_agent: None,
            client_id_allocator: SequentialClientIds::global(),
            process_id: ProcessId::current(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for `database` with defaults.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Set the session pool configuration.
    #[must_use]
    pub fn session_pool(mut self, config: SessionPoolConfig) -> Self {
        self.session_pool = config;
        self
    }

    /// Set the stream re-issue backoff.
    #[must_use]
    pub fn stream_backoff(mut self, backoff: Backoff) -> Self {
        self.stream_backoff = backoff;
        self
    }

    /// Set the resume token buffering ceiling.
    #[must_use]
    pub fn max_bytes_between_resume_tokens(mut self, bytes: usize) -> Self {
        self.max_bytes_between_resume_tokens = bytes;
        self
    }

    /// Set the unary RPC retry policy.
    #[must_use]
    pub fn rpc_retry(mut self, policy: RpcRetryPolicy) -> Self {
        self.rpc_retry = policy;
        self
    }

    /// Set the aborted-transaction backoff.
    #[must_use]
    pub fn abort_backoff(mut self, backoff: Backoff) -> Self {
        self.abort_backoff = backoff;
        self
    }

    /// Set the database role.
    #[must_use]
    pub fn database_role(mut self, role: impl Into<String>) -> Self {
        self.database_role = Some(role.into());
        self
    }

    /// Add a session label.
    #[must_use]
    pub fn session_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.session_labels.insert(key.into(), value.into());
        self
    }

    /// Enable or disable leader routing of read-write traffic.
    #[must_use]
    pub fn disable_route_to_leader(mut self, disable: bool) -> Self {
        self.disable_route_to_leader = disable;
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Set the client id allocator.
    #[must_use]
    pub fn client_id_allocator(mut self, allocator: Arc<dyn ClientIdAllocator>) -> Self {
        self.client_id_allocator = allocator;
        self
    }

    /// Set the process id.
    #[must_use]
    pub fn process_id(mut self, process_id: ProcessId) -> Self {
        self.process_id = process_id;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        let valid_path = DATABASE_PATH
            .as_ref()
            .is_some_and(|re| re.is_match(&self.database));
        if !valid_path {
            return Err(Error::Config(format!(
                "database name {:?} should conform to pattern \
                 projects/<project>/instances/<instance>/databases/<database>",
                self.database
            )));
        }
        if self.max_bytes_between_resume_tokens == 0 {
            return Err(Error::Config(
                "max_bytes_between_resume_tokens must be greater than 0".into(),
            ));
        }
        if self.rpc_retry.max_attempts == 0 {
            return Err(Error::Config("rpc_retry.max_attempts must be at least 1".into()));
        }
        self.session_pool.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    const DB: &str = "projects/p/instances/i/databases/d";

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new(DB);
        assert_eq!(config.max_bytes_between_resume_tokens, 128 * 1024 * 1024);
        assert_eq!(config.rpc_retry.max_attempts, 5);
        assert_eq!(config.stream_backoff.initial, Duration::from_millis(50));
        assert!(!config.disable_route_to_leader);
        config.validate().unwrap();
    }

    #[test]
    fn test_database_path_validation() {
        for bad in [
            "",
            "projects/p/instances/i",
            "projects/p/instances/i/databases/",
            "projects/p/instances/i/databases/d/extra",
            "database",
        ] {
            let err = ClientConfig::new(bad).validate().unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad}");
        }
    }

    #[test]
    fn test_pool_config_validated() {
        let config = ClientConfig::new(DB)
            .session_pool(SessionPoolConfig::new().min_opened(10).max_opened(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new(DB)
            .database_role("reader")
            .session_label("env", "test")
            .rpc_retry(RpcRetryPolicy::no_retry())
            .disable_route_to_leader(true)
            .process_id(ProcessId::fixed(5));
        assert_eq!(config.database_role.as_deref(), Some("reader"));
        assert_eq!(config.session_labels.get("env").map(String::as_str), Some("test"));
        assert_eq!(config.rpc_retry.max_attempts, 1);
        assert_eq!(config.process_id.get(), 5);
    }
}
