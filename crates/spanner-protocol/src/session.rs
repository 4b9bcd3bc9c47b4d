//! Session management messages.

use std::collections::BTreeMap;
use std::time::SystemTime;

/// A session as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Fully-qualified session name.
    pub name: String,
    /// Server-side creation time.
    pub create_time: SystemTime,
    /// Whether this is a multiplexed session.
    pub multiplexed: bool,
}

/// `CreateSession` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    /// Database path.
    pub database: String,
    /// Labels attached to the session.
    pub labels: BTreeMap<String, String>,
    /// Database role the session acts as.
    pub creator_role: Option<String>,
    /// Request a multiplexed session.
    pub multiplexed: bool,
}

/// `BatchCreateSessions` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCreateSessionsRequest {
    /// Database path.
    pub database: String,
    /// Number of sessions wanted; the service may return fewer.
    pub session_count: u32,
    /// Labels attached to each session.
    pub labels: BTreeMap<String, String>,
    /// Database role the sessions act as.
    pub creator_role: Option<String>,
}

/// `BatchCreateSessions` response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchCreateSessionsResponse {
    /// Created sessions.
    pub sessions: Vec<SessionInfo>,
}

/// `DeleteSession` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteSessionRequest {
    /// Session name.
    pub name: String,
}
