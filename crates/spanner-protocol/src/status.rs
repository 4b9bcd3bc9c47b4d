//! RPC status codes and the error taxonomy.
//!
//! Every retry decision in the runtime is made from an [`ErrorClass`], which
//! is computed once per status by [`classify`]. Call sites never inspect
//! codes or message text themselves.
//!
//! ```text
//! Unavailable, transport resets          -> Transient
//! Aborted                                 -> TransactionRetryable
//! NotFound on a Session resource          -> SessionInvalid
//! Unimplemented for multiplexed R/W       -> CapabilityUnsupported
//! everything else                         -> Terminal
//! ```

use std::fmt;
use std::time::Duration;

/// Resource type reported in `ResourceInfo` when a session no longer exists.
pub const SESSION_RESOURCE_TYPE: &str = "type.googleapis.com/google.spanner.v1.Session";

/// `ErrorInfo` reason sent when multiplexed sessions cannot run read-write transactions.
pub const MULTIPLEXED_RW_UNSUPPORTED_REASON: &str = "MULTIPLEXED_SESSIONS_NOT_SUPPORTED_FOR_READ_WRITE";

const MULTIPLEXED_RW_UNSUPPORTED_MESSAGE: &str =
    "Transaction type read_write not supported with multiplexed sessions";

/// Messages of `Internal` errors that are really broken transports.
const TRANSIENT_INTERNAL_MESSAGES: &[&str] = &[
    "transport is closing",
    "RST_STREAM",
    "unexpected EOF",
    "Received unexpected EOS on DATA frame from server",
];

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// Not an error.
    Ok = 0,
    /// The operation was cancelled.
    Canceled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity that a client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted, typically due to a concurrency issue.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// The canonical upper-camel-case name of the code.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Canceled => "Canceled",
            Self::Unknown => "Unknown",
            Self::InvalidArgument => "InvalidArgument",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Aborted => "Aborted",
            Self::OutOfRange => "OutOfRange",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DataLoss => "DataLoss",
            Self::Unauthenticated => "Unauthenticated",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured detail attached to a [`Status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusDetail {
    /// Server-suggested delay before retrying.
    RetryInfo {
        /// How long to wait.
        retry_delay: Duration,
    },
    /// The resource the error refers to.
    ResourceInfo {
        /// Fully-qualified resource type.
        resource_type: String,
        /// Resource name.
        resource_name: String,
    },
    /// Machine-readable error reason.
    ErrorInfo {
        /// Reason constant.
        reason: String,
        /// Reporting domain.
        domain: String,
    },
}

/// The status of a failed RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Status code.
    pub code: Code,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    pub details: Vec<StatusDetail>,
}

impl Status {
    /// Create a status without details.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Attach a detail.
    #[must_use]
    pub fn with_detail(mut self, detail: StatusDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// An `Aborted` status carrying a server retry delay.
    pub fn aborted(message: impl Into<String>, retry_delay: Duration) -> Self {
        Self::new(Code::Aborted, message).with_detail(StatusDetail::RetryInfo { retry_delay })
    }

    /// A `NotFound` status for the named session.
    pub fn session_not_found(session_name: &str) -> Self {
        Self::new(Code::NotFound, format!("Session not found: {session_name}")).with_detail(
            StatusDetail::ResourceInfo {
                resource_type: SESSION_RESOURCE_TYPE.to_string(),
                resource_name: session_name.to_string(),
            },
        )
    }

    /// The `Unimplemented` status sent when multiplexed sessions cannot run
    /// read-write transactions.
    pub fn multiplexed_rw_unsupported() -> Self {
        Self::new(Code::Unimplemented, MULTIPLEXED_RW_UNSUPPORTED_MESSAGE).with_detail(
            StatusDetail::ErrorInfo {
                reason: MULTIPLEXED_RW_UNSUPPORTED_REASON.to_string(),
                domain: "spanner.googleapis.com".to_string(),
            },
        )
    }

    /// Server-suggested retry delay, if any.
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        self.details.iter().find_map(|d| match d {
            StatusDetail::RetryInfo { retry_delay } => Some(*retry_delay),
            _ => None,
        })
    }

    fn resource_type(&self) -> Option<&str> {
        self.details.iter().find_map(|d| match d {
            StatusDetail::ResourceInfo { resource_type, .. } => Some(resource_type.as_str()),
            _ => None,
        })
    }

    fn has_reason(&self, reason: &str) -> bool {
        self.details
            .iter()
            .any(|d| matches!(d, StatusDetail::ErrorInfo { reason: r, .. } if r == reason))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error: code = {} desc = {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

/// How the runtime reacts to a failed RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retried at the RPC level (stream re-issue, unary retry).
    Transient,
    /// The transaction must be restarted from the beginning.
    TransactionRetryable,
    /// The session is gone; discard it and retry with a new one.
    SessionInvalid,
    /// Multiplexed sessions cannot run this transaction kind.
    CapabilityUnsupported,
    /// Surface to the caller.
    Terminal,
}

impl ErrorClass {
    /// Whether the class is retried without involving the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

/// Classify a status into the error taxonomy.
#[must_use]
pub fn classify(status: &Status) -> ErrorClass {
    match status.code {
        Code::Unavailable => ErrorClass::Transient,
        Code::Internal
            if TRANSIENT_INTERNAL_MESSAGES
                .iter()
                .any(|m| status.message.contains(m)) =>
        {
            ErrorClass::Transient
        }
        Code::Aborted => ErrorClass::TransactionRetryable,
        Code::NotFound
            if status.resource_type() == Some(SESSION_RESOURCE_TYPE)
                || status.message.starts_with("Session not found") =>
        {
            ErrorClass::SessionInvalid
        }
        Code::Unimplemented
            if status.has_reason(MULTIPLEXED_RW_UNSUPPORTED_REASON)
                || status.message.contains(MULTIPLEXED_RW_UNSUPPORTED_MESSAGE) =>
        {
            ErrorClass::CapabilityUnsupported
        }
        _ => ErrorClass::Terminal,
    }
}
