//! Request identifiers and per-call header names.
//!
//! Every physical RPC attempt carries a [`RequestId`] in the
//! [`REQUEST_ID_HEADER`] header. The value is six dot-separated unpadded
//! decimal segments:
//!
//! ```text
//! version.processID.clientID.channelID.requestNumber.rpcNumber
//! 1.8442919148391212434.1.2.17.1
//! ```
//!
//! `requestNumber` identifies one logical operation; `rpcNumber` counts the
//! physical attempts made for it, starting at 1.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Header carrying the request identifier.
pub const REQUEST_ID_HEADER: &str = "x-goog-spanner-request-id";

/// Header carrying the client identity.
pub const API_CLIENT_HEADER: &str = "x-goog-api-client";

/// Header naming the database a call operates on.
pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";

/// Header asking the service to route the call to the leader region.
pub const ROUTE_TO_LEADER_HEADER: &str = "x-goog-spanner-route-to-leader";

/// Format version of the request identifier.
pub const REQUEST_ID_VERSION: u8 = 1;

/// Identifier of one physical RPC attempt.
///
/// Values are immutable; a retry obtains a new value through
/// [`RequestId::next_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    /// Format version.
    pub version: u8,
    /// Random identifier of this process.
    pub process_id: u64,
    /// Ordinal of the client instance within the process.
    pub client_id: u32,
    /// Channel the call is sent on.
    pub channel_id: u32,
    /// Ordinal of the logical operation within the client.
    pub request_number: u32,
    /// Ordinal of the physical attempt within the logical operation.
    pub rpc_number: u32,
}

impl RequestId {
    /// The identifier of the first attempt of a logical operation.
    #[must_use]
    pub fn first_attempt(process_id: u64, client_id: u32, channel_id: u32, request_number: u32) -> Self {
        Self {
            version: REQUEST_ID_VERSION,
            process_id,
            client_id,
            channel_id,
            request_number,
            rpc_number: 1,
        }
    }

    /// The identifier of the next physical attempt of the same operation.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            rpc_number: self.rpc_number.saturating_add(1),
            ..*self
        }
    }

    /// Whether both identifiers belong to the same logical operation.
    #[must_use]
    pub fn same_operation(&self, other: &Self) -> bool {
        self.process_id == other.process_id
            && self.client_id == other.client_id
            && self.channel_id == other.channel_id
            && self.request_number == other.request_number
    }

    /// The header value for this identifier.
    #[must_use]
    pub fn header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.version,
            self.process_id,
            self.client_id,
            self.channel_id,
            self.request_number,
            self.rpc_number
        )
    }
}

impl FromStr for RequestId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ProtocolError::InvalidRequestId {
            value: s.to_string(),
            reason,
        };

        let segments: Vec<&str> = s.split('.').collect();
        if segments.len() != 6 {
            return Err(invalid("expected six segments"));
        }
        if segments
            .iter()
            .any(|seg| seg.is_empty() || !seg.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid("segments must be unsigned decimal"));
        }

        let parse_u32 = |seg: &str| seg.parse::<u32>().map_err(|_| invalid("segment out of range"));
        Ok(Self {
            version: segments[0]
                .parse()
                .map_err(|_| invalid("version out of range"))?,
            process_id: segments[1]
                .parse()
                .map_err(|_| invalid("process id out of range"))?,
            client_id: parse_u32(segments[2])?,
            channel_id: parse_u32(segments[3])?,
            request_number: parse_u32(segments[4])?,
            rpc_number: parse_u32(segments[5])?,
        })
    }
}
