//! Per-call request headers.

use std::fmt;

use spanner_protocol::{REQUEST_ID_HEADER, RequestId};

/// Ordered header list sent with one RPC attempt.
///
/// Header names are lower-case ASCII; a name may appear more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    headers: Vec<(String, String)>,
}

impl CallMetadata {
    /// Create empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .push((name.into().to_ascii_lowercase(), value.into()));
    }

    /// Replace all values of a header with `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
        self.headers.push((name, value.into()));
    }

    /// First value of a header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The request id of this attempt, if one was stamped and parses.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.get(REQUEST_ID_HEADER).and_then(|v| v.parse().ok())
    }

    /// Stamp the request id of this attempt.
    pub fn set_request_id(&mut self, id: RequestId) {
        self.insert(REQUEST_ID_HEADER, id.header_value());
    }

    /// Iterate over all headers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl fmt::Display for CallMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (n, v)) in self.headers.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{n}: {v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces() {
        let mut md = CallMetadata::new();
        md.append("X-Goog-Api-Client", "a");
        md.append("x-goog-api-client", "b");
        assert_eq!(md.get_all("x-goog-api-client").count(), 2);

        md.insert("x-goog-api-client", "c");
        assert_eq!(md.get("X-GOOG-API-CLIENT"), Some("c"));
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn test_request_id_round_trip() {
        let mut md = CallMetadata::new();
        assert!(md.request_id().is_none());

        let id = RequestId::first_attempt(7, 1, 0, 3);
        md.set_request_id(id);
        md.set_request_id(id.next_attempt());
        assert_eq!(md.request_id().unwrap().rpc_number, 2);
        assert_eq!(md.len(), 1);
    }
}
