//! Request id generation.
//!
//! Each client owns a [`RequestIdGenerator`]. The process id is random and
//! shared by every client in the process; the client id comes from a
//! [`ClientIdAllocator`] chosen at construction; request numbers are counted
//! per channel.
//!
//! A logical operation takes one id from [`RequestIdGenerator::next`] and
//! derives every retry from it with [`RequestId::next_attempt`], so the
//! request number stays fixed while the rpc number grows.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use spanner_protocol::RequestId;

static PROCESS_ID: Lazy<u64> = Lazy::new(rand::random::<u64>);

static GLOBAL_CLIENT_IDS: Lazy<Arc<SequentialClientIds>> =
    Lazy::new(|| Arc::new(SequentialClientIds::new()));

/// Random identifier of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    /// The id of the running process, generated on first use.
    #[must_use]
    pub fn current() -> Self {
        Self(*PROCESS_ID)
    }

    /// A fixed id, for tests.
    #[must_use]
    pub fn fixed(id: u64) -> Self {
        Self(id)
    }

    /// The numeric value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::current()
    }
}

/// Assigns client ids.
pub trait ClientIdAllocator: Send + Sync + fmt::Debug {
    /// The id of a new client for `database`.
    fn allocate(&self, database: &str) -> u32;
}

/// Numbers clients 1, 2, 3, ... per database.
#[derive(Debug, Default)]
pub struct SequentialClientIds {
    next: Mutex<HashMap<String, u32>>,
}

impl SequentialClientIds {
    /// Create an allocator with no clients yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The allocator shared by clients that do not bring their own.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_CLIENT_IDS)
    }
}

impl ClientIdAllocator for SequentialClientIds {
    fn allocate(&self, database: &str) -> u32 {
        let mut next = self.next.lock();
        let id = next.entry(database.to_string()).or_insert(0);
        *id = id.saturating_add(1);
        *id
    }
}

/// Produces the first request id of each logical operation.
#[derive(Debug)]
pub struct RequestIdGenerator {
    process_id: ProcessId,
    client_id: u32,
    request_numbers: Vec<AtomicU32>,
}

impl RequestIdGenerator {
    /// Create a generator for a client with `channels` channels.
    #[must_use]
    pub fn new(process_id: ProcessId, client_id: u32, channels: usize) -> Self {
        Self {
            process_id,
            client_id,
            request_numbers: (0..channels.max(1)).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Client id stamped on every request.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Process id stamped on every request.
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Id of the first attempt of a new operation on `channel_id`.
    pub fn next(&self, channel_id: u32) -> RequestId {
        let slot = channel_id as usize % self.request_numbers.len();
        let request_number = self.request_numbers[slot]
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        RequestId::first_attempt(self.process_id.get(), self.client_id, channel_id, request_number)
    }
}

/// Tracks the attempts of one logical operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempts {
    first: RequestId,
    last: Option<RequestId>,
}

impl Attempts {
    pub(crate) fn new(first: RequestId) -> Self {
        Self { first, last: None }
    }

    /// Id for the next physical attempt.
    pub(crate) fn next(&mut self) -> RequestId {
        let id = match self.last {
            Some(prev) => prev.next_attempt(),
            None => self.first,
        };
        self.last = Some(id);
        id
    }

    /// Id of the attempt issued most recently.
    pub(crate) fn last(&self) -> Option<RequestId> {
        self.last
    }
}
