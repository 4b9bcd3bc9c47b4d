//! Channels and round-robin channel selection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::rpc::SpannerRpc;

/// One logical connection to the service.
#[derive(Clone)]
pub struct Channel {
    id: u32,
    rpc: Arc<dyn SpannerRpc>,
}

impl Channel {
    /// Create a channel.
    pub fn new(id: u32, rpc: Arc<dyn SpannerRpc>) -> Self {
        Self { id, rpc }
    }

    /// Channel index, as stamped into request ids.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The stub for this channel.
    #[must_use]
    pub fn rpc(&self) -> &Arc<dyn SpannerRpc> {
        &self.rpc
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// A fixed set of channels.
pub struct ChannelPool {
    channels: Vec<Channel>,
    next: AtomicUsize,
}

impl ChannelPool {
    /// Create a pool from stubs; channel ids are their positions.
    ///
    /// Returns `None` if `stubs` is empty.
    pub fn new(stubs: Vec<Arc<dyn SpannerRpc>>) -> Option<Self> {
        if stubs.is_empty() {
            return None;
        }
        let channels = stubs
            .into_iter()
            .enumerate()
            .map(|(i, rpc)| Channel::new(i as u32, rpc))
            .collect();
        Some(Self {
            channels,
            next: AtomicUsize::new(0),
        })
    }

    /// The next channel in round-robin order.
    pub fn next(&self) -> &Channel {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        &self.channels[i % self.channels.len()]
    }

    /// The channel with the given id, wrapping out-of-range ids.
    #[must_use]
    pub fn get(&self, id: u32) -> &Channel {
        &self.channels[id as usize % self.channels.len()]
    }

    /// All channels.
    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always false; a pool has at least one channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPool")
            .field("channels", &self.channels.len())
            .finish()
    }
}
