//! Resumable streaming results.
//!
//! A [`ResumableStreamDecoder`] wraps one streaming RPC. Partial results
//! are held in a [`PendingResultQueue`] until the server confirms them with
//! a resume token; when the stream breaks with a transient error, the call
//! is re-issued from the last token and the unconfirmed results are dropped,
//! so the consumer sees every result exactly once.
//!
//! ## States
//!
//! ```text
//!                 open ok                  token / end
//! Unconnected ──────────────► QueueingRetryable ◄─────────────┐
//!     ▲   │                     │        │                    │
//!     │   │ fatal               │ over   │ transient error    │
//!     │   ▼                     │ budget │ (re-issue)         │
//!     │ Aborted ◄───── error ── QueueingUnretryable ──────────┘
//!     └──────────────────────────────────┘        token
//!
//! end of stream from either queueing state ──► Finished
//! ```
//!
//! All transitions go through [`transition`], which is pure and tested on
//! its own.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use spanner_protocol::{ErrorClass, PartialResultSet, RequestId, Status, classify};
use spanner_transport::{Backoff, Context, ContextError, PartialResultStream};
use tracing::{debug, trace};

use crate::error::Error;

/// Where a decoder's stream comes from.
///
/// Implementations re-issue the same request with a new resume token on
/// every call to [`open`](Self::open), stamping each attempt with the next
/// request id of the operation.
#[async_trait]
pub trait StreamSource: Send {
    /// Issue (or re-issue) the streaming call, resuming after `resume_token`.
    async fn open(&mut self, resume_token: Bytes) -> Result<PartialResultStream, Status>;

    /// Id of the attempt issued most recently.
    fn request_id(&self) -> Option<RequestId>;

    /// Move the call to a new session after the current one was lost.
    ///
    /// Returns `Ok(true)` if the call may be replayed from the start. Called
    /// only before any result has been delivered.
    async fn replace_session(&mut self, _ctx: &Context) -> Result<bool, Error> {
        Ok(false)
    }

    /// The decoder is done with the source.
    fn release(&mut self) {}
}

#[async_trait]
impl<S: StreamSource + ?Sized> StreamSource for Box<S> {
    async fn open(&mut self, resume_token: Bytes) -> Result<PartialResultStream, Status> {
        (**self).open(resume_token).await
    }

    fn request_id(&self) -> Option<RequestId> {
        (**self).request_id()
    }

    async fn replace_session(&mut self, ctx: &Context) -> Result<bool, Error> {
        (**self).replace_session(ctx).await
    }

    fn release(&mut self) {
        (**self).release();
    }
}

/// Decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderState {
    /// No call in flight.
    Unconnected,
    /// Buffering results; a transient failure is retried from the last token.
    QueueingRetryable,
    /// The buffer outgrew its budget; results are delivered without waiting
    /// for a token and a failure is fatal.
    QueueingUnretryable,
    /// Failed.
    Aborted,
    /// The stream ended.
    Finished,
}

impl DecoderState {
    /// Whether no further results can arrive.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Finished)
    }
}

impl fmt::Display for DecoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unConnected",
            Self::QueueingRetryable => "queueingRetryable",
            Self::QueueingUnretryable => "queueingUnretryable",
            Self::Aborted => "aborted",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderEvent {
    /// The call was issued.
    Connected,
    /// A partial result arrived.
    Received {
        /// It carried a resume token.
        resume_token: bool,
        /// Buffered bytes exceed the budget.
        over_budget: bool,
    },
    /// The call or stream failed.
    Failed {
        /// The failure may be retried by re-issuing the call.
        retryable: bool,
    },
    /// The server closed the stream.
    EndOfStream,
    /// The consumer stopped the decoder.
    Stopped,
}

/// The transition function.
#[must_use]
pub fn transition(state: DecoderState, event: DecoderEvent) -> DecoderState {
    use DecoderEvent as E;
    use DecoderState as S;

    match (state, event) {
        (S::Aborted | S::Finished, _) => state,
        (_, E::Stopped) => S::Finished,

        (S::Unconnected, E::Connected) => S::QueueingRetryable,
        (S::Unconnected, E::Failed { retryable: true }) => S::Unconnected,
        (S::Unconnected, E::Failed { retryable: false }) => S::Aborted,
        (S::Unconnected, E::Received { .. } | E::EndOfStream) => S::Aborted,

        (S::QueueingRetryable | S::QueueingUnretryable, E::Received { resume_token: true, .. }) => {
            S::QueueingRetryable
        }
        (S::QueueingRetryable, E::Received { over_budget: true, .. }) => S::QueueingUnretryable,
        (S::QueueingRetryable, E::Received { .. }) => S::QueueingRetryable,
        (S::QueueingUnretryable, E::Received { .. }) => S::QueueingUnretryable,

        (S::QueueingRetryable, E::Failed { retryable: true }) => S::Unconnected,
        (S::QueueingRetryable | S::QueueingUnretryable, E::Failed { .. }) => S::Aborted,

        (S::QueueingRetryable | S::QueueingUnretryable, E::EndOfStream) => S::Finished,
        (S::QueueingRetryable | S::QueueingUnretryable, E::Connected) => state,
    }
}

/// Partial results received since the last resume token.
#[derive(Debug, Default)]
pub struct PendingResultQueue {
    items: VecDeque<PartialResultSet>,
    bytes: usize,
}

impl PendingResultQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result.
    pub fn push(&mut self, item: PartialResultSet) {
        self.bytes += item.encoded_len();
        self.items.push_back(item);
    }

    /// Take every buffered result, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = PartialResultSet> + '_ {
        self.bytes = 0;
        self.items.drain(..)
    }

    /// Drop every buffered result.
    pub fn clear(&mut self) {
        self.items.clear();
        self.bytes = 0;
    }

    /// Buffered bytes.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of buffered results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Decoder settings.
#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions {
    /// Delay between re-issues.
    pub backoff: Backoff,
    /// Bytes that may be buffered without a resume token.
    pub max_bytes_between_resume_tokens: usize,
}

/// Delivers the results of a streaming call exactly once across transient
/// failures.
pub struct ResumableStreamDecoder<S> {
    source: S,
    options: DecoderOptions,
    state: DecoderState,
    stream: Option<PartialResultStream>,
    pending: PendingResultQueue,
    ready: VecDeque<PartialResultSet>,
    current: Option<PartialResultSet>,
    resume_token: Bytes,
    retries: u32,
    delivered: bool,
    error: Option<Error>,
    stopped: bool,
}

impl<S: StreamSource> ResumableStreamDecoder<S> {
    /// Create a decoder; the call is issued on the first [`next`](Self::next).
    pub fn new(source: S, options: DecoderOptions) -> Self {
        Self {
            source,
            options,
            state: DecoderState::Unconnected,
            stream: None,
            pending: PendingResultQueue::new(),
            ready: VecDeque::new(),
            current: None,
            resume_token: Bytes::new(),
            retries: 0,
            delivered: false,
            error: None,
            stopped: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// The last resume token received.
    #[must_use]
    pub fn resume_token(&self) -> &Bytes {
        &self.resume_token
    }

    /// Advance to the next partial result.
    ///
    /// Returns `false` at the end of the stream or on error; check
    /// [`last_error`](Self::last_error) to tell them apart.
    pub async fn next(&mut self, ctx: &Context) -> bool {
        self.current = None;
        if self.stopped {
            self.error.get_or_insert(Error::AlreadyClosed);
            return false;
        }
        loop {
            if let Some(item) = self.ready.pop_front() {
                self.delivered = true;
                self.current = Some(item);
                return true;
            }
            match self.state {
                DecoderState::Aborted | DecoderState::Finished => {
                    self.source.release();
                    return false;
                }
                DecoderState::Unconnected => self.connect(ctx).await,
                DecoderState::QueueingRetryable | DecoderState::QueueingUnretryable => {
                    self.receive(ctx).await;
                }
            }
        }
    }

    /// The current partial result.
    #[must_use]
    pub fn get(&self) -> Option<&PartialResultSet> {
        self.current.as_ref()
    }

    /// Take ownership of the current partial result.
    pub fn take(&mut self) -> Option<PartialResultSet> {
        self.current.take()
    }

    /// The error that ended the stream, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub(crate) fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Stop the decoder, cancelling the call.
    ///
    /// Returns [`Error::AlreadyClosed`] if the decoder was already stopped.
    pub fn stop(&mut self) -> Result<(), Error> {
        if self.stopped {
            return Err(Error::AlreadyClosed);
        }
        self.stopped = true;
        self.stream = None;
        self.pending.clear();
        self.ready.clear();
        self.current = None;
        self.apply(DecoderEvent::Stopped);
        self.source.release();
        Ok(())
    }

    fn apply(&mut self, event: DecoderEvent) {
        let next = transition(self.state, event);
        if next != self.state {
            trace!(from = %self.state, to = %next, ?event, "stream decoder transition");
        }
        self.state = next;
    }

    async fn connect(&mut self, ctx: &Context) {
        let token = self.resume_token.clone();
        match ctx.run(self.source.open(token)).await {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.apply(DecoderEvent::Connected);
            }
            Ok(Err(status)) => self.fail(ctx, status).await,
            Err(e) => self.abort_context(e),
        }
    }

    async fn receive(&mut self, ctx: &Context) {
        let Some(stream) = self.stream.as_mut() else {
            self.state = DecoderState::Unconnected;
            return;
        };
        match ctx.run(stream.message()).await {
            Ok(Ok(Some(item))) => self.on_result(item),
            Ok(Ok(None)) => {
                self.stream = None;
                self.ready.extend(self.pending.drain());
                self.apply(DecoderEvent::EndOfStream);
            }
            Ok(Err(status)) => self.fail(ctx, status).await,
            Err(e) => self.abort_context(e),
        }
    }

    fn on_result(&mut self, item: PartialResultSet) {
        let resume_token = item.has_resume_token();
        if resume_token {
            self.resume_token = item.resume_token.clone();
            self.retries = 0;
        }
        self.pending.push(item);
        let over_budget = self.pending.bytes() > self.options.max_bytes_between_resume_tokens;
        self.apply(DecoderEvent::Received {
            resume_token,
            over_budget,
        });
        if resume_token || self.state == DecoderState::QueueingUnretryable {
            self.ready.extend(self.pending.drain());
        }
    }

    async fn fail(&mut self, ctx: &Context, status: Status) {
        self.stream = None;
        let request_id = self.source.request_id();
        let retryable = match classify(&status) {
            ErrorClass::Transient => self.state != DecoderState::QueueingUnretryable,
            ErrorClass::SessionInvalid if !self.delivered && self.resume_token.is_empty() => {
                match self.source.replace_session(ctx).await {
                    Ok(replaced) => replaced,
                    Err(e) => {
                        self.abort(e);
                        return;
                    }
                }
            }
            _ => false,
        };

        self.apply(DecoderEvent::Failed { retryable });
        if self.state != DecoderState::Unconnected {
            debug!(request_id = ?request_id, error = %status, "stream failed");
            self.abort(Error::rpc(status, request_id));
            return;
        }

        self.pending.clear();
        self.retries += 1;
        let delay = self.options.backoff.delay_for_attempt(self.retries);
        debug!(
            request_id = ?request_id,
            attempt = self.retries,
            delay_ms = delay.as_millis() as u64,
            error = %status,
            "re-issuing interrupted stream"
        );
        if let Err(e) = ctx.sleep(delay).await {
            self.abort_context(e);
        }
    }

    fn abort_context(&mut self, err: ContextError) {
        self.stream = None;
        let request_id = self.source.request_id();
        self.abort(Error::context(err, request_id));
    }

    fn abort(&mut self, err: Error) {
        self.pending.clear();
        self.state = DecoderState::Aborted;
        self.error = Some(err);
    }
}

impl<S> fmt::Debug for ResumableStreamDecoder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableStreamDecoder")
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("ready", &self.ready.len())
            .field("resume_token", &self.resume_token)
            .finish_non_exhaustive()
    }
}
