//! Session management and RPC invocation.
//!
//! [`SessionClient`] owns the channels of a client. Every RPC goes through
//! [`SessionClient::invoke`], which stamps the per-call headers and a fresh
//! request id on each attempt and retries transient failures. It is also the
//! [`SessionFactory`] handed to the session pool.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use spanner_protocol::{
    API_CLIENT_HEADER, BatchCreateSessionsRequest, CreateSessionRequest, DeleteSessionRequest,
    ErrorClass, RESOURCE_PREFIX_HEADER, ROUTE_TO_LEADER_HEADER, RequestId, Status, classify,
};
use spanner_session_pool::{PoolError, Session, SessionFactory, SessionKind};
use spanner_transport::{CallMetadata, Channel, ChannelPool, Context, SpannerRpc};
use tracing::{debug, warn};

use crate::config::{ClientConfig, RpcRetryPolicy};
use crate::error::{Error, into_pool_error};
use crate::request_id::{Attempts, RequestIdGenerator};

const API_CLIENT: &str = concat!("gl-rust gccl/", env!("CARGO_PKG_VERSION"));

/// Issues RPCs for one client.
#[derive(Debug)]
pub struct SessionClient {
    database: String,
    channels: ChannelPool,
    ids: RequestIdGenerator,
    retry: RpcRetryPolicy,
    route_to_leader: bool,
    api_client: String,
    labels: BTreeMap<String, String>,
    database_role: Option<String>,
}

impl SessionClient {
    /// Create a session client over `channels`.
    pub fn new(config: &ClientConfig, channels: ChannelPool) -> Self {
        let client_id = config.client_id_allocator.allocate(&config.database);
        let api_client = match &config.user_agent {
            Some(agent) => format!("{API_CLIENT} {agent}"),
            None => API_CLIENT.to_string(),
        };
        Self {
            database: config.database.clone(),
            ids: RequestIdGenerator::new(config.process_id, client_id, channels.len()),
            channels,
            retry: config.rpc_retry.clone(),
            route_to_leader: !config.disable_route_to_leader,
            api_client,
            labels: config.session_labels.clone(),
            database_role: config.database_role.clone(),
        }
    }

    /// Database path.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The channels of this client.
    #[must_use]
    pub fn channels(&self) -> &ChannelPool {
        &self.channels
    }

    /// The request id generator.
    #[must_use]
    pub fn request_ids(&self) -> &RequestIdGenerator {
        &self.ids
    }

    /// The channel with the given id.
    pub(crate) fn channel(&self, id: u32) -> &Channel {
        self.channels.get(id)
    }

    /// Headers sent with every call, without the request id.
    pub(crate) fn metadata(&self, leader: bool) -> CallMetadata {
        let mut md = CallMetadata::new();
        md.insert(API_CLIENT_HEADER, self.api_client.as_str());
        md.insert(RESOURCE_PREFIX_HEADER, self.database.as_str());
        if leader && self.route_to_leader {
            md.insert(ROUTE_TO_LEADER_HEADER, "true");
        }
        md
    }

    /// Run one logical operation on `channel_id`.
    ///
    /// `call` is invoked once per attempt with the channel's stub and the
    /// headers for that attempt. Transient failures are retried up to the
    /// configured number of attempts; every attempt carries the same request
    /// number and a higher rpc number.
    pub(crate) async fn invoke<T, F, Fut>(
        &self,
        ctx: &Context,
        channel_id: u32,
        leader: bool,
        call: F,
    ) -> Result<T, Error>
    where
        F: FnMut(Arc<dyn SpannerRpc>, CallMetadata) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        self.invoke_with_id(ctx, channel_id, leader, call)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`invoke`](Self::invoke), also returning the id of the attempt
    /// that succeeded.
    pub(crate) async fn invoke_with_id<T, F, Fut>(
        &self,
        ctx: &Context,
        channel_id: u32,
        leader: bool,
        mut call: F,
    ) -> Result<(T, RequestId), Error>
    where
        F: FnMut(Arc<dyn SpannerRpc>, CallMetadata) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let rpc = Arc::clone(self.channel(channel_id).rpc());
        let mut attempts = Attempts::new(self.ids.next(channel_id));
        let mut retries = 0;
        loop {
            let id = attempts.next();
            let mut md = self.metadata(leader);
            md.set_request_id(id);

            let status = match ctx.run(call(Arc::clone(&rpc), md)).await {
                Ok(Ok(value)) => return Ok((value, id)),
                Ok(Err(status)) => status,
                Err(e) => return Err(Error::context(e, Some(id))),
            };

            if classify(&status) != ErrorClass::Transient || id.rpc_number >= self.retry.max_attempts {
                return Err(Error::rpc(status, Some(id)));
            }
            retries += 1;
            let delay = self.retry.backoff.delay_for_attempt(retries);
            debug!(
                request_id = %id,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %status,
                "retrying rpc"
            );
            ctx.sleep(delay)
                .await
                .map_err(|e| Error::context(e, Some(id)))?;
        }
    }

    /// Create one session on the next channel.
    pub async fn create_session(&self, ctx: &Context, kind: SessionKind) -> Result<Session, Error> {
        let channel_id = self.channels.next().id();
        let request = CreateSessionRequest {
            database: self.database.clone(),
            labels: self.labels.clone(),
            creator_role: self.database_role.clone(),
            multiplexed: kind == SessionKind::Multiplexed,
        };
        let info = self
            .invoke(ctx, channel_id, true, |rpc, md| {
                let request = request.clone();
                async move { rpc.create_session(request, md).await }
            })
            .await?;
        debug!(session_id = %info.name, channel_id, ?kind, "created session");
        Ok(Session::new(info.name, channel_id, kind))
    }

    /// Create up to `count` sessions on one channel, re-issuing short
    /// batches for the remainder.
    async fn batch_create_on(
        &self,
        ctx: &Context,
        channel_id: u32,
        count: u32,
        out: &mut Vec<Session>,
    ) -> Result<(), Error> {
        let mut remaining = count;
        while remaining > 0 {
            let request = BatchCreateSessionsRequest {
                database: self.database.clone(),
                session_count: remaining,
                labels: self.labels.clone(),
                creator_role: self.database_role.clone(),
            };
            let resp = self
                .invoke(ctx, channel_id, true, |rpc, md| {
                    let request = request.clone();
                    async move { rpc.batch_create_sessions(request, md).await }
                })
                .await?;
            if resp.sessions.is_empty() {
                break;
            }
            let created = u32::try_from(resp.sessions.len()).unwrap_or(u32::MAX);
            remaining = remaining.saturating_sub(created);
            out.extend(
                resp.sessions
                    .into_iter()
                    .map(|info| Session::new(info.name, channel_id, SessionKind::Regular)),
            );
        }
        Ok(())
    }

    /// Delete a session.
    pub async fn delete_session(&self, ctx: &Context, session: &Session) -> Result<(), Error> {
        let request = DeleteSessionRequest {
            name: session.name().to_string(),
        };
        self.invoke(ctx, session.channel_id(), true, |rpc, md| {
            let request = request.clone();
            async move { rpc.delete_session(request, md).await }
        })
        .await
    }

    /// Split `count` sessions evenly over the channels, remainder first.
    fn distribute(&self, count: u32) -> Vec<(u32, u32)> {
        let channels = u32::try_from(self.channels.len()).unwrap_or(u32::MAX).max(1);
        let per_channel = count / channels;
        let remainder = count % channels;
        self.channels
            .channels()
            .iter()
            .enumerate()
            .map(|(i, channel)| {
                let extra = u32::from((i as u32) < remainder);
                (channel.id(), per_channel + extra)
            })
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

#[async_trait]
impl SessionFactory for SessionClient {
    async fn batch_create(&self, ctx: &Context, count: u32) -> Result<Vec<Session>, PoolError> {
        let mut created = Vec::with_capacity(count as usize);
        let mut first_error = None;
        for (channel_id, n) in self.distribute(count) {
            if let Err(e) = self.batch_create_on(ctx, channel_id, n, &mut created).await {
                warn!(channel_id, requested = n, error = %e, "batch session creation failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) if created.is_empty() => Err(into_pool_error(e, true)),
            _ => Ok(created),
        }
    }

    async fn create_multiplexed(&self, ctx: &Context) -> Result<Session, PoolError> {
        self.create_session(ctx, SessionKind::Multiplexed)
            .await
            .map_err(|e| into_pool_error(e, true))
    }

    async fn delete(&self, ctx: &Context, session: &Session) -> Result<(), PoolError> {
        self.delete_session(ctx, session)
            .await
            .map_err(|e| into_pool_error(e, false))
    }
}
