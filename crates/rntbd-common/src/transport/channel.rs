//! A single multiplexed RNTBD connection.
//!
//! Many requests share one TCP connection. Responses are matched to requests
//! by activity id, never by arrival order. Each channel owns a reader task
//! and a writer task; closing either one fails every pending request with
//! the same cause.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::RntbdCodec;
use super::timer::{RequestTimer, TimeoutHandle};
use crate::protocol::error::{Diagnostics, Result, RntbdError};
use crate::protocol::Frame;

static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Connection settings for a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Why a channel stopped. Every pending request receives an error built
/// from the same cause.
#[derive(Debug, Clone)]
enum CloseCause {
    Malformed(String),
    Closed(String),
}

impl CloseCause {
    fn to_error(&self) -> RntbdError {
        match self {
            CloseCause::Malformed(reason) => RntbdError::MalformedFrame(reason.clone()),
            CloseCause::Closed(reason) => RntbdError::ChannelClosed(reason.clone()),
        }
    }
}

struct InFlightRequest {
    submitted: Instant,
    timeout: TimeoutHandle,
    completion: oneshot::Sender<Result<Frame>>,
}

struct Shared {
    id: u64,
    address: String,
    state: AtomicU8,
    pending: DashMap<Uuid, InFlightRequest>,
    cause: Mutex<Option<CloseCause>>,
    shutdown: CancellationToken,
    timeout_ms: u64,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn complete(&self, activity_id: Uuid, result: Result<Frame>) {
        match self.pending.remove(&activity_id) {
            Some((_, request)) => {
                request.timeout.cancel();
                tracing::trace!(
                    channel = self.id,
                    %activity_id,
                    elapsed_us = request.submitted.elapsed().as_micros() as u64,
                    "request completed"
                );
                if request.completion.send(result).is_err() {
                    tracing::debug!(channel = self.id, %activity_id, "discarding completion for cancelled request");
                }
            }
            None => {
                tracing::debug!(
                    channel = self.id,
                    %activity_id,
                    "no pending request for activity id, discarding"
                );
            }
        }
    }

    fn expire(&self, activity_id: Uuid) {
        if let Some((_, request)) = self.pending.remove(&activity_id) {
            tracing::debug!(channel = self.id, address = %self.address, %activity_id, "request timed out");
            let error = RntbdError::Timeout {
                timeout_ms: self.timeout_ms,
                diagnostics: Diagnostics::for_address(self.address.clone()),
            };
            let _ = request.completion.send(Err(error));
        }
    }

    /// Moves to Closed and fails everything still pending. The first cause
    /// recorded wins.
    fn fail_all(&self, cause: CloseCause) {
        let cause = {
            let mut slot = self.cause.lock();
            slot.get_or_insert(cause).clone()
        };
        self.set_state(ChannelState::Closed);
        self.shutdown.cancel();

        let keys: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        if !keys.is_empty() {
            tracing::debug!(channel = self.id, address = %self.address, pending = keys.len(), ?cause, "failing pending requests");
        }
        for key in keys {
            if let Some((_, request)) = self.pending.remove(&key) {
                request.timeout.cancel();
                let _ = request.completion.send(Err(cause.to_error()));
            }
        }
    }
}

/// Resolves to the response frame, or to the error that completed the
/// request. Dropping it does not unregister the request; the eventual
/// completion is discarded.
#[derive(Debug)]
pub struct ResponseFuture {
    activity_id: Uuid,
    receiver: oneshot::Receiver<Result<Frame>>,
}

impl ResponseFuture {
    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RntbdError::ChannelClosed(
                "completion dropped".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One multiplexed TCP connection to a replica.
pub struct Channel {
    shared: Arc<Shared>,
    writer: mpsc::UnboundedSender<Bytes>,
    timer: Arc<RequestTimer>,
}

impl Channel {
    /// Opens a connection and starts its reader and writer tasks.
    pub async fn connect(address: &str, config: &ChannelConfig, timer: Arc<RequestTimer>) -> Result<Self> {
        let shared = Arc::new(Shared {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            address: address.to_string(),
            state: AtomicU8::new(ChannelState::Connecting as u8),
            pending: DashMap::new(),
            cause: Mutex::new(None),
            shutdown: CancellationToken::new(),
            timeout_ms: timer.request_timeout().as_millis() as u64,
        });

        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                shared.set_state(ChannelState::Closed);
                return Err(RntbdError::Connection(format!("Failed to connect to {}: {}", address, e)));
            }
            Err(_) => {
                shared.set_state(ChannelState::Closed);
                return Err(RntbdError::Connection(format!(
                    "Timed out connecting to {} after {}ms",
                    address,
                    config.connect_timeout.as_millis()
                )));
            }
        };
        stream
            .set_nodelay(config.tcp_nodelay)
            .map_err(|e| RntbdError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let (read_half, write_half) = stream.into_split();
        let (writer, queue) = mpsc::unbounded_channel();

        tokio::spawn(reader_loop(shared.clone(), FramedRead::new(read_half, RntbdCodec::new())));
        tokio::spawn(writer_loop(
            shared.clone(),
            FramedWrite::new(write_half, BytesCodec::new()),
            queue,
        ));

        shared.set_state(ChannelState::Open);
        tracing::debug!(channel = shared.id, %address, "channel open");

        Ok(Channel {
            shared,
            writer,
            timer,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Number of requests registered and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Registers `frame`, arms its expiration and queues it for writing.
    ///
    /// The frame is encoded before it is registered, so a frame that cannot
    /// be encoded fails alone and the connection stays open.
    pub fn dispatch(&self, frame: Frame) -> Result<ResponseFuture> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let mut encoded = BytesMut::new();
        if let Err(e) = frame.encode(&mut encoded) {
            tracing::debug!(channel = self.shared.id, activity_id = %frame.activity_id(), error = %e, "rejecting unencodable request");
            return Err(e);
        }

        let activity_id = frame.activity_id();
        let (completion, receiver) = oneshot::channel();

        match self.shared.pending.entry(activity_id) {
            Entry::Occupied(_) => {
                crate::report_issue!(
                    self,
                    "duplicate activity id {} dispatched while still in flight",
                    activity_id
                );
                return Err(RntbdError::DuplicateActivityId(activity_id));
            }
            Entry::Vacant(slot) => {
                let weak: Weak<Shared> = Arc::downgrade(&self.shared);
                let timeout = self.timer.new_timeout(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.expire(activity_id);
                    }
                })?;
                slot.insert(InFlightRequest {
                    submitted: Instant::now(),
                    timeout,
                    completion,
                });
            }
        }

        // fail_all may have swept the map between the state check and insert
        if !self.is_open() {
            self.shared.complete(activity_id, Err(self.closed_error()));
        } else if self.writer.send(encoded.freeze()).is_err() {
            self.shared
                .complete(activity_id, Err(RntbdError::ChannelClosed("writer stopped".to_string())));
        }

        Ok(ResponseFuture {
            activity_id,
            receiver,
        })
    }

    /// Dispatches `frame` and waits for its completion.
    pub async fn send(&self, frame: Frame) -> Result<Frame> {
        self.dispatch(frame)?.await
    }

    /// Closes the connection, failing all pending requests.
    pub fn close(&self) {
        if self.state() == ChannelState::Closed {
            return;
        }
        self.shared.set_state(ChannelState::Closing);
        self.shared
            .fail_all(CloseCause::Closed("channel closed by client".to_string()));
        tracing::debug!(channel = self.shared.id, address = %self.shared.address, "channel closed");
    }

    fn closed_error(&self) -> RntbdError {
        match self.shared.cause.lock().as_ref() {
            Some(cause) => cause.to_error(),
            None => RntbdError::ChannelClosed(format!("channel to {} is not open", self.shared.address)),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel#{}({})", self.shared.id, self.shared.address)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn reader_loop(shared: Arc<Shared>, mut reader: FramedRead<OwnedReadHalf, RntbdCodec>) {
    let cause = loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) => shared.complete(frame.activity_id(), Ok(frame)),
            Some(Err(e)) if e.is_fatal() => {
                tracing::warn!(channel = shared.id, address = %shared.address, error = %e, "closing channel on malformed frame");
                break CloseCause::Malformed(e.to_string());
            }
            Some(Err(e)) => {
                tracing::debug!(channel = shared.id, address = %shared.address, error = %e, "read error");
                break CloseCause::Closed(e.to_string());
            }
            None => {
                tracing::debug!(channel = shared.id, address = %shared.address, "connection closed by peer");
                break CloseCause::Closed("connection closed by peer".to_string());
            }
        }
    };
    shared.fail_all(cause);
}

async fn writer_loop(
    shared: Arc<Shared>,
    mut writer: FramedWrite<OwnedWriteHalf, BytesCodec>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // batch whatever else is queued into one flush
        let mut result = writer.feed(frame).await;
        while result.is_ok() {
            match queue.try_recv() {
                Ok(next) => result = writer.feed(next).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = SinkExt::<Bytes>::flush(&mut writer).await;
        }

        if let Err(e) = result {
            tracing::debug!(channel = shared.id, address = %shared.address, error = %e, "write error");
            shared.fail_all(CloseCause::Closed(format!("write failed: {}", e)));
            return;
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut writer).await;
}
