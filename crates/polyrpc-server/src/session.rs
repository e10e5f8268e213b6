//! One session per accepted connection.
//!
//! ```text
//!   Created ──► Running ──► Stopping ──► Stopped
//!                 │ ▲
//!                 ▼ │
//!   receive ─► route ─► resolve ─► dispatch ─► send
//! ```
//!
//! Exactly one request is in flight: request N+1 is not read before response
//! N has been written and flushed. Every await in the loop is raced against
//! the session's stop flag and the host's shutdown signal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use polyrpc_core::{
    Address, AnyMessage, Dispatcher, Formatter, HashedWheelTimer, ImplementorProvider,
    ImplementorRegistry, MessageMetadata, Router, Timeout,
};
use polyrpc_protocol::{Channel, Messenger, ProtocolError, TransportSettings};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::ServerResult;
use crate::signals::ShutdownSignal;

/// Process-wide session identifier.
pub type SessionId = u64;

/// Read-only collaborators shared by every session of a host.
pub(crate) struct SharedComponents<F> {
    pub metadata: MessageMetadata<F>,
    pub router: Router<F>,
    pub dispatcher: Dispatcher,
    pub registry: Arc<ImplementorRegistry>,
    pub timer: Arc<HashedWheelTimer>,
    pub settings: TransportSettings,
    pub initial_buffer_capacity: usize,
    pub max_message_size: usize,
}

/// Snapshot of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub session_id: SessionId,
    #[serde(serialize_with = "display")]
    pub local: Address,
    #[serde(serialize_with = "display")]
    pub remote: Address,
    pub connected_at: DateTime<Utc>,
}

fn display<S: serde::Serializer>(address: &Address, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(address)
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The host is shutting down.
    Cancelled,
    /// Disposed through its handle.
    Stopped,
    /// The client closed the connection.
    PeerClosed,
    /// No request arrived within the idle timeout.
    IdleTimeout,
    /// A request did not arrive completely in time.
    ReceiveTimeout,
    /// A response could not be written in time.
    SendTimeout,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
            Self::PeerClosed => "peer closed",
            Self::IdleTimeout => "idle timeout",
            Self::ReceiveTimeout => "receive timeout",
            Self::SendTimeout => "send timeout",
        })
    }
}

struct HandleInner {
    id: SessionId,
    stop: watch::Sender<Option<StopReason>>,
    done: watch::Receiver<bool>,
    info: parking_lot::Mutex<Option<ClientInfo>>,
    dispose: tokio::sync::Mutex<()>,
}

/// Control handle of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("done", &self.is_done())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Asks the session to stop. Only the first reason is kept.
    ///
    /// Synchronous so that timer tasks can call it from the wheel's thread.
    pub fn request_stop(&self, reason: StopReason) {
        self.inner.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Client addresses, once the connection is open.
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.inner.info.lock().clone()
    }

    /// Whether the session loop has exited and its resources are released.
    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Stops the session and waits until it has fully torn down.
    ///
    /// Idempotent; concurrent callers all return once teardown completed.
    pub async fn dispose(&self) {
        let _guard = self.inner.dispose.lock().await;
        self.request_stop(StopReason::Stopped);
        let mut done = self.inner.done.clone();
        // The sender is dropped only after teardown.
        let _ = done.wait_for(|done| *done).await;
    }
}

/// Outcome of one guarded step of the loop.
enum Step<T> {
    Continue(T),
    Stop(StopReason),
}

/// The per-connection processor.
pub(crate) struct Session<F> {
    id: SessionId,
    channel: Box<dyn Channel>,
    messenger: Messenger<F>,
    provider: ImplementorProvider,
    shared: Arc<SharedComponents<F>>,
    handle: SessionHandle,
    stop: watch::Receiver<Option<StopReason>>,
    shutdown: ShutdownSignal,
    pending_timeout: Option<Timeout>,
    done: watch::Sender<bool>,
}

impl<F: Formatter> Session<F> {
    pub(crate) fn new(
        id: SessionId,
        channel: Box<dyn Channel>,
        shared: Arc<SharedComponents<F>>,
        shutdown: ShutdownSignal,
    ) -> (Self, SessionHandle) {
        let (stop_tx, stop_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = SessionHandle {
            inner: Arc::new(HandleInner {
                id,
                stop: stop_tx,
                done: done_rx,
                info: parking_lot::Mutex::new(None),
                dispose: tokio::sync::Mutex::new(()),
            }),
        };
        let session = Self {
            id,
            channel,
            messenger: Messenger::new(shared.initial_buffer_capacity, shared.max_message_size),
            provider: ImplementorProvider::new(Arc::clone(&shared.registry)),
            shared,
            handle: handle.clone(),
            stop: stop_rx,
            shutdown,
            pending_timeout: None,
            done: done_tx,
        };
        (session, handle)
    }

    /// Runs the session to completion, then tears it down.
    pub(crate) async fn run(mut self) -> StopReason {
        let span = info_span!("session", session_id = self.id);
        async move {
            let reason = match self.process().await {
                Ok(reason) => reason,
                Err(e) if e.is_connection_closed() => {
                    debug!(error = %e, "Connection closed");
                    StopReason::PeerClosed
                }
                Err(e) => {
                    warn!(error = %e, "Session failed");
                    StopReason::Stopped
                }
            };
            self.teardown().await;
            info!(%reason, "Session stopped");
            reason
        }
        .instrument(span)
        .await
    }

    async fn process(&mut self) -> ServerResult<StopReason> {
        self.channel.open().await?;
        let connection = self.channel.connection().clone();
        let local = connection.local_address().cloned().map_err(ProtocolError::from)?;
        let remote = connection.remote_address().cloned().map_err(ProtocolError::from)?;
        info!(%remote, "Session started");
        *self.handle.inner.info.lock() = Some(ClientInfo {
            session_id: self.id,
            local,
            remote,
            connected_at: Utc::now(),
        });
        self.provider.session_started(&connection);

        loop {
            let (message_id, request) = match self.receive().await? {
                Step::Continue(received) => received,
                Step::Stop(reason) => return Ok(reason),
            };
            let response = match self.handle_request(message_id, request).await? {
                Step::Continue(response) => response,
                Step::Stop(reason) => return Ok(reason),
            };
            if let Step::Stop(reason) = self.send(response).await? {
                return Ok(reason);
            }
        }
    }

    /// Waits for the next request.
    ///
    /// The idle timeout covers the wait for the first byte of an envelope;
    /// the receive timeout covers everything after it.
    async fn receive(&mut self) -> ServerResult<Step<(u16, AnyMessage)>> {
        let idle = self.shared.settings.idle_timeout;
        let waited = {
            let wait = self.messenger.wait_for_envelope(self.channel.as_mut());
            guarded(&mut self.stop, &mut self.shutdown, with_idle(idle, wait)).await
        };
        match waited {
            Step::Continue(Some(waited)) => waited?,
            Step::Continue(None) => return Ok(Step::Stop(StopReason::IdleTimeout)),
            Step::Stop(reason) => return Ok(Step::Stop(reason)),
        }

        self.arm(self.shared.settings.client_receive_timeout, StopReason::ReceiveTimeout)?;
        let received = self
            .messenger
            .receive(self.channel.as_mut(), &self.shared.metadata);
        let received = guarded(&mut self.stop, &mut self.shutdown, received).await;
        self.disarm();

        Ok(match received {
            Step::Continue(received) => Step::Continue(received?),
            Step::Stop(reason) => Step::Stop(reason),
        })
    }

    async fn handle_request(
        &mut self,
        message_id: u16,
        request: AnyMessage,
    ) -> ServerResult<Step<AnyMessage>> {
        let shared = Arc::clone(&self.shared);
        let operation = shared.router.choose(message_id)?;
        debug!(message_id, operation = operation.name, "Routing request");

        self.provider.operation_started()?;
        let implementor = self.provider.resolve(&operation.contract)?;
        let dispatch = shared.dispatcher.dispatch(implementor, request, operation);
        let result = guarded(&mut self.stop, &mut self.shutdown, dispatch).await;
        self.provider.operation_finished()?;

        Ok(match result {
            Step::Continue(response) => Step::Continue(response?),
            Step::Stop(reason) => Step::Stop(reason),
        })
    }

    async fn send(&mut self, response: AnyMessage) -> ServerResult<Step<()>> {
        self.arm(self.shared.settings.client_send_timeout, StopReason::SendTimeout)?;
        let send = self
            .messenger
            .send(self.channel.as_mut(), &self.shared.metadata, response.as_ref());
        let sent = guarded(&mut self.stop, &mut self.shutdown, send).await;
        self.disarm();

        Ok(match sent {
            Step::Continue(result) => {
                result?;
                Step::Continue(())
            }
            Step::Stop(reason) => Step::Stop(reason),
        })
    }

    /// Schedules a wheel timeout that stops this session when it fires.
    fn arm(&mut self, delay: Option<Duration>, reason: StopReason) -> ServerResult<()> {
        let Some(delay) = delay else {
            return Ok(());
        };
        let handle = self.handle.clone();
        let timeout = self.shared.timer.new_timeout(
            move |_| {
                warn!(session_id = handle.id(), %reason, "Session timed out");
                handle.request_stop(reason);
            },
            delay,
        )?;
        self.pending_timeout = Some(timeout);
        Ok(())
    }

    fn disarm(&mut self) {
        if let Some(timeout) = self.pending_timeout.take() {
            timeout.cancel();
        }
    }

    async fn teardown(&mut self) {
        self.disarm();
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Channel close failed");
        }
        self.messenger.dispose();
        self.provider.dispose();
        self.done.send_replace(true);
    }
}

/// Runs `fut` unless the session is asked to stop or the host shuts down.
///
/// Losing the race drops `fut`; the caller then closes the channel.
async fn guarded<T>(
    stop: &mut watch::Receiver<Option<StopReason>>,
    shutdown: &mut ShutdownSignal,
    fut: impl Future<Output = T>,
) -> Step<T> {
    tokio::select! {
        biased;
        stopped = stop.wait_for(Option::is_some) => {
            let reason = stopped.ok().and_then(|reason| *reason);
            Step::Stop(reason.unwrap_or(StopReason::Stopped))
        }
        _ = shutdown.triggered() => Step::Stop(StopReason::Cancelled),
        value = fut => Step::Continue(value),
    }
}

/// `None` when the idle timeout elapsed first.
async fn with_idle<T>(idle: Option<Duration>, fut: impl Future<Output = T>) -> Option<T> {
    match idle {
        Some(idle) => tokio::time::timeout(idle, fut).await.ok(),
        None => Some(fut.await),
    }
}
