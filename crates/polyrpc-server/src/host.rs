//! The host: contract registration, the accept loop and session tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use polyrpc_core::{
    Contract, ContractInfo, Dispatcher, Formatter, HashedWheelTimer, ImplementorRegistry,
    JsonFormatter, MessageMetadata, Operation, Router, inspect,
};
use polyrpc_protocol::Endpoint;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::HostConfig;
use crate::error::{ServerError, ServerResult};
use crate::listener::{self, Listener};
use crate::session::{ClientInfo, Session, SessionHandle, SessionId, SharedComponents};
use crate::signals::ShutdownHandle;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type Sessions = Arc<Mutex<HashMap<SessionId, SessionHandle>>>;

struct Running {
    timer: Arc<HashedWheelTimer>,
    local_endpoint: Option<Endpoint>,
}

/// Serves registered contracts on one endpoint.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use polyrpc_core::{BoxError, Contract, Formatter, Message, OperationSet};
/// use polyrpc_protocol::Endpoint;
/// use polyrpc_server::{Host, HostConfig};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping;
/// impl Message for Ping { const NAME: &'static str = "demo.Ping"; }
///
/// struct Pinger;
/// impl Contract for Pinger {
///     const NAME: &'static str = "pinger";
///     fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>) {
///         ops.add("ping", |_: Arc<Self>, ping: Ping| async move { Ok::<_, BoxError>(ping) });
///     }
/// }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut host = Host::new(HostConfig::new(Endpoint::tcp("127.0.0.1", 10678)));
/// host.add_contract::<Pinger>()?.add_implementor(|| Pinger);
/// host.start().await?;
/// host.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Host<F: Formatter = JsonFormatter> {
    config: HostConfig,
    contracts: Vec<ContractInfo>,
    operations: Vec<Operation<F>>,
    registry: ImplementorRegistry,
    shutdown: ShutdownHandle,
    sessions: Sessions,
    running: Option<Running>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<Box<dyn Listener>>>>,
}

impl Host {
    /// Creates a host speaking JSON.
    pub fn new(config: HostConfig) -> Self {
        Self::with_formatter(config)
    }
}

impl<F: Formatter> Host<F> {
    /// Creates a host using formatter `F`.
    pub fn with_formatter(config: HostConfig) -> Self {
        Self {
            config,
            contracts: Vec::new(),
            operations: Vec::new(),
            registry: ImplementorRegistry::new(),
            shutdown: ShutdownHandle::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            running: None,
            accept_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Inspects contract `C` and queues its operations.
    ///
    /// Adding the same contract twice is a no-op.
    pub fn add_contract<C: Contract>(&mut self) -> ServerResult<&mut Self> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let info = ContractInfo::of::<C>();
        if self.contracts.contains(&info) {
            debug!(contract = C::NAME, "Contract already added");
            return Ok(self);
        }
        let operations = inspect::<C, F>()?;
        debug!(contract = C::NAME, operations = operations.len(), "Added contract");
        self.operations.extend(operations);
        self.contracts.push(info);
        Ok(self)
    }

    /// Registers the factory creating one `C` per request.
    pub fn add_implementor<C, G>(&mut self, factory: G) -> &mut Self
    where
        C: Contract,
        G: Fn() -> C + Send + Sync + 'static,
    {
        self.registry.register(factory);
        self
    }

    /// Binds the endpoint and starts accepting clients.
    pub async fn start(&mut self) -> ServerResult<()> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        if self.operations.is_empty() {
            return Err(ServerError::NoOperations);
        }
        if let Some(missing) = self.contracts.iter().find(|c| !self.registry.contains(c)) {
            return Err(ServerError::MissingImplementor {
                contract: missing.name,
            });
        }

        let mut metadata = MessageMetadata::new();
        metadata.build(&self.operations)?;
        let mut router = Router::new();
        router.build(&self.operations)?;
        let timer = Arc::new(HashedWheelTimer::new(self.config.timer_config())?);

        let mut listener = listener::for_endpoint(
            &self.config.endpoint,
            self.config.transport.clone(),
            self.config.cleanup_stale_socket,
        )?;
        listener.prepare_accepting().await?;
        let local_endpoint = listener.local_endpoint();

        let shared = Arc::new(SharedComponents {
            metadata,
            router,
            dispatcher: Dispatcher::new(),
            registry: Arc::new(self.registry.clone()),
            timer: Arc::clone(&timer),
            settings: self.config.transport.clone(),
            initial_buffer_capacity: self.config.initial_buffer_capacity,
            max_message_size: self.config.max_message_size,
        });
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections.max(1)));

        let endpoint = local_endpoint
            .as_ref()
            .unwrap_or(&self.config.endpoint)
            .to_string();
        let task = tokio::spawn(
            accept_loop(
                listener,
                shared,
                semaphore,
                Arc::clone(&self.sessions),
                self.shutdown.clone(),
            )
            .instrument(info_span!("host", %endpoint)),
        );
        *self.accept_task.get_mut() = Some(task);
        self.running = Some(Running {
            timer,
            local_endpoint,
        });

        info!(
            %endpoint,
            contracts = self.contracts.len(),
            operations = self.operations.len(),
            "Host started"
        );
        Ok(())
    }

    /// Stops accepting, disposes every session and releases the listener.
    ///
    /// Idempotent; concurrent callers wait for the first one to finish.
    pub async fn stop(&self) {
        let mut accept_task = self.accept_task.lock().await;
        let Some(task) = accept_task.take() else {
            return;
        };

        self.shutdown.trigger();
        let listener = match task.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(error = %e, "Accept loop panicked");
                None
            }
        };

        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        debug!(sessions = handles.len(), "Disposing sessions");
        join_all(handles.iter().map(SessionHandle::dispose)).await;
        drop(listener);

        if let Some(running) = &self.running {
            let timer = Arc::clone(&running.timer);
            match tokio::task::spawn_blocking(move || timer.stop()).await {
                Ok(Ok(unprocessed)) if !unprocessed.is_empty() => {
                    debug!(unprocessed = unprocessed.len(), "Dropped pending timeouts");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to stop timer"),
                Err(e) => warn!(error = %e, "Timer shutdown task failed"),
            }
        }
        info!("Host stopped");
    }

    /// Snapshot of the connected clients, ordered by session.
    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .sessions
            .lock()
            .values()
            .filter(|handle| !handle.is_done())
            .filter_map(SessionHandle::client_info)
            .collect();
        clients.sort_by_key(|client| client.session_id);
        clients
    }

    /// The bound endpoint; reports the actual port when bound to port 0.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.running.as_ref()?.local_endpoint.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some() && !self.shutdown.is_shutdown()
    }

    /// Handle that stops the accept loop and every session when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }
}

impl<F: Formatter> Drop for Host<F> {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn accept_loop<F: Formatter>(
    mut listener: Box<dyn Listener>,
    shared: Arc<SharedComponents<F>>,
    semaphore: Arc<Semaphore>,
    sessions: Sessions,
    shutdown: ShutdownHandle,
) -> Box<dyn Listener> {
    let mut signal = shutdown.wait();
    loop {
        let permit = tokio::select! {
            biased;
            _ = signal.triggered() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let channel = tokio::select! {
            biased;
            _ = signal.triggered() => break,
            accepted = listener.accept_client() => match accepted {
                Ok(channel) => channel,
                Err(ServerError::ListenerStopped) => {
                    info!("Listener stopped");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept client");
                    tokio::select! {
                        biased;
                        _ = signal.triggered() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                    }
                }
            },
        };

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (session, handle) = Session::new(id, channel, Arc::clone(&shared), shutdown.wait());
        sessions.lock().insert(id, handle);

        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let _permit = permit;
            session.run().await;
            sessions.lock().remove(&id);
        });
    }
    debug!("Accept loop exited");
    listener
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use futures_util::future::BoxFuture;
    use polyrpc_core::{AnyMessage, BoxError, Message, OperationSet, TimerConfig};
    use polyrpc_protocol::{Channel, Messenger, ProtocolError, StreamChannel, TransportSettings};
    use serde::{Deserialize, Serialize};
    use tokio::net::TcpStream;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        text: String,
    }

    impl Message for Ping {
        const NAME: &'static str = "tests.Ping";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        text: String,
    }

    impl Message for Pong {
        const NAME: &'static str = "tests.Pong";
    }

    struct Pinger;

    impl Contract for Pinger {
        const NAME: &'static str = "pinger";

        fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>) {
            ops.add("ping", |_: Arc<Self>, ping: Ping| async move {
                Ok::<_, BoxError>(Pong { text: ping.text })
            });
        }
    }

    struct TestClient {
        channel: StreamChannel<TcpStream>,
        messenger: Messenger<JsonFormatter>,
        metadata: MessageMetadata<JsonFormatter>,
    }

    impl TestClient {
        async fn connect(endpoint: &Endpoint) -> Self {
            let stream = TcpStream::connect(endpoint.authority().unwrap()).await.unwrap();
            let mut channel = StreamChannel::tcp(stream, &Default::default()).unwrap();
            channel.open().await.unwrap();
            let mut metadata = MessageMetadata::new();
            metadata.build(&inspect::<Pinger, JsonFormatter>().unwrap()).unwrap();
            Self {
                channel,
                messenger: Messenger::default(),
                metadata,
            }
        }

        async fn ping(&mut self, text: &str) -> Result<Pong, ProtocolError> {
            let ping = Ping { text: text.into() };
            self.messenger
                .send(&mut self.channel, &self.metadata, &ping)
                .await?;
            let (_, response): (_, AnyMessage) = self
                .messenger
                .receive(&mut self.channel, &self.metadata)
                .await?;
            Ok(*response.downcast::<Pong>().unwrap())
        }
    }

    fn tcp_host() -> Host {
        let config = HostConfig::new(Endpoint::tcp("127.0.0.1", 0))
            .with_timer_tick(Duration::from_millis(10));
        let mut host = Host::new(config);
        host.add_contract::<Pinger>().unwrap().add_implementor(|| Pinger);
        host
    }

    #[tokio::test]
    async fn start_requires_operations() {
        let mut host = Host::new(HostConfig::new(Endpoint::tcp("127.0.0.1", 0)));
        assert!(matches!(host.start().await, Err(ServerError::NoOperations)));
    }

    #[tokio::test]
    async fn start_requires_implementor() {
        let mut host = Host::new(HostConfig::new(Endpoint::tcp("127.0.0.1", 0)));
        host.add_contract::<Pinger>().unwrap();
        assert!(matches!(
            host.start().await,
            Err(ServerError::MissingImplementor { contract: "pinger" })
        ));
    }

    #[tokio::test]
    async fn registration_closes_at_start() {
        let mut host = tcp_host();
        host.start().await.unwrap();
        assert!(matches!(
            host.add_contract::<Pinger>(),
            Err(ServerError::AlreadyStarted)
        ));
        assert!(matches!(host.start().await, Err(ServerError::AlreadyStarted)));
        host.stop().await;
    }

    #[tokio::test]
    async fn serves_and_tracks_clients() {
        let mut host = tcp_host();
        host.start().await.unwrap();
        assert!(host.is_running());
        let endpoint = host.local_endpoint().unwrap();

        let mut first = TestClient::connect(&endpoint).await;
        let mut second = TestClient::connect(&endpoint).await;
        assert_eq!(first.ping("one").await.unwrap().text, "one");
        assert_eq!(second.ping("two").await.unwrap().text, "two");

        let clients = host.connected_clients();
        assert_eq!(clients.len(), 2);
        assert!(clients[0].session_id < clients[1].session_id);

        first.channel.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while host.connected_clients().len() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        host.stop().await;
        assert!(!host.is_running());
        assert!(host.connected_clients().is_empty());
        assert!(second.ping("late").await.unwrap_err().is_connection_closed());
        assert!(TcpStream::connect(endpoint.authority().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_stop_is_idempotent() {
        let mut host = tcp_host();
        host.start().await.unwrap();
        let endpoint = host.local_endpoint().unwrap();
        let mut client = TestClient::connect(&endpoint).await;
        client.ping("hi").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(host.stop(), host.stop());
        })
        .await
        .unwrap();
        host.stop().await;
        assert!(host.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn max_connections_defers_extra_clients() {
        let config = HostConfig::new(Endpoint::tcp("127.0.0.1", 0)).with_max_connections(1);
        let mut host = Host::new(config);
        host.add_contract::<Pinger>().unwrap().add_implementor(|| Pinger);
        host.start().await.unwrap();
        let endpoint = host.local_endpoint().unwrap();

        let mut first = TestClient::connect(&endpoint).await;
        first.ping("first").await.unwrap();

        // Connects through the backlog but is not served until a slot frees.
        let mut second = TestClient::connect(&endpoint).await;
        let ping = Ping {
            text: "second".into(),
        };
        second
            .messenger
            .send(&mut second.channel, &second.metadata, &ping)
            .await
            .unwrap();
        assert_eq!(host.connected_clients().len(), 1);

        first.channel.close().await.unwrap();
        let (_, response) = tokio::time::timeout(
            Duration::from_secs(2),
            second.messenger.receive(&mut second.channel, &second.metadata),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(response.downcast::<Pong>().unwrap().text, "second");
        host.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_host_removes_socket_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("host.sock");

        let mut host = Host::new(HostConfig::new(Endpoint::unix(&socket_path)));
        host.add_contract::<Pinger>().unwrap().add_implementor(|| Pinger);
        host.start().await.unwrap();
        assert!(socket_path.exists());
        assert_eq!(host.local_endpoint(), Some(Endpoint::unix(&socket_path)));

        host.stop().await;
        assert!(!socket_path.exists());
    }

    struct FailingListener {
        attempts: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl Listener for FailingListener {
        fn prepare_accepting(&mut self) -> BoxFuture<'_, ServerResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn accept_client(&mut self) -> BoxFuture<'_, ServerResult<Box<dyn Channel>>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(std::io::Error::other("too many open files").into()) })
        }

        fn local_endpoint(&self) -> Option<Endpoint> {
            None
        }
    }

    impl Drop for FailingListener {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn shared_components() -> Arc<SharedComponents<JsonFormatter>> {
        let operations = inspect::<Pinger, JsonFormatter>().unwrap();
        let mut metadata = MessageMetadata::new();
        metadata.build(&operations).unwrap();
        let mut router = Router::new();
        router.build(&operations).unwrap();
        let mut registry = ImplementorRegistry::new();
        registry.register(|| Pinger);
        Arc::new(SharedComponents {
            metadata,
            router,
            dispatcher: Dispatcher::new(),
            registry: Arc::new(registry),
            timer: Arc::new(HashedWheelTimer::new(TimerConfig::default()).unwrap()),
            settings: TransportSettings::default(),
            initial_buffer_capacity: 64,
            max_message_size: 1024,
        })
    }

    #[tokio::test]
    async fn failing_accepts_are_retried_with_a_pause() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let listener = FailingListener {
            attempts: Arc::clone(&attempts),
            dropped: Arc::clone(&dropped),
        };
        let shutdown = ShutdownHandle::new();
        let task = tokio::spawn(accept_loop(
            Box::new(listener),
            shared_components(),
            Arc::new(Semaphore::new(4)),
            Arc::new(Mutex::new(HashMap::new())),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.trigger();
        let listener = task.await.unwrap();

        let tried = attempts.load(Ordering::SeqCst);
        assert!((1..=6).contains(&tried), "{tried} accept attempts");
        // The listener outlives the loop; the host releases it last.
        assert!(!dropped.load(Ordering::SeqCst));
        drop(listener);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
