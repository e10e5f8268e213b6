//! Typed client and contract proxies.
//!
//! A [`Client`] owns one connection. A [`Proxy`] borrows the client
//! mutably, so at most one request is in flight per connection.

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use polyrpc_core::{
    Connection, Contract, ContractInfo, Formatter, JsonFormatter, Message, MessageId,
    MessageMetadata, Operation, inspect,
};
use polyrpc_protocol::{
    Channel, CloseReason, Messenger, ProtocolError, ProtocolResult, TransportSettings,
};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connector;
use crate::error::{ClientError, ClientResult};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

struct Connected<F> {
    channel: Box<dyn Channel>,
    messenger: Messenger<F>,
    last_exchange: Instant,
}

/// Calls contract operations on a remote host.
///
/// ```rust,no_run
/// use polyrpc_client::demo::{EchoReply, EchoRequest, EchoService};
/// use polyrpc_client::{Client, ClientConfig};
/// use polyrpc_protocol::Endpoint;
///
/// # async fn run() -> polyrpc_client::ClientResult<()> {
/// let mut client = Client::new(ClientConfig::new(Endpoint::tcp("127.0.0.1", 10678)));
/// client.add_contract::<EchoService>()?;
/// client.connect().await?;
///
/// let reply: EchoReply = client
///     .get::<EchoService>()?
///     .call(EchoRequest { text: "hi".into() })
///     .await?;
/// assert_eq!(reply.text, "hi");
/// # Ok(())
/// # }
/// ```
pub struct Client<F: Formatter = JsonFormatter> {
    id: u64,
    config: ClientConfig,
    contracts: Vec<ContractInfo>,
    operations: Vec<Operation<F>>,
    /// Keyed by (contract, request) type.
    requests: HashMap<(TypeId, TypeId), Operation<F>>,
    metadata: Option<MessageMetadata<F>>,
    connection: Option<Connected<F>>,
}

impl Client {
    /// Creates a client speaking JSON.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_formatter(config)
    }
}

impl<F: Formatter> Client<F> {
    /// Creates a client using formatter `F`.
    pub fn with_formatter(config: ClientConfig) -> Self {
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            contracts: Vec::new(),
            operations: Vec::new(),
            requests: HashMap::new(),
            metadata: None,
            connection: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Inspects contract `C` and makes its operations callable.
    ///
    /// Contracts must be added before the first [`connect`](Self::connect).
    pub fn add_contract<C: Contract>(&mut self) -> ClientResult<&mut Self> {
        if self.metadata.is_some() {
            return Err(ClientError::contract(format!(
                "cannot add contract `{}` after connecting",
                C::NAME
            )));
        }
        let info = ContractInfo::of::<C>();
        if self.contracts.contains(&info) {
            return Ok(self);
        }

        let operations = inspect::<C, F>()?;
        for operation in &operations {
            self.requests.insert(
                (info.type_id, operation.request.info.type_id),
                operation.clone(),
            );
        }
        self.operations.extend(operations);
        self.contracts.push(info);
        debug!(client_id = self.id, contract = C::NAME, "Added contract");
        Ok(self)
    }

    /// Connects to the configured endpoint. A no-op when connected.
    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        if self.metadata.is_none() {
            if self.operations.is_empty() {
                return Err(ClientError::contract("no contracts added"));
            }
            let mut metadata = MessageMetadata::new();
            metadata.build(&self.operations)?;
            self.metadata = Some(metadata);
        }

        let channel = connector::connect(
            &self.config.endpoint,
            &TransportSettings::default(),
            self.config.connect_timeout,
        )
        .await?;
        info!(client_id = self.id, endpoint = %self.config.endpoint, "Client connected");
        self.connection = Some(Connected {
            channel,
            messenger: Messenger::default(),
            last_exchange: Instant::now(),
        });
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The open connection, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection
            .as_ref()
            .map(|connected| connected.channel.connection())
    }

    /// Returns a proxy for contract `C`.
    pub fn get<C: Contract>(&mut self) -> ClientResult<Proxy<'_, C, F>> {
        if !self.contracts.contains(&ContractInfo::of::<C>()) {
            return Err(ClientError::contract(format!(
                "contract `{}` was not added",
                C::NAME
            )));
        }
        Ok(Proxy {
            client: self,
            _contract: PhantomData,
        })
    }

    /// Closes the connection. Contracts stay registered.
    pub async fn close(&mut self) {
        let Some(mut connected) = self.connection.take() else {
            return;
        };
        if let Err(e) = connected.channel.close().await {
            debug!(client_id = self.id, error = %e, "Channel close failed");
        }
        connected.messenger.dispose();
        debug!(client_id = self.id, "Client disconnected");
    }

    fn operation<C: Contract, Req: Message, Resp: Message>(
        &self,
    ) -> ClientResult<(&'static str, MessageId)> {
        let operation = self
            .requests
            .get(&(TypeId::of::<C>(), TypeId::of::<Req>()))
            .ok_or_else(|| {
                ClientError::contract(format!(
                    "`{}` is not a request of contract `{}`",
                    type_name::<Req>(),
                    C::NAME
                ))
            })?;
        if operation.response.info.type_id != TypeId::of::<Resp>() {
            return Err(ClientError::contract(format!(
                "operation `{}` answers with `{}`, not `{}`",
                operation.name,
                operation.response.info.type_name,
                type_name::<Resp>()
            )));
        }
        Ok((operation.name, operation.response_id()))
    }

    async fn call<C: Contract, Req: Message, Resp: Message>(
        &mut self,
        request: Req,
    ) -> ClientResult<Resp> {
        let (name, response_id) = self.operation::<C, Req, Resp>()?;
        let send_timeout = self.config.send_timeout;
        let receive_timeout = self.config.receive_timeout;
        let metadata = self.metadata.as_ref().ok_or(ClientError::NotConnected)?;
        let connected = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
        let idle_for = connected.last_exchange.elapsed();

        let sent = connected
            .messenger
            .send(connected.channel.as_mut(), metadata, &request);
        let result = match limit(send_timeout, "send", sent).await {
            Ok(()) => {
                let received = connected
                    .messenger
                    .receive(connected.channel.as_mut(), metadata);
                limit(receive_timeout, "receive", received).await
            }
            Err(e) => Err(e),
        };

        let (message_id, response) = match result {
            Ok(received) => received,
            Err(e) => return Err(self.fail(e, idle_for).await),
        };
        connected.last_exchange = Instant::now();

        if message_id != response_id {
            return Err(ClientError::protocol(format!(
                "operation `{name}` expected response {response_id}, received {message_id}"
            )));
        }
        let response = response.downcast::<Resp>().map_err(|_| {
            ClientError::protocol(format!(
                "operation `{name}` response is not a `{}`",
                type_name::<Resp>()
            ))
        })?;
        debug!(client_id = self.id, operation = name, "Call completed");
        Ok(*response)
    }

    /// Drops the broken connection and classifies the error.
    async fn fail(&mut self, error: ProtocolError, idle_for: Duration) -> ClientError {
        let error = classify(error, idle_for, self.config.remote_idle_timeout);
        warn!(client_id = self.id, error = %error, "Call failed, closing connection");
        self.close().await;
        error
    }
}

/// Typed view of one contract on a [`Client`].
pub struct Proxy<'c, C, F: Formatter = JsonFormatter> {
    client: &'c mut Client<F>,
    _contract: PhantomData<fn() -> C>,
}

impl<C: Contract, F: Formatter> Proxy<'_, C, F> {
    /// Sends `request` and waits for the operation's response.
    ///
    /// `Resp` must be the response type the operation declares.
    pub async fn call<Req: Message, Resp: Message>(&mut self, request: Req) -> ClientResult<Resp> {
        self.client.call::<C, Req, Resp>(request).await
    }
}

/// Reports a connection the host shut between exchanges as a remote idle
/// timeout once the connection sat idle longer than the host allows.
///
/// Only a clean close or a reset qualifies; a close in the middle of a
/// response keeps its own reason.
fn classify(error: ProtocolError, idle_for: Duration, remote_idle: Option<Duration>) -> ClientError {
    let idle = remote_idle.is_some_and(|limit| idle_for > limit);
    match error.close_reason() {
        Some(CloseReason::Orderly | CloseReason::PeerReset) if idle => {
            ClientError::closed(CloseReason::RemoteIdleTimeout)
        }
        _ => ClientError::from(error),
    }
}

async fn limit<T>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: impl Future<Output = ProtocolResult<T>>,
) -> ProtocolResult<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ProtocolError::Timeout { operation })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use polyrpc_protocol::Endpoint;
    use polyrpc_server::{Host, HostConfig};

    use super::*;
    use crate::demo::{EchoReply, EchoRequest, EchoService, Identity, WhoAmI};

    async fn echo_host() -> Host {
        let mut host = Host::new(HostConfig::new(Endpoint::tcp("127.0.0.1", 0)));
        host.add_contract::<EchoService>()
            .unwrap()
            .add_implementor(EchoService::default);
        host.start().await.unwrap();
        host
    }

    fn client_for(host: &Host) -> Client {
        let mut client = Client::new(ClientConfig::new(host.local_endpoint().unwrap()));
        client.add_contract::<EchoService>().unwrap();
        client
    }

    #[tokio::test]
    async fn calls_round_trip() {
        let host = echo_host().await;
        let mut client = client_for(&host);
        client.connect().await.unwrap();

        let mut echo = client.get::<EchoService>().unwrap();
        let reply: EchoReply = echo
            .call(EchoRequest {
                text: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply.text, "hello");

        let identity: Identity = echo.call(WhoAmI {}).await.unwrap();
        let local = client.connection().unwrap().local_address().unwrap().to_string();
        assert_eq!(identity.remote, local);

        client.close().await;
        assert!(!client.is_connected());
        host.stop().await;
    }

    #[tokio::test]
    async fn call_requires_connection() {
        let mut client = Client::new(ClientConfig::new(Endpoint::tcp("127.0.0.1", 1)));
        client.add_contract::<EchoService>().unwrap();
        let err = client
            .get::<EchoService>()
            .unwrap()
            .call::<_, EchoReply>(EchoRequest { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn undeclared_types_are_rejected_locally() {
        let mut client = Client::new(ClientConfig::new(Endpoint::tcp("127.0.0.1", 1)));
        client.add_contract::<EchoService>().unwrap();
        let mut echo = client.get::<EchoService>().unwrap();

        let err = echo
            .call::<_, EchoReply>(EchoReply { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Contract(ref msg) if msg.contains("is not a request")));

        let err = echo
            .call::<_, Identity>(EchoRequest { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Contract(ref msg) if msg.contains("answers with")));
    }

    #[tokio::test]
    async fn unknown_contract_has_no_proxy() {
        let mut client = Client::new(ClientConfig::default());
        assert!(matches!(
            client.get::<EchoService>(),
            Err(ClientError::Contract(_))
        ));
        assert!(matches!(
            client.connect().await,
            Err(ClientError::Contract(_))
        ));
    }

    #[tokio::test]
    async fn contracts_are_fixed_after_connect() {
        let host = echo_host().await;
        let mut client = client_for(&host);
        client.connect().await.unwrap();
        assert!(client.add_contract::<EchoService>().is_err());
        host.stop().await;
    }

    #[test]
    fn only_idle_shaped_closes_become_remote_idle_timeouts() {
        let limit = Some(Duration::from_secs(1));
        let long = Duration::from_secs(2);
        let reason = |reason, idle_for, limit| {
            classify(ProtocolError::closed(reason), idle_for, limit).close_reason()
        };

        assert_eq!(
            reason(CloseReason::Orderly, long, limit),
            Some(CloseReason::RemoteIdleTimeout)
        );
        assert_eq!(
            reason(CloseReason::PeerReset, long, limit),
            Some(CloseReason::RemoteIdleTimeout)
        );
        assert_eq!(
            reason(CloseReason::Unexpected, long, limit),
            Some(CloseReason::Unexpected)
        );
        assert_eq!(
            reason(CloseReason::PeerAborted, long, limit),
            Some(CloseReason::PeerAborted)
        );
        assert_eq!(
            reason(CloseReason::Orderly, Duration::from_millis(10), limit),
            Some(CloseReason::Orderly)
        );
        assert_eq!(reason(CloseReason::Orderly, long, None), Some(CloseReason::Orderly));

        let timeout = classify(ProtocolError::Timeout { operation: "receive" }, long, limit);
        assert!(matches!(timeout, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn receive_timeout_closes_connection() {
        // Accepts but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let config = ClientConfig::new(Endpoint::tcp("127.0.0.1", port))
            .with_receive_timeout(Duration::from_millis(100));
        let mut client = Client::new(config);
        client.add_contract::<EchoService>().unwrap();
        client.connect().await.unwrap();

        let err = client
            .get::<EchoService>()
            .unwrap()
            .call::<_, EchoReply>(EchoRequest { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(ref op) if op == "receive"));
        assert!(!client.is_connected());
        server.abort();
    }
}
