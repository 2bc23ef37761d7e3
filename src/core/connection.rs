/// A single connection to one server endpoint
///
/// This module owns the transport boundary ([`Connector`] / [`Transport`]),
/// the handshake performed when a connection opens, and strictly sequential
/// request/response exchange correlated by request id.
use super::Endpoint;
use crate::error::{DriverError, DriverResult};
use crate::protocol::{
    CodecError, Decoded, HelloCommand, HelloReply, Message, OpCode, WireCodec,
    DEFAULT_MAX_FRAME_SIZE,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 8192;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Byte stream a connection runs over (plain TCP, TLS, in-memory, ...)
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Establishes transport streams to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Transport>>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(keepalive: Option<Duration>) -> Self {
        Self { keepalive }
    }

    fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        // Requests are small and latency bound
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            let socket = socket2::SockRef::from(stream);
            socket.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(120)))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Transport>> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        if let Err(e) = self.configure_stream(&stream) {
            warn!("Failed to configure stream to {}: {}", endpoint, e);
        }
        Ok(Box::new(stream))
    }
}

/// Settings used when opening a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound on transport establishment plus handshake
    pub connect_timeout: Duration,
    /// Application name reported in the handshake
    pub app_name: String,
    /// Local ceiling on frame size; the server may lower it
    pub max_message_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            app_name: "docwire".to_string(),
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Ready,
    InUse,
    Closed,
}

enum ExchangeError {
    Encode(CodecError),
    Timeout,
    Stream(String),
}

/// One stream to one server, carrying at most one request at a time
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    stream: Option<Box<dyn Transport>>,
    read_buf: BytesMut,
    codec: WireCodec,
    next_request_id: i32,
    state: ConnectionState,
    last_activity: Instant,
    generation: u64,
    hello: Option<HelloReply>,
    handshake_rtt: Duration,
    handshake_reported: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Establish the transport and perform the handshake
    pub async fn open(
        endpoint: &Endpoint,
        connector: &dyn Connector,
        options: &ConnectionOptions,
    ) -> DriverResult<Connection> {
        let started = Instant::now();
        debug!("Connecting to {}", endpoint);

        let stream = match timeout(options.connect_timeout, connector.connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                debug!("Connect to {} failed: {}", endpoint, source);
                return Err(DriverError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(DriverError::ConnectTimeout {
                    endpoint: endpoint.clone(),
                    timeout: options.connect_timeout,
                })
            }
        };

        let now = Instant::now();
        let mut connection = Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.clone(),
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            codec: WireCodec::new(options.max_message_size),
            next_request_id: 1,
            state: ConnectionState::Handshaking,
            last_activity: now,
            generation: 0,
            hello: None,
            handshake_rtt: Duration::ZERO,
            handshake_reported: false,
        };

        let budget = options.connect_timeout.saturating_sub(started.elapsed());
        if let Err(e) = connection.handshake(&options.app_name, budget).await {
            connection.close();
            return Err(e);
        }

        connection.state = ConnectionState::Ready;
        debug!(
            "Connection {} to {} ready (handshake {:?})",
            connection.id, endpoint, connection.handshake_rtt
        );
        Ok(connection)
    }

    async fn handshake(&mut self, app_name: &str, budget: Duration) -> DriverResult<()> {
        let payload = serde_json::to_vec(&HelloCommand::new(app_name))
            .map_err(|e| DriverError::encoding(format!("hello document: {}", e)))?;

        let sent_at = Instant::now();
        let reply = match self.exchange(OpCode::Handshake, payload.into(), budget).await {
            Ok(reply) => reply,
            Err(ExchangeError::Timeout) => {
                return Err(DriverError::ConnectTimeout {
                    endpoint: self.endpoint.clone(),
                    timeout: budget,
                })
            }
            Err(ExchangeError::Encode(e)) => return Err(DriverError::encoding(e.to_string())),
            Err(ExchangeError::Stream(message)) => {
                return Err(DriverError::handshake(&self.endpoint, message))
            }
        };
        let rtt = sent_at.elapsed();

        let hello: HelloReply = serde_json::from_slice(&reply.payload).map_err(|e| {
            DriverError::handshake(&self.endpoint, format!("malformed hello reply: {}", e))
        })?;

        if hello.ok != 1.0 {
            let reason = hello
                .errmsg
                .clone()
                .unwrap_or_else(|| "server rejected hello".to_string());
            return Err(DriverError::handshake(&self.endpoint, reason));
        }

        hello
            .check_compatibility()
            .map_err(|message| DriverError::handshake(&self.endpoint, message))?;

        if let Some(server_max) = hello.max_message_size_bytes {
            if server_max < self.codec.max_frame_size() {
                self.codec = WireCodec::new(server_max);
            }
        }

        self.handshake_rtt = rtt;
        self.hello = Some(hello);
        Ok(())
    }

    /// Send one request and wait for the reply carrying the same request id
    ///
    /// A timeout or stream failure closes the connection: unread bytes make
    /// the stream unusable. An oversized request fails before anything is
    /// written and leaves the connection ready.
    pub async fn send_receive(
        &mut self,
        op_code: OpCode,
        payload: Bytes,
        socket_timeout: Duration,
    ) -> DriverResult<Message> {
        if self.state != ConnectionState::Ready {
            return Err(DriverError::stream(
                &self.endpoint,
                format!("connection {} is {:?}, not ready", self.id, self.state),
            ));
        }

        self.state = ConnectionState::InUse;
        match self.exchange(op_code, payload, socket_timeout).await {
            Ok(reply) => {
                self.state = ConnectionState::Ready;
                self.last_activity = Instant::now();
                Ok(reply)
            }
            Err(ExchangeError::Encode(e)) => {
                self.state = ConnectionState::Ready;
                Err(DriverError::encoding(e.to_string()))
            }
            Err(ExchangeError::Timeout) => {
                warn!(
                    "Request on connection {} to {} timed out after {:?}",
                    self.id, self.endpoint, socket_timeout
                );
                self.close();
                Err(DriverError::RequestTimeout {
                    endpoint: self.endpoint.clone(),
                    timeout: socket_timeout,
                })
            }
            Err(ExchangeError::Stream(message)) => {
                warn!(
                    "Stream error on connection {} to {}: {}",
                    self.id, self.endpoint, message
                );
                self.close();
                Err(DriverError::stream(&self.endpoint, message))
            }
        }
    }

    async fn exchange(
        &mut self,
        op_code: OpCode,
        payload: Bytes,
        limit: Duration,
    ) -> Result<Message, ExchangeError> {
        let request_id = self.next_request_id;
        let frame = self
            .codec
            .encode(&Message::new(request_id, op_code, payload))
            .map_err(ExchangeError::Encode)?;
        self.next_request_id = request_id
            .checked_add(1)
            .ok_or_else(|| ExchangeError::Stream("request ids exhausted".to_string()))?;

        let codec = self.codec;
        let read_buf = &mut self.read_buf;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ExchangeError::Stream("connection is closed".to_string()))?;

        let io = async {
            stream
                .write_all(&frame)
                .await
                .map_err(|e| ExchangeError::Stream(format!("write failed: {}", e)))?;
            stream
                .flush()
                .await
                .map_err(|e| ExchangeError::Stream(format!("flush failed: {}", e)))?;

            loop {
                match codec.decode(read_buf) {
                    Ok(Decoded::Frame(message)) => return Ok(message),
                    Ok(Decoded::NeedMoreData) => {}
                    Err(e) => return Err(ExchangeError::Stream(format!("invalid frame: {}", e))),
                }

                let read = stream
                    .read_buf(read_buf)
                    .await
                    .map_err(|e| ExchangeError::Stream(format!("read failed: {}", e)))?;
                if read == 0 {
                    return Err(ExchangeError::Stream(
                        "connection closed by server".to_string(),
                    ));
                }
            }
        };

        let reply = timeout(limit, io)
            .await
            .map_err(|_| ExchangeError::Timeout)??;

        if reply.request_id != request_id {
            return Err(ExchangeError::Stream(format!(
                "reply id {} does not match request id {}",
                reply.request_id, request_id
            )));
        }
        if reply.op_code != OpCode::Reply {
            return Err(ExchangeError::Stream(format!(
                "unexpected {} frame in reply",
                reply.op_code
            )));
        }

        Ok(reply)
    }

    /// Release the transport; idempotent
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closing connection {} to {}", self.id, self.endpoint);
        }
        self.read_buf.clear();
        self.state = ConnectionState::Closed;
    }

    /// Handshake details, returned once after the connection was opened
    pub fn take_fresh_handshake(&mut self) -> Option<(Duration, HelloReply)> {
        if self.handshake_reported {
            return None;
        }
        self.handshake_reported = true;
        self.hello.clone().map(|hello| (self.handshake_rtt, hello))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Ready connections are the only ones a pool may hand out again
    pub fn is_reusable(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn hello(&self) -> Option<&HelloReply> {
        self.hello.as_ref()
    }

    pub fn max_frame_size(&self) -> usize {
        self.codec.max_frame_size()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
