//! The networked [`RpcAgent`].
//!
//! A [`TcpAgent`] binds a local TCP listener and serves requests from other
//! workers through a [`RequestHandler`]. For outgoing calls it keeps one
//! connection per destination, opened lazily on the first send. Every
//! connection starts with an HMAC-authenticated handshake that exchanges
//! worker identity and protocol version; after that, each side writes
//! binary message frames (see [`crate::message`]).
//!
//! Responses are matched to their [`FutureMessage`] by message id. Futures
//! complete on the connection's reader task, which is where response
//! callbacks run. When a connection fails, every call still in flight on it
//! completes with [`ConnectionLost`] rather than a response.

use crate::agent::RpcAgent;
use crate::error::{ConnectionLost, WireError};
use crate::future::FutureMessage;
use crate::message::{decode_frame, decode_length, encode_frame, Message, PROTOCOL_VERSION};
use crate::registry::{WorkerEntry, WorkerRegistry};
use crate::request::RequestHandler;

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tandem_types::config::RpcConfig;
use tandem_types::ids::{WorkerId, WorkerInfo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for connection authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Identity a worker presents when a connection opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    worker_name: String,
    worker_id: WorkerId,
    protocol_version: u32,
    /// Random nonce for HMAC authentication.
    nonce: String,
    /// HMAC-SHA256(shared_secret, nonce + worker_id).
    auth_hmac: String,
}

impl Hello {
    fn new(info: &WorkerInfo, secret: &str) -> Self {
        let nonce = uuid::Uuid::new_v4().to_string();
        let auth_hmac = hmac_sign(secret, format!("{}{}", nonce, info.id.0).as_bytes());
        Self {
            worker_name: info.name.clone(),
            worker_id: info.id,
            protocol_version: PROTOCOL_VERSION,
            nonce,
            auth_hmac,
        }
    }

    fn verify(&self, secret: &str) -> bool {
        let data = format!("{}{}", self.nonce, self.worker_id.0);
        hmac_verify(secret, data.as_bytes(), &self.auth_hmac)
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo::new(self.worker_name.clone(), self.worker_id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HandshakeReply {
    Ack(Hello),
    Error { code: i32, message: String },
}

struct InFlight {
    dst: String,
    future: Arc<FutureMessage>,
}

type InFlightMap = Arc<Mutex<HashMap<u64, InFlight>>>;

/// Complete every in-flight call to `dst` with a transport failure.
fn fail_inflight(inflight: &InFlightMap, dst: &str, reason: &str) -> usize {
    let failed: Vec<Arc<FutureMessage>> = {
        let mut map = inflight.lock().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<u64> = map
            .iter()
            .filter(|(_, f)| f.dst == dst)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| map.remove(&id).map(|f| f.future))
            .collect()
    };
    for future in &failed {
        future.mark_lost(ConnectionLost::new(dst, reason));
    }
    failed.len()
}

/// The networked RPC agent.
pub struct TcpAgent {
    info: WorkerInfo,
    shared_secret: String,
    max_message_size: u32,
    registry: WorkerRegistry,
    local_addr: SocketAddr,
    next_id: AtomicU64,
    inflight: InFlightMap,
    outbound: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    runtime: Handle,
}

impl TcpAgent {
    /// Bind the listener and start serving requests through `handler`.
    ///
    /// Must be called from within a tokio runtime; the agent keeps a handle
    /// to it so [`RpcAgent::send`] works from any thread.
    pub async fn start(
        config: &RpcConfig,
        handler: Arc<RequestHandler>,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), WireError> {
        if config.shared_secret.is_empty() {
            return Err(WireError::HandshakeFailed(
                "tandem requires shared_secret. Set shared_secret in the worker config".into(),
            ));
        }

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let info = config.worker_info();

        let registry = WorkerRegistry::from_peers(&config.peers);
        registry.add_worker(WorkerEntry::new(info.clone(), local_addr));

        info!(
            "tandem: {} listening on {} ({} peers)",
            info,
            local_addr,
            config.peers.len()
        );

        let agent = Arc::new(Self {
            info,
            shared_secret: config.shared_secret.clone(),
            max_message_size: config.max_message_size,
            registry,
            local_addr,
            next_id: AtomicU64::new(0),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            outbound: Mutex::new(HashMap::new()),
            runtime: Handle::current(),
        });

        let agent_clone = Arc::clone(&agent);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, agent_clone, handler).await;
        });

        Ok((agent, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a reference to the worker registry.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Number of calls awaiting a response.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Close outbound connections and fail every call still in flight.
    pub fn shutdown(&self) {
        let destinations: Vec<String> = {
            let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            outbound.drain().map(|(name, _)| name).collect()
        };
        for dst in destinations {
            fail_inflight(&self.inflight, &dst, "RPC agent is shutting down");
        }
        info!("tandem: {} shut down", self.info);
    }

    async fn accept_loop(listener: TcpListener, agent: Arc<Self>, handler: Arc<RequestHandler>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("tandem: inbound connection from {}", addr);
                    let agent = agent.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = agent.handle_inbound(stream, handler).await {
                            debug!("tandem: inbound connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("tandem: accept error: {}", e);
                }
            }
        }
    }

    /// Authenticate an inbound connection, then serve its requests in order.
    async fn handle_inbound(
        &self,
        stream: TcpStream,
        handler: Arc<RequestHandler>,
    ) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();
        let hello: Hello = read_json(&mut reader, self.max_message_size).await?;

        if hello.protocol_version != PROTOCOL_VERSION {
            let reply = HandshakeReply::Error {
                code: 400,
                message: format!(
                    "Protocol version mismatch: local={PROTOCOL_VERSION}, remote={}",
                    hello.protocol_version
                ),
            };
            write_json(&mut writer, &reply).await?;
            return Err(WireError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: hello.protocol_version,
            });
        }
        if !hello.verify(&self.shared_secret) {
            warn!(
                "tandem: rejected {}: HMAC verification failed",
                hello.info()
            );
            let reply = HandshakeReply::Error {
                code: 401,
                message: "HMAC authentication failed".to_string(),
            };
            write_json(&mut writer, &reply).await?;
            return Err(WireError::HandshakeFailed("HMAC verification failed".into()));
        }

        let ack = HandshakeReply::Ack(Hello::new(&self.info, &self.shared_secret));
        write_json(&mut writer, &ack).await?;
        info!("tandem: accepted connection from {}", hello.info());

        loop {
            let request = read_frame(&mut reader, self.max_message_size).await?;
            let id = request.id;
            let handler = handler.clone();
            let response = match tokio::task::spawn_blocking(move || handler.handle(&request)).await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("tandem: request {} handler failed: {}", id, e);
                    let mut response = Message::exception(format!("request handler failed: {e}"));
                    response.id = id;
                    response
                }
            };
            write_frame(&mut writer, &response, self.max_message_size).await?;
        }
    }

    fn outbound_sender(&self, entry: &WorkerEntry) -> mpsc::UnboundedSender<Message> {
        let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = outbound.get(&entry.info.name) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        outbound.insert(entry.info.name.clone(), tx.clone());

        let link = OutboundLink {
            local: self.info.clone(),
            remote: entry.info.clone(),
            address: entry.address,
            shared_secret: self.shared_secret.clone(),
            max_message_size: self.max_message_size,
            registry: self.registry.clone(),
            inflight: self.inflight.clone(),
        };
        self.runtime.spawn(link.run(rx));
        tx
    }
}

impl RpcAgent for TcpAgent {
    fn worker_info(&self) -> &WorkerInfo {
        &self.info
    }

    fn send(&self, to: &WorkerInfo, mut message: Message) -> Result<Arc<FutureMessage>, WireError> {
        let entry = self
            .registry
            .get_worker(&to.name)
            .ok_or_else(|| WireError::UnknownWorker(to.to_string()))?;
        if entry.info.id != to.id {
            return Err(WireError::UnknownWorker(format!(
                "{to} (registered as {})",
                entry.info
            )));
        }

        message.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = message.id;
        let future = FutureMessage::new();
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                InFlight {
                    dst: to.name.clone(),
                    future: future.clone(),
                },
            );

        if self.outbound_sender(&entry).send(message).is_err() {
            self.inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(WireError::ConnectionClosed);
        }
        Ok(future)
    }
}

/// One outgoing connection: writes queued requests, reads responses.
struct OutboundLink {
    local: WorkerInfo,
    remote: WorkerInfo,
    address: SocketAddr,
    shared_secret: String,
    max_message_size: u32,
    registry: WorkerRegistry,
    inflight: InFlightMap,
}

impl OutboundLink {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Message>) {
        let outcome = self.serve(&mut rx).await;
        rx.close();
        while rx.try_recv().is_ok() {}

        let reason = match &outcome {
            Ok(()) => "connection closed".to_string(),
            Err(e) => e.to_string(),
        };
        let failed = fail_inflight(&self.inflight, &self.remote.name, &reason);
        self.registry.mark_disconnected(&self.remote.name);
        match outcome {
            Ok(()) => debug!("tandem: connection to {} closed", self.remote),
            Err(e) => warn!(
                "tandem: connection to {} ended: {} ({} calls failed)",
                self.remote, e, failed
            ),
        }
    }

    async fn serve(&self, rx: &mut mpsc::UnboundedReceiver<Message>) -> Result<(), WireError> {
        let stream = TcpStream::connect(self.address).await?;
        let (mut reader, mut writer) = stream.into_split();
        self.handshake(&mut reader, &mut writer).await?;
        self.registry.mark_connected(&self.remote.name);

        let mut responses = tokio::spawn(read_responses(
            reader,
            self.inflight.clone(),
            self.max_message_size,
        ));
        loop {
            tokio::select! {
                queued = rx.recv() => match queued {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut writer, &message, self.max_message_size).await {
                            responses.abort();
                            return Err(e);
                        }
                    }
                    None => {
                        responses.abort();
                        return Ok(());
                    }
                },
                finished = &mut responses => {
                    return match finished {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            error!(
                                "tandem: response delivery from {} violated a protocol invariant; aborting",
                                self.remote
                            );
                            std::process::abort();
                        }
                        Err(_) => Err(WireError::ConnectionClosed),
                    };
                }
            }
        }
    }

    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), WireError> {
        write_json(writer, &Hello::new(&self.local, &self.shared_secret)).await?;
        let reply: HandshakeReply = read_json(reader, self.max_message_size).await?;
        match reply {
            HandshakeReply::Ack(ack) => {
                if ack.protocol_version != PROTOCOL_VERSION {
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: ack.protocol_version,
                    });
                }
                if !ack.verify(&self.shared_secret) {
                    return Err(WireError::HandshakeFailed(
                        "HMAC verification failed on handshake ack".into(),
                    ));
                }
                if ack.worker_id != self.remote.id {
                    return Err(WireError::HandshakeFailed(format!(
                        "expected {} at {}, found {}",
                        self.remote,
                        self.address,
                        ack.info()
                    )));
                }
                info!("tandem: connected to {} at {}", self.remote, self.address);
                Ok(())
            }
            HandshakeReply::Error { code, message } => Err(WireError::HandshakeFailed(format!(
                "Remote error {code}: {message}"
            ))),
        }
    }
}

/// Read response frames and complete the matching futures.
async fn read_responses(
    mut reader: OwnedReadHalf,
    inflight: InFlightMap,
    max_message_size: u32,
) -> Result<(), WireError> {
    loop {
        let response = read_frame(&mut reader, max_message_size).await?;
        let pending = inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&response.id);
        match pending {
            Some(call) => {
                call.future.mark_completed(response);
            }
            None => warn!("tandem: response for unknown request id {}", response.id),
        }
    }
}

/// Write a length-prefixed JSON handshake frame.
async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(value)?;
    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed JSON handshake frame.
async fn read_json<R, T>(reader: &mut R, max: u32) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_body(reader, max).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write a message frame.
pub async fn write_frame<W>(writer: &mut W, message: &Message, max: u32) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(message);
    let size = (bytes.len() - 4) as u32;
    if size > max {
        return Err(WireError::MessageTooLarge { size, max });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a message frame.
pub async fn read_frame<R>(reader: &mut R, max: u32) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let body = read_body(reader, max).await?;
    decode_frame(&body)
}

async fn read_body<R>(reader: &mut R, max: u32) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }
    let len = decode_length(&header);
    if len > max {
        return Err(WireError::MessageTooLarge { size: len, max });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
