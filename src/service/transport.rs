// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::network::handshake::{KeyStore, RsaKeyPair};
use crate::network::{AcceptHandler, InboundMessage, Listener, Role, Session, SessionRecord};
use crate::utils::{Pool, PoolBuilder, WorkerPool, WorkerPoolConfig};
use crate::{AppError, AppResult};

use super::admission::AdmissionController;
use super::config::{EncryptionMode, PoolLimits, TransportConfig};
use super::events::{EventHub, TransportEvent};
use super::server::{process_request, ConnectionHandler, DispatchTask, IoContext};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub type HandlerFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'static>>;

/// Application callback for inbound requests.
pub type DataHandler = Arc<dyn Fn(Arc<InboundMessage>) -> HandlerFuture + Send + Sync>;

pub(crate) struct TransportInner {
    pub(crate) config: TransportConfig,
    pub(crate) admission: AdmissionController,
    // never holds a Closed session
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    session_pool: Pool<SessionRecord>,
    buffer_pool: Pool<BytesMut>,
    io_pool: Pool<IoContext>,
    pub(crate) events: Arc<EventHub>,
    pub(crate) data_handlers: RwLock<Vec<DataHandler>>,
    pub(crate) dispatcher: WorkerPool<DispatchTask>,
    pub(crate) keys: KeyStore,
    notify_shutdown: broadcast::Sender<()>,
}

impl TransportInner {
    pub(crate) fn has_data_handlers(&self) -> bool {
        !self.data_handlers.read().is_empty()
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let permit = match self.admission.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("rejecting connection from {}: {}", remote, e);
                drop(stream);
                self.events
                    .emit(TransportEvent::AdmissionRejected { remote });
                return;
            }
        };
        if let Err(e) = self.open_session(stream, remote, Role::Server, permit) {
            warn!("could not set up session for {}: {}", remote, e);
        }
    }

    /// Builds a running session around an admitted stream and starts reading it.
    fn open_session(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        role: Role,
        permit: OwnedSemaphorePermit,
    ) -> AppResult<Arc<Session>> {
        if let Err(e) = stream.set_nodelay(true) {
            // the slot was taken in admit(), give it back
            drop(permit);
            self.admission.connection_closed();
            return Err(e.into());
        }
        let (reader, writer) = stream.into_split();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            id,
            role,
            remote,
            writer,
            self.session_pool.acquire(),
            permit,
            self.config.network.reply_timeout(),
            self.config.network.max_frame_size,
            self.events.clone(),
        ));
        session.mark_running();
        self.sessions.lock().insert(id, session.clone());

        let handler = ConnectionHandler::new(
            session.clone(),
            reader,
            self.buffer_pool.acquire(),
            self.io_pool.acquire(),
            self.clone(),
        );
        tokio::spawn(handler.run());

        debug!("session {} ({:?}) established with {}", id, role, remote);
        self.events
            .emit(TransportEvent::SessionEstablished(session.clone()));
        Ok(session)
    }

    /// The single close path. Only the caller that removes the session from the
    /// registry closes it; everyone else returns immediately.
    pub(crate) async fn end_session(&self, session: &Arc<Session>, cause: Option<String>) {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(&session.id()) {
                Some(_) => {
                    session.mark_closed();
                    true
                }
                None => false,
            }
        };
        if !removed {
            return;
        }

        session.release_admission();
        self.admission.connection_closed();
        session.shutdown_socket().await;
        match &cause {
            Some(cause) => debug!("session {} closed: {}", session.id(), cause),
            None => debug!("session {} closed", session.id()),
        }
        self.events.emit(TransportEvent::SessionEnded {
            session: session.clone(),
            cause,
        });
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        let _ = self.notify_shutdown.send(());
        debug!("transport dropped");
    }
}

fn build_pool<T, F>(
    name: &str,
    limits: PoolLimits,
    events: &Arc<EventHub>,
    factory: F,
) -> PoolBuilder<T>
where
    T: Send + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    let events = events.clone();
    Pool::builder(name, factory)
        .min(limits.min)
        .max(limits.max)
        .on_overflow(move |pool| {
            events.emit(TransportEvent::PoolOverflow {
                pool: pool.to_string(),
            })
        })
}

/// Entry point for both ends of a connection: listens, connects, and tracks every
/// live session.
///
/// Must be created inside a tokio runtime; the handler workers start right away.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> AppResult<Transport> {
        let keys = KeyStore::new(config.encryption.mode, config.encryption.rsa_key_bits);
        Transport::build(config, keys)
    }

    /// Uses `keypair` instead of generating one on first use.
    pub fn with_keys(config: TransportConfig, keypair: Arc<RsaKeyPair>) -> AppResult<Transport> {
        let keys = KeyStore::with_keypair(config.encryption.mode, keypair);
        Transport::build(config, keys)
    }

    fn build(config: TransportConfig, keys: KeyStore) -> AppResult<Transport> {
        config.validate()?;
        let network = &config.network;
        let pools = &config.pools;
        let events = Arc::new(EventHub::new());

        let admission = AdmissionController::new(
            network.max_connection,
            config.request_handler_pool.max_concurrent_handlers,
            network.admission_timeout(),
        );
        let session_pool = build_pool("session", pools.session, &events, SessionRecord::new)
            .reset(SessionRecord::reset)
            .build();
        let read_size = network.conn_read_buffer_size;
        let buffer_pool = build_pool("receive_buffer", pools.receive_buffer, &events, move || {
            BytesMut::with_capacity(read_size)
        })
        .reset(|buffer: &mut BytesMut| buffer.clear())
        .build();
        let io_pool = build_pool("io_context", pools.io_context, &events, move || {
            IoContext::new(read_size)
        })
        .reset(IoContext::reset)
        .dispose(|io: IoContext| {
            trace!(
                "io context dropped after {} bytes in {} frames",
                io.bytes_received(),
                io.frames_decoded()
            )
        })
        .build();

        let handler_pool = &config.request_handler_pool;
        let worker_config = WorkerPoolConfig {
            channel_capacity: handler_pool.channel_capacity,
            num_workers: handler_pool.num_channels,
            monitor_interval: Duration::from_secs(handler_pool.monitor_interval),
            worker_check_timeout: Duration::from_millis(handler_pool.worker_check_timeout),
        };
        let (notify_shutdown, _) = broadcast::channel(1);

        let inner = Arc::new_cyclic(|weak| {
            let weak = weak.clone();
            let dispatcher = WorkerPool::new(
                "request handler",
                worker_config,
                notify_shutdown.clone(),
                move |task| process_request(weak.clone(), task),
            );
            TransportInner {
                admission,
                sessions: Mutex::new(HashMap::new()),
                session_pool,
                buffer_pool,
                io_pool,
                events,
                data_handlers: RwLock::new(Vec::new()),
                dispatcher,
                keys,
                notify_shutdown,
                config,
            }
        });
        Ok(Transport { inner })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Hands accepted streams to this transport's admission path.
    pub fn accept_handler(&self) -> AcceptHandler {
        let inner = self.inner.clone();
        Arc::new(move |stream, remote| {
            tokio::spawn(inner.clone().accept(stream, remote));
        })
    }

    /// Starts a listener on `addr` wired to this transport.
    pub async fn listen(&self, addr: SocketAddr) -> AppResult<Listener> {
        let mut listener = Listener::new(addr, self.inner.config.network.backlog);
        listener.on_accept(self.accept_handler());
        let local_addr = listener.start().await?;
        info!("transport listening on {}", local_addr);
        Ok(listener)
    }

    /// Opens an outbound session. In `Required` encryption mode the handshake
    /// runs before this returns; if it fails the session is closed.
    pub async fn connect(&self, addr: SocketAddr) -> AppResult<Arc<Session>> {
        let connect_timeout = self.inner.config.network.connect_timeout();
        let stream = match time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(AppError::TransportFailure(format!(
                    "connect to {}: {}",
                    addr, e
                )))
            }
            Err(_) => {
                return Err(AppError::TransportFailure(format!(
                    "connect to {} timed out after {:?}",
                    addr, connect_timeout
                )))
            }
        };
        let permit = match self.inner.admission.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                drop(stream);
                self.inner
                    .events
                    .emit(TransportEvent::AdmissionRejected { remote: addr });
                return Err(e);
            }
        };
        let session = self
            .inner
            .open_session(stream, addr, Role::Client, permit)?;

        if self.inner.keys.mode() == EncryptionMode::Required {
            if let Err(e) = session.negotiate_encryption().await {
                self.inner
                    .end_session(&session, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Connects in the background and reports the outcome to `on_result`.
    pub fn connect_with<F>(&self, addr: SocketAddr, on_result: F) -> JoinHandle<()>
    where
        F: FnOnce(AppResult<Arc<Session>>) + Send + 'static,
    {
        let transport = self.clone();
        tokio::spawn(async move { on_result(transport.connect(addr).await) })
    }

    /// Closes `session`. Closing an already closed session does nothing.
    pub async fn close_session(&self, session: &Arc<Session>) {
        self.inner.end_session(session, None).await;
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn live_connections(&self) -> usize {
        self.inner.admission.live_connections()
    }

    /// Registers a handler for inbound requests. Handlers run in registration
    /// order on a worker; the first error stops the chain and closes the session.
    pub fn on_data<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<InboundMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let handler: DataHandler = Arc::new(move |message| Box::pin(handler(message)));
        self.inner.data_handlers.write().push(handler);
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener);
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    /// Stops the handler workers and closes every live session.
    pub async fn shutdown(&self) {
        let _ = self.inner.notify_shutdown.send(());
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        info!("transport shutting down, closing {} sessions", sessions.len());
        for session in sessions {
            self.inner.end_session(&session, None).await;
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("sessions", &self.session_count())
            .field("live_connections", &self.live_connections())
            .field("encryption", &self.inner.keys.mode())
            .field("session_pool", &self.inner.session_pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn test_config() -> TransportConfig {
        let mut config = TransportConfig::default();
        config.network.port = 0;
        config.request_handler_pool.num_channels = 2;
        config.pools.session.min = 1;
        config.pools.session.max = 1;
        config
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = test_config();
        config.network.max_connection = 0;
        assert!(matches!(Transport::new(config), Err(AppError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn session_lifecycle_events() {
        let server = Transport::new(test_config()).unwrap();
        let listener = server
            .listen(server.config().network.listen_address().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Transport::new(test_config()).unwrap();
        let established = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(AtomicUsize::new(0));
        {
            let established = established.clone();
            let ended = ended.clone();
            client.subscribe(move |event| match event {
                TransportEvent::SessionEstablished(_) => {
                    established.fetch_add(1, Ordering::SeqCst);
                }
                TransportEvent::SessionEnded { cause, .. } => {
                    assert!(cause.is_none());
                    ended.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            });
        }

        let session = client.connect(addr).await.unwrap();
        assert!(session.is_running());
        assert_eq!(session.role(), Role::Client);
        assert_eq!(client.session_count(), 1);
        assert_eq!(client.live_connections(), 1);
        assert!(client.session(session.id()).is_some());

        client.close_session(&session).await;
        client.close_session(&session).await;
        session.closed().await;
        assert_eq!(client.session_count(), 0);
        assert_eq!(client.live_connections(), 0);
        assert_eq!(established.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        listener.stop().await;
    }

    #[tokio::test]
    async fn connect_to_nothing_fails() {
        let client = Transport::new(test_config()).unwrap();
        let unused = {
            let vacated = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            vacated.local_addr().unwrap()
        };
        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .connect_with(unused, move |result| {
                let _ = tx.send(result.map(|_| ()));
            })
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(AppError::TransportFailure(_))));
        assert_eq!(client.live_connections(), 0);
    }
}
