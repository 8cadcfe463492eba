//! The DNS transport module: lifecycle, endpoint cache, task plumbing.
//!
//! One `Module` owns up to two reliable endpoints — a client endpoint for
//! conversations it starts and a server endpoint for conversations
//! started by remote peers — plus the periodic tasks that keep them
//! ticking. Client endpoints are cached per remote host so sequence
//! numbers survive across calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use log::{info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::api::{Action, Node, RemoteResponse, Transport, Value};
use crate::channel::ReliableChannel;
use crate::config::DnsConfig;
use crate::debounce::Debouncer;
use crate::metrics::Metrics;
use crate::{TransportError, DEFAULT_BYTE_LIMIT};

/// Capacity of the segment queues and the response inbox.
pub(crate) const CHANNEL_CAPACITY: usize = 200;

/// Cadence of the endpoint update tasks, both sides.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(15);

/// Cadence of the client's DNS feed loop.
pub(crate) const FEED_INTERVAL: Duration = Duration::from_millis(20);

/// Trailing edge of the receive-drain debouncers.
pub(crate) const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(20);

/// Default bound on the wait for an RPC response.
pub(crate) const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on iterations of the post-stop ACK flush. Each iteration
/// is one DNS exchange; a dead peer would otherwise keep the flush loop
/// retransmitting forever.
const ACK_FLUSH_LIMIT: usize = 100;

pub(crate) type Endpoint = Arc<AsyncMutex<ReliableChannel>>;

/// DNS implementation of a transport module.
#[derive(Clone)]
pub struct Module {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) node: Arc<dyn Node>,

    is_running_client: AtomicBool,
    is_running_server: AtomicBool,
    pub(crate) admin_mode: AtomicBool,
    byte_limit: AtomicI64,
    rpc_timeout_ms: AtomicU64,

    client_conv: u32,
    server_conv: u32,

    listen_str: StdMutex<String>,
    upstream_str: StdMutex<String>,

    client_endpoint: StdMutex<Option<Endpoint>>,
    server_endpoint: StdMutex<Option<Endpoint>>,
    clients_by_host: StdMutex<HashMap<String, Endpoint>>,

    pub(crate) upstream_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) upstream_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    pub(crate) downstream_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) downstream_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    pub(crate) resp_tx: mpsc::Sender<RemoteResponse>,
    pub(crate) resp_rx: AsyncMutex<mpsc::Receiver<RemoteResponse>>,

    pub(crate) debounced_client_update: Debouncer,
    pub(crate) debounced_server_update: Debouncer,

    client_tasks: StdMutex<Vec<JoinHandle<()>>>,
    server_tasks: StdMutex<Vec<JoinHandle<()>>>,
    listener_shutdown: StdMutex<CancellationToken>,

    pub(crate) client_metrics: Metrics,
    pub(crate) server_metrics: Metrics,
}

impl Module {
    /// Create a module bound to `node`.
    ///
    /// The conv values tag the two reliable conversations; both sides of
    /// a link must agree on them crosswise (our client conv is the
    /// remote's server conv). Must be called within a Tokio runtime.
    pub fn new(node: Arc<dyn Node>, client_conv: u32, server_conv: u32) -> Self {
        let (upstream_tx, upstream_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (downstream_tx, downstream_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (resp_tx, resp_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let for_client = weak.clone();
            let for_server = weak.clone();
            Inner {
                node,
                is_running_client: AtomicBool::new(false),
                is_running_server: AtomicBool::new(false),
                admin_mode: AtomicBool::new(false),
                byte_limit: AtomicI64::new(DEFAULT_BYTE_LIMIT),
                rpc_timeout_ms: AtomicU64::new(DEFAULT_RPC_TIMEOUT.as_millis() as u64),
                client_conv,
                server_conv,
                listen_str: StdMutex::new(String::new()),
                upstream_str: StdMutex::new(String::new()),
                client_endpoint: StdMutex::new(None),
                server_endpoint: StdMutex::new(None),
                clients_by_host: StdMutex::new(HashMap::new()),
                upstream_tx,
                upstream_rx: AsyncMutex::new(upstream_rx),
                downstream_tx,
                downstream_rx: AsyncMutex::new(downstream_rx),
                resp_tx,
                resp_rx: AsyncMutex::new(resp_rx),
                debounced_client_update: Debouncer::new(DEBOUNCE_INTERVAL, move || {
                    let weak = for_client.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            Module { inner }.client_update().await;
                        }
                    }
                }),
                debounced_server_update: Debouncer::new(DEBOUNCE_INTERVAL, move || {
                    let weak = for_server.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            Module { inner }.server_update().await;
                        }
                    }
                }),
                client_tasks: StdMutex::new(Vec::new()),
                server_tasks: StdMutex::new(Vec::new()),
                listener_shutdown: StdMutex::new(CancellationToken::new()),
                client_metrics: Metrics::new("client"),
                server_metrics: Metrics::new("server"),
            }
        });
        Self { inner }
    }

    /// Create a module from its deserialized configuration.
    pub fn from_config(node: Arc<dyn Node>, config: &DnsConfig) -> Self {
        let module = Self::new(node, config.client_conv, config.server_conv);
        *module.inner.upstream_str.lock().unwrap() = config.upstream_str.clone();
        *module.inner.listen_str.lock().unwrap() = config.listen_str.clone();
        module
    }

    /// Snapshot the module back into its configuration form.
    pub fn to_config(&self) -> DnsConfig {
        DnsConfig {
            transport: "dns".to_string(),
            listen_str: self.inner.listen_str.lock().unwrap().clone(),
            upstream_str: self.upstream_str(),
            client_conv: self.inner.client_conv,
            server_conv: self.inner.server_conv,
        }
    }

    pub fn is_running_client(&self) -> bool {
        self.inner.is_running_client.load(Ordering::SeqCst)
    }

    fn set_running_client(&self, running: bool) {
        self.inner.is_running_client.store(running, Ordering::SeqCst);
    }

    pub fn is_running_server(&self) -> bool {
        self.inner.is_running_server.load(Ordering::SeqCst)
    }

    fn set_running_server(&self, running: bool) {
        self.inner.is_running_server.store(running, Ordering::SeqCst);
    }

    pub(crate) fn upstream_str(&self) -> String {
        self.inner.upstream_str.lock().unwrap().clone()
    }

    pub(crate) fn set_upstream_str(&self, host: &str) {
        *self.inner.upstream_str.lock().unwrap() = host.to_string();
    }

    pub(crate) fn client_endpoint(&self) -> Option<Endpoint> {
        self.inner.client_endpoint.lock().unwrap().clone()
    }

    pub(crate) fn server_endpoint(&self) -> Option<Endpoint> {
        self.inner.server_endpoint.lock().unwrap().clone()
    }

    pub(crate) fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.rpc_timeout_ms.load(Ordering::Relaxed))
    }

    /// Bound the wait for an RPC response; expiry surfaces
    /// [`TransportError::Timeout`].
    pub fn set_rpc_timeout(&self, timeout: Duration) {
        self.inner
            .rpc_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Open the UDP listener and start answering queries.
    ///
    /// Admin listeners dispatch into the node's privileged RPC surface.
    pub async fn listen(&self, listen: &str, admin_mode: bool) -> Result<(), TransportError> {
        *self.inner.listen_str.lock().unwrap() = listen.to_string();
        self.inner.admin_mode.store(admin_mode, Ordering::SeqCst);

        let endpoint: Endpoint = Arc::new(AsyncMutex::new(
            ReliableChannel::new(self.inner.server_conv, self.inner.downstream_tx.clone())
                .map_err(|e| TransportError::Channel(e.to_string()))?,
        ));
        *self.inner.server_endpoint.lock().unwrap() = Some(Arc::clone(&endpoint));

        let socket = UdpSocket::bind(listen)
            .await
            .map_err(TransportError::ListenFailed)?;
        let socket = Arc::new(socket);
        info!("dns transport listening on udp {listen}");

        self.set_running_server(true);

        let tick = {
            let module = self.clone();
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move {
                while module.is_running_server() {
                    sleep(TICK_INTERVAL).await;
                    let mut channel = endpoint.lock().await;
                    if let Err(e) = channel.update() {
                        warn!("server endpoint update: {e}");
                    }
                }
                info!("server update loop stopped");
            })
        };

        let shutdown = CancellationToken::new();
        *self.inner.listener_shutdown.lock().unwrap() = shutdown.clone();

        let reader = {
            let module = self.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = socket.recv_from(&mut buf) => {
                            let (n, peer) = match received {
                                Ok(pair) => pair,
                                Err(e) => {
                                    warn!("udp recv: {e}");
                                    continue;
                                }
                            };
                            let request = match Message::from_vec(&buf[..n]) {
                                Ok(message) => message,
                                Err(e) => {
                                    warn!("dropping malformed dns message from {peer}: {e}");
                                    continue;
                                }
                            };
                            let module = module.clone();
                            let socket = Arc::clone(&socket);
                            tokio::spawn(async move {
                                let reply = module.handle_dns(&request).await;
                                match reply.to_vec() {
                                    Ok(wire) => {
                                        if let Err(e) = socket.send_to(&wire, peer).await {
                                            warn!("reply to {peer} failed: {e}");
                                        }
                                    }
                                    Err(e) => warn!("reply encode failed: {e}"),
                                }
                                module.inner.debounced_server_update.trigger();
                            });
                        }
                    }
                }
                info!("dns listener stopped");
            })
        };

        let mut tasks = self.inner.server_tasks.lock().unwrap();
        tasks.push(tick);
        tasks.push(reader);
        Ok(())
    }

    /// Stop the server side and release the listener.
    pub async fn stop(&self) {
        self.stop_server().await;
    }

    async fn stop_server(&self) {
        if !self.is_running_server() {
            return;
        }
        self.set_running_server(false);
        self.inner.listener_shutdown.lock().unwrap().cancel();
        let handles: Vec<JoinHandle<()>> =
            self.inner.server_tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.server_metrics.log_summary();
    }

    /// Look up or create the client endpoint for the current upstream.
    ///
    /// The cache persists for the module's lifetime so a reconnect to the
    /// same host resumes the existing sequence-number state.
    pub(crate) fn init_client(&self) -> Result<Endpoint, TransportError> {
        let upstream = self.upstream_str();
        if upstream.is_empty() {
            return Err(TransportError::UpstreamNotSet);
        }

        let mut by_host = self.inner.clients_by_host.lock().unwrap();
        let endpoint = match by_host.get(&upstream) {
            Some(existing) => Arc::clone(existing),
            None => {
                let channel =
                    ReliableChannel::new(self.inner.client_conv, self.inner.upstream_tx.clone())
                        .map_err(|e| TransportError::Channel(e.to_string()))?;
                let endpoint: Endpoint = Arc::new(AsyncMutex::new(channel));
                by_host.insert(upstream, Arc::clone(&endpoint));
                endpoint
            }
        };
        *self.inner.client_endpoint.lock().unwrap() = Some(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Start the client tick and feed loops.
    pub(crate) fn start_client(&self, endpoint: Endpoint) {
        if self.is_running_client() {
            return;
        }
        info!("starting client");
        self.set_running_client(true);

        let tick = {
            let module = self.clone();
            tokio::spawn(async move {
                while module.is_running_client() {
                    sleep(TICK_INTERVAL).await;
                    let mut channel = endpoint.lock().await;
                    if let Err(e) = channel.update() {
                        warn!("client endpoint update: {e}");
                    }
                }
                info!("client update loop stopped");
            })
        };

        let feed = {
            let module = self.clone();
            tokio::spawn(async move {
                while module.is_running_client() {
                    module.feed_upstream(true).await;
                    sleep(FEED_INTERVAL).await;
                }
                info!("feed loop stopped");
            })
        };

        let mut tasks = self.inner.client_tasks.lock().unwrap();
        tasks.push(tick);
        tasks.push(feed);
    }

    /// Stop the client loops, then keep feeding without probes until the
    /// outbound queue drains. Those trailing segments are the ACKs the
    /// remote endpoint is still waiting on.
    pub(crate) async fn stop_client(&self) {
        if !self.is_running_client() {
            return;
        }
        info!("stopping client");
        self.set_running_client(false);
        let handles: Vec<JoinHandle<()>> =
            self.inner.client_tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(endpoint) = self.client_endpoint() {
            {
                // surface any ACKs still sitting in the endpoint
                let mut channel = endpoint.lock().await;
                if let Err(e) = channel.flush() {
                    warn!("client endpoint flush: {e}");
                }
            }
            let mut rounds = 0;
            while self.feed_upstream(false).await {
                rounds += 1;
                if rounds >= ACK_FLUSH_LIMIT {
                    warn!("ack flush abandoned after {rounds} rounds");
                    break;
                }
                sleep(FEED_INTERVAL).await;
                let mut channel = endpoint.lock().await;
                if let Err(e) = channel.update() {
                    warn!("client endpoint update: {e}");
                    break;
                }
            }
        }

        self.inner.upstream_str.lock().unwrap().clear();
        self.inner.client_metrics.log_summary();
        info!("client stopped");
    }
}

#[async_trait]
impl Transport for Module {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn listen(&self, listen: &str, admin_mode: bool) -> Result<(), TransportError> {
        Module::listen(self, listen, admin_mode).await
    }

    async fn rpc(
        &self,
        host: &str,
        action: Action,
        args: Vec<Value>,
    ) -> Result<Option<Value>, TransportError> {
        Module::rpc(self, host, action, args).await
    }

    async fn stop(&self) {
        Module::stop(self).await;
    }

    fn byte_limit(&self) -> i64 {
        self.inner.byte_limit.load(Ordering::Relaxed)
    }

    fn set_byte_limit(&self, limit: i64) {
        self.inner.byte_limit.store(limit, Ordering::Relaxed);
    }
}
