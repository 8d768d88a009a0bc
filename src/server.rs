//! HTTP server, connection tracking and graceful shutdown.
//!
//! A [`Server`] owns the route table, the global middleware, the error
//! handlers and one TCP listener. Registration works before and after
//! [`start`](Server::start): every call swaps in a new router snapshot, and
//! each request runs against the snapshot current when it arrived.
//!
//! # Shutdown
//!
//! [`stop`](Server::stop) stops accepting, asks every open connection to
//! finish its in-flight request and close, then waits for all of them.
//! [`run`](Server::run) does the same on SIGTERM or Ctrl-C.

use std::collections::HashSet;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ServerConfig;
use crate::error::{BodyError, Error};
use crate::events::{self, Event, Listeners, Subscription};
use crate::handler::{ErrorHandler, Layer};
use crate::request::{Protocol, Request};
use crate::response::{Reply, Response};
use crate::router::Router;

// ── Events ────────────────────────────────────────────────────────────────────

/// Lifecycle notifications raised by a [`Server`].
#[derive(Debug)]
pub enum ServerEvent {
    Start(SocketAddr),
    Stop,
    /// A transport-level failure. The listener keeps running.
    Error(Arc<Error>),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ServerEventKind {
    Start,
    Stop,
    Error,
}

impl Event for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Start(_) => ServerEventKind::Start,
            Self::Stop     => ServerEventKind::Stop,
            Self::Error(_) => ServerEventKind::Error,
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// The HTTP server.
pub struct Server {
    config: ServerConfig,
    router: Arc<ArcSwap<Router>>,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

/// State visible to the accept loop and every connection task.
struct Shared {
    connections: Mutex<HashSet<String>>,
    last_error: Mutex<Option<Arc<Error>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    listeners: Mutex<Listeners<ServerEvent>>,
    running: AtomicBool,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let router = Router::new().development(config.development);
        Self {
            config,
            router: Arc::new(ArcSwap::from_pointee(router)),
            shared: Arc::new(Shared {
                connections: Mutex::new(HashSet::new()),
                last_error: Mutex::new(None),
                local_addr: Mutex::new(None),
                listeners: Mutex::new(Listeners::new()),
                running: AtomicBool::new(false),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Configures the server to listen on `addr` (`host:port`) with default
    /// settings otherwise.
    ///
    /// ```rust
    /// use aero::Server;
    /// let server = Server::bind("0.0.0.0:3000").unwrap();
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| Error::Addr(addr.to_owned()))?;
        let port = port.parse().map_err(|_| Error::Addr(addr.to_owned()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Addr(addr.to_owned()));
        }
        Ok(Self::new(ServerConfig { host: host.to_owned(), port, ..ServerConfig::default() }))
    }

    pub fn config(&self) -> &ServerConfig { &self.config }

    /// The router snapshot the next request will run against.
    pub fn router(&self) -> Arc<Router> {
        self.router.load_full()
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Appends a global middleware layer.
    pub fn use_middleware(&self, layer: Layer) -> &Self {
        self.router.rcu(|r| Router::clone(r).use_middleware(layer.clone()));
        self
    }

    /// Appends an error handler.
    pub fn on_error(&self, handler: impl ErrorHandler) -> &Self {
        let handler = handler.into_boxed_error_handler();
        self.router.rcu(|r| Router::clone(r).on_error_boxed(Arc::clone(&handler)));
        self
    }

    /// Registers a handler chain under `METHOD:path`, replacing any chain
    /// already registered there.
    pub fn add_route(&self, method: &str, path: &str, handlers: impl IntoIterator<Item = Layer>) -> &Self {
        let handlers: Vec<Layer> = handlers.into_iter().collect();
        self.router.rcu(|r| Router::clone(r).route(method, path, handlers.clone()));
        self
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Binds the listener and starts accepting connections in the background.
    /// Resolves with the bound address. A bind failure is also kept as
    /// [`last_error`](Self::last_error) and raised as [`ServerEvent::Error`].
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let listener = match TcpListener::bind((self.config.host.as_str(), self.config.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(host = %self.config.host, port = self.config.port, "bind failed: {e}");
                self.shared.record(Error::Io(io::Error::new(e.kind(), e.to_string())));
                return Err(Error::Io(e));
            }
        };
        let addr = listener.local_addr()?;
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.router),
            Arc::clone(&self.shared),
            signal,
        ));

        *running = Some(Running { shutdown, task });
        *lock(&self.shared.local_addr) = Some(addr);
        self.shared.running.store(true, Ordering::SeqCst);

        info!(%addr, "aero listening");
        self.shared.emit(&ServerEvent::Start(addr));
        Ok(addr)
    }

    /// Stops accepting, drains open connections and resolves once they are
    /// all closed. Fails with [`Error::NotRunning`] if the server is not
    /// started.
    pub async fn stop(&self) -> Result<(), Error> {
        let running = self.running.lock().await.take().ok_or(Error::NotRunning)?;

        running.shutdown.send_replace(true);
        if let Err(e) = running.task.await {
            error!("accept loop ended abnormally: {e}");
        }

        *lock(&self.shared.local_addr) = None;
        self.shared.running.store(false, Ordering::SeqCst);

        info!("aero stopped");
        self.shared.emit(&ServerEvent::Stop);
        Ok(())
    }

    /// Starts, then runs until SIGTERM or Ctrl-C and stops gracefully.
    pub async fn run(&self) -> Result<(), Error> {
        self.start().await?;
        shutdown_signal().await;
        info!("shutdown signal received");
        self.stop().await
    }

    // ── State ─────────────────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Open connections as `remoteAddress:remotePort`.
    pub fn connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.connections).iter().cloned().collect();
        ids.sort();
        ids
    }

    /// The most recent transport-level error.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        lock(&self.shared.last_error).clone()
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: ServerEventKind, listener: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).subscribe(kind, false, Arc::new(listener))
    }

    pub fn once<F>(&self, kind: ServerEventKind, listener: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).subscribe(kind, true, Arc::new(listener))
    }

    pub fn off(&self, sub: Subscription) -> bool {
        lock(&self.shared.listeners).unsubscribe(sub)
    }
}

impl Shared {
    fn emit(&self, event: &ServerEvent) {
        let listeners = lock(&self.listeners).take_for(event.kind());
        events::dispatch(listeners, event);
    }

    /// Transport failures never stop the listener.
    fn record(&self, err: Error) {
        let err = Arc::new(err);
        *lock(&self.last_error) = Some(Arc::clone(&err));
        self.emit(&ServerEvent::Error(err));
    }
}

/// Keeps a connection id in the open set for as long as it lives.
struct Tracked {
    id: String,
    shared: Arc<Shared>,
}

impl Tracked {
    fn open(shared: &Arc<Shared>, peer: SocketAddr) -> Self {
        let id = format!("{}:{}", peer.ip(), peer.port());
        lock(&shared.connections).insert(id.clone());
        Self { id, shared: Arc::clone(shared) }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        lock(&self.shared.connections).remove(&self.id);
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    router: Arc<ArcSwap<Router>>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Every connection task, so shutdown can wait for them.
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            // Check shutdown first so a stop request wins over queued accepts.
            biased;

            _ = shutdown.changed() => {
                info!(in_flight = tasks.len(), "draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        shared.record(Error::Io(e));
                        continue;
                    }
                };

                let tracked = Tracked::open(&shared, peer);
                let router = Arc::clone(&router);
                let shared = Arc::clone(&shared);
                let mut shutdown = shutdown.clone();

                tasks.spawn(async move {
                    let _tracked = tracked;

                    // Called once per request on the connection. Each request
                    // loads the router snapshot current at that moment.
                    let svc = service_fn(move |req| {
                        let router = router.load_full();
                        async move { dispatch(router, req, peer).await }
                    });

                    let builder = ConnBuilder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(stream), svc);
                    tokio::pin!(conn);

                    let result = tokio::select! {
                        res = conn.as_mut() => res,
                        _ = shutdown.changed() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(e) = result {
                        error!(%peer, "connection error: {e}");
                        shared.record(Error::Connection(e));
                    }
                });
            }

            // Reap finished connection tasks so the set does not grow without bound.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    while tasks.join_next().await.is_some() {}
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Runs one request through the router and returns whatever it flushed.
///
/// The error type is [`Infallible`]: every failure has already been turned
/// into a response by the time we get here.
async fn dispatch(
    router: Arc<Router>,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
) -> Result<Reply, Infallible> {
    let (parts, body) = req.into_parts();
    let request = Request::new(parts, peer, Protocol::Http);
    let (response, flushed) = Response::channel();
    let span = info_span!("request", method = %request.method(), path = request.path());

    // The body streams in while the pipeline runs; handlers that need it
    // wait with `Request::received`.
    tokio::spawn(receive_body(request.clone(), body));

    async {
        router.handle(request, response.clone()).await;
        if !response.headers_sent() {
            warn!("handler chain finished without sending a response");
            response.send(Bytes::new());
        }
    }
    .instrument(span.clone())
    .await;

    let reply = flushed.await.unwrap_or_else(|_| {
        let mut reply = http::Response::new(Full::default());
        *reply.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
        reply
    });
    span.in_scope(|| debug!(status = reply.status().as_u16(), "response flushed"));
    Ok(reply)
}

async fn receive_body(request: Request, mut body: Incoming) {
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                // Trailers are not part of the body.
                if let Ok(chunk) = frame.into_data() {
                    request.push_chunk(chunk);
                }
            }
            Err(e) => {
                request.fail(BodyError::Stream(e.to_string()));
                request.close();
                return;
            }
        }
    }
    request.finish();
    request.close();
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C). On Windows only Ctrl-C
/// is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_parses_host_and_port() {
        let server = Server::bind("127.0.0.1:8080").unwrap();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 8080);

        let server = Server::bind("[::1]:9000").unwrap();
        assert_eq!(server.config().host, "::1");

        assert!(matches!(Server::bind("localhost"), Err(Error::Addr(_))));
        assert!(matches!(Server::bind("localhost:http"), Err(Error::Addr(_))));
        assert!(matches!(Server::bind(":80"), Err(Error::Addr(_))));
    }

    #[test]
    fn registration_swaps_the_router() {
        let server = Server::new(ServerConfig::default());
        let before = server.router();

        server
            .add_route("get", "/a", [])
            .add_route("POST", "/b", [])
            .add_route("GET", "/a", []);

        assert_eq!(before.routes().count(), 0);
        assert_eq!(server.router().routes().collect::<Vec<_>>(), ["GET:/a", "POST:/b"]);
    }

    #[tokio::test]
    async fn stop_before_start_fails() {
        let server = Server::new(ServerConfig::default());
        assert!(matches!(server.stop().await, Err(Error::NotRunning)));
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn tracked_connection_leaves_the_set_on_drop() {
        let server = Server::new(ServerConfig::default());
        let tracked = Tracked::open(&server.shared, "10.0.0.1:5555".parse().unwrap());
        assert_eq!(server.connections(), ["10.0.0.1:5555"]);
        drop(tracked);
        assert!(server.connections().is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_recorded_and_announced() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        let server = Server::new(ServerConfig { host: "127.0.0.1".into(), port, development: false });
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        server.on(ServerEventKind::Error, move |ev| {
            flag.store(matches!(ev, ServerEvent::Error(e) if matches!(**e, Error::Io(_))), Ordering::SeqCst);
        });

        assert!(matches!(server.start().await, Err(Error::Io(_))));

        assert!(seen.load(Ordering::SeqCst));
        assert!(matches!(server.last_error().as_deref(), Some(Error::Io(_))));
        assert!(!server.is_running());
        assert!(matches!(server.stop().await, Err(Error::NotRunning)));
    }

    #[test]
    fn recorded_errors_are_kept_and_announced() {
        let server = Server::new(ServerConfig::default());
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        server.on(ServerEventKind::Error, move |ev| {
            flag.store(matches!(ev, ServerEvent::Error(_)), Ordering::SeqCst);
        });

        server.shared.record(Error::msg("socket reset"));

        assert!(seen.load(Ordering::SeqCst));
        assert_eq!(server.last_error().unwrap().to_string(), "socket reset");
    }
}
