//! # Socket Wrapper
//!
//! The `SocketWrapper` owns the listening socket for the whole life of a service.
//! Application instances come and go; the wrapper outlives all of them.
//!
//! ## Handler Slot
//!
//! Incoming requests are dispatched through a single slot holding the router of
//! the generation that currently owns the socket. Rebinding is one atomic store,
//! so there is never a moment where the socket has no handler.
//!
//! ## Close Guard
//!
//! `close`, `close_idle_connections` and `force_close_all_connections` are no-ops
//! until the closing signal is raised. The signal is raised by the release that
//! brings the live generation count to zero, which only happens when the
//! service itself is stopped.
//!
//! ## Connections
//!
//! The wrapper runs its own accept loop and tracks every connection task, so
//! the three ways of ending them stay distinct:
//!
//! - `close` stops accepting and waits for open connections to end on their own.
//! - `close_idle_connections` asks every connection to finish the request it is
//!   serving and hang up. Idle keep-alive connections close at once.
//! - `force_close_all_connections` aborts every connection task, in-flight
//!   requests included.

use crate::config::Protocol;
use crate::error::RestartError;
use arc_swap::{ArcSwap, ArcSwapOption};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Generation number used for the empty binding.
const UNBOUND: u64 = 0;

/// Lifecycle notifications published by the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Listening(SocketAddr),
    Closed,
}

/// The router currently receiving requests and the generation it belongs to.
struct Binding {
    generation: u64,
    router: Router,
}

impl Binding {
    fn unbound() -> Self {
        Self {
            generation: UNBOUND,
            router: Router::new().fallback(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        }
    }
}

/// Signals from the wrapper to its serve task.
#[derive(Clone, Default)]
struct Signals {
    /// Stop accepting, then wait for the open connections.
    stop: CancellationToken,
    /// Ask every connection to finish its current request and close.
    drain: CancellationToken,
    /// Abort every connection.
    sever: CancellationToken,
}

struct Listening {
    addr: SocketAddr,
    signals: Signals,
    task: JoinHandle<()>,
}

/// Long-lived owner of the listening socket, shared by every generation.
pub struct SocketWrapper {
    protocol: Protocol,
    slot: Arc<ArcSwap<Binding>>,
    state: Mutex<Option<Listening>>,
    local_addr: ArcSwapOption<SocketAddr>,
    generations: AtomicUsize,
    closing: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<SocketEvent>,
}

impl SocketWrapper {
    pub fn new(protocol: Protocol) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            protocol,
            slot: Arc::new(ArcSwap::from_pointee(Binding::unbound())),
            state: Mutex::new(None),
            local_addr: ArcSwapOption::empty(),
            generations: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Bind the socket, or return the existing address if it is already listening.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, RestartError> {
        let mut state = self.state.lock().await;

        if let Some(listening) = state.as_ref() {
            debug!(addr = %listening.addr, "Already listening");
            return Ok(listening.addr);
        }

        if self.closed.load(Ordering::Acquire) {
            return Err(RestartError::InvalidOperation(
                "socket has been closed".to_string(),
            ));
        }

        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let signals = Signals::default();
        let task = tokio::spawn(serve(listener, self.slot.clone(), signals.clone()));

        *state = Some(Listening {
            addr: bound,
            signals,
            task,
        });
        self.local_addr.store(Some(Arc::new(bound)));
        let _ = self.events.send(SocketEvent::Listening(bound));
        info!(addr = %bound, protocol = %self.protocol, "Socket bound");

        Ok(bound)
    }

    /// Really close the socket, but only once the closing signal is raised.
    ///
    /// Stops accepting and waits for every open connection to end.
    pub async fn close(&self) -> Result<(), RestartError> {
        if !self.is_closing() {
            debug!(
                generations = self.live_generations(),
                "Close ignored, generations still live"
            );
            return Ok(());
        }

        let Some(listening) = self.state.lock().await.take() else {
            self.closed.store(true, Ordering::Release);
            return Ok(());
        };

        listening.signals.stop.cancel();
        let result = listening
            .task
            .await
            .map_err(|e| RestartError::from(io::Error::other(e)));

        self.local_addr.store(None);
        self.closed.store(true, Ordering::Release);
        let _ = self.events.send(SocketEvent::Closed);
        info!(addr = %listening.addr, "Socket closed");

        result
    }

    /// Idle keep-alive connections close now, busy ones after their current
    /// request. No-op unless the closing signal is raised.
    pub async fn close_idle_connections(&self) {
        if !self.is_closing() {
            return;
        }
        if let Some(listening) = self.state.lock().await.as_ref() {
            debug!(addr = %listening.addr, "Closing idle connections");
            listening.signals.drain.cancel();
        }
    }

    /// Abort every open connection, in-flight requests included.
    /// No-op unless the closing signal is raised.
    pub async fn force_close_all_connections(&self) {
        if !self.is_closing() {
            return;
        }
        if let Some(listening) = self.state.lock().await.as_ref() {
            warn!(addr = %listening.addr, "Force closing all connections");
            listening.signals.sever.cancel();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr.load().is_some()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RestartError> {
        self.local_addr
            .load()
            .as_deref()
            .copied()
            .ok_or(RestartError::NotListening)
    }

    pub fn address(&self) -> Result<IpAddr, RestartError> {
        self.local_addr().map(|addr| addr.ip())
    }

    pub fn port(&self) -> Result<u16, RestartError> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Bind `router` as the active handler and return the generation it replaced.
    pub fn bind(&self, generation: u64, router: Router) -> u64 {
        let previous = self.slot.swap(Arc::new(Binding { generation, router }));
        debug!(generation, previous = previous.generation, "Handler bound");
        previous.generation
    }

    /// Remove the handler bound by `generation`, if it is still bound.
    ///
    /// Returns false when another generation owns the slot.
    pub fn detach(&self, generation: u64) -> bool {
        let current = self.slot.load();
        if current.generation != generation || generation == UNBOUND {
            return false;
        }
        let previous = self
            .slot
            .compare_and_swap(&*current, Arc::new(Binding::unbound()));
        let detached = Arc::ptr_eq(&*previous, &*current);
        if detached {
            debug!(generation, "Handler detached");
        }
        detached
    }

    /// Generation whose router currently receives requests (0 when none).
    pub fn bound_generation(&self) -> u64 {
        self.slot.load().generation
    }

    /// Register a new live generation. Returns the new count.
    pub fn acquire_generation(&self) -> usize {
        self.generations.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Retire a generation. Reaching zero raises the closing signal.
    pub fn release_generation(&self) -> usize {
        let previous = self
            .generations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);
        if remaining == 0 {
            self.closing.store(true, Ordering::Release);
            debug!("Last generation released, socket closing");
        }
        remaining
    }

    pub fn live_generations(&self) -> usize {
        self.generations.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }
}

async fn serve(listener: TcpListener, slot: Arc<ArcSwap<Binding>>, signals: Signals) {
    let app = Router::new().fallback(dispatch).with_state(slot);
    let mut connections = JoinSet::new();
    let mut severed = false;

    loop {
        tokio::select! {
            _ = signals.stop.cancelled() => break,
            _ = signals.sever.cancelled(), if !severed => {
                severed = true;
                connections.abort_all();
            }
            accepted = listener.accept() => match accepted {
                Ok((_, remote)) if severed => {
                    debug!(%remote, "Connection refused, socket severed");
                }
                Ok((stream, remote)) => {
                    debug!(%remote, "Connection accepted");
                    connections.spawn(serve_connection(stream, app.clone(), signals.drain.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    info!(connections = connections.len(), "Stopped accepting, waiting for connections");

    loop {
        tokio::select! {
            _ = signals.sever.cancelled(), if !severed => {
                severed = true;
                connections.abort_all();
            }
            next = connections.join_next() => {
                if next.is_none() {
                    break;
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, app: Router, drain: CancellationToken) {
    let builder = Builder::new(TokioExecutor::new());
    let connection =
        builder.serve_connection_with_upgrades(TokioIo::new(stream), TowerToHyperService::new(app));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = drain.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "Connection ended with an error");
    }
}

async fn dispatch(State(slot): State<Arc<ArcSwap<Binding>>>, request: Request<Body>) -> Response {
    let router = slot.load().router.clone();
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}
