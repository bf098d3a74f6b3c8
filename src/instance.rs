//! # Service Instances
//!
//! A [`ServiceInstance`] is one generation of the application: the router the
//! factory built, the configuration it was built with, and the per-instance
//! readiness and close callbacks.
//!
//! Factories never construct instances directly. They receive an
//! [`InstanceBuilder`], which carries the capabilities every generation gets
//! (the back-reference to the handle, the restart capability, the shared hook
//! registry) and produces the instance with [`InstanceBuilder::build`].
//!
//! ## Decorations
//!
//! Applications attach named JSON values to an instance with
//! [`InstanceBuilder::decorate`]. They are reachable through the handle's
//! proxy, next to three read-only properties every instance exposes:
//! `generation`, `restarted` and `closingRestartable`.

use crate::config::{ForceCloseConnections, ServiceConfig};
use crate::coordinator::Restarter;
use crate::error::{BoxError, RestartError};
use crate::handle::{HandleInner, Restartable};
use crate::hooks::HookRegistry;
use crate::proxy::{PropertyDescriptor, ProxyTarget};
use crate::socket::SocketWrapper;
use crate::RestartOptions;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use axum::Router;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::OnceCell;
use tower::ServiceExt;
use tracing::{debug, info, info_span, warn, Span};

const GENERATION: &str = "generation";
const RESTARTED: &str = "restarted";
const CLOSING_RESTARTABLE: &str = "closingRestartable";
const RESERVED: [&str; 3] = [GENERATION, RESTARTED, CLOSING_RESTARTABLE];

/// A named value attached to an instance.
#[derive(Debug, Clone)]
struct Decoration {
    value: Value,
    writable: bool,
    enumerable: bool,
}

impl Decoration {
    fn new(value: Value) -> Self {
        PropertyDescriptor::value(value).into()
    }
}

impl From<PropertyDescriptor> for Decoration {
    fn from(descriptor: PropertyDescriptor) -> Self {
        Self {
            value: descriptor.value,
            writable: descriptor.writable,
            enumerable: descriptor.enumerable,
        }
    }
}

/// Snapshot of an instance's lifecycle flags, handed to readiness and close callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleContext {
    pub generation: u64,
    pub restarted: bool,
    /// True when the service itself is shutting down, not just this generation.
    pub closing_restartable: bool,
}

/// A readiness or close callback, type-erased.
pub type LifecycleHook =
    Arc<dyn Fn(LifecycleContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Back-reference from any generation to the handle that owns it.
///
/// Weak, so instances never keep a stopped service alive. Unset while the
/// first generation is being built.
#[derive(Clone, Default)]
pub struct PersistentRef {
    cell: Arc<OnceLock<Weak<HandleInner>>>,
}

impl PersistentRef {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, inner: &Arc<HandleInner>) {
        if self.cell.set(Arc::downgrade(inner)).is_err() {
            debug!("Persistent reference already set");
        }
    }

    /// The handle, if it has been created and is still alive.
    pub fn upgrade(&self) -> Option<Restartable> {
        self.cell
            .get()
            .and_then(Weak::upgrade)
            .map(Restartable::from_inner)
    }
}

impl fmt::Debug for PersistentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentRef")
            .field("set", &self.cell.get().is_some())
            .finish()
    }
}

/// Registration capability handed to the application factory.
pub struct InstanceBuilder {
    generation: u64,
    restarted: bool,
    socket: Arc<SocketWrapper>,
    persistent: PersistentRef,
    restarter: Restarter,
    hooks: Arc<HookRegistry>,
    decorations: BTreeMap<String, Decoration>,
    ready_hooks: Vec<LifecycleHook>,
    close_hooks: Vec<LifecycleHook>,
}

impl InstanceBuilder {
    pub(crate) fn new(
        generation: u64,
        restarted: bool,
        socket: Arc<SocketWrapper>,
        persistent: PersistentRef,
        restarter: Restarter,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            generation,
            restarted,
            socket,
            persistent,
            restarter,
            hooks,
            decorations: BTreeMap::new(),
            ready_hooks: Vec::new(),
            close_hooks: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restarted(&self) -> bool {
        self.restarted
    }

    pub fn persistent_ref(&self) -> PersistentRef {
        self.persistent.clone()
    }

    /// Restart capability for use inside route handlers.
    pub fn restarter(&self) -> Restarter {
        self.restarter.clone()
    }

    /// Attach a named value to the instance. Reserved names are ignored.
    pub fn decorate(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if RESERVED.contains(&key.as_str()) {
            warn!(%key, "Ignoring decoration with a reserved name");
            return self;
        }
        self.decorations.insert(key, Decoration::new(value));
        self
    }

    /// Run `hook` when the instance becomes ready. A failure fails the build.
    pub fn on_ready<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LifecycleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ready_hooks.push(erase(hook));
        self
    }

    /// Run `hook` when the instance is closed, on retirement or service shutdown.
    pub fn on_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LifecycleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.close_hooks.push(erase(hook));
        self
    }

    pub fn build(self, config: ServiceConfig, router: Router) -> ServiceInstance {
        ServiceInstance {
            span: info_span!("service", generation = self.generation),
            generation: self.generation,
            restarted: self.restarted,
            config,
            router,
            decorations: RwLock::new(self.decorations),
            ready_hooks: self.ready_hooks,
            close_hooks: self.close_hooks,
            socket: self.socket,
            persistent: self.persistent,
            restarter: self.restarter,
            hooks: self.hooks,
            ready: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }
}

fn erase<F, Fut>(hook: F) -> LifecycleHook
where
    F: Fn(LifecycleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |context| hook(context).boxed())
}

/// One generation of the application.
pub struct ServiceInstance {
    generation: u64,
    restarted: bool,
    config: ServiceConfig,
    router: Router,
    decorations: RwLock<BTreeMap<String, Decoration>>,
    ready_hooks: Vec<LifecycleHook>,
    close_hooks: Vec<LifecycleHook>,
    socket: Arc<SocketWrapper>,
    persistent: PersistentRef,
    restarter: Restarter,
    hooks: Arc<HookRegistry>,
    span: Span,
    ready: OnceCell<Result<(), RestartError>>,
    closed: AtomicBool,
}

impl ServiceInstance {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restarted(&self) -> bool {
        self.restarted
    }

    /// True once the socket itself is being torn down.
    pub fn closing_restartable(&self) -> bool {
        self.socket.is_closing()
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn persistent_ref(&self) -> PersistentRef {
        self.persistent.clone()
    }

    pub fn restarter(&self) -> Restarter {
        self.restarter.clone()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `f` inside this instance's span.
    pub fn in_span<R>(&self, f: impl FnOnce() -> R) -> R {
        self.span.in_scope(f)
    }

    fn context(&self) -> LifecycleContext {
        LifecycleContext {
            generation: self.generation,
            restarted: self.restarted,
            closing_restartable: self.closing_restartable(),
        }
    }

    /// Run the readiness callbacks once. Later calls return the first outcome.
    pub async fn ready(&self) -> Result<(), RestartError> {
        self.ready
            .get_or_init(|| async {
                for hook in &self.ready_hooks {
                    if let Err(e) = hook(self.context()).await {
                        self.in_span(|| warn!(error = %e, "Ready callback failed"));
                        return Err(RestartError::build(e));
                    }
                }
                self.in_span(|| debug!("Ready"));
                Ok(())
            })
            .await
            .clone()
    }

    /// Make the instance ready and serve it on `addr`.
    ///
    /// The socket is shared, so a second generation "listening" on the bound
    /// address does not bind again.
    pub(crate) async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, RestartError> {
        self.ready().await?;
        let bound = self.socket.listen(addr).await?;
        let scheme = self.socket.protocol().scheme();
        self.in_span(|| info!("Server listening at {scheme}://{bound}"));
        Ok(bound)
    }

    /// Dispatch a request to this instance in-process, bypassing the socket.
    pub async fn inject(&self, request: Request<Body>) -> Response {
        match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    /// Close the instance: close callbacks, then the guarded socket close.
    ///
    /// Runs at most once. Close callback failures are logged.
    pub(crate) async fn close(&self) -> Result<(), RestartError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let context = self.context();
        for hook in &self.close_hooks {
            if let Err(e) = hook(context).await {
                self.in_span(|| warn!(error = %e, "Close callback failed"));
            }
        }

        if self.socket.is_closing() {
            match self.config.force_close_connections {
                ForceCloseConnections::All => self.socket.force_close_all_connections().await,
                ForceCloseConnections::Idle => self.socket.close_idle_connections().await,
                ForceCloseConnections::Never => {}
            }
        }
        let result = self.socket.close().await;
        self.in_span(|| debug!(closing_restartable = context.closing_restartable, "Closed"));
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Restart the service this instance belongs to.
    pub async fn restart(&self, options: RestartOptions) -> Result<(), RestartError> {
        self.restarter.restart(options).await
    }

    pub fn add_pre_restart_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<ServiceInstance>, RestartOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.add_pre_restart(hook);
    }

    pub fn add_on_restart_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<ServiceInstance>, RestartOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.add_on_restart(hook);
    }
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("generation", &self.generation)
            .field("restarted", &self.restarted)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProxyTarget for ServiceInstance {
    fn get(&self, key: &str) -> Option<Value> {
        match key {
            GENERATION => Some(json!(self.generation)),
            RESTARTED => Some(json!(self.restarted)),
            CLOSING_RESTARTABLE => Some(json!(self.closing_restartable())),
            _ => self
                .decorations
                .read()
                .get(key)
                .map(|decoration| decoration.value.clone()),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), RestartError> {
        if RESERVED.contains(&key) {
            return Err(RestartError::InvalidOperation(format!("{key} is read-only")));
        }
        let mut decorations = self.decorations.write();
        match decorations.get_mut(key) {
            Some(decoration) if !decoration.writable => {
                Err(RestartError::InvalidOperation(format!("{key} is read-only")))
            }
            Some(decoration) => {
                decoration.value = value;
                Ok(())
            }
            None => {
                decorations.insert(key.to_string(), Decoration::new(value));
                Ok(())
            }
        }
    }

    /// Replaces any existing decoration, read-only ones included.
    fn define(&self, key: &str, descriptor: PropertyDescriptor) -> Result<(), RestartError> {
        if RESERVED.contains(&key) {
            return Err(RestartError::InvalidOperation(format!("{key} is read-only")));
        }
        self.decorations
            .write()
            .insert(key.to_string(), descriptor.into());
        Ok(())
    }

    fn delete(&self, key: &str) -> bool {
        self.decorations.write().remove(key).is_some()
    }

    fn has(&self, key: &str) -> bool {
        RESERVED.contains(&key) || self.decorations.read().contains_key(key)
    }

    /// Hidden decorations are left out.
    fn keys(&self) -> Vec<String> {
        let decorations = self.decorations.read();
        RESERVED
            .iter()
            .map(|key| key.to_string())
            .chain(
                decorations
                    .iter()
                    .filter(|(_, decoration)| decoration.enumerable)
                    .map(|(key, _)| key.clone()),
            )
            .collect()
    }

    fn prototype(&self) -> &'static str {
        "ServiceInstance"
    }
}
