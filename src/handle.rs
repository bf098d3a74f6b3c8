//! # Persistent Handle
//!
//! [`Restartable`] is the reference callers hold. It is cheap to clone and its
//! identity never changes: every clone, and the back-reference every generation
//! carries, points at the same handle for the life of the service.
//!
//! Reads go through the proxy to whichever instance is current. Anything that
//! changes which instance is current goes through the coordinator.

use crate::config::{BindOptions, ServiceConfig};
use crate::coordinator::{self, CoordinatorClient, CoordinatorState, RestartCoordinator};
use crate::error::{BoxError, RestartError};
use crate::factory::AppFactory;
use crate::hooks::HookRegistry;
use crate::instance::{InstanceBuilder, PersistentRef, ServiceInstance};
use crate::proxy::MutableProxy;
use crate::socket::{SocketEvent, SocketWrapper};
use crate::RestartOptions;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

pub(crate) struct HandleInner {
    proxy: Arc<MutableProxy<ServiceInstance>>,
    client: CoordinatorClient,
    socket: Arc<SocketWrapper>,
    hooks: Arc<HookRegistry>,
}

/// A live-swappable service.
#[derive(Clone)]
pub struct Restartable {
    inner: Arc<HandleInner>,
}

impl Restartable {
    /// Build the first generation and start the coordinator.
    ///
    /// Fails with `UnknownProtocol` before anything is built if the configured
    /// protocol is not supported, and with `BuildFailure` if the first build
    /// or its readiness fails.
    #[instrument(skip_all)]
    pub async fn new(
        factory: impl AppFactory,
        config: ServiceConfig,
    ) -> Result<Self, RestartError> {
        let protocol = config.protocol()?;
        let factory: Arc<dyn AppFactory> = Arc::new(factory);
        let socket = Arc::new(SocketWrapper::new(protocol));
        let hooks = Arc::new(HookRegistry::new());
        let persistent = PersistentRef::new();
        let (client, receiver) = coordinator::channel();
        let restarter = client.restarter();

        socket.acquire_generation();
        let builder = InstanceBuilder::new(
            1,
            false,
            socket.clone(),
            persistent.clone(),
            restarter.clone(),
            hooks.clone(),
        );
        let instance = factory
            .create(builder, config, None)
            .await
            .map_err(RestartError::build)?;
        if let Err(e) = instance.ready().await {
            socket.release_generation();
            if let Err(close_error) = instance.close().await {
                warn!(error = %close_error, "Failed to close rejected first instance");
            }
            return Err(e);
        }

        socket.bind(instance.generation(), instance.router());
        let config = instance.config().clone();
        let proxy = Arc::new(MutableProxy::new(Arc::new(instance)));

        let inner = Arc::new(HandleInner {
            proxy: proxy.clone(),
            client,
            socket: socket.clone(),
            hooks: hooks.clone(),
        });
        persistent.set(&inner);

        let coordinator = RestartCoordinator::new(
            receiver,
            CoordinatorState {
                factory,
                socket,
                hooks,
                proxy,
                persistent,
                restarter,
                config,
                next_generation: 2,
            },
        );
        tokio::spawn(coordinator.run());
        info!(%protocol, "Service created");

        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    /// The current instance.
    pub fn app(&self) -> Arc<ServiceInstance> {
        self.inner.proxy.target()
    }

    pub fn proxy(&self) -> &MutableProxy<ServiceInstance> {
        &self.inner.proxy
    }

    /// Replace the current instance with a freshly built one.
    ///
    /// Concurrent calls share one build and one result.
    pub async fn restart(&self, options: RestartOptions) -> Result<(), RestartError> {
        self.inner.client.restart(options).await
    }

    /// Bind the shared socket. Listening again returns the existing address.
    pub async fn listen(&self, options: BindOptions) -> Result<SocketAddr, RestartError> {
        let addr = options.resolve()?;
        self.inner.client.listen(addr).await
    }

    /// Close the current instance and the socket. Closing twice is not an error.
    pub async fn close(&self) -> Result<(), RestartError> {
        match self.inner.client.close().await {
            Err(e) if e.is_closed() && self.inner.socket.is_closing() => Ok(()),
            result => result,
        }
    }

    pub async fn stop(&self) -> Result<(), RestartError> {
        self.close().await
    }

    /// Dispatch a request to the current instance without going through the socket.
    pub async fn inject(&self, request: Request<Body>) -> Response {
        self.app().inject(request).await
    }

    pub fn restarted(&self) -> bool {
        self.app().restarted()
    }

    pub fn closing_restartable(&self) -> bool {
        self.inner.socket.is_closing()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.socket.is_listening()
    }

    pub fn address(&self) -> Result<IpAddr, RestartError> {
        self.inner.socket.address()
    }

    pub fn port(&self) -> Result<u16, RestartError> {
        self.inner.socket.port()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RestartError> {
        self.inner.socket.local_addr()
    }

    pub fn url(&self) -> Result<String, RestartError> {
        let addr = self.local_addr()?;
        Ok(format!("{}://{}", self.inner.socket.protocol().scheme(), addr))
    }

    pub fn add_pre_restart_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<ServiceInstance>, RestartOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.inner.hooks.add_pre_restart(hook);
    }

    pub fn add_on_restart_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<ServiceInstance>, RestartOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.inner.hooks.add_on_restart(hook);
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn persistent_ref(&self) -> PersistentRef {
        self.app().persistent_ref()
    }

    /// Socket lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.socket.subscribe()
    }

    pub fn live_generations(&self) -> usize {
        self.inner.socket.live_generations()
    }

    pub fn ptr_eq(&self, other: &Restartable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Restartable {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Restartable {}

impl fmt::Debug for Restartable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Restartable")
            .field("generation", &self.app().generation())
            .field("listening", &self.is_listening())
            .finish()
    }
}
