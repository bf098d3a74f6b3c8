use super::client::Restarter;
use super::message::{CoordinatorRequest, Response};
use crate::config::ServiceConfig;
use crate::error::RestartError;
use crate::factory::AppFactory;
use crate::hooks::HookRegistry;
use crate::instance::{InstanceBuilder, PersistentRef, ServiceInstance};
use crate::proxy::MutableProxy;
use crate::socket::SocketWrapper;
use crate::RestartOptions;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the coordinator owns besides its mailbox.
pub struct CoordinatorState {
    pub factory: Arc<dyn AppFactory>,
    pub socket: Arc<SocketWrapper>,
    pub hooks: Arc<HookRegistry>,
    pub proxy: Arc<MutableProxy<ServiceInstance>>,
    pub persistent: PersistentRef,
    pub restarter: Restarter,
    /// Configuration handed to the next build.
    pub config: ServiceConfig,
    pub next_generation: u64,
}

/// The actor that serializes restarts, listens and closes.
///
/// Only this task mutates the socket's handler slot and generation counter
/// once the service is running.
pub struct RestartCoordinator {
    receiver: mpsc::Receiver<CoordinatorRequest>,
    state: CoordinatorState,
}

impl RestartCoordinator {
    pub fn new(receiver: mpsc::Receiver<CoordinatorRequest>, state: CoordinatorState) -> Self {
        Self { receiver, state }
    }

    /// Processes requests until the service is closed or every client is gone.
    pub async fn run(mut self) {
        info!(
            generation = self.state.proxy.target().generation(),
            "Coordinator started"
        );
        let mut deferred: VecDeque<CoordinatorRequest> = VecDeque::new();
        let mut closed = false;

        loop {
            let request = match deferred.pop_front() {
                Some(request) => request,
                None => match self.receiver.recv().await {
                    Some(request) => request,
                    None => break,
                },
            };

            match request {
                CoordinatorRequest::Restart {
                    options,
                    respond_to,
                } => {
                    let mut waiters: Vec<Response<()>> = vec![respond_to];
                    let result = {
                        let attempt = self.state.restart(options);
                        tokio::pin!(attempt);
                        loop {
                            tokio::select! {
                                result = &mut attempt => break result,
                                Some(next) = self.receiver.recv() => match next {
                                    CoordinatorRequest::Restart { options, respond_to } => {
                                        debug!(
                                            coalesced = waiters.len(),
                                            ?options,
                                            "Restart coalesced, options dropped"
                                        );
                                        waiters.push(respond_to);
                                    }
                                    other => deferred.push_back(other),
                                },
                            }
                        }
                    };
                    if waiters.len() > 1 {
                        debug!(waiters = waiters.len(), "Delivering coalesced restart result");
                    }
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                }
                CoordinatorRequest::Listen { addr, respond_to } => {
                    let _ = respond_to.send(self.state.listen(addr).await);
                }
                CoordinatorRequest::Close { respond_to } => {
                    // A handler still draining may be waiting on a reply from this mailbox.
                    let mut also_closing: Vec<Response<()>> = Vec::new();
                    let result = {
                        let closing = self.state.shutdown();
                        tokio::pin!(closing);
                        loop {
                            tokio::select! {
                                result = &mut closing => break result,
                                Some(next) = self.receiver.recv() => match next {
                                    CoordinatorRequest::Close { respond_to } => {
                                        also_closing.push(respond_to);
                                    }
                                    other => {
                                        debug!("Request received while closing, rejected");
                                        reject(other);
                                    }
                                },
                            }
                        }
                    };
                    let _ = respond_to.send(result);
                    for waiter in also_closing {
                        let _ = waiter.send(Ok(()));
                    }
                    closed = true;
                    break;
                }
            }
        }

        if !closed {
            debug!("All clients dropped");
            if let Err(e) = self.state.shutdown().await {
                warn!(error = %e, "Shutdown failed");
            }
        }

        self.receiver.close();
        for request in deferred.drain(..) {
            reject(request);
        }
        while let Ok(request) = self.receiver.try_recv() {
            reject(request);
        }
    }
}

/// Answer a request that arrived after the service was closed.
fn reject(request: CoordinatorRequest) {
    match request {
        CoordinatorRequest::Restart { respond_to, .. } => {
            let _ = respond_to.send(Err(RestartError::CoordinatorClosed));
        }
        CoordinatorRequest::Listen { respond_to, .. } => {
            let _ = respond_to.send(Err(RestartError::CoordinatorClosed));
        }
        // Closing twice is not an error.
        CoordinatorRequest::Close { respond_to } => {
            let _ = respond_to.send(Ok(()));
        }
    }
}

impl CoordinatorState {
    fn builder(&mut self) -> InstanceBuilder {
        let generation = self.next_generation;
        self.next_generation += 1;
        InstanceBuilder::new(
            generation,
            true,
            self.socket.clone(),
            self.persistent.clone(),
            self.restarter.clone(),
            self.hooks.clone(),
        )
    }

    /// Build, hand off and retire. On failure the current instance stays in place.
    pub async fn restart(&mut self, options: RestartOptions) -> Result<(), RestartError> {
        let old = self.proxy.target();
        info!(generation = old.generation(), ?options, "Restart requested");

        self.hooks.run_pre_restart(&old, &options).await;

        let builder = self.builder();
        let generation = builder.generation();
        self.socket.acquire_generation();
        debug!(generation, "Building");

        let instance = match self
            .factory
            .create(builder, self.config.clone(), options.clone())
            .await
        {
            Ok(instance) => Arc::new(instance),
            Err(e) => {
                warn!(generation, error = %e, "Build failed, keeping current instance");
                self.socket.release_generation();
                return Err(RestartError::build(e));
            }
        };

        let prepared = match self.socket.local_addr() {
            Ok(addr) => instance.listen(addr).await.map(|_| ()),
            Err(_) => instance.ready().await,
        };
        if let Err(e) = prepared {
            warn!(generation, error = %e, "New instance not ready, rolling back");
            self.socket.detach(generation);
            if let Err(close_error) = self.retire(&instance).await {
                warn!(generation, error = %close_error, "Failed to close rejected instance");
            }
            return Err(match e {
                e @ RestartError::BuildFailure(_) => e,
                other => RestartError::build(other),
            });
        }

        debug!(generation, "Handing off");
        self.socket.bind(generation, instance.router());
        self.socket.detach(old.generation());
        self.proxy.change_target(instance.clone());
        self.config = instance.config().clone();

        debug!(generation = old.generation(), "Retiring");
        if let Err(e) = self.retire(&old).await {
            warn!(generation = old.generation(), error = %e, "Failed to close retired instance");
        }

        self.hooks.run_on_restart(&instance, &options).await;
        info!(generation, "Restart complete");
        Ok(())
    }

    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, RestartError> {
        self.proxy.target().listen(addr).await
    }

    /// Retire the current instance. This is the release that closes the socket.
    pub async fn shutdown(&mut self) -> Result<(), RestartError> {
        let current = self.proxy.target();
        let result = self.retire(&current).await;
        self.socket.detach(current.generation());
        info!(generation = current.generation(), "Shutdown");
        result
    }

    async fn retire(&self, instance: &Arc<ServiceInstance>) -> Result<(), RestartError> {
        let remaining = self.socket.release_generation();
        debug!(generation = instance.generation(), remaining, "Instance retired");
        instance.close().await
    }
}
