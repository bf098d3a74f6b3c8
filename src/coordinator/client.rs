use super::message::CoordinatorRequest;
use crate::error::RestartError;
use crate::RestartOptions;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

/// Strong client held by the handle. Dropping every one of them stops the coordinator.
#[derive(Clone)]
pub struct CoordinatorClient {
    sender: mpsc::Sender<CoordinatorRequest>,
}

impl CoordinatorClient {
    pub fn new(sender: mpsc::Sender<CoordinatorRequest>) -> Self {
        Self { sender }
    }

    /// A weak restart capability for instances and route handlers.
    pub fn restarter(&self) -> Restarter {
        Restarter::new(self.sender.downgrade())
    }

    #[instrument(skip(self, options))]
    pub async fn restart(&self, options: RestartOptions) -> Result<(), RestartError> {
        debug!(?options, "Sending restart to coordinator");
        send_restart(&self.sender, options).await
    }

    #[instrument(skip(self))]
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, RestartError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(CoordinatorRequest::Listen { addr, respond_to })
            .await
            .map_err(|_| RestartError::CoordinatorClosed)?;
        response.await.map_err(|_| RestartError::CoordinatorDropped)?
    }

    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), RestartError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(CoordinatorRequest::Close { respond_to })
            .await
            .map_err(|_| RestartError::CoordinatorClosed)?;
        response.await.map_err(|_| RestartError::CoordinatorDropped)?
    }
}

/// Restart capability that does not keep the service alive.
///
/// Every generation holds one, so a route handler can restart the service it
/// is served by.
#[derive(Clone)]
pub struct Restarter {
    sender: mpsc::WeakSender<CoordinatorRequest>,
}

impl Restarter {
    pub(crate) fn new(sender: mpsc::WeakSender<CoordinatorRequest>) -> Self {
        Self { sender }
    }

    pub async fn restart(&self, options: RestartOptions) -> Result<(), RestartError> {
        let sender = self
            .sender
            .upgrade()
            .ok_or(RestartError::CoordinatorClosed)?;
        send_restart(&sender, options).await
    }
}

impl std::fmt::Debug for Restarter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restarter").finish_non_exhaustive()
    }
}

async fn send_restart(
    sender: &mpsc::Sender<CoordinatorRequest>,
    options: RestartOptions,
) -> Result<(), RestartError> {
    let (respond_to, response) = oneshot::channel();
    sender
        .send(CoordinatorRequest::Restart {
            options,
            respond_to,
        })
        .await
        .map_err(|_| RestartError::CoordinatorClosed)?;
    response.await.map_err(|_| RestartError::CoordinatorDropped)?
}
