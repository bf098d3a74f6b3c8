use crate::error::RestartError;
use crate::RestartOptions;
use std::net::SocketAddr;
use tokio::sync::oneshot;

/// One-shot reply channel carried by every request.
pub type Response<T> = oneshot::Sender<Result<T, RestartError>>;

/// Requests processed by the coordinator, one at a time.
#[derive(Debug)]
pub enum CoordinatorRequest {
    Restart {
        options: RestartOptions,
        respond_to: Response<()>,
    },
    Listen {
        addr: SocketAddr,
        respond_to: Response<SocketAddr>,
    },
    Close {
        respond_to: Response<()>,
    },
}
