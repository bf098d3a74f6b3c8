//! # Restart Coordinator
//!
//! The coordinator is an actor task that owns every restart. Handles and
//! instances talk to it over an mpsc channel with oneshot replies, so each
//! build, hand-off and retirement runs to completion before the next request
//! is looked at.
//!
//! ## Coalescing
//!
//! A restart request that arrives while another restart is running does not
//! start a second build. It waits for the running one and receives the same
//! result. The running attempt keeps the options it was started with.
//!
//! Listen and close requests that arrive during a restart are deferred and
//! handled in arrival order once it finishes.

pub mod actor;
pub mod client;
pub mod message;

pub use actor::{CoordinatorState, RestartCoordinator};
pub use client::{CoordinatorClient, Restarter};
pub use message::CoordinatorRequest;

use tokio::sync::mpsc;

/// Capacity of the request channel.
pub const BUFFER_SIZE: usize = 32;

/// Create the request channel and the client that feeds it.
pub fn channel() -> (CoordinatorClient, mpsc::Receiver<CoordinatorRequest>) {
    let (sender, receiver) = mpsc::channel(BUFFER_SIZE);
    (CoordinatorClient::new(sender), receiver)
}
