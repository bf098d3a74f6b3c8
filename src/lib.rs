//! # Restartable
//!
//! > **Restart an HTTP service in-process without dropping its listening socket.**
//!
//! A [`Restartable`] wraps an application factory. The factory builds one
//! [`ServiceInstance`] (an `axum::Router` plus lifecycle callbacks) per
//! generation, and [`Restartable::restart`] swaps in a freshly built one while
//! the socket, the bound port and every connected client stay where they are.
//!
//! ## Module Tour
//!
//! ### 1. The Handle ([`handle`])
//! The only reference callers hold. Identity never changes across restarts.
//! - **Key items**: [`Restartable`], [`PersistentRef`].
//!
//! ### 2. The Coordinator ([`coordinator`])
//! An actor task that serializes restarts and coalesces concurrent ones.
//! - **Key items**: [`RestartCoordinator`](coordinator::RestartCoordinator),
//!   [`Restarter`].
//!
//! ### 3. The Socket ([`socket`])
//! Owns the listener for the life of the service and dispatches every request to
//! the generation currently bound.
//!
//! ### 4. The Proxy ([`proxy`])
//! [`MutableProxy`] forwards property access to the current instance.
//!
//! ### 5. The Application ([`factory`], [`instance`], [`hooks`])
//! What the caller supplies, and the hooks that run around every restart.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use restartable::{BoxError, InstanceBuilder, Restartable, RestartOptions, ServiceConfig};
//! use axum::{routing::get, Router};
//!
//! let service = Restartable::new(
//!     |builder: InstanceBuilder, config: ServiceConfig, _: RestartOptions| async move {
//!         let router = Router::new().route("/", get(|| async { "hello" }));
//!         Ok::<_, BoxError>(builder.build(config, router))
//!     },
//!     ServiceConfig::from_env()?,
//! )
//! .await?;
//!
//! let addr = service.listen(service.app().config().bind_options()).await?;
//! service.restart(None).await?;
//! assert_eq!(service.local_addr()?, addr);
//! service.close().await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod factory;
pub mod handle;
pub mod hooks;
pub mod instance;
pub mod mock;
pub mod proxy;
pub mod socket;
pub mod tracing;

/// Free-form options passed unchanged from `restart` to the factory and hooks.
pub type RestartOptions = Option<serde_json::Value>;

pub use config::{BindOptions, ForceCloseConnections, Protocol, ServiceConfig};
pub use coordinator::Restarter;
pub use error::{BoxError, RestartError};
pub use factory::AppFactory;
pub use handle::Restartable;
pub use hooks::HookRegistry;
pub use instance::{InstanceBuilder, LifecycleContext, PersistentRef, ServiceInstance};
pub use proxy::{MutableProxy, PropertyDescriptor, ProxyTarget};
pub use socket::{SocketEvent, SocketWrapper};
