//! # Application Factory
//!
//! The factory is the caller-supplied piece: given the registration capability,
//! the current configuration and the restart options, it builds one
//! [`ServiceInstance`]. It is called once at startup and once per restart.
//!
//! Async closures work directly through the blanket implementation:
//!
//! ```rust,ignore
//! let service = Restartable::new(
//!     |builder: InstanceBuilder, config: ServiceConfig, _options: RestartOptions| async move {
//!         let router = Router::new().route("/", get(|| async { "hello" }));
//!         Ok::<_, BoxError>(builder.build(config, router))
//!     },
//!     ServiceConfig::default(),
//! )
//! .await?;
//! ```

use crate::config::ServiceConfig;
use crate::error::BoxError;
use crate::instance::{InstanceBuilder, ServiceInstance};
use crate::RestartOptions;
use async_trait::async_trait;
use std::future::Future;

/// Builds one generation of the application.
#[async_trait]
pub trait AppFactory: Send + Sync + 'static {
    async fn create(
        &self,
        builder: InstanceBuilder,
        config: ServiceConfig,
        options: RestartOptions,
    ) -> Result<ServiceInstance, BoxError>;
}

#[async_trait]
impl<F, Fut> AppFactory for F
where
    F: Fn(InstanceBuilder, ServiceConfig, RestartOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ServiceInstance, BoxError>> + Send + 'static,
{
    async fn create(
        &self,
        builder: InstanceBuilder,
        config: ServiceConfig,
        options: RestartOptions,
    ) -> Result<ServiceInstance, BoxError> {
        (self)(builder, config, options).await
    }
}
