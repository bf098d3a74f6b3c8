//! # Mock Factory
//!
//! A scripted [`AppFactory`] for tests.
//!
//! Every generation it builds serves:
//!
//! - `GET /` → `{"version": n}` where `n` counts the successful builds before it
//! - `GET /generation` → `{"generation": g}`
//! - `GET /restart` → restarts the service from inside the handler
//! - `GET /restart/:millis` → the same, after sleeping `millis` milliseconds
//! - `GET /sleep/:millis` → `{"slept": millis}` once `millis` milliseconds have passed
//!
//! Builds can be delayed and failures scripted one at a time, and every call
//! records the configuration and restart options it received.
//!
//! # Example
//! ```ignore
//! let factory = MockFactory::new().with_delay(Duration::from_millis(500));
//! let service = Restartable::new(factory.clone(), ServiceConfig::default()).await?;
//!
//! factory.fail_next("boom");
//! assert!(service.restart(None).await.is_err());
//! assert_eq!(factory.invocations(), 2);
//! ```

use crate::config::ServiceConfig;
use crate::error::BoxError;
use crate::factory::AppFactory;
use crate::instance::{InstanceBuilder, ServiceInstance};
use crate::coordinator::Restarter;
use crate::RestartOptions;
use async_trait::async_trait;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct MockState {
    invocations: AtomicUsize,
    built: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    failures: Mutex<VecDeque<String>>,
    ready_failures: Mutex<VecDeque<String>>,
    configs: Mutex<Vec<ServiceConfig>>,
    options: Mutex<Vec<RestartOptions>>,
}

/// Scripted application factory. Clones share their script and records.
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every build by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(Some(delay));
        self
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock() = delay;
    }

    /// Make the next build fail in the factory itself.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.failures.lock().push_back(message.into());
    }

    /// Make the next build succeed but fail its readiness step.
    pub fn fail_next_ready(&self, message: impl Into<String>) {
        self.state.ready_failures.lock().push_back(message.into());
    }

    /// Number of times the factory was called, failed builds included.
    pub fn invocations(&self) -> usize {
        self.state.invocations.load(Ordering::SeqCst)
    }

    /// Configurations received, in call order.
    pub fn configs(&self) -> Vec<ServiceConfig> {
        self.state.configs.lock().clone()
    }

    /// Restart options received, in call order.
    pub fn options(&self) -> Vec<RestartOptions> {
        self.state.options.lock().clone()
    }
}

#[async_trait]
impl AppFactory for MockFactory {
    async fn create(
        &self,
        builder: InstanceBuilder,
        config: ServiceConfig,
        options: RestartOptions,
    ) -> Result<ServiceInstance, BoxError> {
        let call = self.state.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.configs.lock().push(config.clone());
        self.state.options.lock().push(options);
        debug!(call, generation = builder.generation(), "Mock build");

        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.state.failures.lock().pop_front();
        if let Some(message) = failure {
            return Err(message.into());
        }

        let version = self.state.built.fetch_add(1, Ordering::SeqCst);
        let generation = builder.generation();
        let restarter = builder.restarter();

        let router = Router::new()
            .route("/", get(move || async move { Json(json!({ "version": version })) }))
            .route(
                "/generation",
                get(move || async move { Json(json!({ "generation": generation })) }),
            )
            .route(
                "/sleep/:millis",
                get(|Path(millis): Path<u64>| async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Json(json!({ "slept": millis }))
                }),
            )
            .route("/restart", {
                let restarter = restarter.clone();
                get(move || restart(restarter.clone()))
            })
            .route(
                "/restart/:millis",
                get(move |Path(millis): Path<u64>| {
                    let restarter = restarter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(millis)).await;
                        restart(restarter).await
                    }
                }),
            );

        let mut builder = builder.decorate("version", json!(version));
        let ready_failure = self.state.ready_failures.lock().pop_front();
        if let Some(message) = ready_failure {
            builder = builder.on_ready(move |_| {
                let message = message.clone();
                async move { Err::<(), BoxError>(message.into()) }
            });
        }

        Ok(builder.build(config, router))
    }
}

async fn restart(restarter: Restarter) -> Response {
    match restarter.restart(None).await {
        Ok(()) => Json(json!({ "restarted": true })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
