//! # Restartable Demo
//!
//! Serves a counter that changes on every restart.
//!
//! - `GET /` returns the generation currently serving
//! - `GET /restart` restarts the service from inside the handler
//! - `SIGUSR1` restarts it from outside
//! - Ctrl-C closes it
//!
//! ```bash
//! RUST_LOG=info RESTARTABLE_PORT=3000 cargo run -p restartable-demo
//! curl localhost:3000/
//! kill -USR1 <pid>
//! ```

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use restartable::tracing::setup_tracing;
use restartable::{BoxError, InstanceBuilder, RestartOptions, Restartable, ServiceConfig};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

async fn build_app(
    builder: InstanceBuilder,
    config: ServiceConfig,
    options: RestartOptions,
) -> Result<restartable::ServiceInstance, BoxError> {
    let generation = builder.generation();
    let restarter = builder.restarter();
    info!(generation, ?options, "Building application");

    let router = Router::new()
        .route(
            "/",
            get(move || async move { Json(json!({ "generation": generation })) }),
        )
        .route(
            "/restart",
            get(move || {
                let restarter = restarter.clone();
                async move {
                    match restarter.restart(Some(json!({ "source": "http" }))).await {
                        Ok(()) => (StatusCode::OK, "restarted\n".to_string()),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")),
                    }
                }
            }),
        );

    Ok(builder
        .decorate("started_by", json!(if generation == 1 { "boot" } else { "restart" }))
        .on_close(move |context| async move {
            info!(
                generation = context.generation,
                closing = context.closing_restartable,
                "Application closed"
            );
            Ok::<(), BoxError>(())
        })
        .build(config, router))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    setup_tracing();

    let config = ServiceConfig::from_env()?;
    config.log_config();
    let bind = config.bind_options();

    let service = Restartable::new(build_app, config).await?;
    service.listen(bind).await?;
    info!(url = %service.url()?, "Demo ready");

    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, restarting");
                if let Err(e) = service.restart(Some(json!({ "source": "signal" }))).await {
                    error!(error = %e, "Restart failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, closing");
                break;
            }
        }
    }

    service.close().await?;
    info!("Demo completed");
    Ok(())
}
