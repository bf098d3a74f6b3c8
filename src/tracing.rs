//! # Observability & Tracing
//!
//! [`setup_tracing`] installs a compact `tracing-subscriber` formatter filtered by
//! `RUST_LOG`.
//!
//! ## What Gets Traced
//!
//! - **Coordinator**: startup, each restart stage, coalesced requests, rollbacks, shutdown
//! - **Socket**: bind, handler rebinding, drain and close
//! - **Instances**: every generation logs inside its own `service{generation=N}` span,
//!   including `Server listening at ...` and hook failures
//!
//! ```bash
//! # Restarts and socket lifecycle
//! RUST_LOG=info cargo run -p restartable-demo
//!
//! # Handler rebinding, coalescing, hook runs
//! RUST_LOG=restartable=debug cargo run -p restartable-demo
//! ```
//!
//! With `RUST_LOG=info` a restart from the demo looks like:
//!
//! ```text
//! INFO service: Server listening at http://127.0.0.1:3000 generation=1
//! INFO Restart requested generation=1 options=None
//! INFO Restart complete generation=2
//! ```

/// Initializes the global subscriber. Call once, at the top of `main`.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false) // Spans already name the generation
        .compact()
        .init();
}
