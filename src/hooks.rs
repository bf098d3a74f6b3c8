//! # Restart Hooks
//!
//! Hooks are registered once and run on every later restart, whichever
//! generation registered them.
//!
//! - **Pre-restart** hooks run against the instance being replaced, before the
//!   new one is built.
//! - **On-restart** hooks run against the new instance, after it has been promoted.
//!
//! Each category runs sequentially in registration order. A hook that returns an
//! error or panics is logged inside the instance's span and skipped; the rest of
//! the hooks and the restart itself continue.

use crate::error::BoxError;
use crate::instance::ServiceInstance;
use crate::RestartOptions;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// A restart hook, type-erased.
pub type RestartHook = Arc<
    dyn Fn(Arc<ServiceInstance>, RestartOptions) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PreRestart,
    OnRestart,
}

impl HookKind {
    fn name(&self) -> &'static str {
        match self {
            HookKind::PreRestart => "preRestart",
            HookKind::OnRestart => "onRestart",
        }
    }
}

/// Ordered, append-only hook lists shared by every generation of a service.
#[derive(Default)]
pub struct HookRegistry {
    pre_restart: RwLock<Vec<RestartHook>>,
    on_restart: RwLock<Vec<RestartHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre_restart<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<ServiceInstance>, RestartOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.pre_restart.write().push(erase(hook));
    }

    pub fn add_on_restart<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<ServiceInstance>, RestartOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_restart.write().push(erase(hook));
    }

    pub fn len(&self, kind: HookKind) -> usize {
        self.list(kind).read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len(HookKind::PreRestart) == 0 && self.len(HookKind::OnRestart) == 0
    }

    /// Run pre-restart hooks against the instance about to be replaced.
    pub async fn run_pre_restart(&self, instance: &Arc<ServiceInstance>, options: &RestartOptions) {
        self.run(HookKind::PreRestart, instance, options).await
    }

    /// Run on-restart hooks against the newly promoted instance.
    pub async fn run_on_restart(&self, instance: &Arc<ServiceInstance>, options: &RestartOptions) {
        self.run(HookKind::OnRestart, instance, options).await
    }

    async fn run(&self, kind: HookKind, instance: &Arc<ServiceInstance>, options: &RestartOptions) {
        // Snapshot so hooks may register further hooks without deadlocking.
        let hooks: Vec<RestartHook> = self.list(kind).read().clone();
        if hooks.is_empty() {
            return;
        }
        debug!(
            hook = kind.name(),
            count = hooks.len(),
            generation = instance.generation(),
            "Running hooks"
        );

        for (index, hook) in hooks.iter().enumerate() {
            let call = AssertUnwindSafe(async { hook(instance.clone(), options.clone()).await });
            match call.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => instance.in_span(|| {
                    warn!(hook = kind.name(), index, error = %e, "Hook failed");
                }),
                Err(panic) => instance.in_span(|| {
                    warn!(
                        hook = kind.name(),
                        index,
                        panic = %panic_message(&panic),
                        "Hook panicked"
                    );
                }),
            }
        }
    }

    fn list(&self, kind: HookKind) -> &RwLock<Vec<RestartHook>> {
        match kind {
            HookKind::PreRestart => &self.pre_restart,
            HookKind::OnRestart => &self.on_restart,
        }
    }
}

fn erase<F, Fut>(hook: F) -> RestartHook
where
    F: Fn(Arc<ServiceInstance>, RestartOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |instance, options| hook(instance, options).boxed())
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
