// ABOUTME: Explicit process lifecycle that ties pool cleanup to every exit path
// ABOUTME: Runs a task against shutdown signals and panics, then always empties the pool

use crate::pool::EnvironmentPool;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Which shutdown request interrupted the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shutdown::Interrupt => f.write_str("SIGINT"),
            Shutdown::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    #[error("Interrupted by {0}")]
    Signal(Shutdown),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl Interruption {
    /// Conventional process exit code for this interruption
    pub fn exit_code(&self) -> i32 {
        match self {
            Interruption::Signal(Shutdown::Interrupt) => 130,
            Interruption::Signal(Shutdown::Terminate) => 143,
            Interruption::Panicked(_) => 1,
        }
    }
}

/// Owns the pool for the duration of one run.
///
/// Consumed by `run`/`run_until`, so signal handling is wired exactly once and
/// `EnvironmentPool::cleanup` runs on success, error, panic and shutdown alike.
pub struct Lifecycle {
    pool: Arc<EnvironmentPool>,
}

impl Lifecycle {
    pub fn new(pool: Arc<EnvironmentPool>) -> Self {
        Self { pool }
    }

    /// Run `task` until it finishes or the process receives SIGINT/SIGTERM
    pub async fn run<F, T>(self, task: F) -> Result<T, Interruption>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_until(task, shutdown_signal()).await
    }

    /// Run `task` until it finishes or `shutdown` resolves
    pub async fn run_until<F, T, S>(self, task: F, shutdown: S) -> Result<T, Interruption>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        S: Future<Output = Shutdown>,
    {
        let mut handle = tokio::spawn(task);

        let outcome = tokio::select! {
            joined = &mut handle => match joined {
                Ok(value) => Ok(value),
                Err(e) if e.is_panic() => Err(Interruption::Panicked(panic_message(e.into_panic()))),
                Err(e) => Err(Interruption::Panicked(e.to_string())),
            },
            signal = shutdown => {
                warn!("Received {}, abandoning run", signal);
                handle.abort();
                let _ = handle.await;
                Err(Interruption::Signal(signal))
            }
        };

        if let Err(Interruption::Panicked(message)) = &outcome {
            warn!("Run panicked: {}", message);
        }

        self.pool.cleanup().await;
        info!("Cleanup complete");

        outcome
    }
}

/// Resolves on the first SIGINT (Ctrl-C) or, on unix, SIGTERM
pub async fn shutdown_signal() -> Shutdown {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = interrupt() => Shutdown::Interrupt,
                _ = terminate.recv() => Shutdown::Terminate,
            },
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                interrupt().await;
                Shutdown::Interrupt
            }
        }
    }

    #[cfg(not(unix))]
    {
        interrupt().await;
        Shutdown::Interrupt
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
