// ABOUTME: Remote environment pool tracking every live environment and its session
// ABOUTME: Creates environments through a provider and guarantees they can all be destroyed

use crate::providers::{Environment, EnvironmentConfig, Provider, ProviderError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Lifetime granted to an environment when the caller does not override it
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Remote working directory used by the default audit template
pub const DEFAULT_WORKDIR: &str = "/home/user/project";

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(#[source] ProviderError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    AccessibilityAudit,
    SeoAudit,
    Implementation,
    Generic,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::AccessibilityAudit => "accessibility-audit",
            SessionKind::SeoAudit => "seo-audit",
            SessionKind::Implementation => "implementation",
            SessionKind::Generic => "generic",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// Bookkeeping for one environment, created together with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    fn finish(&mut self, status: SessionStatus) {
        if self.status == SessionStatus::Running {
            self.status = status;
            self.completed_at = Some(Utc::now());
        }
    }
}

/// Handle to a pooled environment plus the facts the pool knows about it
#[derive(Clone)]
pub struct RemoteEnvironment {
    inner: Arc<dyn Environment>,
    workdir: String,
    lifetime: Duration,
    created_at: DateTime<Utc>,
}

impl RemoteEnvironment {
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let lifetime = chrono::Duration::from_std(self.lifetime).unwrap_or(chrono::Duration::MAX);
        self.created_at + lifetime
    }

    /// Shared handle for tasks that outlive a borrow, such as background processes
    pub fn handle(&self) -> Arc<dyn Environment> {
        Arc::clone(&self.inner)
    }
}

impl Deref for RemoteEnvironment {
    type Target = dyn Environment;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for RemoteEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEnvironment")
            .field("id", &self.id())
            .field("workdir", &self.workdir)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

struct PoolEntry {
    environment: RemoteEnvironment,
    session: Session,
}

/// Owns every environment created during a run
pub struct EnvironmentPool {
    provider: Arc<dyn Provider>,
    template: String,
    workdir: String,
    entries: Arc<RwLock<HashMap<String, PoolEntry>>>,
    /// Held shared by every in-flight provisioning task, exclusively by cleanup
    provisioning: Arc<RwLock<()>>,
}

impl EnvironmentPool {
    pub fn new(provider: Arc<dyn Provider>, template: impl Into<String>) -> Self {
        Self {
            provider,
            template: template.into(),
            workdir: DEFAULT_WORKDIR.to_string(),
            entries: Arc::new(RwLock::new(HashMap::new())),
            provisioning: Arc::new(RwLock::new(())),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Allocate an environment and register it with a running session.
    /// Nothing is registered when the provider fails.
    ///
    /// Provisioning runs on its own task and registers the environment even
    /// if the caller is dropped mid-call, so `cleanup` still destroys it.
    pub async fn create(
        &self,
        kind: SessionKind,
        env_vars: HashMap<String, String>,
        lifetime: Option<Duration>,
    ) -> Result<(RemoteEnvironment, Session)> {
        let lifetime = lifetime.unwrap_or(DEFAULT_LIFETIME);
        let config = EnvironmentConfig {
            template: self.template.clone(),
            timeout: lifetime,
            env_vars,
            metadata: HashMap::from([
                ("type".to_string(), kind.as_str().to_string()),
                ("createdAt".to_string(), Utc::now().to_rfc3339()),
            ]),
        };

        info!(
            "Creating {} environment from template {} ({} provider)",
            kind,
            self.template,
            self.provider.name()
        );

        let in_flight = self.provisioning.clone().read_owned().await;
        let provider = self.provider.clone();
        let entries = self.entries.clone();
        let workdir = self.workdir.clone();

        let task = tokio::spawn(async move {
            let _in_flight = in_flight;
            let inner = provider
                .create_environment(&config)
                .await
                .map_err(PoolError::Provisioning)?;

            let environment = RemoteEnvironment {
                inner,
                workdir,
                lifetime,
                created_at: Utc::now(),
            };
            let session = Session {
                id: environment.id().to_string(),
                kind,
                status: SessionStatus::Running,
                started_at: environment.created_at,
                completed_at: None,
            };

            entries.write().await.insert(
                session.id.clone(),
                PoolEntry {
                    environment: environment.clone(),
                    session: session.clone(),
                },
            );

            info!("Environment {} ready", session.id);
            Ok((environment, session))
        });

        task.await.map_err(|e| {
            PoolError::Provisioning(ProviderError::EnvironmentError(format!(
                "provisioning task failed: {}",
                e
            )))
        })?
    }

    pub async fn get(&self, id: &str) -> Option<RemoteEnvironment> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.environment.clone())
    }

    pub async fn session(&self, id: &str) -> Option<Session> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.session.clone())
    }

    pub async fn mark_completed(&self, id: &str) {
        self.finish(id, SessionStatus::Completed).await;
    }

    pub async fn mark_failed(&self, id: &str) {
        self.finish(id, SessionStatus::Failed).await;
    }

    async fn finish(&self, id: &str, status: SessionStatus) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.session.finish(status);
        }
    }

    /// Destroy one environment. The id is forgotten even if the backend
    /// refuses to destroy it.
    pub async fn kill(&self, id: &str) {
        let removed = self.entries.write().await.remove(id);
        let Some(entry) = removed else {
            debug!("Environment {} not tracked, nothing to kill", id);
            return;
        };

        match entry.environment.kill().await {
            Ok(()) => info!("Environment {} destroyed", id),
            Err(e) => error!("Failed to destroy environment {}: {}", id, e),
        }
    }

    /// Destroy every tracked environment concurrently and wait for all of
    /// them. Environments still being provisioned are waited for first.
    pub async fn cleanup(&self) {
        let drained: Vec<(String, PoolEntry)> = {
            let _settled = self.provisioning.write().await;
            self.entries.write().await.drain().collect()
        };
        if drained.is_empty() {
            return;
        }

        info!("Cleaning up {} environment(s)", drained.len());

        let attempts = drained.into_iter().map(|(id, entry)| async move {
            let outcome = entry.environment.kill().await;
            (id, outcome)
        });

        let mut failures = 0;
        for (id, outcome) in join_all(attempts).await {
            if let Err(e) = outcome {
                failures += 1;
                error!("Failed to destroy environment {}: {}", id, e);
            }
        }

        if failures > 0 {
            warn!("{} environment(s) could not be destroyed", failures);
        }
    }

    /// Sessions whose environments are still running
    pub async fn active_sessions(&self) -> Vec<Session> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.session.status == SessionStatus::Running)
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
