// ABOUTME: End-to-end audit run inside one remote environment
// ABOUTME: Upload, install, dev server, readiness, audit tools, report download, teardown

use crate::audit::{ensure_tools, AuditError, AuditPipeline, AuditReport, AuditTool};
use crate::lifecycle::Interruption;
use crate::pool::{EnvironmentPool, PoolError, RemoteEnvironment, Session, SessionKind};
use crate::report::SUMMARY_FILE_NAME;
use crate::runner::{
    self, start_background, wait_for_ready, OutputSink, ReadinessOptions, RunOptions,
    RunnerError,
};
use crate::settings::{AuditSettings, PackageManager};
use crate::sync::{upload_tree, ExclusionRuleSet, ReportFile, SyncError, UploadRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Dev server output is redirected here inside the environment
pub const DEV_SERVER_LOG: &str = "/tmp/dev-server.log";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Dependency install failed with exit code {exit_code}: {stderr}")]
    DependencyInstall { exit_code: i64, stderr: String },

    #[error("No audit tool completed ({0}); see {1} for details")]
    AllToolsFailed(String, PathBuf),

    #[error("Audit did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Interrupted(#[from] Interruption),
}

impl OrchestratorError {
    /// Process exit code for the driver
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Interrupted(interruption) => interruption.exit_code(),
            _ => 1,
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct AuditOutcome {
    pub session: Session,
    pub upload: Option<UploadRecord>,
    pub report: AuditReport,
    /// Local files written, reports first then the summary
    pub written: Vec<PathBuf>,
    pub duration: Duration,
}

/// Session kind recorded for a tool selection
pub fn session_kind(tools: &[AuditTool]) -> SessionKind {
    let accessibility = tools
        .iter()
        .all(|t| matches!(t, AuditTool::Axe | AuditTool::Pa11y));
    match tools {
        [] => SessionKind::Generic,
        [AuditTool::Lighthouse] => SessionKind::SeoAudit,
        _ if accessibility => SessionKind::AccessibilityAudit,
        _ => SessionKind::Generic,
    }
}

/// One audit of one project
pub struct AuditRun {
    pool: Arc<EnvironmentPool>,
    settings: AuditSettings,
    on_output: Option<OutputSink>,
}

impl AuditRun {
    pub fn new(pool: Arc<EnvironmentPool>, settings: AuditSettings) -> Self {
        Self {
            pool,
            settings,
            on_output: None,
        }
    }

    /// Forward live output of install and tool commands
    pub fn on_output(mut self, sink: OutputSink) -> Self {
        self.on_output = Some(sink);
        self
    }

    pub fn settings(&self) -> &AuditSettings {
        &self.settings
    }

    /// Run the whole audit. The environment is destroyed before this
    /// returns, whatever the outcome.
    pub async fn execute(&self, project_dir: &Path) -> Result<AuditOutcome, OrchestratorError> {
        let started = Instant::now();
        info!(
            "Auditing {} on the {} provider",
            self.settings.audit_url(),
            self.pool.provider_name()
        );
        let (env, created) = self
            .pool
            .create(
                session_kind(&self.settings.tools),
                HashMap::new(),
                Some(self.settings.environment_lifetime),
            )
            .await?;

        let driven = match tokio::time::timeout(self.settings.timeout, self.drive(&env, project_dir)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Audit timed out after {:?}", self.settings.timeout);
                Err(OrchestratorError::Timeout(self.settings.timeout))
            }
        };

        match &driven {
            Ok(_) => self.pool.mark_completed(env.id()).await,
            Err(_) => self.pool.mark_failed(env.id()).await,
        }
        let session = self.pool.session(env.id()).await.unwrap_or(created);

        info!("Destroying environment {}", env.id());
        self.pool.kill(env.id()).await;

        let (upload, report, written) = driven?;

        let duration = started.elapsed();
        info!("Audit complete in {}s", duration.as_secs());

        Ok(AuditOutcome {
            session,
            upload,
            report,
            written,
            duration,
        })
    }

    async fn drive(
        &self,
        env: &RemoteEnvironment,
        project_dir: &Path,
    ) -> Result<(Option<UploadRecord>, AuditReport, Vec<PathBuf>), OrchestratorError> {
        let settings = &self.settings;
        let mut upload = None;
        let mut dev_server = None;

        if settings.is_local_target() {
            let rules = ExclusionRuleSet::with_defaults(&settings.exclude);
            upload = Some(upload_tree(&**env, project_dir, &settings.remote_project_dir, &rules).await?);

            self.install_dependencies(env, project_dir).await?;

            info!("Starting dev server on port {}...", settings.dev_port);
            let command = format!("{} > {} 2>&1", settings.dev_command, DEV_SERVER_LOG);
            dev_server = Some(
                start_background(env.handle(), &command, Some(&settings.remote_project_dir)).await?,
            );

            let readiness = ReadinessOptions {
                timeout: settings.readiness_timeout,
                interval: settings.readiness_interval,
                log_path: Some(DEV_SERVER_LOG.to_string()),
            };
            if let Err(e) = wait_for_ready(&**env, settings.dev_port, &readiness).await {
                if let RunnerError::ReadinessTimeout { log_tail, .. } = &e {
                    if !log_tail.trim().is_empty() {
                        error!("Dev server log tail:\n{}", log_tail);
                    }
                }
                return Err(e.into());
            }
        } else {
            env.make_dir(&settings.remote_project_dir)
                .await
                .map_err(RunnerError::from)?;
        }

        ensure_tools(&**env, &settings.tools, self.on_output.clone()).await?;

        let mut pipeline = AuditPipeline::new(
            settings.tools.iter().copied(),
            settings.remote_results_dir.clone(),
        )
        .tool_timeout(settings.tool_timeout);
        if let Some(sink) = &self.on_output {
            pipeline = pipeline.on_output(sink.clone());
        }

        let report = pipeline.run(&**env, &settings.audit_url()).await?;

        if let Some(server) = dev_server {
            if let Err(e) = server.kill().await {
                warn!("Failed to stop dev server: {}", e);
            }
        }

        let output_dir = if settings.output_dir.is_absolute() {
            settings.output_dir.clone()
        } else {
            project_dir.join(&settings.output_dir)
        };
        let written = write_outputs(&output_dir, &report).await?;

        if !report.results.is_empty() && report.results.iter().all(|r| !r.outcome.ran()) {
            let tools = report
                .results
                .iter()
                .map(|r| r.tool.name())
                .collect::<Vec<_>>()
                .join(", ");
            error!("Every audit tool failed: {}", tools);
            return Err(OrchestratorError::AllToolsFailed(
                tools,
                output_dir.join(SUMMARY_FILE_NAME),
            ));
        }

        Ok((upload, report, written))
    }

    async fn install_dependencies(
        &self,
        env: &RemoteEnvironment,
        project_dir: &Path,
    ) -> Result<(), OrchestratorError> {
        if !project_dir.join("package.json").is_file() {
            info!("No package.json, skipping dependency install");
            return Ok(());
        }

        let manager = self
            .settings
            .package_manager
            .unwrap_or_else(|| PackageManager::detect(project_dir));
        info!("Installing dependencies ({})...", manager.install_command());

        let mut options = RunOptions::default()
            .cwd(self.settings.remote_project_dir.clone())
            .timeout(self.settings.install_timeout);
        if let Some(sink) = &self.on_output {
            options = options.on_output(sink.clone());
        }

        let result = runner::run(&**env, manager.install_command(), options).await?;
        if !result.success() {
            return Err(OrchestratorError::DependencyInstall {
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Write downloaded reports and `summary.md` into `output_dir`
pub async fn write_outputs(
    output_dir: &Path,
    report: &AuditReport,
) -> Result<Vec<PathBuf>, OrchestratorError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| OrchestratorError::Output { path, source }
    };

    fs::create_dir_all(output_dir)
        .await
        .map_err(io_error(output_dir))?;

    let mut written = Vec::new();
    for (name, file) in &report.reports {
        let content: &[u8] = match file {
            ReportFile::Downloaded(bytes) => bytes,
            ReportFile::Empty => &[],
            ReportFile::Missing | ReportFile::Failed(_) => continue,
        };
        let path = output_dir.join(name);
        fs::write(&path, content).await.map_err(io_error(&path))?;
        written.push(path);
    }

    let summary_path = output_dir.join(SUMMARY_FILE_NAME);
    fs::write(&summary_path, &report.summary)
        .await
        .map_err(io_error(&summary_path))?;
    written.push(summary_path);

    info!(
        "Saved {} file(s) to {}",
        written.len(),
        output_dir.display()
    );
    Ok(written)
}
