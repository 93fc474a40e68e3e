// ABOUTME: Remote sandbox orchestration engine for website audits
// ABOUTME: Environment pool, file sync, command runner and audit pipeline over pluggable providers

pub mod audit;
pub mod lifecycle;
pub mod orchestrator;
pub mod pool;
pub mod providers;
pub mod report;
pub mod runner;
pub mod settings;
pub mod sync;

pub use audit::{
    classify, AuditError, AuditPipeline, AuditReport, AuditRunResult, AuditTool, ToolOutcome,
};
pub use lifecycle::{Interruption, Lifecycle, Shutdown};
pub use orchestrator::{AuditOutcome, AuditRun, OrchestratorError};
pub use pool::{
    EnvironmentPool, PoolError, RemoteEnvironment, Session, SessionKind, SessionStatus,
};
pub use providers::{
    DockerProvider, E2BProvider, Environment, Provider, ProviderError, StreamType,
};
pub use runner::{
    run, start_background, wait_for_ready, BackgroundProcess, CommandResult, OutputSink,
    ReadinessOptions, RunOptions, RunnerError,
};
pub use settings::{AuditSettings, PackageManager, ProviderKind};
pub use sync::{
    download_named, download_tree, upload_tree, DownloadRecord, ExclusionRuleSet, ReportFile,
    SyncError, UploadRecord,
};
