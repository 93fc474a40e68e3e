// ABOUTME: Audit run settings with defaults, config file and environment layers
// ABOUTME: Also selects and builds the provider backend for a run

use crate::audit::AuditTool;
use crate::pool::PoolError;
use crate::providers::{DockerProvider, E2BProvider, Provider, ProviderError};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use siteaudit_config::{
    constants, env_parse_u64, env_string, CONFIG_FILE_NAME, DEFAULT_DOCKER_IMAGE,
    DEFAULT_TEMPLATE,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    E2B,
    Docker,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::E2B => f.write_str("e2b"),
            ProviderKind::Docker => f.write_str("docker"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "e2b" => Ok(ProviderKind::E2B),
            "docker" => Ok(ProviderKind::Docker),
            other => Err(SettingsError::Invalid(format!(
                "unknown provider '{}' (expected e2b or docker)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    pub fn install_command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm install",
            PackageManager::Yarn => "yarn install",
            PackageManager::Pnpm => "pnpm install",
        }
    }

    /// Pick the package manager from the lockfile in `project_dir`
    pub fn detect(project_dir: &Path) -> Self {
        if project_dir.join("pnpm-lock.yaml").is_file() {
            PackageManager::Pnpm
        } else if project_dir.join("yarn.lock").is_file() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }
}

impl FromStr for PackageManager {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(PackageManager::Npm),
            "yarn" => Ok(PackageManager::Yarn),
            "pnpm" => Ok(PackageManager::Pnpm),
            other => Err(SettingsError::Invalid(format!(
                "unknown package manager '{}'",
                other
            ))),
        }
    }
}

/// Everything one audit run needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    pub provider: ProviderKind,
    /// Template (E2B) or image (Docker); `None` uses the provider default
    pub template: Option<String>,
    pub url: String,
    pub tools: Vec<AuditTool>,
    pub output_dir: PathBuf,
    pub dev_command: String,
    pub dev_port: u16,
    /// `None` detects from the project's lockfile
    pub package_manager: Option<PackageManager>,
    pub timeout: Duration,
    pub environment_lifetime: Duration,
    pub install_timeout: Duration,
    pub tool_timeout: Duration,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub remote_project_dir: String,
    pub remote_results_dir: String,
    /// Added to the default exclusion rules
    pub exclude: Vec<String>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::E2B,
            template: None,
            url: "http://localhost:4321".to_string(),
            tools: AuditTool::ALL.to_vec(),
            output_dir: PathBuf::from("docs/audits/raw"),
            dev_command: "npm run dev".to_string(),
            dev_port: 4321,
            package_manager: None,
            timeout: Duration::from_secs(600),
            environment_lifetime: Duration::from_secs(30 * 60),
            install_timeout: Duration::from_secs(300),
            tool_timeout: Duration::from_secs(300),
            readiness_timeout: Duration::from_secs(60),
            readiness_interval: Duration::from_secs(1),
            remote_project_dir: "/home/user/project".to_string(),
            remote_results_dir: "/home/user/project/audit-results".to_string(),
            exclude: Vec::new(),
        }
    }
}

/// Shape of `siteaudit.config.json`; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigFile {
    pub sandbox: SandboxSection,
    pub file_sync: FileSyncSection,
    pub dev_server: DevServerSection,
    pub audit: AuditSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxSection {
    pub provider: Option<ProviderKind>,
    pub template: Option<String>,
    /// Environment lifetime in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSyncSection {
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevServerSection {
    pub port: Option<u16>,
    pub command: Option<String>,
    pub package_manager: Option<PackageManager>,
    /// Readiness timeout in seconds
    pub startup_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditSection {
    pub url: Option<String>,
    pub tools: Option<ToolToggles>,
    pub output: Option<OutputSection>,
    /// Overall run timeout in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolToggles {
    pub lighthouse: bool,
    pub axe: bool,
    pub pa11y: bool,
}

impl Default for ToolToggles {
    fn default() -> Self {
        Self {
            lighthouse: true,
            axe: true,
            pa11y: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Search `start` and its ancestors for the config file
    pub fn find(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
    }
}

impl AuditSettings {
    /// Defaults, then the config file found from `project_dir`, then env vars
    pub fn load(project_dir: &Path) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        if let Some(path) = ConfigFile::find(project_dir) {
            info!("Using config file {}", path.display());
            settings.merge_file(&ConfigFile::load(&path)?);
        }
        settings.apply_env()?;
        Ok(settings)
    }

    pub fn merge_file(&mut self, file: &ConfigFile) {
        if let Some(provider) = file.sandbox.provider {
            self.provider = provider;
        }
        if let Some(template) = &file.sandbox.template {
            self.template = Some(template.clone());
        }
        if let Some(secs) = file.sandbox.timeout {
            self.environment_lifetime = Duration::from_secs(secs);
        }

        self.exclude.extend(file.file_sync.exclude.iter().cloned());

        if let Some(port) = file.dev_server.port {
            self.dev_port = port;
        }
        if let Some(command) = &file.dev_server.command {
            self.dev_command = command.clone();
        }
        if file.dev_server.package_manager.is_some() {
            self.package_manager = file.dev_server.package_manager;
        }
        if let Some(secs) = file.dev_server.startup_timeout {
            self.readiness_timeout = Duration::from_secs(secs);
        }

        if let Some(url) = &file.audit.url {
            self.url = url.clone();
        }
        if let Some(toggles) = file.audit.tools {
            self.tools = AuditTool::ALL
                .into_iter()
                .filter(|tool| match tool {
                    AuditTool::Lighthouse => toggles.lighthouse,
                    AuditTool::Axe => toggles.axe,
                    AuditTool::Pa11y => toggles.pa11y,
                })
                .collect();
        }
        if let Some(dir) = file.audit.output.as_ref().and_then(|o| o.dir.clone()) {
            self.output_dir = dir;
        }
        if let Some(secs) = file.audit.timeout {
            self.timeout = Duration::from_secs(secs);
        }
    }

    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        if let Some(provider) = env_string(constants::SITEAUDIT_PROVIDER) {
            self.provider = provider.parse()?;
        }
        let template_var = match self.provider {
            ProviderKind::E2B => constants::SITEAUDIT_TEMPLATE,
            ProviderKind::Docker => constants::SITEAUDIT_DOCKER_IMAGE,
        };
        if let Some(template) = env_string(template_var) {
            self.template = Some(template);
        }
        let timeout = env_parse_u64(constants::SITEAUDIT_TIMEOUT, self.timeout.as_secs());
        self.timeout = Duration::from_secs(timeout);
        Ok(())
    }

    pub fn template(&self) -> &str {
        match (&self.template, self.provider) {
            (Some(template), _) => template,
            (None, ProviderKind::E2B) => DEFAULT_TEMPLATE,
            (None, ProviderKind::Docker) => DEFAULT_DOCKER_IMAGE,
        }
    }

    /// True when the target is served from the project itself
    pub fn is_local_target(&self) -> bool {
        is_local_url(&self.url)
    }

    /// URL the tools audit: the dev server for local targets, else the target itself
    pub fn audit_url(&self) -> String {
        if !self.is_local_target() {
            return self.url.clone();
        }
        match Url::parse(&self.url) {
            Ok(mut url) => {
                let _ = url.set_host(Some("localhost"));
                let _ = url.set_port(Some(self.dev_port));
                url.to_string().trim_end_matches('/').to_string()
            }
            Err(_) => format!("http://localhost:{}", self.dev_port),
        }
    }

    /// Build the configured backend. A missing credential is a precondition
    /// failure, never retried.
    pub fn build_provider(&self) -> Result<Arc<dyn Provider>, PoolError> {
        debug!("Building {} provider", self.provider);
        match self.provider {
            ProviderKind::E2B => match E2BProvider::from_env() {
                Ok(provider) => Ok(Arc::new(provider)),
                Err(ProviderError::AuthError(message)) | Err(ProviderError::ConfigError(message)) => {
                    Err(PoolError::Precondition(message))
                }
                Err(e) => Err(PoolError::Provisioning(e)),
            },
            ProviderKind::Docker => DockerProvider::new()
                .map(|provider| Arc::new(provider) as Arc<dyn Provider>)
                .map_err(|e| PoolError::Precondition(format!("Docker is not reachable: {}", e))),
        }
    }
}

pub fn is_local_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(url) => matches!(
            url.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("0.0.0.0") | Some("[::1]")
        ),
        Err(_) => false,
    }
}
