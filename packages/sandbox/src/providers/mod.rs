// ABOUTME: Provider and environment traits for remote execution backends
// ABOUTME: Defines the boundary every backend implements: lifecycle, processes and files

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod docker;
pub mod e2b;

pub use docker::DockerProvider;
pub use e2b::E2BProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Environment error: {0}")]
    EnvironmentError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Filesystem error: {0}")]
    FilesystemError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Parameters for provisioning a new remote environment
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub template: String,
    /// Maximum wall-clock lifetime; the backend destroys the environment after it
    pub timeout: Duration,
    pub env_vars: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// A shell command to launch inside an environment
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn new(stream: StreamType, data: Vec<u8>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stream,
            data,
        }
    }
}

/// Events emitted by a started process, in the order they were produced
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Output(OutputChunk),
    Exited { exit_code: i64 },
}

/// A process that has been started; events arrive until `Exited`
pub struct ProcessStream {
    pub pid: u32,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
}

/// Remote file reads come back as text or raw bytes depending on the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FileContent::Text(text) => text.into_bytes(),
            FileContent::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FileContent::Text(text) => text.len(),
            FileContent::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provisioning side of a backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &str;

    /// Check if the provider is reachable and configured
    async fn is_available(&self) -> Result<bool>;

    /// Allocate a new isolated environment
    async fn create_environment(&self, config: &EnvironmentConfig)
        -> Result<Arc<dyn Environment>>;
}

/// One live remote environment
#[async_trait]
pub trait Environment: Send + Sync {
    fn id(&self) -> &str;

    /// Destroy the environment and everything running in it
    async fn kill(&self) -> Result<()>;

    /// Launch `request.command` through a shell and stream its events
    async fn start_process(&self, request: &ProcessRequest) -> Result<ProcessStream>;

    /// Forcefully terminate a process started by `start_process`
    async fn kill_process(&self, pid: u32) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<FileContent>;

    /// Write bytes verbatim; the parent directory must exist
    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Create a directory and its parents; succeeds if it already exists
    async fn make_dir(&self, path: &str) -> Result<()>;

    /// List direct children; `NotFound` if the directory does not exist
    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
}

/// Quote a string for safe interpolation into a POSIX shell command
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%')
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Join a remote directory and a relative path using forward slashes
pub fn remote_join(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        format!("/{}", relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Parent directory of a remote path, `/` for top-level entries
pub fn remote_parent(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("http://localhost:4321"), "http://localhost:4321");
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("npm run dev"), "'npm run dev'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/home/user/project", "src/a.ts"), "/home/user/project/src/a.ts");
        assert_eq!(remote_join("/home/user/project/", "/x"), "/home/user/project/x");
        assert_eq!(remote_join("/home/user/project", ""), "/home/user/project");
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/home/user/project/a.txt"), "/home/user/project");
        assert_eq!(remote_parent("/a.txt"), "/");
        assert_eq!(remote_parent("/home/user/dir/"), "/home/user");
    }

    #[test]
    fn test_file_content_bytes() {
        assert_eq!(FileContent::Text("hi".into()).into_bytes(), b"hi".to_vec());
        assert!(FileContent::Binary(Vec::new()).is_empty());
    }
}
