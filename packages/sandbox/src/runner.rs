// ABOUTME: Command execution inside remote environments
// ABOUTME: Buffered or streamed runs with timeouts, background processes and readiness polling

use crate::providers::{
    Environment, ProcessEvent, ProcessRequest, ProviderError, StreamType,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exit code reported for a command killed by its timeout
pub const TIMEOUT_EXIT_CODE: i64 = 124;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound for a single readiness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Floor for a probe started right at the readiness deadline
const MIN_PROBE_BUDGET: Duration = Duration::from_millis(500);
/// Seconds curl may spend on a server that accepts but never answers
const PROBE_MAX_TIME_SECS: u64 = 2;

/// Lines of server log attached to a readiness failure
const LOG_TAIL_LINES: usize = 50;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Server on port {port} not ready after {timeout:?}")]
    ReadinessTimeout {
        port: u16,
        timeout: Duration,
        log_tail: String,
    },

    #[error("Process {0} stopped reporting before it exited")]
    StreamClosed(u32),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Receives output chunks as they arrive
pub type OutputSink = Arc<dyn Fn(StreamType, &[u8]) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<String>,
    pub env_vars: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub on_output: Option<OutputSink>,
}

impl RunOptions {
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_output(mut self, sink: OutputSink) -> Self {
        self.on_output = Some(sink);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("cwd", &self.cwd)
            .field("env_vars", &self.env_vars.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("on_output", &self.on_output.is_some())
            .finish()
    }
}

/// Terminal outcome of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run `command` to completion. Output is accumulated in full and, when a
/// sink is set, forwarded chunk by chunk in the order produced.
pub async fn run(env: &dyn Environment, command: &str, options: RunOptions) -> Result<CommandResult> {
    let timeout = options.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
    let request = ProcessRequest {
        command: command.to_string(),
        cwd: options.cwd.clone(),
        env_vars: options.env_vars.clone(),
    };

    debug!("Running in {}: {}", env.id(), command);

    let mut process = env.start_process(&request).await?;
    let pid = process.pid;
    let sink = options.on_output;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let waited = tokio::time::timeout(timeout, async {
        while let Some(event) = process.events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => {
                    if let Some(sink) = &sink {
                        sink(chunk.stream, &chunk.data);
                    }
                    match chunk.stream {
                        StreamType::Stdout => stdout.extend_from_slice(&chunk.data),
                        StreamType::Stderr => stderr.extend_from_slice(&chunk.data),
                    }
                }
                ProcessEvent::Exited { exit_code } => return Some(exit_code),
            }
        }
        None
    })
    .await;

    let (exit_code, timed_out) = match waited {
        Ok(Some(exit_code)) => (exit_code, false),
        Ok(None) => return Err(RunnerError::StreamClosed(pid)),
        Err(_) => {
            warn!("Command timed out after {:?}: {}", timeout, command);
            if let Err(e) = env.kill_process(pid).await {
                warn!("Failed to kill timed out process {}: {}", pid, e);
            }
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    Ok(CommandResult {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
    })
}

/// A process left running while other commands execute
pub struct BackgroundProcess {
    pid: u32,
    env: Arc<dyn Environment>,
    drain: JoinHandle<Option<i64>>,
}

impl BackgroundProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.drain.is_finished()
    }

    pub async fn kill(self) -> Result<()> {
        info!("Stopping background process {}", self.pid);
        let outcome = self.env.kill_process(self.pid).await;
        self.drain.abort();
        outcome.map_err(RunnerError::from)
    }
}

/// Launch `command` without waiting for it
pub async fn start_background(
    env: Arc<dyn Environment>,
    command: &str,
    cwd: Option<&str>,
) -> Result<BackgroundProcess> {
    let request = ProcessRequest {
        command: command.to_string(),
        cwd: cwd.map(str::to_string),
        env_vars: HashMap::new(),
    };

    let mut process = env.start_process(&request).await?;
    let pid = process.pid;
    info!("Started background process {}: {}", pid, command);

    let drain = tokio::spawn(async move {
        while let Some(event) = process.events.recv().await {
            if let ProcessEvent::Exited { exit_code } = event {
                info!("Background process {} exited with {}", pid, exit_code);
                return Some(exit_code);
            }
        }
        None
    });

    Ok(BackgroundProcess { pid, env, drain })
}

#[derive(Debug, Clone)]
pub struct ReadinessOptions {
    pub timeout: Duration,
    pub interval: Duration,
    /// Server log whose tail is attached to a timeout error
    pub log_path: Option<String>,
}

impl Default for ReadinessOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(1),
            log_path: None,
        }
    }
}

fn probe_command(port: u16) -> String {
    format!(
        "curl -s --max-time {} -o /dev/null -w \"%{{http_code}}\" http://localhost:{} || echo \"000\"",
        PROBE_MAX_TIME_SECS, port
    )
}

/// Any HTTP status proves the socket accepts connections
fn is_ready_status(output: &str) -> bool {
    let status = output.trim();
    !status.is_empty()
        && status.chars().all(|c| c.is_ascii_digit())
        && status.chars().any(|c| c != '0')
}

/// Poll `localhost:port` inside the environment until it answers or
/// `options.timeout` elapses
pub async fn wait_for_ready(env: &dyn Environment, port: u16, options: &ReadinessOptions) -> Result<()> {
    let probe = probe_command(port);
    let started = Instant::now();
    let mut attempts = 0u32;

    info!("Waiting for server on port {}", port);

    loop {
        attempts += 1;
        let remaining = options.timeout.saturating_sub(started.elapsed());
        let budget = PROBE_TIMEOUT.min(remaining).max(MIN_PROBE_BUDGET);
        match run(env, &probe, RunOptions::default().timeout(budget)).await {
            Ok(result) if is_ready_status(&result.stdout) => {
                info!(
                    "Server ready on port {} (HTTP {}) after {} attempt(s)",
                    port,
                    result.stdout.trim(),
                    attempts
                );
                return Ok(());
            }
            Ok(result) => debug!("Port {} not ready yet ({})", port, result.stdout.trim()),
            Err(e) => debug!("Readiness probe failed: {}", e),
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            break;
        }
        tokio::time::sleep(options.interval.min(options.timeout - elapsed)).await;
    }

    let log_tail = match &options.log_path {
        Some(path) => read_log_tail(env, path).await,
        None => String::new(),
    };

    Err(RunnerError::ReadinessTimeout {
        port,
        timeout: options.timeout,
        log_tail,
    })
}

async fn read_log_tail(env: &dyn Environment, path: &str) -> String {
    let command = format!(
        "tail -n {} {} 2>/dev/null",
        LOG_TAIL_LINES,
        crate::providers::shell_escape(path)
    );
    match run(env, &command, RunOptions::default().timeout(PROBE_TIMEOUT)).await {
        Ok(result) => result.stdout,
        Err(e) => {
            warn!("Could not read {}: {}", path, e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_status() {
        assert!(is_ready_status("200"));
        assert!(is_ready_status("404\n"));
        assert!(is_ready_status("500"));
        assert!(!is_ready_status("000"));
        assert!(!is_ready_status("000000"));
        assert!(!is_ready_status(""));
        assert!(!is_ready_status("curl: (7)"));
    }

    #[test]
    fn test_probe_command() {
        assert_eq!(
            probe_command(4321),
            "curl -s --max-time 2 -o /dev/null -w \"%{http_code}\" http://localhost:4321 || echo \"000\""
        );
    }

    #[test]
    fn test_command_result_success() {
        let result = CommandResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        };
        assert!(result.success());
        assert!(!CommandResult {
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            ..result
        }
        .success());
    }
}
