// ABOUTME: Docker provider implementation for local container-based environments
// ABOUTME: Uses bollard to run audit environments as throwaway containers

use super::{
    remote_parent, shell_escape, DirEntry, EntryKind, Environment, EnvironmentConfig,
    FileContent, OutputChunk, ProcessEvent, ProcessRequest, ProcessStream, Provider,
    ProviderError, Result, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// First stderr line of every exec carries the shell pid after this marker
const PID_MARKER: &str = "__siteaudit_pid__";
const LABEL_PREFIX: &str = "siteaudit.sandbox";

pub struct DockerProvider {
    client: Docker,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Create a new Docker provider with default timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            pull_timeout: timeout,
        })
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            pull_timeout: Duration::from_secs(600),
        }
    }

    fn to_bollard_config(&self, config: &EnvironmentConfig) -> Config<String> {
        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels: HashMap<String, String> = config
            .metadata
            .iter()
            .map(|(k, v)| (format!("{}.{}", LABEL_PREFIX, k), v.clone()))
            .collect();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());

        Config {
            image: Some(config.template.clone()),
            // The container exits, and is auto-removed, once its lifetime elapses
            cmd: Some(vec![
                "sleep".to_string(),
                config.timeout.as_secs().max(1).to_string(),
            ]),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(bollard::models::HostConfig {
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::EnvironmentError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::EnvironmentError(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    ))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::EnvironmentError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::EnvironmentError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_environment(
        &self,
        config: &EnvironmentConfig,
    ) -> Result<Arc<dyn Environment>> {
        if !self.image_exists(&config.template).await? {
            self.pull_image(&config.template).await?;
        }

        let name = format!("siteaudit-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(config))
            .await
            .map_err(|e| ProviderError::EnvironmentError(e.to_string()))?;

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::EnvironmentError(e.to_string()))?;

        info!("Started container {} ({})", name, container.id);

        Ok(Arc::new(DockerEnvironment {
            client: self.client.clone(),
            container_id: container.id,
        }))
    }
}

/// A running container acting as one environment
pub struct DockerEnvironment {
    client: Docker,
    container_id: String,
}

impl DockerEnvironment {
    /// Run a command to completion and collect its output
    async fn exec_collect(&self, command: Vec<String>) -> Result<(i64, Vec<u8>, Vec<u8>)> {
        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(&self.container_id, exec_config)
            .await
            .map_err(|e| ProviderError::ProcessError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ProcessError(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::ProcessError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exit_code = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::ProcessError(e.to_string()))?
            .exit_code
            .unwrap_or(0);

        Ok((exit_code, stdout, stderr))
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn kill(&self) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(&self.container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", self.container_id);
                Ok(())
            }
            Err(e) => Err(ProviderError::EnvironmentError(e.to_string())),
        }
    }

    async fn start_process(&self, request: &ProcessRequest) -> Result<ProcessStream> {
        let env: Vec<String> = request
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(wrapper_command(&request.command)),
            env: Some(env),
            working_dir: request.cwd.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(&self.container_id, exec_config)
            .await
            .map_err(|e| ProviderError::ProcessError(e.to_string()))?;

        let mut output = match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ProcessError(e.to_string()))?
        {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(ProviderError::ProcessError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let mut pending = Vec::new();
        let mut marker_line = Vec::new();
        let pid = loop {
            match output.next().await {
                Some(Ok(LogOutput::StdErr { message })) => {
                    marker_line.extend_from_slice(&message);
                    if let Some(pos) = marker_line.iter().position(|b| *b == b'\n') {
                        let line = String::from_utf8_lossy(&marker_line[..pos]).to_string();
                        let rest = marker_line[pos + 1..].to_vec();
                        let pid = parse_pid_marker(&line).ok_or_else(|| {
                            ProviderError::ProcessError(format!(
                                "Unexpected first stderr line: {}",
                                line
                            ))
                        })?;
                        if !rest.is_empty() {
                            pending.push(OutputChunk::new(StreamType::Stderr, rest));
                        }
                        break pid;
                    }
                }
                Some(Ok(LogOutput::StdOut { message })) | Some(Ok(LogOutput::Console { message })) => {
                    pending.push(OutputChunk::new(StreamType::Stdout, message.to_vec()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ProviderError::ProcessError(e.to_string())),
                None => {
                    return Err(ProviderError::ProcessError(
                        "Exec ended before reporting its pid".to_string(),
                    ))
                }
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let exec_id = exec.id;

        tokio::spawn(async move {
            for chunk in pending {
                if tx.send(ProcessEvent::Output(chunk)).is_err() {
                    return;
                }
            }

            while let Some(msg) = output.next().await {
                let chunk = match msg {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        OutputChunk::new(StreamType::Stdout, message.to_vec())
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        OutputChunk::new(StreamType::Stderr, message.to_vec())
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Exec output stream failed: {}", e);
                        return;
                    }
                };
                if tx.send(ProcessEvent::Output(chunk)).is_err() {
                    return; // Receiver dropped
                }
            }

            match client.inspect_exec(&exec_id).await {
                Ok(inspect) => {
                    let exit_code = inspect.exit_code.unwrap_or(-1);
                    let _ = tx.send(ProcessEvent::Exited { exit_code });
                }
                Err(e) => warn!("Could not inspect exec {}: {}", exec_id, e),
            }
        });

        Ok(ProcessStream { pid, events: rx })
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        let (code, _, stderr) = self
            .exec_collect(vec!["kill".to_string(), "-9".to_string(), pid.to_string()])
            .await?;
        if code != 0 {
            debug!(
                "kill -9 {} exited {}: {}",
                pid,
                code,
                String::from_utf8_lossy(&stderr).trim()
            );
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<FileContent> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self
            .client
            .download_from_container(&self.container_id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(ProviderError::NotFound(path.to_string())),
                Err(e) => return Err(ProviderError::FilesystemError(e.to_string())),
            }
        }

        extract_single_file(&data)
            .map(FileContent::Binary)
            .map_err(|e| ProviderError::FilesystemError(format!("{}: {}", path, e)))
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let tar_data = single_file_archive(file_name, &data)
            .map_err(|e| ProviderError::FilesystemError(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: remote_parent(path),
            ..Default::default()
        };

        self.client
            .upload_to_container(&self.container_id, Some(options), tar_data.into())
            .await
            .map_err(|e| ProviderError::FilesystemError(format!("{}: {}", path, e)))
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let (code, _, stderr) = self
            .exec_collect(vec![
                "mkdir".to_string(),
                "-p".to_string(),
                "--".to_string(),
                path.to_string(),
            ])
            .await?;
        if code == 0 {
            Ok(())
        } else {
            Err(ProviderError::FilesystemError(format!(
                "mkdir {}: {}",
                path,
                String::from_utf8_lossy(&stderr).trim()
            )))
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (code, stdout, stderr) = self
            .exec_collect(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("ls -1Ap -- {}", shell_escape(path)),
            ])
            .await?;

        if code != 0 {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(if message.contains("No such file") {
                ProviderError::NotFound(path.to_string())
            } else {
                ProviderError::FilesystemError(format!("ls {}: {}", path, message))
            });
        }

        Ok(parse_ls_output(path, &String::from_utf8_lossy(&stdout)))
    }
}

/// Wrap a command so the shell reports its pid before exec'ing it
fn wrapper_command(command: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "echo \"{}$$\" >&2; exec sh -c {}",
            PID_MARKER,
            shell_escape(command)
        ),
    ]
}

fn parse_pid_marker(line: &str) -> Option<u32> {
    line.trim().strip_prefix(PID_MARKER)?.parse().ok()
}

fn parse_ls_output(dir: &str, listing: &str) -> Vec<DirEntry> {
    listing
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, kind) = match line.strip_suffix('/') {
                Some(name) => (name, EntryKind::Dir),
                None => (line, EntryKind::File),
            };
            DirEntry {
                name: name.to_string(),
                path: super::remote_join(dir, name),
                kind,
            }
        })
        .collect()
}

fn single_file_archive(file_name: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, file_name, data)?;
    archive.into_inner()
}

fn extract_single_file(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "archive holds no regular file",
    ))
}
