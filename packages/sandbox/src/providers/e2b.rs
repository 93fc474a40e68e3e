// ABOUTME: E2B provider for disposable cloud sandboxes
// ABOUTME: Control plane over REST, in-sandbox daemon over HTTP file routes and Connect-JSON RPC

use super::{
    DirEntry, EntryKind, Environment, EnvironmentConfig, FileContent, OutputChunk,
    ProcessEvent, ProcessRequest, ProcessStream, Provider, ProviderError, Result, StreamType,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use siteaudit_config::{constants, env_string, DEFAULT_E2B_API_URL, DEFAULT_E2B_DOMAIN};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Port the in-sandbox daemon listens on
const ENVD_PORT: u16 = 49983;
/// Default unprivileged user inside the sandbox
const ENVD_USER: &str = "user";
const CONNECT_PROTOCOL_VERSION: &str = "1";
const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_END_STREAM: u8 = 0x02;

/// E2B provider for secure cloud sandboxes
pub struct E2BProvider {
    client: Client,
    api_key: String,
    api_url: String,
    domain: String,
    envd_url_override: Option<String>,
}

impl E2BProvider {
    pub fn new(api_key: String, api_url: Option<String>, domain: Option<String>) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::ConfigError(
                "E2B API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            api_url: api_url
                .unwrap_or_else(|| DEFAULT_E2B_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            domain: domain.unwrap_or_else(|| DEFAULT_E2B_DOMAIN.to_string()),
            envd_url_override: None,
        })
    }

    /// Build from `E2B_API_KEY`, `E2B_API_URL` and `E2B_DOMAIN`
    pub fn from_env() -> Result<Self> {
        let api_key = env_string(constants::E2B_API_KEY).ok_or_else(|| {
            ProviderError::AuthError(format!(
                "{} is required. Get your key at https://e2b.dev/dashboard",
                constants::E2B_API_KEY
            ))
        })?;

        Self::new(
            api_key,
            env_string(constants::E2B_API_URL),
            env_string(constants::E2B_DOMAIN),
        )
    }

    /// Route every in-sandbox daemon call to a fixed base URL
    pub fn with_envd_url(mut self, url: impl Into<String>) -> Self {
        self.envd_url_override = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    fn envd_url(&self, sandbox_id: &str, domain: Option<&str>) -> String {
        match &self.envd_url_override {
            Some(url) => url.clone(),
            None => format!(
                "https://{}-{}.{}",
                ENVD_PORT,
                sandbox_id,
                domain.unwrap_or(&self.domain)
            ),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
    env_vars: &'a HashMap<String, String>,
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    envd_access_token: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

#[async_trait]
impl Provider for E2BProvider {
    fn name(&self) -> &str {
        "e2b"
    }

    async fn is_available(&self) -> Result<bool> {
        match self
            .client
            .get(format!("{}/health", self.api_url))
            .send()
            .await
        {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!("E2B API not reachable: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_environment(
        &self,
        config: &EnvironmentConfig,
    ) -> Result<Arc<dyn Environment>> {
        let body = CreateSandboxRequest {
            template_id: &config.template,
            timeout: config.timeout.as_secs().max(1),
            env_vars: &config.env_vars,
            metadata: &config.metadata,
        };

        let response = self
            .client
            .post(format!("{}/sandboxes", self.api_url))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ProviderError::AuthError(format!("E2B rejected the API key: {}", text))
                }
                _ => ProviderError::EnvironmentError(format!(
                    "E2B returned {} creating sandbox from template {}: {}",
                    status, config.template, text
                )),
            });
        }

        let created: CreateSandboxResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;

        info!("E2B sandbox {} allocated", created.sandbox_id);

        Ok(Arc::new(E2BEnvironment {
            envd_url: self.envd_url(&created.sandbox_id, created.domain.as_deref()),
            sandbox_id: created.sandbox_id,
            access_token: created.envd_access_token,
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            api_url: self.api_url.clone(),
        }))
    }
}

/// A live E2B sandbox
pub struct E2BEnvironment {
    sandbox_id: String,
    client: Client,
    api_key: String,
    api_url: String,
    envd_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl ConnectErrorBody {
    fn from_body(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| ConnectErrorBody {
            code: "unknown".to_string(),
            message: body.to_string(),
        })
    }

    fn into_provider_error(self, context: &str) -> ProviderError {
        match self.code.as_str() {
            "not_found" => ProviderError::NotFound(format!("{}: {}", context, self.message)),
            "unauthenticated" | "permission_denied" => {
                ProviderError::AuthError(format!("{}: {}", context, self.message))
            }
            _ => ProviderError::ProtocolError(format!(
                "{} failed ({}): {}",
                context, self.code, self.message
            )),
        }
    }
}

type RpcResult<T> = std::result::Result<T, ConnectErrorBody>;
type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

impl E2BEnvironment {
    fn envd(&self, method: Method, path: &str) -> RequestBuilder {
        let credentials = STANDARD.encode(format!("{}:", ENVD_USER));
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.envd_url, path))
            .header(AUTHORIZATION, format!("Basic {}", credentials));
        if let Some(token) = &self.access_token {
            builder = builder.header("X-Access-Token", token);
        }
        builder
    }

    /// Unary Connect call with a JSON body
    async fn rpc<Req, Resp>(&self, procedure: &str, body: &Req) -> Result<RpcResult<Resp>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self
            .envd(Method::POST, &format!("/{}", procedure))
            .header("Connect-Protocol-Version", CONNECT_PROTOCOL_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(Err(ConnectErrorBody::from_body(&text)));
        }

        let parsed = response
            .json::<Resp>()
            .await
            .map_err(|e| ProviderError::ProtocolError(format!("{}: {}", procedure, e)))?;
        Ok(Ok(parsed))
    }
}

#[derive(Debug, Serialize)]
struct ProcessConfig<'a> {
    cmd: &'a str,
    args: Vec<&'a str>,
    envs: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ListDirResponse {
    #[serde(default)]
    entries: Vec<EntryInfo>,
}

#[derive(Debug, Deserialize)]
struct EntryInfo {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    path: String,
}

#[async_trait]
impl Environment for E2BEnvironment {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    async fn kill(&self) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/sandboxes/{}", self.api_url, self.sandbox_id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("Sandbox {} already gone", self.sandbox_id);
                Ok(())
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(ProviderError::EnvironmentError(format!(
                    "E2B returned {} killing sandbox {}: {}",
                    status, self.sandbox_id, text
                )))
            }
        }
    }

    async fn start_process(&self, request: &ProcessRequest) -> Result<ProcessStream> {
        let body = json!({
            "process": ProcessConfig {
                cmd: "/bin/bash",
                args: vec!["-l", "-c", &request.command],
                envs: &request.env_vars,
                cwd: request.cwd.as_deref(),
            }
        });
        let payload =
            serde_json::to_vec(&body).map_err(|e| ProviderError::ProtocolError(e.to_string()))?;

        let response = self
            .envd(Method::POST, "/process.Process/Start")
            .header(CONTENT_TYPE, "application/connect+json")
            .header("Connect-Protocol-Version", CONNECT_PROTOCOL_VERSION)
            .body(encode_envelope(0, &payload))
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConnectErrorBody::from_body(&text).into_provider_error("start process"));
        }

        let mut stream: ByteStream = Box::pin(response.bytes_stream());
        let mut decoder = EnvelopeDecoder::default();

        let pid = loop {
            if let Some(frame) = decoder.next_frame() {
                match decode_frame(&frame)? {
                    Decoded::Start(pid) => break pid,
                    Decoded::EndOfStream(Some(error)) => {
                        return Err(error.into_provider_error("start process"))
                    }
                    Decoded::EndOfStream(None) => {
                        return Err(ProviderError::ProcessError(
                            "Process stream ended before start event".to_string(),
                        ))
                    }
                    _ => continue,
                }
            }

            match stream.next().await {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => return Err(ProviderError::ConnectionError(e.to_string())),
                None => {
                    return Err(ProviderError::ProcessError(
                        "Process stream closed before start event".to_string(),
                    ))
                }
            }
        };

        debug!("Process {} started in sandbox {}", pid, self.sandbox_id);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_process_events(stream, decoder, tx));

        Ok(ProcessStream { pid, events: rx })
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        let body = json!({ "process": { "pid": pid }, "signal": "SIGNAL_SIGKILL" });
        match self
            .rpc::<_, serde_json::Value>("process.Process/SendSignal", &body)
            .await?
        {
            Ok(_) => Ok(()),
            Err(error) if error.code == "not_found" => Ok(()),
            Err(error) => Err(error.into_provider_error("kill process")),
        }
    }

    async fn read_file(&self, path: &str) -> Result<FileContent> {
        let response = self
            .envd(Method::GET, "/files")
            .query(&[("path", path), ("username", ENVD_USER)])
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
                Ok(FileContent::Binary(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(path.to_string())),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(ProviderError::FilesystemError(format!(
                    "Reading {} returned {}: {}",
                    path, status, text
                )))
            }
        }
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let part = reqwest::multipart::Part::bytes(data).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .envd(Method::POST, "/files")
            .query(&[("path", path), ("username", ENVD_USER)])
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::FilesystemError(format!(
                "Writing {} returned {}: {}",
                path, status, text
            )))
        }
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        match self
            .rpc::<_, serde_json::Value>("filesystem.Filesystem/MakeDir", &json!({ "path": path }))
            .await?
        {
            Ok(_) => Ok(()),
            Err(error) if error.code == "already_exists" => Ok(()),
            Err(error) => Err(error.into_provider_error(path)),
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let listing = self
            .rpc::<_, ListDirResponse>(
                "filesystem.Filesystem/ListDir",
                &json!({ "path": path, "depth": 1 }),
            )
            .await?
            .map_err(|error| error.into_provider_error(path))?;

        Ok(listing
            .entries
            .into_iter()
            .map(|entry| DirEntry {
                kind: if entry.kind == "FILE_TYPE_DIRECTORY" {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                path: if entry.path.is_empty() {
                    super::remote_join(path, &entry.name)
                } else {
                    entry.path
                },
                name: entry.name,
            })
            .collect())
    }
}

async fn pump_process_events(
    mut stream: ByteStream,
    mut decoder: EnvelopeDecoder,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    loop {
        while let Some(frame) = decoder.next_frame() {
            match decode_frame(&frame) {
                Ok(Decoded::Output(chunk)) => {
                    if tx.send(ProcessEvent::Output(chunk)).is_err() {
                        return; // Receiver dropped
                    }
                }
                Ok(Decoded::Exit(exit_code)) => {
                    let _ = tx.send(ProcessEvent::Exited { exit_code });
                    return;
                }
                Ok(Decoded::EndOfStream(error)) => {
                    if let Some(error) = error {
                        warn!(
                            "Process stream ended with error {}: {}",
                            error.code, error.message
                        );
                    }
                    return;
                }
                Ok(Decoded::Start(_)) | Ok(Decoded::KeepAlive) => {}
                Err(e) => {
                    warn!("Dropping undecodable process frame: {}", e);
                }
            }
        }

        match stream.next().await {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(e)) => {
                warn!("Process stream interrupted: {}", e);
                return;
            }
            None => return,
        }
    }
}

fn encode_envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 5);
    framed.push(flags);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

#[derive(Debug, PartialEq)]
struct Frame {
    flags: u8,
    payload: Vec<u8>,
}

/// Splits a Connect streaming body into length-prefixed frames
#[derive(Debug, Default)]
struct EnvelopeDecoder {
    buffer: Vec<u8>,
}

impl EnvelopeDecoder {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() < 5 {
            return None;
        }
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if self.buffer.len() < 5 + len {
            return None;
        }
        let frame = Frame {
            flags: self.buffer[0],
            payload: self.buffer[5..5 + len].to_vec(),
        };
        self.buffer.drain(..5 + len);
        Some(frame)
    }
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    event: Option<ProcessEventJson>,
}

#[derive(Debug, Deserialize)]
struct ProcessEventJson {
    start: Option<StartEvent>,
    data: Option<DataEvent>,
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct StartEvent {
    #[serde(default)]
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    stdout: Option<String>,
    stderr: Option<String>,
    pty: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    exited: bool,
}

#[derive(Debug, Deserialize)]
struct EndStreamMessage {
    error: Option<ConnectErrorBody>,
}

#[derive(Debug)]
enum Decoded {
    Start(u32),
    Output(OutputChunk),
    Exit(i64),
    KeepAlive,
    EndOfStream(Option<ConnectErrorBody>),
}

fn decode_frame(frame: &Frame) -> Result<Decoded> {
    if frame.flags & FLAG_COMPRESSED != 0 {
        return Err(ProviderError::ProtocolError(
            "Compressed frames are not supported".to_string(),
        ));
    }

    if frame.flags & FLAG_END_STREAM != 0 {
        let end: EndStreamMessage = if frame.payload.is_empty() {
            EndStreamMessage { error: None }
        } else {
            serde_json::from_slice(&frame.payload)
                .map_err(|e| ProviderError::ProtocolError(e.to_string()))?
        };
        return Ok(Decoded::EndOfStream(end.error));
    }

    let message: StreamMessage = serde_json::from_slice(&frame.payload)
        .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;
    let event = message.event.ok_or_else(|| {
        ProviderError::ProtocolError("Process message without event".to_string())
    })?;

    if let Some(start) = event.start {
        return Ok(Decoded::Start(start.pid));
    }
    if let Some(data) = event.data {
        let (stream, encoded) = match (data.stdout, data.stderr, data.pty) {
            (Some(out), _, _) => (StreamType::Stdout, out),
            (_, Some(err), _) => (StreamType::Stderr, err),
            (_, _, Some(pty)) => (StreamType::Stdout, pty),
            _ => return Ok(Decoded::KeepAlive),
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;
        return Ok(Decoded::Output(OutputChunk::new(stream, bytes)));
    }
    if let Some(end) = event.end {
        let exit_code = if !end.exited && end.exit_code == 0 {
            -1
        } else {
            end.exit_code
        };
        return Ok(Decoded::Exit(exit_code));
    }
    Ok(Decoded::KeepAlive)
}
