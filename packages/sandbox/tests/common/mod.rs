// ABOUTME: Scripted in-memory provider shared by the integration tests
// ABOUTME: Keeps files in maps and answers commands through a caller supplied script

#![allow(dead_code)]

use async_trait::async_trait;
use siteaudit_sandbox::providers::{
    remote_parent, DirEntry, EntryKind, Environment, EnvironmentConfig, FileContent,
    OutputChunk, ProcessEvent, ProcessRequest, ProcessStream, Provider, ProviderError, Result,
    StreamType,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How a scripted command behaves
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
    },
    /// Never exits on its own; only `kill_process` ends it
    Hang,
}

pub fn exit(code: i64, stdout: &str) -> Scripted {
    Scripted::Exit {
        code,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn exit_with_stderr(code: i64, stderr: &str) -> Scripted {
    Scripted::Exit {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

pub type Script = Arc<dyn Fn(&str) -> Scripted + Send + Sync>;

/// Script answering every command with exit code 0 and no output
pub fn succeed_all() -> Script {
    Arc::new(|_| exit(0, ""))
}

pub struct FakeEnvironment {
    id: String,
    script: Script,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    failing_writes: Mutex<HashSet<String>>,
    commands: Mutex<Vec<String>>,
    killed_pids: Mutex<Vec<u32>>,
    running: Mutex<HashMap<u32, mpsc::UnboundedSender<ProcessEvent>>>,
    next_pid: AtomicU32,
    killed: AtomicBool,
    fail_kill: bool,
}

impl FakeEnvironment {
    pub fn new(id: &str, script: Script) -> Self {
        Self {
            id: id.to_string(),
            script,
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::from(["/".to_string()])),
            failing_writes: Mutex::new(HashSet::new()),
            commands: Mutex::new(Vec::new()),
            killed_pids: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(100),
            killed: AtomicBool::new(false),
            fail_kill: false,
        }
    }

    /// Store a file, creating its parent directories
    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.add_dir_all(&remote_parent(path));
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.failing_writes.lock().unwrap().insert(path.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn killed_pids(&self) -> Vec<u32> {
        self.killed_pids.lock().unwrap().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn add_dir_all(&self, path: &str) {
        let mut dirs = self.dirs.lock().unwrap();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            dirs.insert(current.clone());
        }
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn kill(&self) -> Result<()> {
        if self.fail_kill {
            return Err(ProviderError::EnvironmentError("refused to die".to_string()));
        }
        self.killed.store(true, Ordering::SeqCst);
        self.running.lock().unwrap().clear();
        Ok(())
    }

    async fn start_process(&self, request: &ProcessRequest) -> Result<ProcessStream> {
        if self.is_killed() {
            return Err(ProviderError::EnvironmentError("environment is gone".to_string()));
        }
        self.commands.lock().unwrap().push(request.command.clone());

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        match (self.script)(&request.command) {
            Scripted::Exit {
                code,
                stdout,
                stderr,
            } => {
                if !stdout.is_empty() {
                    let _ = tx.send(ProcessEvent::Output(OutputChunk::new(
                        StreamType::Stdout,
                        stdout.into_bytes(),
                    )));
                }
                if !stderr.is_empty() {
                    let _ = tx.send(ProcessEvent::Output(OutputChunk::new(
                        StreamType::Stderr,
                        stderr.into_bytes(),
                    )));
                }
                let _ = tx.send(ProcessEvent::Exited { exit_code: code });
            }
            Scripted::Hang => {
                self.running.lock().unwrap().insert(pid, tx);
            }
        }

        Ok(ProcessStream { pid, events: rx })
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        self.killed_pids.lock().unwrap().push(pid);
        if let Some(tx) = self.running.lock().unwrap().remove(&pid) {
            let _ = tx.send(ProcessEvent::Exited { exit_code: 137 });
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<FileContent> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .map(FileContent::Binary)
            .ok_or_else(|| ProviderError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        if self.failing_writes.lock().unwrap().contains(path) {
            return Err(ProviderError::FilesystemError(format!("disk full: {}", path)));
        }
        if !self.dirs.lock().unwrap().contains(&remote_parent(path)) {
            return Err(ProviderError::NotFound(remote_parent(path)));
        }
        self.files.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        self.add_dir_all(path);
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = path.trim_end_matches('/').to_string();
        if !self.dirs.lock().unwrap().contains(&path) {
            return Err(ProviderError::NotFound(path));
        }

        let mut entries = Vec::new();
        for dir in self.dirs.lock().unwrap().iter() {
            if dir != &path && remote_parent(dir) == path {
                entries.push(DirEntry {
                    name: dir.rsplit('/').next().unwrap_or_default().to_string(),
                    path: dir.clone(),
                    kind: EntryKind::Dir,
                });
            }
        }
        for file in self.files.lock().unwrap().keys() {
            if remote_parent(file) == path {
                entries.push(DirEntry {
                    name: file.rsplit('/').next().unwrap_or_default().to_string(),
                    path: file.clone(),
                    kind: EntryKind::File,
                });
            }
        }
        Ok(entries)
    }
}

/// Provider handing out `FakeEnvironment`s and remembering each one
pub struct FakeProvider {
    script: Script,
    seed: Vec<(String, Vec<u8>)>,
    fail_create: bool,
    fail_kill: bool,
    create_delay: Option<Duration>,
    created: Mutex<Vec<Arc<FakeEnvironment>>>,
    configs: Mutex<Vec<EnvironmentConfig>>,
}

impl FakeProvider {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            seed: Vec::new(),
            fail_create: false,
            fail_kill: false,
            create_delay: None,
            created: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new(succeed_all())
        }
    }

    /// Environments refuse to be destroyed
    pub fn undying(script: Script) -> Self {
        Self {
            fail_kill: true,
            ..Self::new(script)
        }
    }

    /// The environment is allocated at once but only handed back after `delay`
    pub fn slow(script: Script, delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::new(script)
        }
    }

    /// Every new environment starts with this file
    pub fn with_file(mut self, path: &str, content: &[u8]) -> Self {
        self.seed.push((path.to_string(), content.to_vec()));
        self
    }

    pub fn environments(&self) -> Vec<Arc<FakeEnvironment>> {
        self.created.lock().unwrap().clone()
    }

    pub fn configs(&self) -> Vec<EnvironmentConfig> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(!self.fail_create)
    }

    async fn create_environment(
        &self,
        config: &EnvironmentConfig,
    ) -> Result<Arc<dyn Environment>> {
        if self.fail_create {
            return Err(ProviderError::EnvironmentError("quota exceeded".to_string()));
        }

        let env = {
            let mut created = self.created.lock().unwrap();
            let mut env =
                FakeEnvironment::new(&format!("fake-{}", created.len() + 1), self.script.clone());
            env.fail_kill = self.fail_kill;
            for (path, content) in &self.seed {
                env.put_file(path, content);
            }

            let env = Arc::new(env);
            created.push(env.clone());
            self.configs.lock().unwrap().push(config.clone());
            env
        };

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(env)
    }
}
