// ABOUTME: File synchronization between a local project tree and a remote environment
// ABOUTME: Uploads with exclusion rules, downloads trees or named files with per-file tolerance

pub mod exclude;
pub mod walk;

pub use exclude::{ExclusionRuleSet, DEFAULT_EXCLUDES};
pub use walk::{TreeWalker, WalkedFile};

use crate::providers::{
    remote_join, remote_parent, EntryKind, Environment, ProviderError,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local I/O error on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl SyncError {
    fn local(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::LocalIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome of `upload_tree`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadRecord {
    pub uploaded: usize,
    /// Files that were included but could not be read or written
    pub skipped: usize,
    /// Entries matched by an exclusion rule (directories count once)
    pub excluded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub remote_path: String,
    pub content: Vec<u8>,
}

/// Outcome of `download_tree`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadRecord {
    pub downloaded: usize,
    pub failed: usize,
    pub files: Vec<DownloadedFile>,
}

/// What happened to one file requested by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFile {
    Downloaded(Vec<u8>),
    /// The file exists but holds zero bytes
    Empty,
    /// Nothing was ever written at that path
    Missing,
    Failed(String),
}

/// Copy `local_root` into `remote_root`, skipping excluded paths without
/// descending into them. A file that fails is counted and the upload goes on.
pub async fn upload_tree(
    env: &dyn Environment,
    local_root: &Path,
    remote_root: &str,
    rules: &ExclusionRuleSet,
) -> Result<UploadRecord> {
    info!(
        "Uploading {} to {}:{}",
        local_root.display(),
        env.id(),
        remote_root
    );

    env.make_dir(remote_root).await?;

    let mut created_dirs: HashSet<String> = HashSet::from([remote_root.to_string()]);
    let mut record = UploadRecord::default();
    let mut walker = TreeWalker::new(local_root, rules);

    while let Some(file) = walker
        .next_file()
        .map_err(|e| SyncError::local(local_root, e))?
    {
        let remote_path = remote_join(remote_root, &to_remote_relative(&file.relative));

        match upload_one(env, &file.absolute, &remote_path, &mut created_dirs).await {
            Ok(()) => {
                record.uploaded += 1;
                debug!("Uploaded {}", file.relative.display());
            }
            Err(e) => {
                record.skipped += 1;
                warn!("Failed to upload {}: {}", file.relative.display(), e);
            }
        }
    }

    record.excluded = walker.excluded();
    record.skipped += walker.unreadable();

    info!(
        "Uploaded {} files ({} skipped, {} excluded)",
        record.uploaded, record.skipped, record.excluded
    );
    Ok(record)
}

async fn upload_one(
    env: &dyn Environment,
    local_path: &Path,
    remote_path: &str,
    created_dirs: &mut HashSet<String>,
) -> Result<()> {
    let data = fs::read(local_path)
        .await
        .map_err(|e| SyncError::local(local_path, e))?;

    let parent = remote_parent(remote_path);
    if !created_dirs.contains(&parent) {
        env.make_dir(&parent).await?;
        created_dirs.insert(parent);
    }

    env.write_file(remote_path, data).await?;
    Ok(())
}

/// Mirror `remote_root` into `local_root`. A remote root that does not exist
/// yields an empty record.
pub async fn download_tree(
    env: &dyn Environment,
    remote_root: &str,
    local_root: &Path,
) -> Result<DownloadRecord> {
    let mut record = DownloadRecord::default();
    let mut pending: VecDeque<String> = VecDeque::from([remote_root.to_string()]);

    while let Some(dir) = pending.pop_front() {
        let entries = match env.list_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() && dir == remote_root => {
                info!("Remote directory {} does not exist, nothing to download", dir);
                return Ok(record);
            }
            Err(e) => {
                warn!("Failed to list {}: {}", dir, e);
                record.failed += 1;
                continue;
            }
        };

        for entry in entries {
            let Some(relative) = relative_local_path(remote_root, &entry.path) else {
                warn!("Refusing to download {} outside {}", entry.path, remote_root);
                record.failed += 1;
                continue;
            };
            let local_path = local_root.join(&relative);

            match entry.kind {
                EntryKind::Dir => {
                    fs::create_dir_all(&local_path)
                        .await
                        .map_err(|e| SyncError::local(&local_path, e))?;
                    pending.push_back(entry.path);
                }
                EntryKind::File => match download_one(env, &entry.path, &local_path).await {
                    Ok(content) => {
                        record.downloaded += 1;
                        record.files.push(DownloadedFile {
                            remote_path: entry.path,
                            content,
                        });
                    }
                    Err(e) => {
                        record.failed += 1;
                        warn!("Failed to download {}: {}", entry.path, e);
                    }
                },
            }
        }
    }

    info!(
        "Downloaded {} files ({} failed)",
        record.downloaded, record.failed
    );
    Ok(record)
}

async fn download_one(env: &dyn Environment, remote_path: &str, local_path: &Path) -> Result<Vec<u8>> {
    let content = env.read_file(remote_path).await?.into_bytes();
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::local(parent, e))?;
    }
    fs::write(local_path, &content)
        .await
        .map_err(|e| SyncError::local(local_path, e))?;
    Ok(content)
}

/// Fetch each named file under `remote_root` independently
pub async fn download_named<S: AsRef<str>>(
    env: &dyn Environment,
    remote_root: &str,
    names: &[S],
) -> BTreeMap<String, ReportFile> {
    let mut files = BTreeMap::new();

    for name in names {
        let name = name.as_ref();
        let remote_path = remote_join(remote_root, name);
        let outcome = match env.read_file(&remote_path).await {
            Ok(content) if content.is_empty() => {
                warn!("{} exists but is empty", name);
                ReportFile::Empty
            }
            Ok(content) => {
                info!("Downloaded {}", name);
                ReportFile::Downloaded(content.into_bytes())
            }
            Err(e) if e.is_not_found() => {
                warn!("{} was not produced", name);
                ReportFile::Missing
            }
            Err(e) => {
                warn!("Failed to download {}: {}", name, e);
                ReportFile::Failed(e.to_string())
            }
        };
        files.insert(name.to_string(), outcome);
    }

    files
}

/// Send one local file, creating its remote parent directory
pub async fn upload_file(env: &dyn Environment, local_path: &Path, remote_path: &str) -> Result<()> {
    let data = fs::read(local_path)
        .await
        .map_err(|e| SyncError::local(local_path, e))?;
    env.make_dir(&remote_parent(remote_path)).await?;
    env.write_file(remote_path, data).await?;
    Ok(())
}

/// Fetch one remote file, creating local parents; returns the byte count
pub async fn download_file(env: &dyn Environment, remote_path: &str, local_path: &Path) -> Result<usize> {
    download_one(env, remote_path, local_path)
        .await
        .map(|content| content.len())
}

fn to_remote_relative(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Local relative path for a remote entry, `None` if it escapes the root
fn relative_local_path(remote_root: &str, remote_path: &str) -> Option<PathBuf> {
    let root = remote_root.trim_end_matches('/');
    let rest = remote_path.strip_prefix(root)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }

    let mut relative = PathBuf::new();
    for segment in rest.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if segment == ".." {
            return None;
        }
        relative.push(segment);
    }
    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_local_path() {
        assert_eq!(
            relative_local_path("/home/user/project/audit-results", "/home/user/project/audit-results/a/b.json"),
            Some(PathBuf::from("a").join("b.json"))
        );
        assert_eq!(relative_local_path("/r", "/r/../etc/passwd"), None);
        assert_eq!(relative_local_path("/r", "/rx/a"), None);
        assert_eq!(relative_local_path("/r", "/r"), None);
    }

    #[test]
    fn test_to_remote_relative_uses_forward_slashes() {
        let path = Path::new("src").join("pages").join("index.astro");
        assert_eq!(to_remote_relative(&path), "src/pages/index.astro");
    }
}
