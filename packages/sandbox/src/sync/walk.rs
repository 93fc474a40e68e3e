// ABOUTME: Local directory walker built on walkdir with exclusion pruning
// ABOUTME: Never follows directory symlinks and never descends into excluded directories

use super::exclude::ExclusionRuleSet;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// A file found under the walk root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    pub relative: PathBuf,
    pub absolute: PathBuf,
}

/// Yields files one at a time. The walk can be dropped between any two
/// entries; a directory is only read once the walk reaches it.
pub struct TreeWalker<'a> {
    root: PathBuf,
    rules: &'a ExclusionRuleSet,
    entries: walkdir::IntoIter,
    excluded: usize,
    unreadable: usize,
}

impl<'a> TreeWalker<'a> {
    pub fn new(root: impl AsRef<Path>, rules: &'a ExclusionRuleSet) -> Self {
        let root = root.as_ref().to_path_buf();
        let entries = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self {
            root,
            rules,
            entries,
            excluded: 0,
            unreadable: 0,
        }
    }

    /// Entries (files or whole directories) skipped by the rules so far
    pub fn excluded(&self) -> usize {
        self.excluded
    }

    /// Entries that could not be read so far
    pub fn unreadable(&self) -> usize {
        self.unreadable
    }

    /// Next included file, `None` when the tree is exhausted.
    /// Only a failure to read the root itself is an error.
    pub fn next_file(&mut self) -> std::io::Result<Option<WalkedFile>> {
        while let Some(next) = self.entries.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    self.unreadable += 1;
                    continue;
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_path_buf();

            if self.rules.should_exclude(&relative) {
                self.excluded += 1;
                if entry.file_type().is_dir() {
                    self.entries.skip_current_dir();
                }
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_file() {
                return Ok(Some(WalkedFile {
                    relative,
                    absolute: entry.into_path(),
                }));
            }

            // Linked files are sent as their content; linked directories are
            // left alone so a link to an ancestor cannot loop the walk
            if file_type.is_symlink() {
                match std::fs::metadata(entry.path()) {
                    Ok(target) if target.is_file() => {
                        return Ok(Some(WalkedFile {
                            relative,
                            absolute: entry.into_path(),
                        }));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Skipping dangling link {}: {}", relative.display(), e);
                        self.unreadable += 1;
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collect(walker: &mut TreeWalker<'_>) -> Vec<String> {
        let mut files = Vec::new();
        while let Some(file) = walker.next_file().unwrap() {
            files.push(file.relative.to_string_lossy().replace('\\', "/"));
        }
        files.sort();
        files
    }

    #[test]
    fn test_walk_prunes_excluded_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/components")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg/deep")).unwrap();
        std::fs::write(root.join("package.json"), "{}").unwrap();
        std::fs::write(root.join("src/index.ts"), "export {}").unwrap();
        std::fs::write(root.join("src/components/Nav.astro"), "<nav/>").unwrap();
        std::fs::write(root.join("node_modules/pkg/deep/a.js"), "").unwrap();
        std::fs::write(root.join("debug.log"), "").unwrap();

        let rules = ExclusionRuleSet::defaults();
        let mut walker = TreeWalker::new(root, &rules);
        let files = collect(&mut walker);

        assert_eq!(
            files,
            vec!["package.json", "src/components/Nav.astro", "src/index.ts"]
        );
        // node_modules counted once, its subtree is never read
        assert_eq!(walker.excluded(), 2);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let rules = ExclusionRuleSet::default();
        let mut walker = TreeWalker::new(dir.path().join("absent"), &rules);

        assert!(walker.next_file().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_link_to_ancestor_is_not_followed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("pages")).unwrap();
        std::fs::write(root.join("index.html"), "<html/>").unwrap();
        std::fs::write(root.join("pages/about.html"), "<p/>").unwrap();
        std::os::unix::fs::symlink(".", root.join("loop")).unwrap();
        std::os::unix::fs::symlink("..", root.join("pages/up")).unwrap();
        std::os::unix::fs::symlink("index.html", root.join("home.html")).unwrap();

        let rules = ExclusionRuleSet::defaults();
        let mut walker = TreeWalker::new(root, &rules);

        assert_eq!(
            collect(&mut walker),
            vec!["home.html", "index.html", "pages/about.html"]
        );
        assert_eq!(walker.unreadable(), 0);
    }
}
