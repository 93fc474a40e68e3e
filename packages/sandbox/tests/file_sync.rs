// ABOUTME: Integration tests for uploading project trees and downloading results
// ABOUTME: Runs against the in-memory provider with real temporary directories

mod common;

use common::FakeEnvironment;
use pretty_assertions::assert_eq;
use siteaudit_sandbox::sync::{download_file, upload_file};
use siteaudit_sandbox::{
    download_named, download_tree, upload_tree, ExclusionRuleSet, ReportFile, UploadRecord,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const REMOTE_ROOT: &str = "/home/user/project";

fn environment() -> FakeEnvironment {
    FakeEnvironment::new("sync-test", common::succeed_all())
}

fn write(root: &Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn sample_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "package.json", br#"{"name": "site"}"#);
    write(root, "src/pages/index.astro", b"<h1>Hello</h1>");
    write(root, "public/favicon.ico", &[0x00, 0xff, 0xfe, 0x10, 0x80]);
    write(root, "node_modules/astro/index.js", b"module.exports = {}");
    write(root, ".git/HEAD", b"ref: refs/heads/main");
    write(root, "debug.log", b"noise");
    write(root, ".env", b"SECRET=1");
    dir
}

#[tokio::test]
async fn test_upload_skips_excluded_paths() {
    let project = sample_project();
    let env = environment();

    let record = upload_tree(&env, project.path(), REMOTE_ROOT, &ExclusionRuleSet::defaults())
        .await
        .expect("upload failed");

    assert_eq!(record.uploaded, 3);
    assert_eq!(record.skipped, 0);
    // node_modules and .git count once each, plus debug.log and .env
    assert_eq!(record.excluded, 4);

    assert!(env.file("/home/user/project/package.json").is_some());
    assert!(env.file("/home/user/project/src/pages/index.astro").is_some());
    assert!(env.file("/home/user/project/node_modules/astro/index.js").is_none());
    assert!(env.file("/home/user/project/.env").is_none());
}

#[tokio::test]
async fn test_upload_then_download_preserves_bytes() {
    let project = sample_project();
    let env = environment();
    upload_tree(&env, project.path(), REMOTE_ROOT, &ExclusionRuleSet::defaults())
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    let record = download_tree(&env, REMOTE_ROOT, target.path()).await.unwrap();

    assert_eq!(record.downloaded, 3);
    assert_eq!(record.failed, 0);
    for relative in ["package.json", "src/pages/index.astro", "public/favicon.ico"] {
        assert_eq!(
            fs::read(target.path().join(relative)).unwrap(),
            fs::read(project.path().join(relative)).unwrap(),
            "{} differs after round trip",
            relative
        );
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_upload_does_not_follow_directory_links() {
    let project = TempDir::new().unwrap();
    write(project.path(), "index.html", b"<html></html>");
    std::os::unix::fs::symlink(".", project.path().join("loop")).unwrap();
    let env = environment();

    let record = upload_tree(&env, project.path(), REMOTE_ROOT, &ExclusionRuleSet::defaults())
        .await
        .expect("upload failed");

    assert_eq!(
        record,
        UploadRecord {
            uploaded: 1,
            skipped: 0,
            excluded: 0
        }
    );
    assert_eq!(env.file_count(), 1);
    assert!(env.file("/home/user/project/loop/index.html").is_none());
}

#[tokio::test]
async fn test_failed_file_is_counted_and_upload_continues() {
    let project = TempDir::new().unwrap();
    for i in 1..=10 {
        write(project.path(), &format!("file-{:02}.txt", i), format!("file {}", i).as_bytes());
    }
    let env = environment();
    env.fail_writes_to("/home/user/project/file-04.txt");

    let record = upload_tree(&env, project.path(), REMOTE_ROOT, &ExclusionRuleSet::new(Vec::<String>::new()))
        .await
        .expect("a single failing file must not abort the upload");

    assert_eq!(
        record,
        UploadRecord {
            uploaded: 9,
            skipped: 1,
            excluded: 0
        }
    );
    assert!(env.file("/home/user/project/file-04.txt").is_none());
    assert!(env.file("/home/user/project/file-10.txt").is_some());
}

#[tokio::test]
async fn test_custom_patterns_add_to_defaults() {
    let project = sample_project();
    write(project.path(), "src/generated/schema.ts", b"export {}");
    let env = environment();

    let rules = ExclusionRuleSet::with_defaults(["src/generated"]);
    let record = upload_tree(&env, project.path(), REMOTE_ROOT, &rules).await.unwrap();

    assert_eq!(record.uploaded, 3);
    assert!(env.file("/home/user/project/src/generated/schema.ts").is_none());
    assert!(env.file("/home/user/project/node_modules/astro/index.js").is_none());
}

#[tokio::test]
async fn test_download_of_missing_root_is_empty() {
    let env = environment();
    let target = TempDir::new().unwrap();

    let record = download_tree(&env, "/home/user/results", target.path())
        .await
        .expect("missing root is not an error");

    assert_eq!(record.downloaded, 0);
    assert_eq!(record.failed, 0);
    assert!(record.files.is_empty());
}

#[tokio::test]
async fn test_download_named_reports_each_state() {
    let env = environment();
    env.put_file("/tmp/results/lighthouse-results.json", b"{}");
    env.put_file("/tmp/results/pa11y-results.json", b"");

    let files = download_named(
        &env,
        "/tmp/results",
        &["lighthouse-results.json", "pa11y-results.json", "axe-results.json"],
    )
    .await;

    assert_eq!(
        files.get("lighthouse-results.json"),
        Some(&ReportFile::Downloaded(b"{}".to_vec()))
    );
    assert_eq!(files.get("pa11y-results.json"), Some(&ReportFile::Empty));
    assert_eq!(files.get("axe-results.json"), Some(&ReportFile::Missing));
}

#[tokio::test]
async fn test_single_file_transfer() {
    let local = TempDir::new().unwrap();
    write(local.path(), "report.json", b"[1,2,3]");
    let env = Arc::new(environment());

    upload_file(&*env, &local.path().join("report.json"), "/tmp/nested/dir/report.json")
        .await
        .unwrap();
    let bytes = download_file(&*env, "/tmp/nested/dir/report.json", &local.path().join("copy/report.json"))
        .await
        .unwrap();

    assert_eq!(bytes, 7);
    assert_eq!(fs::read(local.path().join("copy/report.json")).unwrap(), b"[1,2,3]");
}
