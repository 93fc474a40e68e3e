// ABOUTME: Wire-level tests for the E2B provider against a mock HTTP server
// ABOUTME: Covers sandbox allocation, teardown, file transfer and streamed process output

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use siteaudit_sandbox::providers::{EnvironmentConfig, FileContent, ProviderError};
use siteaudit_sandbox::{run, E2BProvider, Environment, Provider, RunOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> EnvironmentConfig {
    EnvironmentConfig {
        template: "audit-template".to_string(),
        timeout: Duration::from_secs(1800),
        env_vars: HashMap::new(),
        metadata: HashMap::from([("type".to_string(), "generic".to_string())]),
    }
}

fn envelope(flags: u8, value: serde_json::Value) -> Vec<u8> {
    let payload = serde_json::to_vec(&value).unwrap();
    let mut frame = vec![flags];
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Provider whose control plane and in-sandbox daemon both live on `server`
async fn connected(server: &MockServer) -> Arc<dyn Environment> {
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .and(header("X-API-Key", "test-key"))
        .and(body_partial_json(json!({"templateID": "audit-template", "timeout": 1800})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "sandboxID": "sbx-123",
            "envdAccessToken": "envd-token"
        })))
        .expect(1)
        .mount(server)
        .await;

    E2BProvider::new("test-key".to_string(), Some(server.uri()), None)
        .unwrap()
        .with_envd_url(server.uri())
        .create_environment(&config())
        .await
        .expect("create failed")
}

#[tokio::test]
async fn test_create_and_kill_sandbox() {
    let server = MockServer::start().await;
    let env = connected(&server).await;
    assert_eq!(env.id(), "sbx-123");

    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    env.kill().await.expect("kill failed");
}

#[tokio::test]
async fn test_kill_of_vanished_sandbox_is_ok() {
    let server = MockServer::start().await;
    let env = connected(&server).await;

    Mock::given(method("DELETE"))
        .and(path("/sandboxes/sbx-123"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(env.kill().await.is_ok());
}

#[tokio::test]
async fn test_rejected_api_key_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
        .mount(&server)
        .await;

    let provider = E2BProvider::new("bad-key".to_string(), Some(server.uri()), None).unwrap();
    let result = provider.create_environment(&config()).await;

    assert!(matches!(result, Err(ProviderError::AuthError(_))));
}

#[tokio::test]
async fn test_read_file_and_missing_file() {
    let server = MockServer::start().await;
    let env = connected(&server).await;

    Mock::given(method("GET"))
        .and(path("/files"))
        .and(query_param("path", "/tmp/results/axe-results.json"))
        .and(header("X-Access-Token", "envd-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"[]".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .and(query_param("path", "/tmp/results/pa11y-results.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let content = env.read_file("/tmp/results/axe-results.json").await.unwrap();
    assert_eq!(content, FileContent::Binary(b"[]".to_vec()));

    let missing = env.read_file("/tmp/results/pa11y-results.json").await;
    assert!(matches!(missing, Err(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn test_make_dir_tolerates_existing_directory() {
    let server = MockServer::start().await;
    let env = connected(&server).await;

    Mock::given(method("POST"))
        .and(path("/filesystem.Filesystem/MakeDir"))
        .and(header("Connect-Protocol-Version", "1"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "already_exists",
            "message": "directory exists"
        })))
        .mount(&server)
        .await;

    env.make_dir("/home/user/project").await.expect("existing dir is fine");
}

#[tokio::test]
async fn test_list_dir_maps_entry_kinds() {
    let server = MockServer::start().await;
    let env = connected(&server).await;

    Mock::given(method("POST"))
        .and(path("/filesystem.Filesystem/ListDir"))
        .and(body_partial_json(json!({"path": "/tmp/results"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {"name": "lighthouse-results.json", "type": "FILE_TYPE_FILE", "path": "/tmp/results/lighthouse-results.json"},
                {"name": "screenshots", "type": "FILE_TYPE_DIRECTORY", "path": "/tmp/results/screenshots"}
            ]
        })))
        .mount(&server)
        .await;

    let entries = env.list_dir("/tmp/results").await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "lighthouse-results.json");
    assert_eq!(entries[1].path, "/tmp/results/screenshots");
    assert_eq!(entries[1].kind, siteaudit_sandbox::providers::EntryKind::Dir);
}

#[tokio::test]
async fn test_streamed_process_output_and_exit_code() {
    let server = MockServer::start().await;
    let env = connected(&server).await;

    let mut body = Vec::new();
    body.extend(envelope(0, json!({"event": {"start": {"pid": 7}}})));
    body.extend(envelope(
        0,
        json!({"event": {"data": {"stdout": STANDARD.encode("200")}}}),
    ));
    body.extend(envelope(
        0,
        json!({"event": {"data": {"stderr": STANDARD.encode("warn\n")}}}),
    ));
    body.extend(envelope(0, json!({"event": {"end": {"exitCode": 2, "exited": true}}})));
    body.extend(envelope(0x02, json!({})));

    Mock::given(method("POST"))
        .and(path("/process.Process/Start"))
        .and(header("Content-Type", "application/connect+json"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/connect+json"))
        .mount(&server)
        .await;

    let result = run(&*env, "pa11y http://localhost:4321", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.exit_code, 2);
    assert_eq!(result.stdout, "200");
    assert_eq!(result.stderr, "warn\n");
    assert!(!result.timed_out);
}
