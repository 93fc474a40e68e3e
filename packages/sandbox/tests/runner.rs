// ABOUTME: Integration tests for command execution and dev server readiness polling
// ABOUTME: Uses tokio's paused clock so timeout paths run instantly

mod common;

use common::{exit, Scripted};
use siteaudit_sandbox::runner::TIMEOUT_EXIT_CODE;
use siteaudit_sandbox::{
    run, start_background, wait_for_ready, ReadinessOptions, RunOptions, RunnerError, StreamType,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn environment(script: impl Fn(&str) -> Scripted + Send + Sync + 'static) -> common::FakeEnvironment {
    common::FakeEnvironment::new("runner-test", Arc::new(script))
}

#[tokio::test]
async fn test_run_collects_output_and_forwards_chunks() {
    let env = environment(|_| Scripted::Exit {
        code: 3,
        stdout: "building...\n".to_string(),
        stderr: "warning: slow\n".to_string(),
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();

    let result = run(
        &env,
        "npm run build",
        RunOptions::default()
            .cwd("/home/user/project")
            .on_output(Arc::new(move |stream, data| {
                sink_seen
                    .lock()
                    .unwrap()
                    .push((stream, String::from_utf8_lossy(data).into_owned()));
            })),
    )
    .await
    .unwrap();

    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, "building...\n");
    assert_eq!(result.stderr, "warning: slow\n");
    assert!(!result.success());
    assert!(!result.timed_out);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (StreamType::Stdout, "building...\n".to_string()),
            (StreamType::Stderr, "warning: slow\n".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_kills_process() {
    let env = environment(|_| Scripted::Hang);

    let result = run(
        &env,
        "sleep 3600",
        RunOptions::default().timeout(Duration::from_secs(10)),
    )
    .await
    .unwrap();

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(result.timed_out);
    assert!(!result.success());
    assert_eq!(env.killed_pids(), vec![100]);
}

#[tokio::test]
async fn test_background_process_runs_until_killed() {
    let env = Arc::new(environment(|_| Scripted::Hang));

    let server = start_background(env.clone(), "npm run dev > /tmp/dev-server.log 2>&1", Some("/home/user/project"))
        .await
        .unwrap();
    let pid = server.pid();

    tokio::task::yield_now().await;
    assert!(!server.has_exited());

    server.kill().await.unwrap();
    assert_eq!(env.killed_pids(), vec![pid]);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_succeeds_once_port_answers() {
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = probes.clone();
    let env = environment(move |command| {
        if command.contains("curl") && counter.fetch_add(1, Ordering::SeqCst) >= 2 {
            exit(0, "404")
        } else {
            exit(0, "000")
        }
    });

    wait_for_ready(&env, 4321, &ReadinessOptions::default())
        .await
        .expect("server should become ready");

    assert_eq!(probes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_gives_up_after_timeout() {
    let env = environment(|command| {
        if command.starts_with("tail") {
            exit(0, "Error: Cannot find module 'astro'\n")
        } else {
            exit(0, "000")
        }
    });
    let options = ReadinessOptions {
        timeout: Duration::from_secs(5),
        interval: Duration::from_secs(1),
        log_path: Some("/tmp/dev-server.log".to_string()),
    };

    let started = Instant::now();
    let err = wait_for_ready(&env, 4321, &options)
        .await
        .expect_err("port never opens");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(5), "gave up early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "overshot: {:?}", elapsed);
    match err {
        RunnerError::ReadinessTimeout {
            port,
            timeout,
            log_tail,
        } => {
            assert_eq!(port, 4321);
            assert_eq!(timeout, Duration::from_secs(5));
            assert!(log_tail.contains("Cannot find module"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_probe_near_deadline_does_not_overshoot() {
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = probes.clone();
    // The server accepts the second connection but never answers it
    let env = environment(move |command| {
        if command.starts_with("curl") && counter.fetch_add(1, Ordering::SeqCst) == 1 {
            Scripted::Hang
        } else {
            exit(0, "000")
        }
    });
    let options = ReadinessOptions {
        timeout: Duration::from_secs(5),
        interval: Duration::from_secs(3),
        log_path: None,
    };

    let started = Instant::now();
    let err = wait_for_ready(&env, 4321, &options)
        .await
        .expect_err("port never answers");
    let elapsed = started.elapsed();

    assert!(matches!(err, RunnerError::ReadinessTimeout { .. }));
    assert_eq!(probes.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_secs(5), "gave up early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "overshot: {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_cancelled_by_outer_timeout() {
    let env = environment(|_| exit(0, "000"));
    let options = ReadinessOptions {
        timeout: Duration::from_secs(60),
        ..ReadinessOptions::default()
    };

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_millis(2000),
        wait_for_ready(&env, 3000, &options),
    )
    .await;

    assert!(outcome.is_err(), "outer timeout should win");
    assert!(started.elapsed() < Duration::from_secs(3));
}
