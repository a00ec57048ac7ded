use std::time::Duration;

use sandbox_relay_gateway::{
    CreateSandbox, GatewayError, LocalGateway, OutputLine, RunOptions, SandboxGateway,
};
use tokio::sync::mpsc;

fn create_request() -> CreateSandbox {
    let mut request = CreateSandbox {
        template: "local".to_string(),
        timeout: Duration::from_secs(60),
        ..CreateSandbox::default()
    };
    request
        .envs
        .insert("RELAY_GREETING".to_string(), "hello".to_string());
    request
}

#[tokio::test]
async fn commands_run_in_sandbox_home_with_env() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    let result = sandbox
        .run("echo \"$RELAY_GREETING\" && pwd && echo oops >&2 && exit 3", RunOptions::default())
        .await
        .expect("run");

    assert_eq!(result.exit_code, 3);
    let mut stdout = result.stdout.lines();
    assert_eq!(stdout.next(), Some("hello"));
    assert_eq!(stdout.next(), Some(sandbox.home_dir()));
    assert_eq!(result.stderr, "oops\n");
}

#[tokio::test]
async fn streaming_preserves_line_order() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = sandbox
        .run(
            "for i in 1 2 3 4 5; do echo line-$i; done",
            RunOptions::new(Duration::from_secs(10)).streaming(tx),
        )
        .await
        .expect("run");
    assert!(result.success());

    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    let expected: Vec<OutputLine> = (1..=5)
        .map(|i| OutputLine::Stdout(format!("line-{i}")))
        .collect();
    assert_eq!(lines, expected);
}

#[tokio::test]
async fn write_file_resolves_relative_to_home() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    sandbox
        .write_file(".router/config.json", "{\"ok\":true}")
        .await
        .expect("write");
    let result = sandbox
        .run("cat .router/config.json", RunOptions::default())
        .await
        .expect("run");
    assert_eq!(result.stdout, "{\"ok\":true}\n");
}

#[tokio::test]
async fn commands_past_their_timeout_fail() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    let err = sandbox
        .run("sleep 5", RunOptions::new(Duration::from_millis(100)))
        .await
        .expect_err("timeout");
    assert!(matches!(err, GatewayError::Timeout { timeout_ms: 100, .. }));
}

#[tokio::test]
async fn connect_finds_live_sandboxes_only() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    let again = gateway.connect(sandbox.id()).await.expect("connect");
    assert_eq!(again.id(), sandbox.id());
    assert!(again.exposed_url(5173).is_some());
    assert!(again.capability_gateway().await.expect("capabilities").is_none());

    let missing = gateway.connect("local-missing").await;
    assert!(matches!(missing, Err(GatewayError::NotFound { .. })));

    let short_lived = gateway
        .create(CreateSandbox {
            timeout: Duration::ZERO,
            ..create_request()
        })
        .await
        .expect("create");
    let expired = gateway.connect(short_lived.id()).await;
    assert!(matches!(expired, Err(GatewayError::NotFound { .. })));
}

#[tokio::test]
async fn invalid_utf8_lines_do_not_end_the_stream() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = sandbox
        .run(
            r#"printf 'before\n\377\n{"type":"result","session_id":"sid"}\n'"#,
            RunOptions::new(Duration::from_secs(10)).streaming(tx),
        )
        .await
        .expect("run");
    assert_eq!(result.exit_code, 0);

    let result_line = r#"{"type":"result","session_id":"sid"}"#;
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    assert_eq!(
        lines,
        vec![
            OutputLine::Stdout("before".to_string()),
            OutputLine::Stdout("\u{FFFD}".to_string()),
            OutputLine::Stdout(result_line.to_string()),
        ]
    );
    assert!(result.stdout.contains(result_line));
}

#[tokio::test]
async fn output_after_invalid_utf8_is_fully_read() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    let result = sandbox
        .run(
            r"printf '\377\n'; head -c 300000 /dev/zero | tr '\0' a",
            RunOptions::new(Duration::from_secs(10)),
        )
        .await
        .expect("run");

    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.len() > 300_000);
    assert!(result.stdout.ends_with("aaaa\n"));
}

#[tokio::test]
async fn timeout_kills_the_whole_process_group() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());
    let sandbox = gateway.create(create_request()).await.expect("create");

    let err = sandbox
        .run(
            "(sleep 1; touch late) & wait",
            RunOptions::new(Duration::from_millis(200)),
        )
        .await
        .expect_err("timeout");
    assert!(matches!(err, GatewayError::Timeout { .. }));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let late = std::path::Path::new(sandbox.home_dir()).join("late");
    assert!(!late.exists(), "background child outlived the timeout");
}

#[tokio::test]
async fn create_sweeps_expired_sandboxes() {
    let root = tempfile::tempdir().expect("tempdir");
    let gateway = LocalGateway::new(root.path());

    let short_lived = gateway
        .create(CreateSandbox {
            timeout: Duration::ZERO,
            ..create_request()
        })
        .await
        .expect("create");
    let stale_home = std::path::PathBuf::from(short_lived.home_dir());
    assert!(stale_home.exists());

    let fresh = gateway.create(create_request()).await.expect("create");

    assert!(!stale_home.exists());
    assert!(std::path::Path::new(fresh.home_dir()).exists());
    let expired = gateway.connect(short_lived.id()).await;
    assert!(matches!(expired, Err(GatewayError::NotFound { .. })));
}
