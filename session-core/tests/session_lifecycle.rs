use session_core::{SessionConfig, SessionManager, SessionStatus, TransportKind};

#[tokio::test]
async fn pty_session_runs_a_command_and_reports_output() {
    let manager = SessionManager::new();
    let mut config = SessionConfig::default();
    config.binary = Some("/bin/sh".to_string());
    config.args = vec!["-c".to_string(), "echo hello-session".to_string()];

    let session = manager.create_session_with_config(config).await.unwrap();
    session.start().await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Running);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let output = session.read_output().await.unwrap();
    assert!(
        String::from_utf8_lossy(&output).contains("hello-session"),
        "expected greeting in pty output"
    );

    session.stop().await.unwrap();
    assert_eq!(session.status().await, SessionStatus::Terminated);
}

#[tokio::test]
async fn write_before_start_fails() {
    let manager = SessionManager::new();
    let session = manager.create_session().await.unwrap();
    assert!(session.write_input(b"hi").await.is_err());
}

#[tokio::test]
async fn rpc_transport_requires_a_binary() {
    let manager = SessionManager::new();
    let mut config = SessionConfig::default();
    config.transport = TransportKind::Rpc;
    config.binary = None;

    let session = manager.create_session_with_config(config).await.unwrap();
    assert!(session.start().await.is_err());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let manager = SessionManager::new();
    let mut config = SessionConfig::default();
    config.binary = Some("/bin/sh".to_string());
    config.args = vec!["-c".to_string(), "true".to_string()];

    let session = manager.create_session_with_config(config).await.unwrap();
    session.start().await.unwrap();
    session.stop().await.unwrap();
    session.stop().await.unwrap();
}
