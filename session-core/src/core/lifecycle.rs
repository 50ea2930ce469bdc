//! Start, stop, pause, and resume transitions for a session's subprocess.

use std::io::ErrorKind;

use anyhow::Result;
use portable_pty::CommandBuilder;

use super::piped_shell::PipedShellHandle;
use super::pty::PtyHandle;
use super::transport::TransportHandle;
use super::{AISession, SessionConfig, SessionStatus, TransportKind};
use crate::rpc::RpcHandle;

pub async fn start_session(session: &AISession) -> Result<()> {
    {
        let mut status = session.status.write().await;
        if *status != SessionStatus::Initializing {
            return Err(anyhow::anyhow!("session already started"));
        }
        *status = SessionStatus::Running;
    }

    let terminal = match session.config.transport {
        TransportKind::Rpc => TransportHandle::Rpc(spawn_rpc(&session.config).await?),
        TransportKind::Pty if session.config.force_headless => {
            TransportHandle::PipedShell(spawn_piped_shell(&session.config).await?)
        }
        TransportKind::Pty => match spawn_pty(&session.config).await {
            Ok(pty) => TransportHandle::Pty(pty),
            Err(err) if session.config.allow_headless_fallback && is_permission_denied(&err) => {
                tracing::warn!(
                    session = %session.id,
                    error = %err,
                    "pty unavailable, falling back to piped shell"
                );
                TransportHandle::PipedShell(spawn_piped_shell(&session.config).await?)
            }
            Err(err) => return Err(err),
        },
    };

    session.set_terminal(Some(terminal)).await;
    *session.last_activity.write().await = chrono::Utc::now();
    Ok(())
}

pub async fn stop_session(session: &AISession) -> Result<()> {
    {
        let mut status = session.status.write().await;
        if *status != SessionStatus::Running && *status != SessionStatus::Paused {
            return Ok(());
        }
        *status = SessionStatus::Terminating;
    }

    if let Some(terminal) = session.take_terminal().await {
        terminal.shutdown().await?;
    }

    *session.status.write().await = SessionStatus::Terminated;
    Ok(())
}

pub async fn pause_session(session: &AISession) -> Result<()> {
    let mut status = session.status.write().await;
    if *status != SessionStatus::Running {
        return Err(anyhow::anyhow!("session not running"));
    }
    *status = SessionStatus::Paused;
    Ok(())
}

pub async fn resume_session(session: &AISession) -> Result<()> {
    let mut status = session.status.write().await;
    if *status != SessionStatus::Paused {
        return Err(anyhow::anyhow!("session not paused"));
    }
    *status = SessionStatus::Running;
    drop(status);
    *session.last_activity.write().await = chrono::Utc::now();
    Ok(())
}

async fn spawn_pty(config: &SessionConfig) -> Result<PtyHandle> {
    let pty = PtyHandle::new(config.pty_size.0, config.pty_size.1)?;
    let binary = config
        .binary
        .clone()
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/bash".to_string());

    let mut cmd = CommandBuilder::new(&binary);
    for arg in &config.args {
        cmd.arg(arg);
    }
    cmd.cwd(&config.working_directory);
    for (key, value) in &config.environment {
        cmd.env(key, value);
    }

    pty.spawn_command(cmd).await?;
    Ok(pty)
}

async fn spawn_piped_shell(config: &SessionConfig) -> Result<PipedShellHandle> {
    let binary = config
        .binary
        .clone()
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/bash".to_string());

    PipedShellHandle::spawn(
        &binary,
        &config.args,
        &config.working_directory,
        config.environment.iter(),
    )
    .await
}

async fn spawn_rpc(config: &SessionConfig) -> Result<RpcHandle> {
    let binary = config
        .binary
        .clone()
        .ok_or_else(|| anyhow::anyhow!("rpc transport requires an explicit binary"))?;

    RpcHandle::spawn(
        &binary,
        &config.args,
        &config.working_directory,
        config.environment.iter(),
    )
    .await
}

fn is_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            io_err.kind() == ErrorKind::PermissionDenied
        } else {
            let msg = cause.to_string();
            msg.contains("PermissionDenied") || msg.contains("Operation not permitted")
        }
    })
}
