//! Unified transport handle: the session supervisor only ever writes bytes
//! in, reads bytes out, and resizes — never cares which of the three
//! concrete transports is behind the handle.

use anyhow::Result;

use super::piped_shell::PipedShellHandle;
use super::pty::PtyHandle;
use crate::rpc::RpcHandle;

pub enum TransportHandle {
    /// Native pty backed transport.
    Pty(PtyHandle),
    /// Piped shell used as a pty fallback in sandboxes without `openpty`.
    PipedShell(PipedShellHandle),
    /// Structured JSON-RPC transport over a subprocess's stdio.
    Rpc(RpcHandle),
}

impl TransportHandle {
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        match self {
            TransportHandle::Pty(handle) => handle.write(data).await,
            TransportHandle::PipedShell(handle) => handle.write(data).await,
            TransportHandle::Rpc(handle) => handle.write(data).await,
        }
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        match self {
            TransportHandle::Pty(handle) => handle.read().await,
            TransportHandle::PipedShell(handle) => handle.read().await,
            TransportHandle::Rpc(handle) => handle.read().await,
        }
    }

    pub async fn read_with_timeout(&self, timeout_ms: u64) -> Result<Vec<u8>> {
        match self {
            TransportHandle::Pty(handle) => handle.read_with_timeout(timeout_ms).await,
            TransportHandle::PipedShell(handle) => handle.read_with_timeout(timeout_ms).await,
            TransportHandle::Rpc(handle) => handle.read_with_timeout(timeout_ms).await,
        }
    }

    pub async fn is_running(&self) -> bool {
        match self {
            TransportHandle::Pty(handle) => handle.is_running(),
            TransportHandle::PipedShell(handle) => handle.is_running().await,
            TransportHandle::Rpc(handle) => handle.is_running().await,
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        match self {
            TransportHandle::Pty(handle) => handle.kill(),
            TransportHandle::PipedShell(handle) => handle.shutdown().await,
            TransportHandle::Rpc(handle) => handle.shutdown().await,
        }
    }
}
