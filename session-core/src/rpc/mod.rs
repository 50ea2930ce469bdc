//! Structured-RPC transport: a subprocess speaking line-delimited JSON-RPC
//! on stdout, with request/response correlation by id and a side channel for
//! the raw transcript bytes the session supervisor still wants to persist.

pub mod jsonrpc;

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Duration};

pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};

const TRANSCRIPT_CAP_BYTES: usize = 1_048_576;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

type PendingMap = DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>;

/// Handle to a structured-RPC tool subprocess.
pub struct RpcHandle {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    child: Arc<Mutex<Option<Child>>>,
    pending: Arc<PendingMap>,
    transcript: Arc<Mutex<Vec<u8>>>,
    next_id: AtomicI64,
    /// The remote conversation identifier, once the subprocess reports one.
    thread_id: Arc<Mutex<Option<String>>>,
}

impl RpcHandle {
    pub async fn spawn<'a>(
        binary: &str,
        args: &[String],
        working_dir: &Path,
        env: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command.spawn().context("spawn rpc subprocess")?;
        let stdin = child.stdin.take().context("missing stdin")?;
        let stdout = child.stdout.take().context("missing stdout")?;
        let stderr = child.stderr.take().context("missing stderr")?;

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let transcript = Arc::new(Mutex::new(Vec::new()));
        let thread_id = Arc::new(Mutex::new(None));

        spawn_reader(stdout, pending.clone(), transcript.clone(), thread_id.clone());
        spawn_stderr_drain(stderr, transcript.clone());

        Ok(Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
            child: Arc::new(Mutex::new(Some(child))),
            pending,
            transcript,
            next_id: AtomicI64::new(1),
            thread_id,
        })
    }

    /// Raw bytes written verbatim to the subprocess's stdin (used for plain
    /// piped-text protocols; structured calls should use [`Self::call`]).
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        match guard.as_mut() {
            Some(stdin) => {
                stdin.write_all(data).await?;
                stdin.flush().await?;
                Ok(())
            }
            None => Err(anyhow::anyhow!("rpc subprocess stdin unavailable")),
        }
    }

    /// Drain transcript bytes accumulated from stdout/stderr (non-JSON-RPC
    /// framing noise and any plain-text the tool prints alongside RPC frames).
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut buffer = self.transcript.lock().await;
        if buffer.is_empty() {
            return Ok(Vec::new());
        }
        Ok(std::mem::take(&mut buffer))
    }

    pub async fn read_with_timeout(&self, timeout_ms: u64) -> Result<Vec<u8>> {
        match timeout(Duration::from_millis(timeout_ms), self.read()).await {
            Ok(result) => result,
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Send a JSON-RPC request and await its matched response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let line = serde_json::to_string(&request)?;
        if let Err(err) = self.write_line(&line).await {
            self.pending.remove(&id);
            return Err(err);
        }

        match timeout(Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(anyhow::anyhow!("rpc subprocess closed before responding")),
            Err(_) => {
                self.pending.remove(&id);
                Err(anyhow::anyhow!("rpc call to {method} timed out"))
            }
        }
    }

    /// Send a notification, which has no response.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&notification)?;
        self.write_line(&line).await
    }

    /// Start a new turn (the rpc analogue of writing text to a pty).
    pub async fn start_turn(&self, text: &str) -> Result<JsonRpcResponse> {
        self.call("turn/start", Some(serde_json::json!({ "text": text })))
            .await
    }

    /// Interrupt the active turn, if any.
    pub async fn interrupt(&self) -> Result<()> {
        self.notify("turn/interrupt", None).await
    }

    pub async fn thread_id(&self) -> Option<String> {
        self.thread_id.lock().await.clone()
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        match guard.as_mut() {
            Some(stdin) => {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await?;
                Ok(())
            }
            None => Err(anyhow::anyhow!("rpc subprocess stdin unavailable")),
        }
    }

    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        self.pending.clear();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

fn spawn_reader<R>(
    reader: R,
    pending: Arc<PendingMap>,
    transcript: Arc<Mutex<Vec<u8>>>,
    thread_id: Arc<Mutex<Option<String>>>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    handle_line(&line, &pending, &transcript, &thread_id).await;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!("rpc stdout read error: {err}");
                    break;
                }
            }
        }
    });
}

async fn handle_line(
    line: &str,
    pending: &PendingMap,
    transcript: &Mutex<Vec<u8>>,
    thread_id: &Mutex<Option<String>>,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    match serde_json::from_str::<JsonRpcMessage>(trimmed) {
        Ok(JsonRpcMessage::Response(response)) => {
            if let Some((_, tx)) = pending.remove(&response.id) {
                let _ = tx.send(response);
            }
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            if notification.method == "session/thread" {
                if let Some(params) = &notification.params {
                    if let Some(id) = params.get("threadId").and_then(Value::as_str) {
                        *thread_id.lock().await = Some(id.to_string());
                    }
                }
            }
            append_transcript(transcript, trimmed.as_bytes()).await;
        }
        Ok(JsonRpcMessage::Request(_)) | Err(_) => {
            append_transcript(transcript, line.as_bytes()).await;
            append_transcript(transcript, b"\n").await;
        }
    }
}

async fn append_transcript(transcript: &Mutex<Vec<u8>>, bytes: &[u8]) {
    let mut guard = transcript.lock().await;
    guard.extend_from_slice(bytes);
    if guard.len() > TRANSCRIPT_CAP_BYTES {
        let drop_count = guard.len() - TRANSCRIPT_CAP_BYTES;
        guard.drain(..drop_count);
    }
}

fn spawn_stderr_drain<R>(mut reader: R, transcript: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
    tokio::spawn(async move {
        let mut buffer = vec![0u8; 4096];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => append_transcript(&transcript, &buffer[..n]).await,
                Err(err) => {
                    tracing::debug!("rpc stderr read error: {err}");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::jsonrpc::*;

    #[test]
    fn response_matches_request_id() {
        let mut builder = JsonRpcBuilder::new();
        let request = builder.request("turn/start", None);
        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id.clone(),
            result: Some(serde_json::json!({"accepted": true})),
            error: None,
        };
        assert_eq!(request.id, response.id);
    }
}
