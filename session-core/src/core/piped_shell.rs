//! Piped (non-pty) subprocess fallback used when a real pseudo-terminal
//! cannot be allocated (restricted sandboxes, containers without `openpty`).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

type OutputBuffer = Arc<Mutex<Vec<u8>>>;

const OUTPUT_CAP_BYTES: usize = 1_048_576;

pub struct PipedShellHandle {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    output: OutputBuffer,
    child: Arc<Mutex<Option<Child>>>,
}

impl PipedShellHandle {
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

        let mut child = command.spawn().context("spawn piped subprocess")?;

        let stdin = child.stdin.take().context("missing stdin")?;
        let stdout = child.stdout.take().context("missing stdout")?;
        let stderr = child.stderr.take().context("missing stderr")?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let handle = Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
            output: output.clone(),
            child: Arc::new(Mutex::new(Some(child))),
        };

        spawn_drain(stdout, output.clone());
        spawn_drain(stderr, output);

        Ok(handle)
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        match guard.as_mut() {
            Some(stdin) => {
                stdin.write_all(data).await?;
                stdin.flush().await?;
                Ok(())
            }
            None => Err(anyhow::anyhow!("piped shell stdin unavailable")),
        }
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut buffer = self.output.lock().await;
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

    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

fn spawn_drain<R>(mut reader: R, output: OutputBuffer)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0u8; 4096];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut out = output.lock().await;
                    out.extend_from_slice(&buffer[..n]);
                    if out.len() > OUTPUT_CAP_BYTES {
                        let drop_count = out.len() - OUTPUT_CAP_BYTES;
                        out.drain(..drop_count);
                    }
                }
                Err(err) => {
                    tracing::debug!("piped shell read error: {err}");
                    break;
                }
            }
        }
    });
}
