//! PTY (pseudo-terminal) transport for interactive subprocess sessions.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};

/// Minimum and maximum PTY dimensions accepted by `resize`.
pub const MIN_COLS: u16 = 12;
pub const MAX_COLS: u16 = 400;
pub const MIN_ROWS: u16 = 6;
pub const MAX_ROWS: u16 = 220;

/// Clamp a requested terminal size into the supported range.
pub fn clamp_size(rows: u16, cols: u16) -> (u16, u16) {
    (rows.clamp(MIN_ROWS, MAX_ROWS), cols.clamp(MIN_COLS, MAX_COLS))
}

/// Handle to a spawned pty-backed subprocess.
pub struct PtyHandle {
    size: Mutex<PtySize>,
    master: Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    reader: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl PtyHandle {
    /// Create a handle for a PTY of the given size. The size is clamped to the
    /// supported range before the pty pair is allocated.
    pub fn new(rows: u16, cols: u16) -> Result<Self> {
        let (rows, cols) = clamp_size(rows, cols);
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        Ok(Self {
            size: Mutex::new(size),
            master: Arc::new(Mutex::new(None)),
            child: Arc::new(Mutex::new(None)),
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
        })
    }

    /// Spawn an arbitrary command in the pty.
    pub async fn spawn_command(&self, cmd: CommandBuilder) -> Result<()> {
        let size = *self.size.lock().unwrap();
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size).context("open pty pair")?;

        let child = pair.slave.spawn_command(cmd).context("spawn pty command")?;
        *self.child.lock().unwrap() = Some(child);

        let reader = pair.master.try_clone_reader().context("clone pty reader")?;
        *self.reader.lock().unwrap() = Some(reader);

        let writer = pair.master.take_writer().context("take pty writer")?;
        *self.writer.lock().unwrap() = Some(writer);

        *self.master.lock().unwrap() = Some(pair.master);
        Ok(())
    }

    /// Spawn a coding-tool subprocess (codex/claude/opencode etc.) by binary
    /// name and argv in the given working directory.
    pub async fn spawn_tool(
        &self,
        binary: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
    ) -> Result<()> {
        let mut cmd = CommandBuilder::new(binary);
        for arg in args {
            cmd.arg(arg);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.cwd(working_dir);
        self.spawn_command(cmd).await
    }

    /// Write raw bytes to the pty's master side (delivered to the child's stdin).
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer_lock = self.writer.lock().unwrap();
        if let Some(writer) = writer_lock.as_mut() {
            writer.write_all(data)?;
            writer.flush()?;
            Ok(())
        } else {
            Err(anyhow::anyhow!("pty not started"))
        }
    }

    /// Read whatever output is currently available without blocking.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let reader_arc = self.reader.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut reader_lock = reader_arc.lock().unwrap();
            if let Some(reader) = reader_lock.as_mut() {
                let mut buffer = vec![0u8; 8192];
                match reader.read(&mut buffer) {
                    Ok(0) => Ok(Vec::new()),
                    Ok(n) => {
                        buffer.truncate(n);
                        Ok(buffer)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
                    Err(e) => Err(anyhow::anyhow!("pty read error: {e}")),
                }
            } else {
                Err(anyhow::anyhow!("pty reader not initialized"))
            }
        })
        .await?
    }

    /// Resize the live pty. Dimensions are clamped into the supported range
    /// before being applied.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let (rows, cols) = clamp_size(rows, cols);
        let new_size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        if let Some(master) = self.master.lock().unwrap().as_ref() {
            master.resize(new_size).context("resize pty")?;
        }
        *self.size.lock().unwrap() = new_size;
        Ok(())
    }

    /// Current pty size as (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        let size = self.size.lock().unwrap();
        (size.rows, size.cols)
    }

    /// Whether the child process is still believed to be running.
    pub fn is_running(&self) -> bool {
        let mut child_lock = self.child.lock().unwrap();
        match child_lock.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the child process outright.
    pub fn kill(&self) -> Result<()> {
        let mut child_lock = self.child.lock().unwrap();
        if let Some(child) = child_lock.as_mut() {
            child.kill().context("kill pty child")?;
        }
        Ok(())
    }

    /// Read with a bounded wait, returning whatever arrived (possibly empty).
    pub async fn read_with_timeout(&self, timeout_ms: u64) -> Result<Vec<u8>> {
        match timeout(Duration::from_millis(timeout_ms), self.read()).await {
            Ok(result) => result,
            Err(_) => Ok(Vec::new()),
        }
    }
}
