//! Pseudo-terminal bridge.
//!
//! Owns the operator's shell process and exposes its output as a blocking
//! stream of chunks. The broadcast pipeline consumes any
//! [`TerminalSource`]; [`PtyBridge`] is the real one.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// Size of a single read from the PTY.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Terminal size used when the operator's terminal cannot be queried.
pub const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Errors that can occur while driving the shell.
#[derive(Error, Debug)]
pub enum PtyError {
    /// Failed to spawn the PTY or the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The shell has already exited or the bridge was closed.
    #[error("PTY already closed")]
    Closed,
}

/// A blocking source of terminal output that also accepts input.
///
/// `read_chunk` may block; callers run it on a blocking thread.
pub trait TerminalSource: Send + Sync + 'static {
    /// Reads the next chunk. `Ok(None)` means end of stream.
    fn read_chunk(&self) -> std::io::Result<Option<Vec<u8>>>;

    /// Sends operator keystrokes to the shell.
    fn write_input(&self, data: &[u8]) -> Result<(), PtyError>;

    /// Stops the source. Pending and future reads return end of stream.
    fn close(&self);
}

/// Returns the operator's terminal size as `(cols, rows)`.
pub fn terminal_size() -> (u16, u16) {
    match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => FALLBACK_SIZE,
    }
}

/// The operator's shell running under a pseudo-terminal.
pub struct PtyBridge {
    master: Mutex<Box<dyn MasterPty + Send>>,
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    running: AtomicBool,
    pid: Option<u32>,
}

impl PtyBridge {
    /// Spawns `shell` under a new PTY of the given size.
    pub fn spawn(shell: &str, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        if let Ok(dir) = std::env::current_dir() {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        tracing::info!(shell = %shell, pid = ?pid, cols = cols, rows = rows, "Spawned shell");

        Ok(Self {
            master: Mutex::new(pair.master),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            running: AtomicBool::new(true),
            pid,
        })
    }

    /// Process ID of the shell, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the bridge is still open.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resizes the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::Closed);
        }

        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        tracing::debug!(cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    /// Exit code of the shell if it has already exited.
    pub fn try_wait(&self) -> Option<u32> {
        match lock(&self.child).try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }
}

impl TerminalSource for PtyBridge {
    fn read_chunk(&self) -> std::io::Result<Option<Vec<u8>>> {
        if !self.is_running() {
            return Ok(None);
        }

        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        let result = lock(&self.reader).read(&mut buffer);
        match result {
            Ok(0) => Ok(None),
            Ok(n) => {
                buffer.truncate(n);
                Ok(Some(buffer))
            }
            // Linux reports EIO once the slave side is gone.
            Err(_) if !self.is_running() || self.try_wait().is_some() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_input(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::Closed);
        }

        let mut writer = lock(&self.writer);
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut child = lock(&self.child);
        if let Err(e) = child.kill() {
            tracing::debug!(error = %e, "Shell already gone");
        }
        match child.wait() {
            Ok(status) => tracing::info!(code = status.exit_code(), "Shell exited"),
            Err(e) => tracing::warn!(error = %e, "Failed to reap shell"),
        }
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// A terminal source fed from an in-process channel instead of a shell.
///
/// Replays whatever is sent through the paired [`ChannelFeed`]; the stream
/// ends when the feed is dropped or the source is closed. Keystrokes written
/// to it are kept and can be drained with [`ChannelSource::take_input`].
pub struct ChannelSource {
    output: Mutex<std::sync::mpsc::Receiver<Vec<u8>>>,
    input: Mutex<Vec<u8>>,
    running: AtomicBool,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelFeed {
    tx: std::sync::mpsc::Sender<Vec<u8>>,
}

impl ChannelFeed {
    /// Queues a chunk of terminal output. Returns false once the source is gone.
    pub fn send(&self, chunk: impl Into<Vec<u8>>) -> bool {
        self.tx.send(chunk.into()).is_ok()
    }
}

impl ChannelSource {
    /// How often a blocked read rechecks whether the source was closed.
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(20);

    /// Creates a source and its feed.
    pub fn new() -> (Self, ChannelFeed) {
        let (tx, rx) = std::sync::mpsc::channel();
        let source = Self {
            output: Mutex::new(rx),
            input: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        };
        (source, ChannelFeed { tx })
    }

    /// Drains the keystrokes written so far.
    pub fn take_input(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.input))
    }
}

impl TerminalSource for ChannelSource {
    fn read_chunk(&self) -> std::io::Result<Option<Vec<u8>>> {
        use std::sync::mpsc::RecvTimeoutError;

        let output = lock(&self.output);
        while self.running.load(Ordering::SeqCst) {
            match output.recv_timeout(Self::POLL_INTERVAL) {
                Ok(chunk) => return Ok(Some(chunk)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
        Ok(None)
    }

    fn write_input(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        lock(&self.input).extend_from_slice(data);
        Ok(())
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
