//! Out-of-band stop signals.
//!
//! The server polls a [`StopSignal`] on every accept-loop tick. The file
//! backend is the cross-process control surface: any process that can
//! create a file at the configured path can stop the server. The content of
//! the file is irrelevant, only its existence counts.

use crate::error::RexecResult;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// A pollable shutdown request originating outside the server's own calls.
pub trait StopSignal: Send + Sync {
    /// Whether a stop has been requested.
    fn is_raised(&self) -> bool;

    /// Drop a stale request left over from a previous run.
    ///
    /// Returns `true` if something was cleared.
    fn clear(&self) -> RexecResult<bool> {
        Ok(false)
    }

    /// Human-readable description for log lines.
    fn describe(&self) -> String;
}

/// Stop signal backed by the existence of a file.
#[derive(Debug, Clone)]
pub struct FileStopSignal {
    path: PathBuf,
}

impl FileStopSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the flag file (and any missing parent directories).
    ///
    /// This is what the standalone stopper utility does.
    pub fn raise(&self) -> RexecResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, b"stop")?;
        info!(path = %self.path.display(), "stop flag created");
        Ok(())
    }
}

impl StopSignal for FileStopSignal {
    fn is_raised(&self) -> bool {
        self.path.exists()
    }

    fn clear(&self) -> RexecResult<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed stale stop flag");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("stop flag {}", self.path.display())
    }
}

/// In-memory stop signal, raised programmatically.
#[derive(Debug, Default)]
pub struct ManualStopSignal {
    raised: AtomicBool,
}

impl ManualStopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }
}

impl StopSignal for ManualStopSignal {
    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    fn clear(&self) -> RexecResult<bool> {
        Ok(self.raised.swap(false, Ordering::SeqCst))
    }

    fn describe(&self) -> String {
        "manual stop signal".to_string()
    }
}

/// Stop signal that is never raised (stop-flag polling disabled).
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStop;

impl StopSignal for NeverStop {
    fn is_raised(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "no external stop signal".to_string()
    }
}
