//! Port traits at the edges of the engine: where bytes come from/go to, how
//! progress is reported, and how an in-flight operation is cancelled.
//! Concrete filesystem implementations live in `volume`.

use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::Result;

/// A readable, seekable archive volume, handed out on demand so the pipeline
/// never has to hold every volume open at once.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Source side of an unpack: resolves volume indices to open readers.
pub trait UnpackSource: Send + Sync {
    /// Opens the base archive file (volume 0, e.g. `name.dz`).
    fn open_base(&self) -> Result<Box<dyn ReadSeek>>;

    /// Opens a split-volume continuation file by 1-based index
    /// (`name.d01`, `name.d02`, ...).
    fn open_volume(&self, index: u16) -> Result<Box<dyn ReadSeek>>;

    /// Byte length of a volume, used to compute the last chunk's effective
    /// compressed length.
    fn volume_len(&self, index: u16) -> Result<u64>;
}

/// Whether an operation ran to completion or was cut short by cancellation or
/// a fatal error, passed to a sink's `finalize` so it can decide whether to
/// commit or discard whatever it already wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Committed,
    Aborted,
}

/// Sink side of an unpack: where extracted files land.
pub trait UnpackSink: Send + Sync {
    /// Opens (creating parent directories as needed) the destination for a
    /// logical, already-sanitized path.
    fn create_file(&self, logical_path: &str) -> Result<Box<dyn Write + Send>>;

    /// Opens a sidecar sibling of `logical_path` (named `logical_path` plus
    /// `suffix`, e.g. `.rangecoder` or `.raw`) for a chunk whose codec was
    /// skipped or failed under `keep_raw`. The raw compressed bytes are
    /// written here instead of being spliced into the main file.
    fn create_sidecar(&self, logical_path: &str, suffix: &str) -> Result<Box<dyn Write + Send>>;

    /// Called exactly once, after every file has been written or the
    /// operation was cut short. The default no-op implementation is correct
    /// for a sink that writes files directly and has nothing to commit or
    /// roll back; a sink staging into a temp directory can use `Aborted` to
    /// discard it instead of promoting it into place.
    fn finalize(&self, outcome: FinalizeOutcome) -> Result<()> {
        let _ = outcome;
        Ok(())
    }
}

/// Source side of a pack: reads file contents to be chunked and compressed.
pub trait PackSource: Send + Sync {
    fn open_file(&self, logical_path: &str) -> Result<Box<dyn Read + Send>>;

    fn file_len(&self, logical_path: &str) -> Result<u64>;
}

/// Sink side of a pack: where the archive volumes are written.
pub trait PackSink: Send + Sync {
    fn create_base(&self) -> Result<Box<dyn Write + Send>>;

    fn create_volume(&self, index: u16) -> Result<Box<dyn Write + Send>>;

    /// The name the on-disk volume-name list should record for a split
    /// volume (index >= 1); the main volume (index 0) is unnamed in that
    /// table. Called by the pack writer when it first rolls onto a volume.
    fn volume_name(&self, index: u16) -> Result<String>;

    /// Called exactly once, after the archive has been fully written or the
    /// operation was cut short. See `UnpackSink::finalize`.
    fn finalize(&self, outcome: FinalizeOutcome) -> Result<()> {
        let _ = outcome;
        Ok(())
    }
}

/// Reports progress and warnings during unpack/pack. The default `NoOpObserver`
/// is used by library callers that don't need UI feedback; `dzip-cli` supplies
/// an indicatif-backed implementation.
pub trait ProgressObserver: Send + Sync {
    fn set_total(&self, total: u64) {
        let _ = total;
    }

    fn advance(&self, delta: u64) {
        let _ = delta;
    }

    fn info(&self, message: &str) {
        log::info!("{message}");
    }

    fn warn(&self, message: &str) {
        log::warn!("{message}");
    }

    fn finish(&self, message: &str) {
        let _ = message;
    }
}

pub struct NoOpObserver;

impl ProgressObserver for NoOpObserver {}

/// A cooperative cancellation flag, checked at I/O and chunk boundaries
/// inside the pipeline rather than forcibly interrupting a thread.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(crate::error::DzipError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_round_trips() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }

    #[test]
    fn cloned_token_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
