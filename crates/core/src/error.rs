use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DzipError>;

/// The error taxonomy for the archive engine. Parse-level errors abort the
/// operation; per-chunk codec failures are recoverable on unpack when the
/// caller sets `keep_raw` (see `pipeline::unpack`), always fatal on pack.
#[derive(Debug, Error)]
pub enum DzipError {
    #[error("bad magic: expected 'DTRZ', found {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u8),

    #[error("archive truncated while reading {0}")]
    Truncated(&'static str),

    #[error("corrupt index ({kind}): offending index {offender}")]
    CorruptIndex { kind: String, offender: u32 },

    #[error("chunk {chunk_id} has invalid compression flags")]
    BadChunkFlags { chunk_id: u16 },

    #[error("chunk {chunk_id} uses unsupported codec (flag {flag:#06x})")]
    UnsupportedCodec { chunk_id: u16, flag: u16 },

    #[error("codec failure on chunk {chunk_id}: {source}")]
    CodecFailure {
        chunk_id: u16,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("path traversal rejected: {path}")]
    PathTraversal { path: String },

    #[error("volume {index} is missing")]
    VolumeMissing { index: u16 },

    #[error("size mismatch on chunk {chunk_id}: expected {expected}, got {got}")]
    SizeMismatch {
        expected: u64,
        got: u64,
        chunk_id: u16,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DzipError {
    pub fn codec_failure(
        chunk_id: u16,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DzipError::CodecFailure {
            chunk_id,
            source: Box::new(source),
        }
    }
}
