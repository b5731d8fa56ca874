use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between `open` and `close`.
///
/// Per-record decode failures never surface here, they are logged
/// and the record is dropped. Ring-level failures do surface, since
/// the ring state is not recoverable past a malformed record.
#[derive(Debug, Error)]
pub enum Error {
    /// The queue was opened without the kprobe backend flag.
    #[error("kprobe backend not requested")]
    Unsupported,

    /// The host kernel lacks something we need (tracefs, BTF, a
    /// resolvable field, the probe body offset).
    #[error("missing kernel feature: {0}")]
    MissingFeature(&'static str),

    /// Kernel BTF could not be loaded or walked.
    #[error("btf: {0}")]
    Btf(anyhow::Error),

    /// A probe argument expression failed to compile.
    #[error("bad probe expression {expr:?}: {reason}")]
    BadExpr { expr: String, reason: &'static str },

    /// A ring record claims to be larger than the linearization
    /// buffer. The shadow tail cannot move past it.
    #[error("ring record of {size} bytes exceeds the scratch buffer")]
    RecordTooBig { size: usize },

    /// A ring record claims to be smaller than its own header.
    #[error("ring record of {size} bytes is smaller than a record header")]
    RecordTruncated { size: usize },

    /// A reconstructed working directory exceeded the path limit.
    #[error("reconstructed path is too long")]
    NameTooLong,

    #[error(transparent)]
    Io(#[from] io::Error),
}
