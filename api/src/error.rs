//! Error types shared by the whole crate.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KbitError>;

/// Everything that can go wrong while answering a query. All variants are
/// fatal for the current request; there is no retry logic anywhere below.
#[derive(Error, Debug)]
pub enum KbitError {
    /// Malformed k-mer, bad flag range, invalid substring, and friends.
    #[error("bad input: {0}")]
    BadInput(String),

    /// A resume cursor that is unparseable or does not match the request.
    #[error("bad cursor: {0}")]
    BadCursor(&'static str),

    /// The shard directory index or GC histogram is missing or inconsistent.
    #[error("bad index: {0}")]
    BadIndex(String),

    /// A shard file could not be read as KBITv1.
    #[error("shard {}: {}", path.display(), kind)]
    ShardIo { path: PathBuf, kind: ShardIoKind },

    /// The compressed-bitmap payload was rejected by the deserializer.
    #[error("shard {}: bitmap deserialization failed", path.display())]
    DecodeFail { path: PathBuf },

    /// A membership key that no shard range owns.
    #[error("k-mer {kmer} is outside all shard ranges")]
    OutOfRange { kmer: String },

    /// Mutually incompatible k parameters.
    #[error("config conflict: {0}")]
    ConfigConflict(String),
}

/// The distinct ways a KBITv1 file can fail to load, short of payload
/// deserialization (which is [`KbitError::DecodeFail`]).
#[derive(Error, Debug)]
pub enum ShardIoKind {
    #[error("{0}")]
    Open(#[from] std::io::Error),

    #[error("bad magic (not a KBITv1 file)")]
    BadMagic,

    #[error("unsupported payload flags {0}")]
    UnsupportedFlags(u64),

    #[error("truncated payload ({got} of {want} bytes)")]
    Truncated { got: u64, want: u64 },
}

impl KbitError {
    pub(crate) fn shard_io(path: &std::path::Path, kind: ShardIoKind) -> Self {
        KbitError::ShardIo {
            path: path.to_path_buf(),
            kind,
        }
    }
}
