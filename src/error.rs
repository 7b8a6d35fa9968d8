use thiserror::Error;

/// Top level error type. Every fallible operation in this crate returns
/// `Result<_, Error>`. The variants are grouped into the five kinds the
/// design calls out: bad arguments, corrupt persistent headers, allocator
/// exhaustion, mapping-provider I/O failure, and invariant violations
/// detected mid-traversal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad arguments: oversize/empty keys, out-of-range indices, conflicting
    /// open flags, a value-vector size mismatch supplied by the caller. The
    /// call fails without mutating persistent state.
    #[error("logic error: {0}")]
    Logic(&'static str),

    /// A persistent header (pool, vector, or trie) failed to validate on
    /// open: wrong magic, mismatched version, truncated data, or a failed
    /// integrity hash.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// The allocator ran out of blocks, nodes, entries, or key-buffer space.
    /// The caller may be able to recover by running `defrag` and retrying.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The mapping provider failed. Propagated unchanged.
    #[error("I/O error")]
    Io(#[from] IoError),

    /// An on-disk invariant was violated during a traversal that should be
    /// impossible to reach with correct persistent state: a label mismatch
    /// on a path the tree says must exist, an out-of-range page pointer, and
    /// similar "this cannot happen" conditions. Fatal: callers should not try
    /// to recover, only report and abort.
    #[error("internal invariant violation: {0}")]
    Internal(&'static str),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FormatError {
    #[error("unrecognized file type tag")]
    FileType,
    #[error("unrecognized format version")]
    Version,
    #[error("file size is not a multiple of the chunk size, or below the minimum")]
    FileSize,
    #[error("persistent header failed its integrity hash")]
    HashMismatch,
    #[error("value size at open did not match the size recorded in the header")]
    ValueSizeMismatch,
    #[error("paged vector page/table shape (PS/TS/STS) at open did not match the shape recorded in the header")]
    PageShapeMismatch,
    #[error("both root headers are duplicated or otherwise unreadable")]
    DuplicateOrCorruptRoots,
    #[error("header data was truncated or malformed")]
    Truncated,
}

/// I/O failures from the mapping provider (L0). Kept as its own enum, in the
/// teacher's style, because each failure mode carries distinct context
/// (requested vs. available size, the offending offset) that's worth
/// preserving on the way up through [`Error::Io`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IoError {
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    #[error("can't resize the backing file: have 0x{size:x} bytes, wanted 0x{requested:x} bytes")]
    Resize {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    #[error("can't map any more chunks: tried to get 0x{requested:x} bytes")]
    Map {
        requested: usize,
        source: std::io::Error,
    },
    #[error("punching a hole in the sparse backing file failed")]
    HolePunch(#[source] std::io::Error),
    #[error("invalid access attempted at offset 0x{offset:x} with length 0x{len:x}")]
    InvalidAccess { offset: usize, len: usize },
}

impl Error {
    pub(crate) fn logic(msg: &'static str) -> Self {
        Error::Logic(msg)
    }

    pub(crate) fn resource_exhausted(msg: &'static str) -> Self {
        Error::ResourceExhausted(msg)
    }
}

/// Panic with an [`Error::Internal`]-formatted message. Reserved for
/// invariant violations (§7 `Internal`): never used for ordinary argument
/// validation, which should return `Err(Error::Logic(..))` instead.
macro_rules! bug {
    ($msg:literal) => {
        panic!("{}", $crate::error::Error::Internal($msg))
    };
}
pub(crate) use bug;
