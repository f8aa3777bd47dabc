//! Crate-wide error type.
//!
//! Mirrors the flat, non-hierarchical `GzpError` style of the upstream
//! crate this one is descended from: one enum, one variant per failure
//! kind, `thiserror` for `Display`/`source` wiring.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The underlying deflate implementation failed.
    #[error("deflate codec failure")]
    Codec(#[source] std::io::Error),

    /// A compressed block did not fit inside the BGZF frame even after
    /// falling back to stored (no-compression) encoding. The block-size
    /// cap is chosen so this can't happen; seeing it means an invariant
    /// upstream of the codec has been violated.
    #[error("compressed block of {0} bytes exceeds the {1}-byte BGZF frame")]
    BlockOverflow(usize, usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("BGZF stream is missing its EOF terminator block")]
    MissingTerminator,

    #[error("invalid virtual pointer fields: block_address={block_address}, intra_offset={intra_offset}")]
    InvalidPointerFields { block_address: u64, intra_offset: u32 },

    #[error("index builder type mismatch")]
    IndexerTypeMismatch,

    #[error("indexer.finish() called with unresolved records still pending")]
    UnresolvedRecordsAtFinish,

    #[error("parallelism must be >= 1, got {0}")]
    NumThreads(usize),

    #[error("buffer size {0} is smaller than the minimum {1}")]
    BufferSize(usize, usize),

    #[error("a compressor worker was lost")]
    WorkerLost,

    #[error("failed to send across an internal channel")]
    ChannelSend,

    #[error(transparent)]
    ChannelRecv(#[from] flume::RecvError),
}
