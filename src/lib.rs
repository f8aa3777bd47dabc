//! A parallel BGZF (Blocked GZIP) encoder with an in-line BAM index
//! builder hook.
//!
//! [`BgzfWriter`] accepts a regular byte stream through its [`Write`]
//! implementation, buffers it into fixed-size blocks, and hands each
//! block off to a pool of worker threads for independent deflate
//! compression. Workers may finish in any order; the blocks are always
//! placed on the underlying sink in the exact order they were submitted.
//! A [`BgzfReader`] is included for round-tripping what this crate wrote.
//!
//! BAM-style indexing needs each alignment record's virtual file
//! pointers rewritten once its enclosing block's real compressed offset
//! is known — which, under parallel compression, happens well after the
//! record was produced. [`DeferredIndexer`] buffers records in
//! producer order and performs that rewrite the moment each block is
//! placed, forwarding fully-resolved records to a caller-supplied
//! [`IndexBuilder`] delegate. This crate implements only that
//! rewrite-and-forward machinery; the delegate (bins, linear index,
//! metadata) is out of scope.
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//! use pbgzf::BgzfWriter;
//!
//! let mut writer = BgzfWriter::builder().build(Vec::new());
//! writer.write_all(b"hello bgzf\n").unwrap();
//! writer.close().unwrap();
//! ```

use std::io::{self, Write};

pub mod codec;
pub mod error;
pub mod index;
pub mod pool;
pub mod reader;
pub mod vpos;
pub mod writer;

pub use codec::BgzfBlockCodec;
pub use error::Error;
pub use flate2::Compression;
pub use index::{DeferredIndexer, IndexBuilder, NullIndexBuilder, Unindexed};
pub use pool::{DeflaterPool, DeflaterPoolBuilder};
pub use reader::BgzfReader;
pub use vpos::{AlignmentRecord, Chunk, VirtualPosition};
pub use writer::{check_terminator, BgzfWriter, BgzfWriterBuilder};

/// Uncompressed bytes buffered per block before it is handed to a
/// worker. 65280 = 64 KiB minus slack for the largest possible BGZF
/// header/footer overhead, so a maximally-expanded block still fits
/// under [`MAX_COMPRESSED_BLOCK_SIZE`].
pub const DEFAULT_UNCOMPRESSED_BLOCK_SIZE: usize = 65_280;

/// The hard cap on a single framed BGZF block, imposed by the 16-bit
/// BSIZE field in its header.
pub const MAX_COMPRESSED_BLOCK_SIZE: usize = 64 * 1024;

/// Length in bytes of a BGZF block header (fixed gzip header plus the
/// `BC` FEXTRA subfield).
pub const BLOCK_HEADER_LENGTH: usize = 18;

/// Length in bytes of a BGZF block footer (CRC32 + ISIZE).
pub const BLOCK_FOOTER_LENGTH: usize = 8;

/// The canonical 28-byte empty BGZF block every conforming stream ends
/// with. Byte-identical to the EOF marker other BGZF implementations
/// emit, so files this crate writes are indistinguishable from theirs
/// at the tail.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02, 0x00,
    0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
