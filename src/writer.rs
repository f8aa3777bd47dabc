//! The public parallel BGZF writer.
//!
//! `BgzfWriter` buffers uncompressed bytes up to the BGZF block-size cap,
//! then hands each full block to a [`DeflaterPool`] for out-of-order
//! compression and in-order placement. Builder shape and the
//! buffer-then-submit write loop are grounded on `ParCompress`/
//! `ParCompressBuilder` in the upstream crate this one descends from.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
pub use flate2::Compression;

use crate::index::{DeferredIndexer, IndexBuilder, NullIndexBuilder, Unindexed};
use crate::pool::{DeflaterPool, DeflaterPoolBuilder};
use crate::vpos::VirtualPosition;
use crate::{Error, BGZF_EOF, DEFAULT_UNCOMPRESSED_BLOCK_SIZE};

/// Builder for [`BgzfWriter`].
pub struct BgzfWriterBuilder {
    compression_level: Compression,
    parallelism: usize,
    write_terminator: bool,
    block_capacity: usize,
}

impl Default for BgzfWriterBuilder {
    fn default() -> Self {
        Self {
            compression_level: Compression::new(5),
            parallelism: num_cpus::get(),
            write_terminator: true,
            block_capacity: DEFAULT_UNCOMPRESSED_BLOCK_SIZE,
        }
    }
}

impl BgzfWriterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression_level(mut self, level: Compression) -> Self {
        self.compression_level = level;
        self
    }

    /// Number of compressor worker threads. Must be `>= 1`.
    pub fn parallelism(mut self, parallelism: usize) -> Result<Self, Error> {
        if parallelism == 0 {
            return Err(Error::NumThreads(parallelism));
        }
        self.parallelism = parallelism;
        Ok(self)
    }

    /// Whether `close()` appends the canonical 28-byte BGZF EOF block.
    /// Defaults to `true`; set to `false` when writing a fragment that
    /// will be concatenated with other BGZF streams before a terminator
    /// is appended once, at the end.
    pub fn write_terminator(mut self, write_terminator: bool) -> Self {
        self.write_terminator = write_terminator;
        self
    }

    /// Uncompressed bytes buffered per block before it's submitted for
    /// compression. Must leave room for worst-case deflate expansion
    /// within the BGZF frame; the default matches the spec's
    /// `BGZF_BLOCK_SIZE`.
    pub fn block_capacity(mut self, block_capacity: usize) -> Result<Self, Error> {
        if block_capacity == 0 || block_capacity > DEFAULT_UNCOMPRESSED_BLOCK_SIZE {
            return Err(Error::BufferSize(block_capacity, DEFAULT_UNCOMPRESSED_BLOCK_SIZE));
        }
        self.block_capacity = block_capacity;
        Ok(self)
    }

    /// Build a writer with no indexing delegate; records processed via an
    /// indexer built separately are simply not possible with this
    /// constructor.
    pub fn build<W>(self, sink: W) -> BgzfWriter
    where
        W: Write + Send + 'static,
    {
        let indexer = Arc::new(DeferredIndexer::new(NullIndexBuilder::<Unindexed>::default()));
        self.build_with_indexer(sink, indexer)
    }

    /// Build a writer that reports every placed block's real compressed
    /// offset to `indexer`, which the caller drives with
    /// `DeferredIndexer::process_alignment` as records are produced.
    pub fn build_with_indexer<W, D>(self, sink: W, indexer: Arc<DeferredIndexer<D>>) -> BgzfWriter
    where
        W: Write + Send + 'static,
        D: IndexBuilder + 'static,
    {
        let pool = DeflaterPoolBuilder::new()
            .parallelism(self.parallelism)
            .expect("parallelism already validated")
            .compression_level(self.compression_level)
            .write_terminator(self.write_terminator)
            .build(sink, indexer);

        BgzfWriter {
            pool,
            buffer: BytesMut::with_capacity(self.block_capacity),
            block_capacity: self.block_capacity,
            next_block_idx: 0,
            closed: false,
        }
    }
}

/// A `Write` implementation that compresses its input in parallel and
/// writes it out as a BGZF stream, with blocks placed in the exact order
/// they were submitted regardless of which worker finishes first.
pub struct BgzfWriter {
    pool: DeflaterPool,
    buffer: BytesMut,
    block_capacity: usize,
    next_block_idx: u64,
    closed: bool,
}

impl BgzfWriter {
    pub fn builder() -> BgzfWriterBuilder {
        BgzfWriterBuilder::new()
    }

    /// The preliminary virtual pointer for the next byte that would be
    /// written. `block_address` is a logical block index, not yet a real
    /// compressed offset — see `crate::index` for how it gets resolved.
    pub fn virtual_position(&self) -> VirtualPosition {
        VirtualPosition::pack_unchecked(self.next_block_idx, self.buffer.len() as u32)
    }

    fn emit_current_block(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let payload = std::mem::replace(&mut self.buffer, BytesMut::with_capacity(self.block_capacity));
        let idx = self.next_block_idx;
        self.next_block_idx += 1;
        self.pool.submit(idx, payload)
    }

    /// Flush any buffered bytes as a final (possibly short) block, close
    /// the pool, and — unless disabled on the builder — append the BGZF
    /// EOF terminator.
    pub fn close(mut self) -> Result<(), Error> {
        self.emit_current_block()?;
        self.pool.close()?;
        self.closed = true;
        Ok(())
    }
}

impl Write for BgzfWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let space = self.block_capacity - self.buffer.len();
            let n = std::cmp::min(space, buf.len() - written);
            self.buffer.extend_from_slice(&buf[written..written + n]);
            written += n;
            if self.buffer.len() == self.block_capacity {
                self.emit_current_block().map_err(to_io_error)?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_current_block().map_err(to_io_error)?;
        self.pool.flush().map_err(to_io_error)
    }
}

impl Drop for BgzfWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.emit_current_block();
        let _ = self.pool.close();
    }
}

fn to_io_error(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Reopen `path` and confirm its last 28 bytes are the canonical BGZF EOF
/// block. Only meaningful for seekable regular files; a writer's sink may
/// be a pipe or socket, in which case this check simply doesn't apply —
/// callers should not treat `Ok(false)` from a non-seekable sink as proof
/// of corruption.
pub fn check_terminator<P: AsRef<Path>>(path: P) -> Result<bool, Error> {
    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    if len < BGZF_EOF.len() as u64 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-(BGZF_EOF.len() as i64)))?;
    let mut tail = [0u8; 28];
    file.read_exact(&mut tail)?;
    Ok(tail == BGZF_EOF)
}
