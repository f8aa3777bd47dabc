//! BGZF block framing: deflate one block, frame it with the BGZF header
//! and footer, falling back to stored encoding when compression would
//! overflow the frame.
//!
//! Grounded on `bgzf::compress`/`header_inner`/`footer_inner` in the
//! upstream crate this one descends from, cross-checked against
//! `noodles_bgzf::writer::write_header`/`write_trailer` for field layout.

use byteorder::{LittleEndian, WriteBytesExt};
pub use flate2::Compression;
use flate2::{Compress, Crc, FlushCompress};

use crate::{
    Error, BLOCK_FOOTER_LENGTH, BLOCK_HEADER_LENGTH, MAX_COMPRESSED_BLOCK_SIZE,
};

/// Extra scratch space budgeted for the compressed payload beyond the
/// input length: small blocks can expand slightly under deflate before
/// falling back to stored encoding.
const EXTRA_FRACTION: f64 = 0.1;

#[inline]
fn scratch_len(input_len: usize) -> usize {
    input_len + std::cmp::max(128, (input_len as f64 * EXTRA_FRACTION) as usize)
}

/// Per-worker compressor state. Each [`crate::pool::DeflaterPool`] worker
/// owns exactly one of these; it is never shared across threads.
pub struct BgzfBlockCodec {
    compressor: Compress,
    level: Compression,
}

impl BgzfBlockCodec {
    pub fn new(level: Compression) -> Self {
        Self {
            compressor: Compress::new(level, false),
            level,
        }
    }

    /// Deflate `uncompressed` into a complete, framed BGZF block.
    ///
    /// # Errors
    /// - [`Error::Codec`] if the underlying deflate call fails.
    /// - [`Error::BlockOverflow`] if even the stored-encoding fallback
    ///   doesn't fit in [`MAX_COMPRESSED_BLOCK_SIZE`] — defined to be
    ///   impossible given the block-size cap; seeing it means an upstream
    ///   invariant has been violated.
    pub fn encode(&mut self, uncompressed: &[u8]) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::with_capacity(scratch_len(uncompressed.len()));
        self.compressor
            .compress_vec(uncompressed, &mut payload, FlushCompress::Finish)
            .map_err(|e| Error::Codec(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.compressor.reset();

        let budget = MAX_COMPRESSED_BLOCK_SIZE - BLOCK_HEADER_LENGTH - BLOCK_FOOTER_LENGTH;
        if payload.len() > budget {
            // Expansion case: re-deflate at no compression. Guaranteed to
            // fit because BGZF_BLOCK_SIZE is chosen so stored overhead
            // (+5 bytes/64KiB deflate block plus our framing) can't
            // exceed MAX_COMPRESSED_BLOCK_SIZE.
            payload.clear();
            let mut stored = Compress::new(Compression::none(), false);
            stored
                .compress_vec(uncompressed, &mut payload, FlushCompress::Finish)
                .map_err(|e| Error::Codec(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            if payload.len() > budget {
                return Err(Error::BlockOverflow(
                    payload.len() + BLOCK_HEADER_LENGTH + BLOCK_FOOTER_LENGTH,
                    MAX_COMPRESSED_BLOCK_SIZE,
                ));
            }
        }

        let mut crc = Crc::new();
        crc.update(uncompressed);

        let mut block = Vec::with_capacity(BLOCK_HEADER_LENGTH + payload.len() + BLOCK_FOOTER_LENGTH);
        write_header(&mut block, self.level, payload.len() as u16)?;
        block.extend_from_slice(&payload);
        block.write_u32::<LittleEndian>(crc.sum())?;
        block.write_u32::<LittleEndian>(uncompressed.len() as u32)?;

        Ok(block)
    }
}

/// Write an 18-byte BGZF block header into `out`, per `spec.md` §6.
/// `compressed_len` is the length of the deflate payload alone (not
/// including header/footer).
fn write_header(out: &mut Vec<u8>, level: Compression, compressed_len: u16) -> Result<(), Error> {
    let xfl = if level.level() >= Compression::best().level() {
        2
    } else if level.level() <= Compression::fast().level() {
        4
    } else {
        0
    };

    out.write_u8(0x1f)?;
    out.write_u8(0x8b)?;
    out.write_u8(0x08)?; // CM = deflate
    out.write_u8(0x04)?; // FLG = FEXTRA
    out.write_u32::<LittleEndian>(0)?; // MTIME
    out.write_u8(xfl)?;
    out.write_u8(0xff)?; // OS = unknown
    out.write_u16::<LittleEndian>(6)?; // XLEN
    out.write_u8(b'B')?;
    out.write_u8(b'C')?;
    out.write_u16::<LittleEndian>(2)?; // SLEN
    let total_len = BLOCK_HEADER_LENGTH + compressed_len as usize + BLOCK_FOOTER_LENGTH;
    out.write_u16::<LittleEndian>((total_len - 1) as u16)?; // BSIZE

    Ok(())
}
