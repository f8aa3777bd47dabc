//! A serial BGZF reader.
//!
//! This is ambient functionality, not part of the parallel-encoder
//! contract: the core of this crate only writes BGZF. A reader is needed
//! so the round-trip property in `spec.md` §8 (invariant 6) can actually
//! be exercised by a conforming decoder, and so callers have something to
//! open files this crate wrote. Grounded on `BgzfSyncReader` in the
//! upstream crate this one descends from.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};
use flate2::{Crc, Decompress, FlushDecompress};

use crate::{BLOCK_FOOTER_LENGTH, BLOCK_HEADER_LENGTH};

/// Reads a BGZF stream, transparently decompressing block by block.
pub struct BgzfReader<R>
where
    R: Read,
{
    inner: R,
    compressed: BytesMut,
    uncompressed: BytesMut,
    decompressor: Decompress,
}

impl<R> BgzfReader<R>
where
    R: Read,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            compressed: BytesMut::new(),
            uncompressed: BytesMut::new(),
            decompressor: Decompress::new(false),
        }
    }

    /// Reads and decompresses the next block, if any. Returns `false` on a
    /// clean EOF (no bytes available where a header was expected).
    fn fill_next_block(&mut self) -> io::Result<bool> {
        let mut header = [0u8; BLOCK_HEADER_LENGTH];
        match read_exact_or_eof(&mut self.inner, &mut header)? {
            false => return Ok(false),
            true => {}
        }
        check_header(&header)?;
        let block_size = LittleEndian::read_u16(&header[16..18]) as usize + 1;
        let remaining = block_size - BLOCK_HEADER_LENGTH;

        self.compressed.clear();
        self.compressed.resize(remaining, 0);
        self.inner.read_exact(&mut self.compressed)?;

        let footer_at = remaining - BLOCK_FOOTER_LENGTH;
        let payload = &self.compressed[..footer_at];
        let expected_crc = LittleEndian::read_u32(&self.compressed[footer_at..footer_at + 4]);
        let isize = LittleEndian::read_u32(&self.compressed[footer_at + 4..footer_at + 8]) as usize;

        self.uncompressed.clear();
        self.uncompressed.resize(isize, 0);
        if isize > 0 {
            self.decompressor
                .decompress(payload, &mut self.uncompressed, FlushDecompress::Finish)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.decompressor.reset(false);
        }

        let mut crc = Crc::new();
        crc.update(&self.uncompressed);
        if crc.sum() != expected_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "BGZF block CRC32 mismatch",
            ));
        }

        Ok(true)
    }
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated BGZF block header",
                ));
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn check_header(header: &[u8; BLOCK_HEADER_LENGTH]) -> io::Result<()> {
    if header[0] != 0x1f || header[1] != 0x8b {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad gzip magic"));
    }
    if header[3] & 0x04 != 0x04 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "FEXTRA flag not set",
        ));
    }
    if header[12] != b'B' || header[13] != b'C' {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad BGZF SI1/SI2"));
    }
    Ok(())
}

impl<R> Read for BgzfReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            if self.uncompressed.is_empty() {
                if !self.fill_next_block()? {
                    break;
                }
                continue;
            }
            let n = std::cmp::min(buf.len() - total, self.uncompressed.remaining());
            self.uncompressed.copy_to_slice(&mut buf[total..total + n]);
            total += n;
        }
        Ok(total)
    }
}
