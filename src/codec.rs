//! Gzip member codec
//!
//! Every block written by the threaded writer becomes one self-contained
//! gzip member: header, raw deflate stream, CRC32 + ISIZE trailer. Members
//! concatenate into a valid multi-member gzip file, which is what lets
//! workers finish out of order without sharing any compressor state.
//!
//! The header carries an FEXTRA subfield ("PZ") holding the total member
//! length, in the spirit of BGZF block-size markers. Standard gzip readers
//! ignore it; the threaded reader uses it to cut whole members off the
//! source and inflate them in parallel.

use crc32fast::Hasher;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{PargzError, PargzResult};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// FEXTRA subfield ID for the member length marker
pub const MEMBER_SIZE_SUBFIELD: [u8; 2] = [b'P', b'Z'];

/// Header length of a member produced by [`MemberEncoder`]
pub const MARKED_HEADER_LEN: usize = 20;

/// CRC32 + ISIZE
pub const TRAILER_LEN: usize = 8;

const METHOD_DEFLATE: u8 = 8;
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const OS_UNKNOWN: u8 = 0xff;

/// Offset of the 4-byte member length inside a marked header
const MEMBER_SIZE_OFFSET: usize = 16;

/// Deflate never expands beyond ~1032:1, anything claiming more is corrupt
const MAX_INFLATE_RATIO: usize = 1032;

/// CRC32 of `data` continuing from `seed` (0 for a fresh checksum)
#[inline]
pub fn crc32(data: &[u8], seed: u32) -> u32 {
    let mut hasher = Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// Size of the pre-allocated deflate output buffer for a block.
///
/// Incompressible input grows slightly under deflate; 10% headroom (at
/// least 500 bytes) covers stored-block overhead for any block that
/// respects `block_size`.
#[inline]
pub fn deflate_buffer_size(block_size: usize) -> usize {
    block_size + std::cmp::max(block_size / 10, 500)
}

/// XFL byte as gzip writes it: 2 for maximum compression, 4 for fastest
#[inline]
fn extra_flags(level: u32) -> u8 {
    match level {
        9 => 2,
        1 => 4,
        _ => 0,
    }
}

fn write_marked_header(out: &mut Vec<u8>, level: u32) {
    out.extend_from_slice(&GZIP_MAGIC);
    out.extend_from_slice(&[
        METHOD_DEFLATE,
        FEXTRA,
        0, 0, 0, 0, // MTIME: zero keeps output reproducible
        extra_flags(level),
        OS_UNKNOWN,
    ]);
    // XLEN, then SI1 SI2 LEN(4) + placeholder member length
    out.extend_from_slice(&[8, 0]);
    out.extend_from_slice(&MEMBER_SIZE_SUBFIELD);
    out.extend_from_slice(&[4, 0]);
    out.extend_from_slice(&[0, 0, 0, 0]);
}

/// Compresses blocks into independent gzip members.
///
/// One encoder per worker; the deflate state is reset between blocks so
/// no history crosses a member boundary.
pub struct MemberEncoder {
    compress: Compress,
    level: u32,
    deflate_capacity: usize,
}

impl MemberEncoder {
    pub fn new(level: u32, block_size: usize) -> Self {
        Self {
            compress: Compress::new(Compression::new(level), false),
            level,
            deflate_capacity: deflate_buffer_size(block_size),
        }
    }

    /// Append one complete gzip member for `block` to `out`.
    ///
    /// Returns the CRC32 of the raw block. If the deflate stream does not
    /// fit the pre-sized buffer the member is rolled back and an overflow
    /// error returned; output is never truncated.
    pub fn encode(&mut self, block: &[u8], out: &mut Vec<u8>) -> PargzResult<u32> {
        // Short blocks get a buffer sized for themselves; anything past
        // the configured block size still hits the fixed capacity
        let capacity = deflate_buffer_size(block.len()).min(self.deflate_capacity);
        let start = out.len();
        out.reserve(MARKED_HEADER_LEN + capacity + TRAILER_LEN);
        write_marked_header(out, self.level);

        let deflate_start = out.len();
        out.resize(deflate_start + capacity, 0);

        self.compress.reset();
        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();
        let status = match self.compress.compress(
            block,
            &mut out[deflate_start..],
            FlushCompress::Finish,
        ) {
            Ok(status) => status,
            Err(e) => {
                out.truncate(start);
                return Err(PargzError::compression(e));
            }
        };
        let consumed = (self.compress.total_in() - before_in) as usize;
        let produced = (self.compress.total_out() - before_out) as usize;

        if status != Status::StreamEnd || consumed != block.len() {
            out.truncate(start);
            return Err(PargzError::overflow(format!(
                "Compressed output exceeds buffer size of {}",
                capacity
            )));
        }
        out.truncate(deflate_start + produced);

        let crc = crc32(block, 0);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());

        let total = out.len() - start;
        let member_len = match u32::try_from(total) {
            Ok(len) => len,
            Err(_) => {
                out.truncate(start);
                return Err(PargzError::overflow(format!(
                    "gzip member of {} bytes does not fit the size marker",
                    total
                )));
            }
        };
        let offset = start + MEMBER_SIZE_OFFSET;
        out[offset..offset + 4].copy_from_slice(&member_len.to_le_bytes());

        Ok(crc)
    }
}

/// A parsed gzip member header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberHeader {
    /// Bytes occupied by the header, up to the first deflate byte
    pub len: usize,
    /// Total member length from the "PZ" marker, when present
    pub member_size: Option<usize>,
}

fn find_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?.iter().position(|&b| b == 0).map(|i| from + i)
}

/// Parse a gzip member header at the start of `buf`.
///
/// Returns `Ok(None)` while `buf` is too short to hold the whole header.
pub fn parse_header(buf: &[u8]) -> PargzResult<Option<MemberHeader>> {
    if buf.len() < 2 {
        if buf.first().is_some_and(|&b| b != GZIP_MAGIC[0]) {
            return Err(PargzError::corrupt(format!(
                "Not a gzipped file ({:02x?})",
                buf
            )));
        }
        return Ok(None);
    }
    if buf[..2] != GZIP_MAGIC {
        return Err(PargzError::corrupt(format!(
            "Not a gzipped file ({:02x?})",
            &buf[..2]
        )));
    }
    if buf.len() < 10 {
        return Ok(None);
    }
    if buf[2] != METHOD_DEFLATE {
        return Err(PargzError::corrupt(format!(
            "Unknown compression method {}",
            buf[2]
        )));
    }

    let flags = buf[3];
    let mut pos = 10;
    let mut member_size = None;

    if flags & FEXTRA != 0 {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        let xlen = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        if buf.len() < pos + xlen {
            return Ok(None);
        }
        let extra = &buf[pos..pos + xlen];
        let mut sub = 0;
        while sub + 4 <= extra.len() {
            let id = [extra[sub], extra[sub + 1]];
            let len = u16::from_le_bytes([extra[sub + 2], extra[sub + 3]]) as usize;
            if id == MEMBER_SIZE_SUBFIELD && len == 4 && sub + 8 <= extra.len() {
                let size = u32::from_le_bytes([
                    extra[sub + 4],
                    extra[sub + 5],
                    extra[sub + 6],
                    extra[sub + 7],
                ]) as usize;
                if size != 0 {
                    member_size = Some(size);
                }
            }
            sub += 4 + len;
        }
        pos += xlen;
    }

    if flags & FNAME != 0 {
        match find_nul(buf, pos) {
            Some(end) => pos = end + 1,
            None => return Ok(None),
        }
    }

    if flags & FCOMMENT != 0 {
        match find_nul(buf, pos) {
            Some(end) => pos = end + 1,
            None => return Ok(None),
        }
    }

    if flags & FHCRC != 0 {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        pos += 2;
    }

    if let Some(size) = member_size {
        if size < pos + TRAILER_LEN {
            return Err(PargzError::corrupt(format!(
                "member size marker {} is smaller than its own header",
                size
            )));
        }
    }

    Ok(Some(MemberHeader {
        len: pos,
        member_size,
    }))
}

fn read_trailer(trailer: &[u8]) -> (u32, u32) {
    let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    (crc, isize)
}

fn verify_trailer(trailer: &[u8], crc: u32, size: u32) -> PargzResult<()> {
    let (expected_crc, expected_size) = read_trailer(trailer);
    if expected_crc != crc {
        return Err(PargzError::corrupt(format!(
            "CRC check failed {:#010x} != {:#010x}",
            crc, expected_crc
        )));
    }
    if expected_size != size {
        return Err(PargzError::corrupt("Incorrect length of data produced"));
    }
    Ok(())
}

/// Uncompressed size recorded in a complete member's trailer, capped at
/// what deflate could produce from the member's bytes
pub fn member_raw_size(member: &[u8]) -> usize {
    if member.len() < TRAILER_LEN {
        return 0;
    }
    let recorded = read_trailer(&member[member.len() - TRAILER_LEN..]).1 as usize;
    recorded.min(member.len().saturating_mul(MAX_INFLATE_RATIO) + 64)
}

/// Inflate one complete member (header through trailer), appending the
/// raw bytes to `out`.
///
/// The output buffer is pre-sized from ISIZE; a deflate stream that
/// produces more than that is an overflow, one that stops short of its
/// end-of-block marker is a truncation.
pub fn inflate_member(member: &[u8], header_len: usize, out: &mut Vec<u8>) -> PargzResult<()> {
    if member.len() < header_len + TRAILER_LEN {
        return Err(PargzError::truncated());
    }
    let trailer = &member[member.len() - TRAILER_LEN..];
    let body = &member[header_len..member.len() - TRAILER_LEN];
    let (_, isize) = read_trailer(trailer);
    let expected = isize as usize;
    if expected > body.len().saturating_mul(MAX_INFLATE_RATIO) + 64 {
        return Err(PargzError::corrupt(format!(
            "member claims {} bytes from {} compressed bytes",
            expected,
            body.len()
        )));
    }

    let start = out.len();
    out.resize(start + expected + 1, 0);
    let mut inflate = Decompress::new(false);
    let status = match inflate.decompress(body, &mut out[start..], FlushDecompress::Finish) {
        Ok(status) => status,
        Err(e) => {
            out.truncate(start);
            return Err(PargzError::corrupt(e));
        }
    };
    let produced = inflate.total_out() as usize;
    out.truncate(start + produced.min(expected + 1));

    if produced > expected {
        out.truncate(start);
        return Err(PargzError::overflow(format!(
            "Decompressed output exceeds buffer size of {}",
            expected
        )));
    }
    if status != Status::StreamEnd {
        out.truncate(start);
        return Err(PargzError::truncated());
    }

    let crc = crc32(&out[start..], 0);
    if let Err(e) = verify_trailer(trailer, crc, produced as u32) {
        out.truncate(start);
        return Err(e);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyState {
    Inflating,
    Trailer,
    Done,
}

/// Incremental decoder for the body and trailer of one gzip member.
///
/// Used for members without a length marker, which have to be inflated
/// as they are read. The caller parses the header, then feeds the bytes
/// that follow it; whatever `decompress` does not consume is the data
/// after this member.
pub struct MemberDecoder {
    inflate: Decompress,
    hasher: Hasher,
    size: u32,
    state: BodyState,
    trailer: Vec<u8>,
    starved: bool,
}

impl Default for MemberDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberDecoder {
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(false),
            hasher: Hasher::new(),
            size: 0,
            state: BodyState::Inflating,
            trailer: Vec::with_capacity(TRAILER_LEN),
            starved: false,
        }
    }

    /// The trailer has been read and verified
    pub fn eof(&self) -> bool {
        self.state == BodyState::Done
    }

    /// No progress is possible without more input
    pub fn needs_input(&self) -> bool {
        self.starved
    }

    /// Decode from `input`, appending at most `max_output` bytes to `out`.
    ///
    /// Returns how many input bytes were consumed.
    pub fn decompress(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        max_output: usize,
    ) -> PargzResult<usize> {
        let mut consumed = 0;
        self.starved = false;

        if self.state == BodyState::Inflating {
            let start = out.len();
            out.resize(start + max_output, 0);
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status =
                match self
                    .inflate
                    .decompress(input, &mut out[start..], FlushDecompress::None)
                {
                    Ok(status) => status,
                    Err(e) => {
                        out.truncate(start);
                        return Err(PargzError::corrupt(e));
                    }
                };
            consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            out.truncate(start + produced);
            self.hasher.update(&out[start..]);
            self.size = self.size.wrapping_add(produced as u32);

            if status == Status::StreamEnd {
                self.state = BodyState::Trailer;
            } else {
                self.starved = consumed == input.len() && produced < max_output;
                return Ok(consumed);
            }
        }

        if self.state == BodyState::Trailer {
            let take = (TRAILER_LEN - self.trailer.len()).min(input.len() - consumed);
            self.trailer
                .extend_from_slice(&input[consumed..consumed + take]);
            consumed += take;
            if self.trailer.len() == TRAILER_LEN {
                let crc = self.hasher.clone().finalize();
                verify_trailer(&self.trailer, crc, self.size)?;
                self.state = BodyState::Done;
            } else {
                self.starved = true;
            }
        }

        Ok(consumed)
    }
}
