//! Serialized front of a compressed source
//!
//! Reader workers take turns holding the cursor. Whoever holds it claims
//! the next sequence number and cuts off enough compressed input to make
//! roughly one block of raw output. Members carrying a length marker are
//! copied out whole and inflated after the lock is released; members
//! without one have to be inflated in place, since their end is only
//! known once the deflate stream says so.

use std::io::{self, Read};

use crate::codec::{inflate_member, member_raw_size, parse_header, MemberDecoder};
use crate::error::{PargzError, PargzResult};

/// A piece of one block's worth of input
#[derive(Debug)]
pub enum Segment {
    /// Raw bytes already inflated while the cursor was held
    Inflated(Vec<u8>),
    /// A complete marked member, still compressed
    Member { bytes: Vec<u8>, header_len: usize },
}

/// What a worker got from the cursor
#[derive(Debug)]
pub enum Claim {
    Block { seq: u64, segments: Vec<Segment> },
    /// The source ended cleanly; `seq` is the end-of-stream marker
    End { seq: u64 },
    Failed { seq: u64, error: PargzError },
    /// End or failure was already handed out
    Exhausted,
}

pub struct SourceCursor<R> {
    source: R,
    buf: Vec<u8>,
    pos: usize,
    read_size: usize,
    source_eof: bool,
    next_seq: u64,
    member: Option<MemberDecoder>,
    deferred: Option<PargzError>,
    done: bool,
}

impl<R: Read> SourceCursor<R> {
    pub fn new(source: R, read_size: usize) -> Self {
        Self {
            source,
            buf: Vec::with_capacity(read_size),
            pos: 0,
            read_size: read_size.max(1),
            source_eof: false,
            next_seq: 0,
            member: None,
            deferred: None,
            done: false,
        }
    }

    pub fn into_source(self) -> R {
        self.source
    }

    /// Claim the next block of at most about `block_size` raw bytes.
    ///
    /// A marked member is never split, so a block may overshoot
    /// `block_size` by up to one member. When an error is hit after some
    /// input was already gathered, that input is handed out first and the
    /// error goes to the next claim.
    pub fn claim(&mut self, block_size: usize) -> Claim {
        if self.done {
            return Claim::Exhausted;
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(error) = self.deferred.take() {
            self.done = true;
            return Claim::Failed { seq, error };
        }

        let mut segments = Vec::new();
        match self.gather(block_size, &mut segments) {
            Ok(()) if segments.is_empty() => {
                self.done = true;
                Claim::End { seq }
            }
            Ok(()) => Claim::Block { seq, segments },
            Err(error) if segments.is_empty() => {
                self.done = true;
                Claim::Failed { seq, error }
            }
            Err(error) => {
                self.deferred = Some(error);
                Claim::Block { seq, segments }
            }
        }
    }

    fn gather(&mut self, block_size: usize, segments: &mut Vec<Segment>) -> PargzResult<()> {
        let mut raw = 0usize;

        while raw < block_size {
            if let Some(mut decoder) = self.member.take() {
                let mut out = Vec::new();
                let limit = (block_size - raw).min(self.read_size.saturating_mul(4));
                let consumed = decoder.decompress(&self.buf[self.pos..], &mut out, limit)?;
                self.pos += consumed;
                let produced = out.len();
                raw += produced;
                if produced > 0 {
                    segments.push(Segment::Inflated(out));
                }
                if decoder.eof() {
                    continue;
                }
                if (decoder.needs_input() || (consumed == 0 && produced == 0)) && !self.fill()? {
                    return Err(PargzError::truncated());
                }
                self.member = Some(decoder);
                continue;
            }

            if !self.skip_padding()? {
                break;
            }

            let header = loop {
                match parse_header(&self.buf[self.pos..])? {
                    Some(header) => break header,
                    None => {
                        if !self.fill()? {
                            return Err(PargzError::truncated());
                        }
                    }
                }
            };

            match header.member_size {
                Some(size) => {
                    if !self.ensure(size)? {
                        return Err(PargzError::truncated());
                    }
                    let bytes = self.buf[self.pos..self.pos + size].to_vec();
                    self.pos += size;
                    raw += member_raw_size(&bytes);
                    segments.push(Segment::Member {
                        bytes,
                        header_len: header.len,
                    });
                }
                None => {
                    self.pos += header.len;
                    self.member = Some(MemberDecoder::new());
                }
            }
        }

        Ok(())
    }

    /// Skip NUL bytes between members. Returns false at end of source.
    fn skip_padding(&mut self) -> PargzResult<bool> {
        loop {
            while self.pos < self.buf.len() && self.buf[self.pos] == 0 {
                self.pos += 1;
            }
            if self.pos < self.buf.len() {
                return Ok(true);
            }
            if !self.fill()? {
                return Ok(false);
            }
        }
    }

    fn ensure(&mut self, n: usize) -> PargzResult<bool> {
        while self.buf.len() - self.pos < n {
            if !self.fill()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read up to `read_size` more bytes. Returns false at end of source.
    fn fill(&mut self) -> PargzResult<bool> {
        if self.source_eof {
            return Ok(false);
        }
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let len = self.buf.len();
        self.buf.resize(len + self.read_size, 0);
        loop {
            match self.source.read(&mut self.buf[len..]) {
                Ok(n) => {
                    self.buf.truncate(len + n);
                    if n == 0 {
                        self.source_eof = true;
                    }
                    return Ok(n > 0);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(len);
                    return Err(e.into());
                }
            }
        }
    }
}

/// Turn a claimed block into raw bytes, inflating any marked members
pub fn materialize(segments: Vec<Segment>) -> PargzResult<Vec<u8>> {
    let capacity = segments
        .iter()
        .map(|s| match s {
            Segment::Inflated(data) => data.len(),
            Segment::Member { bytes, .. } => member_raw_size(bytes),
        })
        .sum();
    let mut out = Vec::with_capacity(capacity);
    for segment in segments {
        match segment {
            Segment::Inflated(data) => out.extend_from_slice(&data),
            Segment::Member { bytes, header_len } => inflate_member(&bytes, header_len, &mut out)?,
        }
    }
    Ok(out)
}
