use std::io::{Seek, Write};

use bytes::BufMut;

use crate::{
    error::{Error, Result},
    record::{
        checksum::{CrcAlgo, CrcFn},
        ChunkType, BLOCK_SIZE, CHUNK_HEADER_SIZE, LOG_HEADER_SIZE, LOG_IDENT, LOG_MAGIC,
    },
};

/// Serializes a sequence of records into framed, checksummed, block-packed
/// chunks written to an underlying byte sink.
///
/// Call [`LogWriter::next`] to begin a record and stream its payload through
/// the returned [`RecordWriter`]. Starting the next record finalizes the
/// previous one; [`LogWriter::flush`] or [`LogWriter::close`] finalizes the
/// last record of the stream.
///
/// Errors are sticky: after the first IO failure every later operation
/// returns the same error. The writer never reads back what it wrote.
pub struct LogWriter<W> {
    dest: W,

    // buf[i..j] is the chunk under construction, header included.
    i: usize,
    j: usize,

    // buf[..written] has already been handed to the sink.
    written: usize,

    // Offset in the sink at which writing started. Non-zero only when the
    // sink was seekable at construction, making reported record offsets
    // absolute.
    base_offset: u64,

    // Zero-based number of the block currently held in buf.
    block_number: u64,

    // Offset of the first chunk header of the most recently started record,
    // relative to base_offset.
    last_record_offset: Option<u64>,

    // Whether the chunk under construction is the record's first.
    first: bool,

    // Whether a chunk is buffered but its header not yet filled in.
    pending: bool,

    err: Option<Error>,
    buf: Box<[u8; BLOCK_SIZE]>,
    crc: CrcFn,
}

impl<W: Write> LogWriter<W> {
    /// Binds to a sink with base offset 0 and seeds the internal block
    /// buffer with the stream header.
    pub fn new(dest: W, algo: CrcAlgo, version: u8) -> Self {
        Self::with_base_offset(dest, algo, version, 0)
    }

    fn with_base_offset(dest: W, algo: CrcAlgo, version: u8, base_offset: u64) -> Self {
        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        buf[0..4].copy_from_slice(LOG_IDENT);
        buf[4..6].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        buf[6] = version;

        Self {
            dest,
            i: 0,
            j: LOG_HEADER_SIZE,
            written: 0,
            base_offset,
            block_number: 0,
            last_record_offset: None,
            first: false,
            pending: false,
            err: None,
            buf,
            crc: algo.as_fn(),
        }
    }

    /// Fills in the header of the pending chunk.
    fn fill_header(&mut self, last: bool) {
        assert!(
            self.i + CHUNK_HEADER_SIZE <= self.j && self.j <= BLOCK_SIZE,
            "chunk bounds out of sync"
        );
        let ty = match (self.first, last) {
            (true, true) => ChunkType::Full,
            (true, false) => ChunkType::First,
            (false, false) => ChunkType::Middle,
            (false, true) => ChunkType::Last,
        };
        self.buf[self.i + 6] = ty as u8;
        let crc = (self.crc)(&self.buf[self.i + 6..self.j]);
        (&mut self.buf[self.i..self.i + 4]).put_u32_le(crc);
        let len = (self.j - self.i - CHUNK_HEADER_SIZE) as u16;
        (&mut self.buf[self.i + 4..self.i + 6]).put_u16_le(len);
    }

    /// Writes the buffered block to the sink and reserves space for the next
    /// chunk's header.
    fn write_block(&mut self) {
        if let Err(e) = self.dest.write_all(&self.buf[self.written..]) {
            self.err = Some(e.into());
        }
        self.i = 0;
        self.j = CHUNK_HEADER_SIZE;
        self.written = 0;
        self.block_number += 1;
    }

    /// Finishes the current record and writes the buffer to the sink.
    fn write_pending(&mut self) {
        if self.err.is_some() {
            return;
        }
        if self.pending {
            self.fill_header(true);
            self.pending = false;
        }
        if let Err(e) = self.dest.write_all(&self.buf[self.written..self.j]) {
            self.err = Some(e.into());
            return;
        }
        self.written = self.j;
    }

    /// Begins a new record, finalizing the previous one. If fewer bytes than
    /// a chunk header remain in the current block, the remainder is
    /// zero-padded and the block flushed first.
    pub fn next(&mut self) -> Result<RecordWriter<'_, W>> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if self.pending {
            self.fill_header(true);
        }
        self.i = self.j;
        self.j += CHUNK_HEADER_SIZE;
        if self.j > BLOCK_SIZE {
            self.buf[self.i..].fill(0);
            self.write_block();
            if let Some(e) = &self.err {
                return Err(e.clone());
            }
        }
        self.last_record_offset =
            Some(self.base_offset + self.block_number * BLOCK_SIZE as u64 + self.i as u64);
        self.first = true;
        self.pending = true;
        Ok(RecordWriter { writer: self })
    }

    /// Finalizes the current record, writes buffered bytes to the sink and
    /// forwards a flush to it. Does not start a new record.
    pub fn flush(&mut self) -> Result<()> {
        self.write_pending();
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if let Err(e) = self.dest.flush() {
            let err = Error::from(e);
            self.err = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Finalizes and flushes like [`flush`](Self::flush), then permanently
    /// marks the writer closed.
    pub fn close(&mut self) -> Result<()> {
        self.write_pending();
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        self.err = Some(Error::Closed("record writer"));
        Ok(())
    }

    /// Offset of the most recently started record's first chunk header,
    /// relative to the sink's position at construction. Suitable to pass to
    /// `LogReader::seek_record`.
    pub fn last_record_offset(&self) -> Result<u64> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        self.last_record_offset.ok_or(Error::NoLastRecord)
    }
}

impl<W: Write + Seek> LogWriter<W> {
    /// Like [`new`](Self::new), but records the sink's current position as
    /// the base offset so reported record offsets are absolute.
    pub fn from_seekable(mut dest: W, algo: CrcAlgo, version: u8) -> Result<Self> {
        let base_offset = dest.stream_position()?;
        Ok(Self::with_base_offset(dest, algo, version, base_offset))
    }
}

/// Write handle for a single record, obtained from [`LogWriter::next`].
///
/// Holds the parent writer mutably for its whole lifetime, so a handle can
/// never outlive the record it belongs to: the borrow must end before the
/// parent can start another record, flush or close.
pub struct RecordWriter<'a, W> {
    writer: &'a mut LogWriter<W>,
}

impl<W: Write> RecordWriter<'_, W> {
    /// Appends payload bytes to the record, splitting it into further chunks
    /// whenever the block buffer fills up.
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        let w = &mut *self.writer;
        if let Some(e) = &w.err {
            return Err(e.clone());
        }
        while !data.is_empty() {
            if w.j == BLOCK_SIZE {
                w.fill_header(false);
                w.write_block();
                if let Some(e) = &w.err {
                    return Err(e.clone());
                }
                w.first = false;
            }
            let n = (BLOCK_SIZE - w.j).min(data.len());
            w.buf[w.j..w.j + n].copy_from_slice(&data[..n]);
            w.j += n;
            data = &data[n..];
        }
        Ok(())
    }
}

impl<W: Write> Write for RecordWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
