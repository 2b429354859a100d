use std::io::{Read, Seek, SeekFrom};

use bytes::Buf;

use crate::{
    error::{Error, Result},
    record::{
        checksum::{CrcAlgo, CrcFn},
        ChunkType, BLOCK_SIZE, CHUNK_HEADER_SIZE, LOG_HEADER_SIZE, LOG_IDENT, LOG_MAGIC,
    },
};

/// Parses a framed byte stream back into a sequence of record byte streams.
///
/// Call [`LogReader::next`] to obtain a [`RecordReader`] for the next record
/// and drain it before advancing. On corruption the error latches; calling
/// [`LogReader::recover`] sacrifices the rest of the current block and
/// resumes at the next block that holds a valid record start.
pub struct LogReader<R> {
    src: R,

    // buf[i..j] is the unread portion of the current chunk's payload; i
    // excludes the chunk header.
    i: usize,
    j: usize,

    // Number of valid bytes in buf. Once reading has started, only the
    // final block can have n < BLOCK_SIZE.
    n: usize,

    // Whether the first block has been read. It needs special handling
    // because the stream header occupies its start.
    first_block_done: bool,

    // Whether a record has been returned at all.
    started: bool,

    // True while recovering from corruption: bad chunks make the reader
    // skip to the next block instead of surfacing an error.
    recovering: bool,

    // Whether the current chunk is the last chunk of its record.
    last: bool,

    err: Option<Error>,
    buf: Box<[u8; BLOCK_SIZE]>,
    crc: CrcFn,
}

/// Reads until `buf` is full or the source is exhausted, tolerating a short
/// final read.
fn read_full(src: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match src.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(n)
}

impl<R: Read> LogReader<R> {
    /// Binds to a source; nothing is read until the first
    /// [`next`](Self::next), [`verify_header`](Self::verify_header) or
    /// `seek_record` call.
    pub fn new(src: R, algo: CrcAlgo) -> Self {
        Self {
            src,
            i: 0,
            j: 0,
            n: 0,
            first_block_done: false,
            started: false,
            recovering: false,
            last: false,
            err: None,
            buf: Box::new([0u8; BLOCK_SIZE]),
            crc: algo.as_fn(),
        }
    }

    /// Reads the stream header and first block into the buffer. The source
    /// must be positioned at the start. A source shorter than the stream
    /// header fails as a truncation, leaving nothing half-parsed.
    fn read_first_block(&mut self) -> Result<()> {
        let n = read_full(&mut self.src, &mut self.buf[..])?;
        if n < LOG_HEADER_SIZE {
            return Err(Error::UnexpectedEof);
        }
        self.i = LOG_HEADER_SIZE;
        self.j = LOG_HEADER_SIZE;
        self.n = n;
        self.first_block_done = true;
        Ok(())
    }

    /// Checks the stream header fields against the expected values, naming
    /// the first field that mismatches. On success the reader is positioned
    /// to continue with records right after the header.
    pub fn verify_header(&mut self, expected_version: u8) -> Result<()> {
        if let Err(e) = self.read_first_block() {
            self.err = Some(e.clone());
            return Err(e);
        }

        let ident = &self.buf[0..4];
        if ident != LOG_IDENT {
            return Err(Error::BadHeader(format!(
                "invalid identifier: {:?}",
                String::from_utf8_lossy(ident)
            )));
        }

        let magic = u16::from_le_bytes([self.buf[4], self.buf[5]]);
        if magic != LOG_MAGIC {
            return Err(Error::BadHeader(format!("invalid magic: {magic:#06x}")));
        }

        let version = self.buf[6];
        if version != expected_version {
            return Err(Error::BadHeader(format!(
                "expected version {expected_version} but got {version}"
            )));
        }

        Ok(())
    }

    /// Discards whatever is left of the block in the buffer, forcing the
    /// next parse step to load a fresh block.
    fn skip_to_next_block(&mut self) {
        self.i = self.n;
        self.j = self.n;
        self.last = false;
    }

    /// Sets buf[i..j] to the next chunk's payload, reading further blocks
    /// into the buffer as needed.
    ///
    /// With `want_first`, stray middle/last chunks are skipped until a
    /// full/first chunk is found. Corruption (checksum mismatch, length
    /// overflowing the block, an all-zero header where a real one belongs)
    /// is an error in default mode; in recovering mode it causes a silent
    /// skip to the next block.
    fn next_chunk(&mut self, want_first: bool) -> Result<()> {
        loop {
            if self.j + CHUNK_HEADER_SIZE <= self.n {
                let mut header = &self.buf[self.j..self.j + CHUNK_HEADER_SIZE];
                let checksum = header.get_u32_le();
                let length = header.get_u16_le() as usize;
                let chunk_type = header.get_u8();

                if checksum == 0 && length == 0 && chunk_type == 0 {
                    if want_first || self.recovering {
                        // Common when the file was preallocated or mmapped:
                        // the rest of the block is zero filled. Skip it.
                        tracing::warn!(block_offset = self.j, "skipping zeroed region");
                        self.recovering = true;
                        self.skip_to_next_block();
                        continue;
                    }
                    return Err(Error::Corruption("zeroed chunk header".to_owned()));
                }

                self.i = self.j + CHUNK_HEADER_SIZE;
                self.j = self.j + CHUNK_HEADER_SIZE + length;
                if self.j > self.n {
                    if self.recovering {
                        self.skip_to_next_block();
                        continue;
                    }
                    return Err(Error::Corruption("length overflows block".to_owned()));
                }
                if checksum != (self.crc)(&self.buf[self.i - 1..self.j]) {
                    if self.recovering {
                        self.skip_to_next_block();
                        continue;
                    }
                    return Err(Error::Corruption("checksum mismatch".to_owned()));
                }
                if want_first
                    && chunk_type != ChunkType::Full as u8
                    && chunk_type != ChunkType::First as u8
                {
                    continue;
                }
                self.last =
                    chunk_type == ChunkType::Full as u8 || chunk_type == ChunkType::Last as u8;
                self.recovering = false;
                return Ok(());
            }

            if self.n < BLOCK_SIZE && self.started {
                if self.j != self.n {
                    // The final block ended in the middle of a chunk.
                    return Err(Error::UnexpectedEof);
                }
                return Err(Error::EndOfStream);
            }

            let n = read_full(&mut self.src, &mut self.buf[..])?;
            self.i = 0;
            self.j = 0;
            self.n = n;
            if n == 0 {
                return Err(Error::EndOfStream);
            }
        }
    }

    /// Advances to the next record, skipping any unread remainder of the
    /// current one. Clean end of data yields [`Error::EndOfStream`].
    pub fn next(&mut self) -> Result<RecordReader<'_, R>> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        self.i = self.j;

        if !self.first_block_done {
            if let Err(e) = self.read_first_block() {
                self.err = Some(e.clone());
                return Err(e);
            }
        }

        if let Err(e) = self.next_chunk(true) {
            self.err = Some(e.clone());
            return Err(e);
        }
        self.started = true;
        Ok(RecordReader { reader: self })
    }

    /// Clears a latched error so that the following [`next`](Self::next)
    /// scans forward block by block until a valid record start, sacrificing
    /// the remainder of the current block. A no-op without a pending error.
    pub fn recover(&mut self) {
        let Some(err) = self.err.take() else {
            return;
        };
        tracing::warn!(error = %err, "recovering record reader");
        self.recovering = true;
        self.skip_to_next_block();
    }
}

impl<R: Read + Seek> LogReader<R> {
    /// Positions the reader so that the following [`next`](Self::next)
    /// returns the record whose first chunk header starts at `offset`.
    ///
    /// Only offsets previously obtained from `LogWriter::last_record_offset`
    /// are meaningful; for any other offset the bytes there may
    /// coincidentally parse as a chunk header. Fails if an unrecovered error
    /// is pending.
    pub fn seek_record(&mut self, offset: u64) -> Result<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }

        let block_mask = BLOCK_SIZE as u64 - 1;
        let intra_block = (offset & block_mask) as usize;
        let block_start = offset & !block_mask;

        if let Err(e) = self.src.seek(SeekFrom::Start(block_start)) {
            let err = Error::from(e);
            self.err = Some(err.clone());
            return Err(err);
        }

        self.started = false;
        self.recovering = false;
        self.last = false;

        // The first block is short: its first bytes are the stream header.
        let loaded = if block_start == 0 {
            self.read_first_block()
        } else {
            read_full(&mut self.src, &mut self.buf[..]).map(|n| {
                self.n = n;
                self.first_block_done = true;
            })
        };
        if let Err(e) = loaded {
            self.err = Some(e.clone());
            return Err(e);
        }

        self.i = intra_block;
        self.j = intra_block;
        Ok(())
    }
}

/// Read handle for a single record, obtained from [`LogReader::next`].
///
/// Holds the parent reader mutably for its whole lifetime, so the handle
/// cannot be used once the parent has advanced past its record.
pub struct RecordReader<'a, R> {
    reader: &'a mut LogReader<R>,
}

impl<R: Read> RecordReader<'_, R> {
    /// Copies payload bytes into `out`, transparently loading and validating
    /// successor chunks of a multi-chunk record. Returns `Ok(0)` once the
    /// record is exhausted.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        let r = &mut *self.reader;
        if let Some(e) = &r.err {
            return Err(e.clone());
        }
        while r.i == r.j {
            if r.last {
                return Ok(0);
            }
            if let Err(e) = r.next_chunk(false) {
                r.err = Some(e.clone());
                return Err(e);
            }
        }
        let n = out.len().min(r.j - r.i);
        out[..n].copy_from_slice(&r.buf[r.i..r.i + n]);
        r.i += n;
        Ok(n)
    }

    /// Drains the record to exhaustion, appending its payload to `out`.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let r = &mut *self.reader;
        if let Some(e) = &r.err {
            return Err(e.clone());
        }
        let mut total = 0;
        loop {
            if r.i < r.j {
                out.extend_from_slice(&r.buf[r.i..r.j]);
                total += r.j - r.i;
                r.i = r.j;
            }
            if r.last {
                return Ok(total);
            }
            if let Err(e) = r.next_chunk(false) {
                r.err = Some(e.clone());
                return Err(e);
            }
        }
    }
}

impl<R: Read> Read for RecordReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        RecordReader::read(self, buf).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use itertools::Itertools;

    use super::*;
    use crate::record::{checksum::crc_masked, writer::LogWriter, LOG_VERSION};

    fn write_log(payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut file = Vec::new();
        let mut writer = LogWriter::new(Cursor::new(&mut file), CrcAlgo::Masked, LOG_VERSION);
        for payload in payloads {
            writer.next().unwrap().append(payload).unwrap();
        }
        writer.close().unwrap();
        file
    }

    fn read_all_records(file: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        let mut records = Vec::new();
        loop {
            let mut record = match reader.next() {
                Ok(record) => record,
                Err(Error::EndOfStream) => return Ok(records),
                Err(e) => return Err(e),
            };
            let mut payload = Vec::new();
            record.read_to_end(&mut payload)?;
            records.push(payload);
        }
    }

    /// Hand-rolls one chunk, for building corrupt or padded fixtures the
    /// writer would never produce.
    fn raw_chunk(ty: ChunkType, payload: &[u8]) -> Vec<u8> {
        let mut covered = vec![ty as u8];
        covered.extend_from_slice(payload);
        let mut chunk = crc_masked(&covered).to_le_bytes().to_vec();
        chunk.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        chunk.push(ty as u8);
        chunk.extend_from_slice(payload);
        chunk
    }

    #[test]
    fn round_trip_small_records() -> anyhow::Result<()> {
        let payloads = (0..10)
            .map(|i| format!("record-{i:03}").into_bytes())
            .collect_vec();
        let file = write_log(&payloads);
        assert_eq!(read_all_records(file)?, payloads);
        Ok(())
    }

    #[test]
    fn round_trip_block_spanning_record() -> anyhow::Result<()> {
        let payloads = vec![
            vec![b'a'; 2 * BLOCK_SIZE],
            b"after the big one".to_vec(),
            vec![b'b'; BLOCK_SIZE - LOG_HEADER_SIZE - CHUNK_HEADER_SIZE],
        ];
        let file = write_log(&payloads);
        assert_eq!(read_all_records(file)?, payloads);
        Ok(())
    }

    #[test]
    fn end_of_stream_is_sticky_until_recover() -> anyhow::Result<()> {
        let file = write_log(&[b"only".to_vec()]);
        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);

        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"only");

        assert!(matches!(reader.next(), Err(Error::EndOfStream)));
        // Latched, like any other reader error.
        assert!(matches!(reader.next(), Err(Error::EndOfStream)));
        Ok(())
    }

    #[test]
    fn garbage_tail_is_corruption_not_end_of_stream() -> anyhow::Result<()> {
        let mut file = write_log(&[b"good".to_vec()]);
        file.extend_from_slice(b"bad record");

        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"good");

        assert!(matches!(reader.next(), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn truncated_chunk_header_is_unexpected_eof() -> anyhow::Result<()> {
        let mut file = write_log(&[b"good".to_vec()]);
        // Fewer bytes than a chunk header, and not zero (zero means padding).
        file.extend_from_slice(b"zap");

        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;

        assert!(matches!(reader.next(), Err(Error::UnexpectedEof)));
        Ok(())
    }

    #[test]
    fn recover_skips_to_next_block() -> anyhow::Result<()> {
        // Record A spans blocks 0 and 1; record B sits in block 1 after A's
        // last chunk. Corrupting block 0 loses A but must not lose B.
        let a = vec![b'a'; BLOCK_SIZE];
        let b = b"survivor".to_vec();
        let mut file = write_log(&[a, b.clone()]);

        file[LOG_HEADER_SIZE + CHUNK_HEADER_SIZE + 100] ^= 0xff;

        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        assert!(matches!(reader.next(), Err(Error::Corruption(_))));

        reader.recover();
        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b);
        Ok(())
    }

    #[test]
    fn recover_without_error_is_noop() -> anyhow::Result<()> {
        let payloads = vec![b"one".to_vec(), b"two".to_vec()];
        let file = write_log(&payloads);
        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);

        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        reader.recover();

        payload.clear();
        reader.next()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"two");
        Ok(())
    }

    #[test]
    fn zeroed_gap_is_skipped_when_seeking_a_record_start() -> anyhow::Result<()> {
        // Header, one record, then a zero fill to the end of block 0 (as a
        // preallocated file would have), then a valid record in block 1.
        let mut file = write_log(&[b"first".to_vec()]);
        file.resize(BLOCK_SIZE, 0);
        file.extend_from_slice(&raw_chunk(ChunkType::Full, b"second"));

        assert_eq!(
            read_all_records(file)?,
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn handles_work_through_std_io_traits() -> anyhow::Result<()> {
        let mut file = Vec::new();
        let mut writer = LogWriter::new(Cursor::new(&mut file), CrcAlgo::Masked, LOG_VERSION);
        let mut record = writer.next()?;
        std::io::Write::write_all(&mut record, b"via std traits")?;
        writer.close()?;

        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        let mut record = reader.next()?;
        let mut payload = Vec::new();
        std::io::Read::read_to_end(&mut record, &mut payload)?;
        assert_eq!(payload, b"via std traits");
        Ok(())
    }

    #[test]
    fn checksum_algorithm_mismatch_detected() -> anyhow::Result<()> {
        let mut file = Vec::new();
        let mut writer = LogWriter::new(Cursor::new(&mut file), CrcAlgo::Ieee, LOG_VERSION);
        writer.next()?.append(b"ieee framed")?;
        writer.close()?;

        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        match reader.next() {
            Err(Error::Corruption(msg)) => assert!(msg.contains("checksum")),
            Err(other) => panic!("expected checksum corruption, got {other:?}"),
            Ok(_) => panic!("expected checksum corruption, got a record"),
        }
        Ok(())
    }

    #[test]
    fn zero_length_chunk_flush_against_block_end() -> anyhow::Result<()> {
        // Leave exactly one chunk header's worth of room in block 0: the
        // second record starts as a First chunk with no payload bytes, and
        // its data lands in block 1.
        let a = vec![b'a'; BLOCK_SIZE - LOG_HEADER_SIZE - 2 * CHUNK_HEADER_SIZE];
        let b = b"spills into block 1".to_vec();

        let mut file = Vec::new();
        let mut writer = LogWriter::new(Cursor::new(&mut file), CrcAlgo::Masked, LOG_VERSION);
        writer.next()?.append(&a)?;
        writer.next()?.append(&b)?;
        let offset = writer.last_record_offset()?;
        writer.close()?;

        assert_eq!(offset, (BLOCK_SIZE - CHUNK_HEADER_SIZE) as u64);
        assert_eq!(file[BLOCK_SIZE - 1], ChunkType::First as u8);

        assert_eq!(read_all_records(file.clone())?, vec![a, b.clone()]);

        // The empty chunk's header is still a valid seek target.
        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        reader.seek_record(offset)?;
        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b);
        Ok(())
    }

    #[test]
    fn verify_header_accepts_own_files() -> anyhow::Result<()> {
        let file = write_log(&[b"payload".to_vec()]);
        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        reader.verify_header(LOG_VERSION)?;

        // Reading continues right after the header.
        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"payload");
        Ok(())
    }

    #[test]
    fn verify_header_names_the_mismatched_field() {
        let cases: [(&[u8], &str); 3] = [
            (b"nope\x0c\xb1\x00rest of the file", "identifier"),
            (b":TXL\xff\xff\x00rest of the file", "magic"),
            (b":TXL\x0c\xb1\x09rest of the file", "version"),
        ];
        for (bytes, field) in cases {
            let mut reader = LogReader::new(Cursor::new(bytes.to_vec()), CrcAlgo::Masked);
            match reader.verify_header(LOG_VERSION) {
                Err(Error::BadHeader(msg)) => {
                    assert!(msg.contains(field), "{msg:?} should mention {field}")
                }
                other => panic!("expected BadHeader, got {other:?}"),
            }
        }
    }

    #[test]
    fn verify_header_tolerates_short_files() {
        let mut reader = LogReader::new(Cursor::new(b"Inv".to_vec()), CrcAlgo::Masked);
        assert!(matches!(
            reader.verify_header(LOG_VERSION),
            Err(Error::UnexpectedEof)
        ));
    }

    #[test]
    fn seek_record_returns_the_exact_record() -> anyhow::Result<()> {
        // Spread records over several blocks so seeks cross block math.
        let payloads = (0..5)
            .map(|i| vec![b'a' + i as u8; BLOCK_SIZE / 2])
            .collect_vec();

        let mut file = Vec::new();
        let mut writer = LogWriter::new(Cursor::new(&mut file), CrcAlgo::Masked, LOG_VERSION);
        let mut offsets = Vec::new();
        for payload in &payloads {
            writer.next()?.append(payload)?;
            offsets.push(writer.last_record_offset()?);
        }
        writer.close()?;

        for (offset, expected) in offsets.iter().zip(&payloads).rev() {
            let mut reader = LogReader::new(Cursor::new(file.clone()), CrcAlgo::Masked);
            reader.seek_record(*offset)?;
            let mut payload = Vec::new();
            reader.next()?.read_to_end(&mut payload)?;
            assert_eq!(&payload, expected);
        }
        Ok(())
    }

    #[test]
    fn seek_record_fails_on_pending_error() -> anyhow::Result<()> {
        let mut file = write_log(&[b"good".to_vec()]);
        file.extend_from_slice(b"bad record");

        let mut reader = LogReader::new(Cursor::new(file), CrcAlgo::Masked);
        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        assert!(matches!(reader.next(), Err(Error::Corruption(_))));

        assert!(matches!(reader.seek_record(7), Err(Error::Corruption(_))));

        // Recover clears the error; seeking works again.
        reader.recover();
        reader.seek_record(LOG_HEADER_SIZE as u64)?;
        payload.clear();
        reader.next()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"good");
        Ok(())
    }
}
