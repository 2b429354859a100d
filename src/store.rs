//! Typed record log over the chunked record stream.
//!
//! A [`Store`] persists one serialized message per record: writes encode the
//! message and hand the payload to the record writer, reads drain the next
//! record and decode it. The engine knows nothing about the message schema;
//! callers supply it through [`RecordPayload`].

use std::{
    fs::OpenOptions,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    record::{
        checksum::CrcAlgo,
        reader::LogReader,
        writer::LogWriter,
        LOG_VERSION,
    },
};

/// Serializer contract for messages kept in a [`Store`]. The record log
/// itself treats payloads as opaque bytes.
pub trait RecordPayload: Sized {
    fn encode_payload(&self) -> Result<Vec<u8>>;
    fn decode_payload(bytes: &[u8]) -> Result<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create or truncate, append-only.
    Write,
    /// Sequential read of an existing log.
    Read,
}

enum Inner {
    Writing(LogWriter<std::fs::File>),
    Reading(LogReader<std::fs::File>),
    Closed,
}

/// An append-only log of serialized messages at a single file path, open in
/// exactly one direction at a time.
pub struct Store<M> {
    path: PathBuf,
    inner: Inner,
    _message: PhantomData<fn() -> M>,
}

impl<M: RecordPayload> Store<M> {
    /// Opens the log at `path`.
    ///
    /// Write mode creates or truncates the file and puts the stream header
    /// on disk immediately. Read mode verifies the stream header, rejecting
    /// non-log, foreign-version and truncated files before any record is
    /// attempted. IO failures (missing parent directory, permissions)
    /// surface directly.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = match mode {
            OpenMode::Write => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                let mut writer = LogWriter::from_seekable(file, CrcAlgo::default(), LOG_VERSION)?;
                writer.flush()?;
                Inner::Writing(writer)
            }
            OpenMode::Read => {
                let file = OpenOptions::new().read(true).open(&path)?;
                let mut reader = LogReader::new(file, CrcAlgo::default());
                reader.verify_header(LOG_VERSION)?;
                Inner::Reading(reader)
            }
        };
        tracing::debug!(path = %path.display(), ?mode, "opened store");
        Ok(Self {
            path,
            inner,
            _message: PhantomData,
        })
    }

    /// Serializes `message` and appends it as one record.
    pub fn write(&mut self, message: &M) -> Result<()> {
        let writer = match &mut self.inner {
            Inner::Writing(writer) => writer,
            Inner::Reading(_) => return Err(Error::InvalidMode),
            Inner::Closed => return Err(Error::Closed("store")),
        };
        let payload = message.encode_payload()?;
        writer.next()?.append(&payload)?;
        Ok(())
    }

    /// Reads and decodes the next record. Ends with [`Error::EndOfStream`];
    /// corrupt data yields [`Error::Corruption`], which the caller can treat
    /// differently from a clean end.
    pub fn read(&mut self) -> Result<M> {
        let reader = match &mut self.inner {
            Inner::Reading(reader) => reader,
            Inner::Writing(_) => return Err(Error::InvalidMode),
            Inner::Closed => return Err(Error::Closed("store")),
        };
        let mut payload = Vec::new();
        reader.next()?.read_to_end(&mut payload)?;
        M::decode_payload(&payload)
    }

    /// Finalizes the last pending record (write mode) and releases the file
    /// handle. Idempotent; any later read or write fails.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Writing(mut writer) => writer.close()?,
            Inner::Reading(_) | Inner::Closed => {}
        }
        tracing::debug!(path = %self.path.display(), "closed store");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<M> Drop for Store<M> {
    fn drop(&mut self) {
        if let Inner::Writing(writer) = &mut self.inner {
            // Best effort finalization for stores dropped without close().
            if let Err(e) = writer.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "close on drop failed");
            }
        }
    }
}
