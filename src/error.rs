/// Errors shared by the record layer and the store built on top of it.
///
/// Format and IO errors latch on a reader or writer: once recorded, every
/// later call on that object returns the same error until the caller
/// explicitly recovers (readers only). `Clone` exists so a latched error can
/// be handed back more than once; IO errors clone as kind plus message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("corrupt chunk: {0}")]
    Corruption(String),

    #[error("unexpected end of log data")]
    UnexpectedEof,

    #[error("end of record stream")]
    EndOfStream,

    #[error("bad stream header: {0}")]
    BadHeader(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("store opened in wrong mode for this operation")]
    InvalidMode,

    #[error("no record written yet")]
    NoLastRecord,

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::IO(e) => Error::IO(std::io::Error::new(e.kind(), e.to_string())),
            Error::Corruption(s) => Error::Corruption(s.clone()),
            Error::UnexpectedEof => Error::UnexpectedEof,
            Error::EndOfStream => Error::EndOfStream,
            Error::BadHeader(s) => Error::BadHeader(s.clone()),
            Error::Closed(what) => Error::Closed(what),
            Error::InvalidMode => Error::InvalidMode,
            Error::NoLastRecord => Error::NoLastRecord,
            Error::Serialization(s) => Error::Serialization(s.clone()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::IO(e) => e,
            Error::EndOfStream => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e),
            other => std::io::Error::other(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
