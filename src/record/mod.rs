/// Log file format:
///
/// ```text
///     +---------------+
///     | stream header |
///     +---------------+
///     |    Block 0    |
///     +---------------+
///     |    Block 1    |
///     +---------------+
///     |      ...      |
///     +---------------+
///     |    Block n    |
///     +---------------+
/// ```
///
/// The 7-byte stream header occupies the start of block 0, so block 0 holds
/// 7 bytes less chunk data than every later block:
///
/// ```text
///     +-------------------------------------------+
///     | ident: 4b | magic (LE): 2b | version: 1b  |
///     +-------------------------------------------+
/// ```
///
/// Block format (chunks never cross a block boundary; unused tail bytes of a
/// flushed block are zero):
///
/// ```text
///     +----------------+
///     | header | data  |
///     +----------------+
///     | header | data  |
///     +----------------+
///     |      ...       |
///     +----------------+
///     | header | data  |
///     +----------------+
/// ```
///
/// Chunk header format (checksum covers the type byte and the data, never
/// the length field):
///
/// ```text
///     +--------------------------------------+
///     | crc32 (LE): 4b | len (LE): 2b | ty: 1b |
///     +--------------------------------------+
/// ```
///
/// A record is one `Full` chunk, or a `First` chunk, zero or more `Middle`
/// chunks and one `Last` chunk, contiguous in chunk order.
pub mod checksum;
pub mod reader;
pub mod writer;

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const CHUNK_HEADER_SIZE: usize = 7;

/// Stream header: ident(4) + magic(2) + version(1).
pub const LOG_IDENT: &[u8; 4] = b":TXL";
pub const LOG_MAGIC: u16 = 0xB10C;
pub const LOG_HEADER_SIZE: usize = 7;

/// Current on-disk format version.
pub const LOG_VERSION: u8 = 0;

/// Wire values; part of the on-disk format, do not renumber.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}
