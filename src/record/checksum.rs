//! Pluggable chunk checksums.
//!
//! The format descends from a log design whose files carried a plain CRC-32;
//! this crate's files default to a masked CRC-32C instead, so both algorithms
//! stay selectable at reader/writer construction. Writer and reader of the
//! same file must agree on the algorithm; a mismatch shows up as a checksum
//! failure on every chunk.

/// Checksum contract: chunk-type byte followed by the payload, to a u32.
pub type CrcFn = fn(&[u8]) -> u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CrcAlgo {
    /// Masked CRC-32C (Castagnoli), the on-disk default.
    #[default]
    Masked,
    /// Plain CRC-32 (IEEE polynomial), for files written by the unmasked
    /// variant of the format.
    Ieee,
}

impl CrcAlgo {
    pub(crate) fn as_fn(self) -> CrcFn {
        match self {
            CrcAlgo::Masked => crc_masked,
            CrcAlgo::Ieee => crc_ieee,
        }
    }
}

const MASK_DELTA: u32 = 0xa282_ead8;

/// CRC-32C rotated right by 15 bits plus a fixed delta, so a checksum
/// computed over bytes that themselves contain embedded checksums stays
/// well distributed.
pub fn crc_masked(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
        .rotate_right(15)
        .wrapping_add(MASK_DELTA)
}

pub fn crc_ieee(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithms_disagree() {
        let data = b"\x01some chunk payload";
        assert_ne!(crc_masked(data), crc_ieee(data));
    }

    #[test]
    fn masked_is_not_raw_castagnoli() {
        let data = b"\x01some chunk payload";
        assert_ne!(crc_masked(data), crc32c::crc32c(data));
    }

    #[test]
    fn deterministic() {
        let data = b"\x04tail";
        assert_eq!(crc_masked(data), crc_masked(data));
        assert_eq!(crc_ieee(data), crc_ieee(data));
        assert_eq!(CrcAlgo::default(), CrcAlgo::Masked);
    }
}
