//! Wire format for record-store pages and record headers.
//!
//! Layout exactly as specified: page `[magic(2)][version_counter(2)]`,
//! record `[crc8(1)][flags(1)][length(2)][record_id(2)][version_counter(2)][data]`.

use bytes::{Buf, BufMut};

use crate::error::WireError;

pub const PAGE_HEADER_SIZE: usize = 4;
pub const RECORD_HEADER_SIZE: usize = 8;

/// A page's magic number, occupying the first two bytes of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMagic {
    /// Erased, ready to receive records (`0xFFFF`).
    Swap,
    /// Contains live records (`0xAC71`).
    Active,
    /// Anything else: neither erased nor a recognized active page.
    Corrupt(u16),
}

impl PageMagic {
    const SWAP_RAW: u16 = 0xFFFF;
    const ACTIVE_RAW: u16 = 0xAC71;

    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            PageMagic::Swap => Self::SWAP_RAW,
            PageMagic::Active => Self::ACTIVE_RAW,
            PageMagic::Corrupt(raw) => raw,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            Self::SWAP_RAW => PageMagic::Swap,
            Self::ACTIVE_RAW => PageMagic::Active,
            other => {
                tracing::warn!(magic = format!("{other:#06x}"), "unrecognized page magic");
                PageMagic::Corrupt(other)
            }
        }
    }
}

/// The 4-byte header at the start of every flash page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub magic: PageMagic,
    /// Incremented every time the page is promoted from swap to active.
    pub version_counter: u16,
}

impl PageHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        let mut w = &mut buf[..];
        w.put_u16_le(self.magic.to_raw());
        w.put_u16_le(self.version_counter);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`PAGE_HEADER_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < PAGE_HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let magic = PageMagic::from_raw(bytes.get_u16_le());
        let version_counter = bytes.get_u16_le();
        Ok(Self {
            magic,
            version_counter,
        })
    }
}

/// The flags byte: `[reserved(4)][mortal(1)][record_active(1)][padding_len(2)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFlags {
    /// Number of zero-padding bytes appended to the body so it stays word-aligned.
    pub padding_len: u8,
    /// Cleared by `deactivate_record`; a cleared record is invisible to lookups.
    pub record_active: bool,
    /// `false` means immortal: the record survives `lock_down_and_clear_all`.
    pub mortal: bool,
}

impl RecordFlags {
    #[must_use]
    pub fn encode(&self) -> u8 {
        debug_assert!(self.padding_len <= 0b11);
        (u8::from(self.mortal) << 3) | (u8::from(self.record_active) << 2) | (self.padding_len & 0b11)
    }

    #[must_use]
    pub fn decode(byte: u8) -> Self {
        Self {
            padding_len: byte & 0b11,
            record_active: (byte >> 2) & 1 == 1,
            mortal: (byte >> 3) & 1 == 1,
        }
    }
}

/// The 8-byte record header, followed by `length` bytes of body (including padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub crc8: u8,
    pub flags: RecordFlags,
    /// Total on-flash body length in bytes, including padding.
    pub length: u16,
    pub record_id: u16,
    pub version_counter: u16,
}

impl RecordHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        let mut w = &mut buf[..];
        w.put_u8(self.crc8);
        w.put_u8(self.flags.encode());
        w.put_u16_le(self.length);
        w.put_u16_le(self.record_id);
        w.put_u16_le(self.version_counter);
        buf
    }

    /// # Errors
    /// Returns [`WireError::Truncated`] if fewer than [`RECORD_HEADER_SIZE`] bytes remain.
    pub fn decode(mut bytes: impl Buf) -> Result<Self, WireError> {
        if bytes.remaining() < RECORD_HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let crc8 = bytes.get_u8();
        let flags = RecordFlags::decode(bytes.get_u8());
        let length = bytes.get_u16_le();
        let record_id = bytes.get_u16_le();
        let version_counter = bytes.get_u16_le();
        Ok(Self {
            crc8,
            flags,
            length,
            record_id,
            version_counter,
        })
    }

    /// `0x0000` written over the flags byte's position invalidates a record
    /// in place, per the persistent-state-layout contract. Returns the raw
    /// two bytes (`crc8`, `flags`) to overwrite.
    #[must_use]
    pub fn invalidation_patch() -> [u8; 2] {
        [0x00, 0x00]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_round_trip_swap() {
        let header = PageHeader {
            magic: PageMagic::Swap,
            version_counter: 0,
        };
        assert_eq!(PageHeader::decode(&header.encode()[..]).unwrap(), header);
    }

    #[test]
    fn page_header_round_trip_active() {
        let header = PageHeader {
            magic: PageMagic::Active,
            version_counter: 9,
        };
        assert_eq!(PageHeader::decode(&header.encode()[..]).unwrap(), header);
    }

    #[test]
    fn page_magic_unknown_is_corrupt() {
        assert_eq!(PageMagic::from_raw(0x1234), PageMagic::Corrupt(0x1234));
    }

    #[test]
    fn record_flags_round_trip_all_combinations() {
        for padding_len in 0..=3u8 {
            for record_active in [false, true] {
                for mortal in [false, true] {
                    let flags = RecordFlags {
                        padding_len,
                        record_active,
                        mortal,
                    };
                    assert_eq!(RecordFlags::decode(flags.encode()), flags);
                }
            }
        }
    }

    #[test]
    fn record_header_round_trip() {
        let header = RecordHeader {
            crc8: 0xAB,
            flags: RecordFlags {
                padding_len: 2,
                record_active: true,
                mortal: false,
            },
            length: 128,
            record_id: 42,
            version_counter: 3,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), RECORD_HEADER_SIZE);
        assert_eq!(RecordHeader::decode(&encoded[..]).unwrap(), header);
    }

    #[test]
    fn record_header_decode_truncated() {
        let bytes = [0u8; 4];
        assert!(matches!(
            RecordHeader::decode(&bytes[..]),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn invalidation_clears_active_and_mortal_bits() {
        let mut patched = RecordFlags {
            padding_len: 1,
            record_active: true,
            mortal: true,
        }
        .encode();
        let patch = RecordHeader::invalidation_patch();
        patched = patch[1]; // flags byte overwritten with 0x00
        let decoded = RecordFlags::decode(patched);
        assert!(!decoded.record_active);
    }
}
