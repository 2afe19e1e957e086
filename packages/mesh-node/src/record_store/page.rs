//! In-memory mirror of one flash page's contents.
//!
//! The record store treats flash as memory-mapped for reads (this mirror
//! *is* the authoritative view once a write/erase has been confirmed by the
//! flash controller) and serializes mutation through the queue in `mod.rs`.

use mesh_core::{PageHeader, PageMagic, RecordHeader, PAGE_HEADER_SIZE, RECORD_HEADER_SIZE};

/// One record as currently mirrored in RAM for a given page.
#[derive(Debug, Clone)]
pub struct MirroredRecord {
    pub header: RecordHeader,
    /// Original, unpadded payload bytes.
    pub data: Vec<u8>,
}

impl MirroredRecord {
    /// Validates the CRC8 stored in the header against `data`.
    #[must_use]
    pub fn crc_is_valid(&self) -> bool {
        mesh_core::crc8(&self.data) == self.header.crc8
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.header.flags.record_active && self.crc_is_valid()
    }

    /// Total on-flash footprint: header plus padded body.
    #[must_use]
    pub fn footprint(&self) -> usize {
        RECORD_HEADER_SIZE + self.header.length as usize
    }
}

/// Word alignment used for padding record bodies before they are written.
pub const WORD_SIZE: usize = 4;

#[must_use]
pub fn padded_len(data_len: usize) -> (usize, u8) {
    let rem = data_len % WORD_SIZE;
    if rem == 0 {
        (data_len, 0)
    } else {
        let pad = WORD_SIZE - rem;
        (data_len + pad, pad as u8)
    }
}

/// In-memory mirror of a page: its header and the records currently believed
/// to be on flash.
#[derive(Debug, Clone)]
pub struct PageState {
    pub header: PageHeader,
    pub records: Vec<MirroredRecord>,
    pub page_size: usize,
}

impl PageState {
    #[must_use]
    pub fn new_swap(page_size: usize) -> Self {
        Self {
            header: PageHeader {
                magic: PageMagic::Swap,
                version_counter: 0,
            },
            records: Vec::new(),
            page_size,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.header.magic, PageMagic::Active)
    }

    #[must_use]
    pub fn is_swap(&self) -> bool {
        matches!(self.header.magic, PageMagic::Swap)
    }

    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self.header.magic, PageMagic::Corrupt(_))
    }

    /// Bytes already occupied by the header plus every record's on-flash footprint.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        PAGE_HEADER_SIZE + self.records.iter().map(MirroredRecord::footprint).sum::<usize>()
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.page_size.saturating_sub(self.used_bytes())
    }

    /// Bytes occupied by live (active, CRC-valid) records only -- what would
    /// need to be carried over by a defragmentation of this page.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.is_live())
            .map(MirroredRecord::footprint)
            .sum()
    }

    /// Highest `(page.version_counter, record.version_counter)` among live
    /// records with the given id, if any.
    #[must_use]
    pub fn freshest(&self, record_id: u16) -> Option<&MirroredRecord> {
        self.records
            .iter()
            .filter(|r| r.is_live() && r.header.record_id == record_id)
            .max_by_key(|r| r.header.version_counter)
    }

    pub fn push_record(&mut self, header: RecordHeader, data: Vec<u8>) {
        self.records.push(MirroredRecord { header, data });
    }

    /// Clears `record_active` on the freshest live copy of `record_id`, in place.
    pub fn deactivate(&mut self, record_id: u16) -> bool {
        if let Some(r) = self
            .records
            .iter_mut()
            .filter(|r| r.is_live() && r.header.record_id == record_id)
            .max_by_key(|r| r.header.version_counter)
        {
            r.header.flags.record_active = false;
            true
        } else {
            false
        }
    }

    pub fn immortalize(&mut self, record_id: u16) -> bool {
        if let Some(r) = self
            .records
            .iter_mut()
            .filter(|r| r.is_live() && r.header.record_id == record_id)
            .max_by_key(|r| r.header.version_counter)
        {
            r.header.flags.mortal = false;
            true
        } else {
            false
        }
    }
}
