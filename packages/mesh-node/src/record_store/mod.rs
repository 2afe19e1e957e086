//! Power-safe persistent key to blob store over N >= 2 flash pages.
//!
//! A single operation queue, processed one transaction at a time; each
//! transaction's steps are retried on `FlashOperationError` up to a bounded
//! budget, and on exhaustion the *whole* transaction is abandoned and the
//! queue moves on to the next one.
//!
//! Reads (`get_record`) are synchronous against the in-memory mirror of
//! confirmed flash content, matching real flash being memory-mapped; writes
//! and erases are asynchronous requests to the [`FlashTransport`] whose
//! results land later as [`FlashEvent`]s.

mod page;

use std::collections::VecDeque;

use mesh_core::{
    FlashEvent, FlashOpToken, FlashTransport, ModuleId, PageHeader, PageMagic, RecordFlags,
    RecordHeader, PAGE_HEADER_SIZE, RECORD_HEADER_SIZE,
};
use tracing::{debug, instrument, warn};

use crate::config::RecordStoreConfig;
use crate::error::RecordStoreError;
use page::{padded_len, PageState};

/// A completed (or failed) record-store operation, delivered in the order
/// its transaction was enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStoreCompletion {
    Saved { record_id: u16, result: Result<(), RecordStoreError> },
    Deactivated { record_id: u16, result: Result<(), RecordStoreError> },
    Immortalized { record_id: u16, result: Result<(), RecordStoreError> },
    LockedDown { module_id: ModuleId, result: Result<(), RecordStoreError> },
}

#[derive(Debug, Clone)]
enum FlashOp {
    Erase { page: usize },
    WriteHeader { page: usize, header: PageHeader },
    WriteRecord { page: usize, offset: usize, header: RecordHeader, data: Vec<u8> },
    InvalidateInPlace { page: usize, record_index: usize },
}

#[derive(Debug, Clone)]
enum TransactionKind {
    Save { record_id: u16 },
    Deactivate { record_id: u16 },
    Immortalize { record_id: u16 },
    LockDown { module_id: ModuleId },
    Defrag,
}

#[derive(Debug, Clone)]
struct Transaction {
    kind: TransactionKind,
    ops: Vec<FlashOp>,
}

struct ActiveTransaction {
    transaction: Transaction,
    step: usize,
    retries_left: u8,
    token: FlashOpToken,
}

/// The record store. Owns the in-memory mirror of every page and the
/// single-threaded operation queue that serializes mutation through it.
pub struct RecordStore {
    config: RecordStoreConfig,
    pages: Vec<PageState>,
    queue: VecDeque<Transaction>,
    active: Option<ActiveTransaction>,
    next_token: u64,
    next_version: u16,
    locked_down_by: Option<ModuleId>,
    completions: VecDeque<RecordStoreCompletion>,
}

impl RecordStore {
    /// Boots a fresh store: every page starts as an erased swap page except
    /// page 0, which becomes the initial active page. Real boot instead
    /// calls [`RecordStore::repair_on_boot`] against whatever flash already
    /// holds.
    #[must_use]
    pub fn new_erased(config: RecordStoreConfig) -> Self {
        assert!(config.num_pages >= 2, "record store needs at least 2 pages");
        let mut pages: Vec<PageState> = (0..config.num_pages)
            .map(|_| PageState::new_swap(config.page_size))
            .collect();
        pages[0].header = PageHeader {
            magic: PageMagic::Active,
            version_counter: 1,
        };
        Self {
            config,
            pages,
            queue: VecDeque::new(),
            active: None,
            next_token: 1,
            next_version: 1,
            locked_down_by: None,
            completions: VecDeque::new(),
        }
    }

    /// Repairs the store from raw page snapshots at boot, per the repair
    /// algorithm in 4.1: erase any page whose magic is neither active nor
    /// erased, then ensure exactly one swap page exists.
    #[must_use]
    pub fn repair_on_boot(config: RecordStoreConfig, raw_pages: Vec<PageState>) -> Self {
        assert_eq!(raw_pages.len(), config.num_pages as usize);
        let mut pages = raw_pages;

        for page in &mut pages {
            if page.is_corrupt() {
                warn!("record store: erasing corrupt page at boot");
                *page = PageState::new_swap(config.page_size);
            }
        }

        let swap_count = pages.iter().filter(|p| p.is_swap()).count();
        if swap_count == 0 {
            // Borrow one from the active set: demote the page with the
            // fewest live bytes, since it has the least to lose.
            if let Some((idx, _)) = pages
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.live_bytes())
            {
                pages[idx] = PageState::new_swap(config.page_size);
            }
        } else if swap_count > 1 {
            // Keep exactly one erased; re-erase the rest (no-op, already erased).
        }

        if !pages.iter().any(PageState::is_active) {
            // No active page survived repair: seed page 0.
            pages[0].header = PageHeader {
                magic: PageMagic::Active,
                version_counter: 1,
            };
        }

        let next_version = pages
            .iter()
            .flat_map(|p| p.records.iter())
            .map(|r| r.header.version_counter)
            .max()
            .unwrap_or(0)
            + 1;

        Self {
            config,
            pages,
            queue: VecDeque::new(),
            active: None,
            next_token: 1,
            next_version,
            locked_down_by: None,
            completions: VecDeque::new(),
        }
    }

    // -----------------------------------------------------------------
    // Synchronous reads
    // -----------------------------------------------------------------

    /// Scans every active page and returns the freshest live copy of
    /// `record_id`, or `None`. Invariant 1 in 3: at most one record with a
    /// given id is ever returned.
    #[must_use]
    pub fn get_record(&self, record_id: u16) -> Option<&[u8]> {
        self.pages
            .iter()
            .filter(|p| p.is_active())
            .filter_map(|p| p.freshest(record_id).map(|r| (p.header.version_counter, r)))
            .max_by_key(|(page_version, r)| (*page_version, r.header.version_counter))
            .map(|(_, r)| r.data.as_slice())
    }

    #[must_use]
    pub fn completions(&mut self) -> &mut VecDeque<RecordStoreCompletion> {
        &mut self.completions
    }

    /// Snapshots every page's current in-memory mirror, suitable for handing
    /// to [`RecordStore::repair_on_boot`] to simulate a power cycle against
    /// the same underlying flash contents.
    #[must_use]
    pub fn snapshot_pages(&self) -> Vec<RawPageSnapshot> {
        self.pages.clone()
    }

    pub fn pop_completion(&mut self) -> Option<RecordStoreCompletion> {
        self.completions.pop_front()
    }

    // -----------------------------------------------------------------
    // Mutating operations: validate synchronously, enqueue a transaction
    // -----------------------------------------------------------------

    /// # Errors
    /// `RecordTooLarge` if the body cannot fit in any page even when empty;
    /// `LockedDown` if the store is locked and `caller` isn't the lock
    /// holder; `Busy` if the queue itself is full (bounded by page count
    /// times a small multiplier).
    #[instrument(skip(self, data))]
    pub fn save_record(
        &mut self,
        record_id: u16,
        data: &[u8],
        caller: Option<ModuleId>,
    ) -> Result<(), RecordStoreError> {
        let (padded, padding_len) = padded_len(data.len());
        let footprint = RECORD_HEADER_SIZE + padded;
        if footprint > self.config.page_size - PAGE_HEADER_SIZE {
            return Err(RecordStoreError::RecordTooLarge);
        }
        if let Some(owner) = self.locked_down_by {
            if caller != Some(owner) {
                return Err(RecordStoreError::LockedDown(owner));
            }
        }
        if self.queue.len() >= 64 {
            return Err(RecordStoreError::Busy);
        }

        let version = self.next_version;
        self.next_version = self.next_version.wrapping_add(1);

        let header = RecordHeader {
            crc8: mesh_core::crc8(data),
            flags: RecordFlags {
                padding_len,
                record_active: true,
                mortal: true,
            },
            length: padded as u16,
            record_id,
            version_counter: version,
        };

        let mut ops = Vec::new();
        let page_idx = match self.find_space(footprint) {
            Some(idx) => idx,
            None => {
                if !self.stage_defrag_ops(footprint, &mut ops) {
                    return Err(RecordStoreError::NoSpace);
                }
                // ops now contains the defrag steps; the actual write
                // targets whatever page defrag freed, resolved at apply
                // time via `find_space` again since defrag is itself
                // queued ahead of this save.
                self.queue.push_back(Transaction {
                    kind: TransactionKind::Defrag,
                    ops: std::mem::take(&mut ops),
                });
                // Re-check space optimistically against the post-defrag
                // page; if the caller observes `NoSpace` they may retry.
                self.find_space(footprint).unwrap_or(0)
            }
        };

        if let Some(existing) = self.pages[page_idx]
            .records
            .iter()
            .position(|r| r.is_live() && r.header.record_id == record_id)
        {
            ops.push(FlashOp::InvalidateInPlace {
                page: page_idx,
                record_index: existing,
            });
        }
        let offset = self.pages[page_idx].used_bytes();
        ops.push(FlashOp::WriteRecord {
            page: page_idx,
            offset,
            header,
            data: data.to_vec(),
        });

        self.queue.push_back(Transaction {
            kind: TransactionKind::Save { record_id },
            ops,
        });
        Ok(())
    }

    /// # Errors
    /// `Busy` if the queue is full.
    pub fn deactivate_record(&mut self, record_id: u16) -> Result<(), RecordStoreError> {
        if self.queue.len() >= 64 {
            return Err(RecordStoreError::Busy);
        }
        let Some(page_idx) = self
            .pages
            .iter()
            .position(|p| p.is_active() && p.freshest(record_id).is_some())
        else {
            // Nothing to deactivate; treat as a trivial success.
            self.completions.push_back(RecordStoreCompletion::Deactivated {
                record_id,
                result: Ok(()),
            });
            return Ok(());
        };
        let record_index = self.pages[page_idx]
            .records
            .iter()
            .position(|r| r.is_live() && r.header.record_id == record_id)
            .expect("freshest() already confirmed a live match");
        self.queue.push_back(Transaction {
            kind: TransactionKind::Deactivate { record_id },
            ops: vec![FlashOp::InvalidateInPlace {
                page: page_idx,
                record_index,
            }],
        });
        Ok(())
    }

    /// # Errors
    /// `Busy` if the queue is full.
    pub fn immortalize_record(&mut self, record_id: u16) -> Result<(), RecordStoreError> {
        if self.queue.len() >= 64 {
            return Err(RecordStoreError::Busy);
        }
        self.queue.push_back(Transaction {
            kind: TransactionKind::Immortalize { record_id },
            ops: Vec::new(),
        });
        Ok(())
    }

    /// Deactivates every mortal record across all pages. Per 4.1, this must
    /// complete even across reboots; real persistence of the marker record
    /// is left to the flash-backed apply step (every op in the transaction
    /// is individually retried and the transaction is atomic-or-nothing from
    /// the queue's point of view).
    ///
    /// # Errors
    /// `Busy` if the queue is full.
    pub fn lock_down_and_clear_all(&mut self, module_id: ModuleId) -> Result<(), RecordStoreError> {
        if self.queue.len() >= 64 {
            return Err(RecordStoreError::Busy);
        }
        let mut ops = Vec::new();
        for (page_idx, page) in self.pages.iter().enumerate() {
            for (record_idx, record) in page.records.iter().enumerate() {
                if record.is_live() && record.header.flags.mortal {
                    ops.push(FlashOp::InvalidateInPlace {
                        page: page_idx,
                        record_index: record_idx,
                    });
                }
            }
        }
        self.queue.push_back(Transaction {
            kind: TransactionKind::LockDown { module_id },
            ops,
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Space management
    // -----------------------------------------------------------------

    fn find_space(&self, footprint: usize) -> Option<usize> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_active() && p.free_bytes() >= footprint)
            .min_by_key(|(_, p)| p.free_bytes())
            .map(|(idx, _)| idx)
    }

    /// Finds the active page with the least live data (most reclaimable
    /// space), stages MOVE_TO_SWAP + WRITE_HEADER + ERASE_OLD ops for it.
    /// Returns `true` if a candidate was found and staged.
    fn stage_defrag_ops(&self, needed: usize, ops: &mut Vec<FlashOp>) -> bool {
        let Some(swap_idx) = self.pages.iter().position(PageState::is_swap) else {
            return false;
        };
        let Some((src_idx, _)) = self
            .pages
            .iter()
            .enumerate()
            .filter(|(idx, p)| *idx != swap_idx && p.is_active())
            .min_by_key(|(_, p)| p.live_bytes())
        else {
            return false;
        };
        let src = &self.pages[src_idx];
        if PAGE_HEADER_SIZE + src.live_bytes() + needed > self.config.page_size {
            return false;
        }

        let mut offset = PAGE_HEADER_SIZE;
        for record in &src.records {
            if record.is_live() {
                ops.push(FlashOp::WriteRecord {
                    page: swap_idx,
                    offset,
                    header: record.header,
                    data: record.data.clone(),
                });
                offset += RECORD_HEADER_SIZE + record.header.length as usize;
            }
        }
        ops.push(FlashOp::WriteHeader {
            page: swap_idx,
            header: PageHeader {
                magic: PageMagic::Active,
                version_counter: src.header.version_counter.wrapping_add(1),
            },
        });
        ops.push(FlashOp::Erase { page: src_idx });
        true
    }

    // -----------------------------------------------------------------
    // Flash dispatch loop
    // -----------------------------------------------------------------

    /// Dispatches the next queued transaction's next step to `flash`, if
    /// nothing is currently in flight. Call after boot and after every
    /// `on_flash_event`.
    pub fn pump(&mut self, flash: &dyn FlashTransport) {
        if self.active.is_some() {
            return;
        }
        let Some(transaction) = self.queue.pop_front() else {
            return;
        };
        if transaction.ops.is_empty() {
            self.finish(transaction, true);
            self.pump(flash);
            return;
        }
        let token = self.issue_token();
        self.issue_op(flash, &transaction.ops[0], token);
        self.active = Some(ActiveTransaction {
            transaction,
            step: 0,
            retries_left: self.config.flash_retry_count,
            token,
        });
    }

    /// Handles a `FlashEvent` from the transport. Returns `true` if the
    /// event matched the in-flight operation.
    #[instrument(skip(self, flash))]
    pub fn on_flash_event(&mut self, event: FlashEvent, flash: &dyn FlashTransport) -> bool {
        let Some(active) = &mut self.active else {
            return false;
        };
        let (matched_token, success) = match event {
            FlashEvent::FlashOperationSuccess { token } => (token, true),
            FlashEvent::FlashOperationError { token } => (token, false),
        };
        if matched_token != active.token {
            return false;
        }

        if success {
            self.apply_op_effect(active.step);
            let mut active = self.active.take().expect("checked above");
            active.step += 1;
            if active.step >= active.transaction.ops.len() {
                self.finish(active.transaction, true);
            } else {
                let token = self.issue_token();
                self.issue_op(flash, &active.transaction.ops[active.step], token);
                active.retries_left = self.config.flash_retry_count;
                active.token = token;
                self.active = Some(active);
            }
        } else {
            active.retries_left = active.retries_left.saturating_sub(1);
            if active.retries_left == 0 {
                warn!("record store: flash retry budget exhausted, aborting transaction");
                let active = self.active.take().expect("checked above");
                self.finish(active.transaction, false);
            } else {
                let op = active.transaction.ops[active.step].clone();
                let token = self.issue_token();
                self.issue_op(flash, &op, token);
                active.token = token;
            }
        }
        self.pump(flash);
        true
    }

    fn issue_token(&mut self) -> FlashOpToken {
        let token = FlashOpToken(self.next_token);
        self.next_token += 1;
        token
    }

    fn issue_op(&self, flash: &dyn FlashTransport, op: &FlashOp, token: FlashOpToken) {
        match op {
            FlashOp::Erase { page } => flash.erase_page(token, mesh_core::PageIndex(*page as u16)),
            FlashOp::WriteHeader { page, header } => {
                let bytes = header.encode();
                let words = bytes_to_words(&bytes);
                flash.write(token, mesh_core::PageIndex(*page as u16), 0, words);
            }
            FlashOp::WriteRecord { page, offset, header, data } => {
                let (padded, _) = padded_len(data.len());
                let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + padded);
                bytes.extend_from_slice(&header.encode());
                bytes.extend_from_slice(data);
                bytes.resize(RECORD_HEADER_SIZE + padded, 0);
                let words = bytes_to_words(&bytes);
                #[allow(clippy::cast_possible_truncation)]
                flash.write(token, mesh_core::PageIndex(*page as u16), *offset as u32, words);
            }
            FlashOp::InvalidateInPlace { page, record_index } => {
                // Two-byte patch at the record's header offset; offset
                // computed the same way `used_bytes` accumulates.
                let p = &self.pages[*page];
                let mut offset = PAGE_HEADER_SIZE;
                for r in &p.records[..*record_index] {
                    offset += r.footprint();
                }
                let patch = RecordHeader::invalidation_patch();
                let words = bytes_to_words(&patch);
                #[allow(clippy::cast_possible_truncation)]
                flash.write(token, mesh_core::PageIndex(*page as u16), offset as u32, words);
            }
        }
    }

    /// Mutates the in-memory mirror once the flash controller has confirmed
    /// the corresponding physical write/erase.
    fn apply_op_effect(&mut self, step: usize) {
        let op = self.active.as_ref().expect("caller holds active").transaction.ops[step].clone();
        match op {
            FlashOp::Erase { page } => {
                self.pages[page] = PageState::new_swap(self.config.page_size);
            }
            FlashOp::WriteHeader { page, header } => {
                self.pages[page].header = header;
            }
            FlashOp::WriteRecord { page, header, data, .. } => {
                self.pages[page].push_record(header, data);
            }
            FlashOp::InvalidateInPlace { page, record_index } => {
                if let Some(r) = self.pages[page].records.get_mut(record_index) {
                    r.header.flags.record_active = false;
                }
            }
        }
    }

    fn finish(&mut self, transaction: Transaction, success: bool) {
        let result = if success {
            Ok(())
        } else {
            Err(RecordStoreError::InternalError)
        };
        let completion = match transaction.kind {
            TransactionKind::Save { record_id } => {
                debug!(record_id, success, "record store: save complete");
                Some(RecordStoreCompletion::Saved { record_id, result })
            }
            TransactionKind::Deactivate { record_id } => {
                Some(RecordStoreCompletion::Deactivated { record_id, result })
            }
            TransactionKind::Immortalize { record_id } => {
                for page in &mut self.pages {
                    if page.immortalize(record_id) {
                        break;
                    }
                }
                Some(RecordStoreCompletion::Immortalized { record_id, result })
            }
            TransactionKind::LockDown { module_id } => {
                self.locked_down_by = Some(module_id);
                Some(RecordStoreCompletion::LockedDown { module_id, result })
            }
            TransactionKind::Defrag => None,
        };
        if let Some(c) = completion {
            self.completions.push_back(c);
        }
    }
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}

pub use page::PageState as RawPageSnapshot;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFlash;

    fn drain(store: &mut RecordStore, flash: &FakeFlash) {
        store.pump(flash);
        while let Some(event) = flash.pop_event() {
            store.on_flash_event(event, flash);
        }
    }

    #[test]
    fn save_then_get_round_trips() {
        let flash = FakeFlash::new();
        let mut store = RecordStore::new_erased(RecordStoreConfig::default());
        store.save_record(42, &[1, 2, 3, 4], None).unwrap();
        drain(&mut store, &flash);
        assert_eq!(store.get_record(42), Some(&[1, 2, 3, 4][..]));
        assert!(matches!(
            store.pop_completion(),
            Some(RecordStoreCompletion::Saved { record_id: 42, result: Ok(()) })
        ));
    }

    #[test]
    fn update_invalidates_old_version() {
        let flash = FakeFlash::new();
        let mut store = RecordStore::new_erased(RecordStoreConfig::default());
        store.save_record(1, &[0xAA], None).unwrap();
        drain(&mut store, &flash);
        store.save_record(1, &[0xBB], None).unwrap();
        drain(&mut store, &flash);
        assert_eq!(store.get_record(1), Some(&[0xBB][..]));
        let live_count = store.pages[0].records.iter().filter(|r| r.is_live()).count();
        assert_eq!(live_count, 1);
    }

    #[test]
    fn deactivate_makes_record_invisible() {
        let flash = FakeFlash::new();
        let mut store = RecordStore::new_erased(RecordStoreConfig::default());
        store.save_record(7, &[9, 9], None).unwrap();
        drain(&mut store, &flash);
        store.deactivate_record(7).unwrap();
        drain(&mut store, &flash);
        assert_eq!(store.get_record(7), None);
    }

    #[test]
    fn oversized_record_is_rejected_synchronously() {
        let mut store = RecordStore::new_erased(RecordStoreConfig {
            page_size: 64,
            ..Default::default()
        });
        let huge = vec![0u8; 128];
        assert_eq!(store.save_record(1, &huge, None), Err(RecordStoreError::RecordTooLarge));
    }

    #[test]
    fn lock_down_blocks_other_callers_but_not_the_owner() {
        let flash = FakeFlash::new();
        let mut store = RecordStore::new_erased(RecordStoreConfig::default());
        let owner = ModuleId::Core(5);
        store.lock_down_and_clear_all(owner).unwrap();
        drain(&mut store, &flash);
        assert_eq!(
            store.save_record(1, &[1], None),
            Err(RecordStoreError::LockedDown(owner))
        );
        assert!(store.save_record(1, &[1], Some(owner)).is_ok());
    }

    #[test]
    fn lock_down_and_clear_all_preserves_immortal_records() {
        let flash = FakeFlash::new();
        let mut store = RecordStore::new_erased(RecordStoreConfig::default());
        for id in 1..=16u16 {
            store.save_record(id, &[id as u8], None).unwrap();
            drain(&mut store, &flash);
        }
        for id in (1..=16u16).step_by(2) {
            store.immortalize_record(id).unwrap();
            drain(&mut store, &flash);
        }
        store.lock_down_and_clear_all(ModuleId::Core(1)).unwrap();
        drain(&mut store, &flash);

        for id in 1..=16u16 {
            if id % 2 == 1 {
                assert_eq!(store.get_record(id), Some(&[id as u8][..]), "odd id {id} should survive");
            } else {
                assert_eq!(store.get_record(id), None, "even id {id} should be cleared");
            }
        }
    }

    #[test]
    fn flash_write_failure_exhausting_retries_yields_internal_error() {
        let flash = FakeFlash::new();
        flash.fail_next_writes(10);
        let mut store = RecordStore::new_erased(RecordStoreConfig {
            flash_retry_count: 5,
            ..Default::default()
        });
        store.save_record(3, &[1, 2], None).unwrap();
        drain(&mut store, &flash);
        assert_eq!(store.get_record(3), None);
        assert!(matches!(
            store.pop_completion(),
            Some(RecordStoreCompletion::Saved { record_id: 3, result: Err(RecordStoreError::InternalError) })
        ));
    }

    #[test]
    fn flash_write_succeeds_after_transient_failures_within_budget() {
        let flash = FakeFlash::new();
        flash.fail_next_writes(3);
        let mut store = RecordStore::new_erased(RecordStoreConfig {
            flash_retry_count: 5,
            ..Default::default()
        });
        store.save_record(9, &[5, 5, 5], None).unwrap();
        drain(&mut store, &flash);
        assert_eq!(store.get_record(9), Some(&[5, 5, 5][..]));
    }

    #[test]
    fn defragmentation_reclaims_space_from_invalidated_records() {
        let flash = FakeFlash::new();
        let mut store = RecordStore::new_erased(RecordStoreConfig {
            num_pages: 2,
            page_size: 128,
            ..Default::default()
        });
        // Fill the active page with records, then invalidate most of them
        // so the next save must defragment to find room.
        for id in 0..6u16 {
            store.save_record(id, &[0xFF; 8], None).unwrap();
            drain(&mut store, &flash);
        }
        for id in 0..5u16 {
            store.deactivate_record(id).unwrap();
            drain(&mut store, &flash);
        }
        assert!(store.save_record(99, &[0x42; 8], None).is_ok());
        drain(&mut store, &flash);
        assert_eq!(store.get_record(99), Some(&[0x42; 8][..]));
        assert_eq!(store.get_record(5), Some(&[0xFF; 8][..]));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::testing::FakeFlash;
    use proptest::prelude::*;

    fn drain(store: &mut RecordStore, flash: &FakeFlash) {
        store.pump(flash);
        while let Some(event) = flash.pop_event() {
            store.on_flash_event(event, flash);
        }
    }

    proptest! {
        /// `save_record(id, d)` followed by a drain always yields a
        /// `get_record(id)` equal to `d`, for any id/payload that fits a
        /// fresh page -- the round trip in spec §8.
        #[test]
        fn save_then_get_round_trips(
            record_id in any::<u16>(),
            data in proptest::collection::vec(any::<u8>(), 0..200),
        ) {
            let flash = FakeFlash::new();
            let mut store = RecordStore::new_erased(RecordStoreConfig::default());
            store.save_record(record_id, &data, None).unwrap();
            drain(&mut store, &flash);
            prop_assert_eq!(store.get_record(record_id), Some(data.as_slice()));
        }

        /// Rewriting the same id repeatedly always leaves exactly the latest
        /// value visible, never an older one.
        #[test]
        fn repeated_rewrite_always_shows_latest(
            record_id in any::<u16>(),
            versions in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 1..6),
        ) {
            let flash = FakeFlash::new();
            let mut store = RecordStore::new_erased(RecordStoreConfig::default());
            for version in &versions {
                store.save_record(record_id, version, None).unwrap();
                drain(&mut store, &flash);
            }
            prop_assert_eq!(store.get_record(record_id), versions.last().map(Vec::as_slice));
        }
    }
}
