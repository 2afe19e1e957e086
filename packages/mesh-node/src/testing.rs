//! In-memory `RadioTransport`/`FlashTransport` fakes used by the test suite.
//!
//! Scoped down to what this crate's own tests need: deterministic,
//! synchronous delivery of the events the real stacks would otherwise
//! produce asynchronously from hardware.

use std::collections::VecDeque;

use mesh_core::{
    AdvParams, BleAddress, CharHandle, ConnHandle, ConnParams, FlashEvent, FlashOpToken,
    FlashTransport, HciDisconnectReason, PageIndex, RadioEvent, RadioTransport, ScanParams,
};
use parking_lot::Mutex;

/// Records every call made against it and lets tests inject failures and
/// drain the resulting events in FIFO order, the same order a real radio
/// would deliver them.
///
/// `RadioTransport`/`FlashTransport` require `Send + Sync` (events are
/// reported back from a different task than the one driving sends), so
/// interior mutability here goes through `parking_lot::Mutex` rather than
/// `RefCell`.
#[derive(Default)]
pub struct FakeRadio {
    inner: Mutex<FakeRadioInner>,
}

#[derive(Default)]
struct FakeRadioInner {
    events: VecDeque<RadioEvent>,
    adv_active: bool,
    scan_active: bool,
    last_adv_payload: Option<Vec<u8>>,
    connect_calls: Vec<(BleAddress, ConnParams)>,
    write_calls: Vec<(ConnHandle, CharHandle, Vec<u8>, bool)>,
    disconnect_calls: Vec<(ConnHandle, HciDisconnectReason)>,
    next_resources_exhausted: bool,
}

impl FakeRadio {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: RadioEvent) {
        self.inner.lock().events.push_back(event);
    }

    pub fn pop_event(&self) -> Option<RadioEvent> {
        self.inner.lock().events.pop_front()
    }

    #[must_use]
    pub fn connect_calls(&self) -> Vec<(BleAddress, ConnParams)> {
        self.inner.lock().connect_calls.clone()
    }

    #[must_use]
    pub fn write_calls(&self) -> Vec<(ConnHandle, CharHandle, Vec<u8>, bool)> {
        self.inner.lock().write_calls.clone()
    }

    #[must_use]
    pub fn disconnect_calls(&self) -> Vec<(ConnHandle, HciDisconnectReason)> {
        self.inner.lock().disconnect_calls.clone()
    }

    #[must_use]
    pub fn is_advertising(&self) -> bool {
        self.inner.lock().adv_active
    }

    /// Most recently advertised `JoinMe` payload bytes, if advertising has
    /// started at least once. Lets a multi-node harness observe convergence
    /// (cluster id/size agreement) without reaching into the core's state.
    #[must_use]
    pub fn last_adv_payload(&self) -> Option<Vec<u8>> {
        self.inner.lock().last_adv_payload.clone()
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scan_active
    }
}

impl RadioTransport for FakeRadio {
    fn bt_adv_start(&self, _params: AdvParams, payload: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.adv_active = true;
        inner.last_adv_payload = Some(payload);
    }

    fn bt_adv_stop(&self) {
        self.inner.lock().adv_active = false;
    }

    fn bt_scan_start(&self, _params: ScanParams) {
        self.inner.lock().scan_active = true;
    }

    fn bt_scan_stop(&self) {
        self.inner.lock().scan_active = false;
    }

    fn bt_connect(&self, peer_addr: BleAddress, params: ConnParams) {
        self.inner.lock().connect_calls.push((peer_addr, params));
    }

    fn bt_disconnect(&self, handle: ConnHandle, hci_reason: HciDisconnectReason) {
        self.inner.lock().disconnect_calls.push((handle, hci_reason));
    }

    fn bt_write(&self, handle: ConnHandle, char_handle: CharHandle, data: Vec<u8>, reliable: bool) {
        let mut inner = self.inner.lock();
        if inner.next_resources_exhausted {
            inner.next_resources_exhausted = false;
            return;
        }
        inner.write_calls.push((handle, char_handle, data, reliable));
    }

    fn bt_notify(&self, handle: ConnHandle, char_handle: CharHandle, data: Vec<u8>) {
        self.inner
            .lock()
            .write_calls
            .push((handle, char_handle, data, false));
    }
}

/// In-memory flash fake: echoes back success after every `erase_page`/`write`
/// call unless instructed to fail the next N writes.
#[derive(Default)]
pub struct FakeFlash {
    inner: Mutex<FakeFlashInner>,
}

#[derive(Default)]
struct FakeFlashInner {
    events: VecDeque<FlashEvent>,
    remaining_failures: u32,
}

impl FakeFlash {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().remaining_failures = count;
    }

    pub fn pop_event(&self) -> Option<FlashEvent> {
        self.inner.lock().events.pop_front()
    }
}

impl FlashTransport for FakeFlash {
    fn erase_page(&self, token: FlashOpToken, _page: PageIndex) {
        self.complete(token);
    }

    fn write(&self, token: FlashOpToken, _page: PageIndex, _byte_offset: u32, _words: Vec<u32>) {
        self.complete(token);
    }
}

impl FakeFlash {
    fn complete(&self, token: FlashOpToken) {
        let mut inner = self.inner.lock();
        if inner.remaining_failures > 0 {
            inner.remaining_failures -= 1;
            inner.events.push_back(FlashEvent::FlashOperationError { token });
        } else {
            inner.events.push_back(FlashEvent::FlashOperationSuccess { token });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_radio_records_connect_calls() {
        let radio = FakeRadio::new();
        radio.bt_connect(
            BleAddress([1, 2, 3, 4, 5, 6]),
            ConnParams {
                interval_hint: std::time::Duration::from_millis(30),
            },
        );
        assert_eq!(radio.connect_calls().len(), 1);
    }

    #[test]
    fn fake_radio_tracks_last_adv_payload() {
        let radio = FakeRadio::new();
        assert_eq!(radio.last_adv_payload(), None);
        radio.bt_adv_start(
            AdvParams { interval: std::time::Duration::from_millis(100) },
            vec![1, 2, 3],
        );
        assert_eq!(radio.last_adv_payload(), Some(vec![1, 2, 3]));
        radio.bt_adv_start(
            AdvParams { interval: std::time::Duration::from_millis(100) },
            vec![4, 5],
        );
        assert_eq!(radio.last_adv_payload(), Some(vec![4, 5]));
    }

    #[test]
    fn fake_flash_fails_then_succeeds() {
        let flash = FakeFlash::new();
        flash.fail_next_writes(1);
        flash.write(FlashOpToken(1), PageIndex(0), 0, vec![0]);
        assert!(matches!(flash.pop_event(), Some(FlashEvent::FlashOperationError { .. })));
        flash.write(FlashOpToken(2), PageIndex(0), 0, vec![0]);
        assert!(matches!(flash.pop_event(), Some(FlashEvent::FlashOperationSuccess { .. })));
    }
}
