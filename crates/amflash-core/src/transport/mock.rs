//! Mock transports for exercising the state machines without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Backend, HidIo, SerialLink};
use crate::error::{FlashError, Result};

/// Scripted serial line: responses are consumed in order, writes are
/// captured. Clones share state so a test can keep inspecting after the
/// flasher has taken ownership.
#[derive(Clone, Default)]
pub struct MockSerial {
    responses: Arc<Mutex<VecDeque<Option<Vec<u8>>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response returned by the next `await_response`.
    pub fn push_response(&self, bytes: &[u8]) {
        self.responses.lock().unwrap().push_back(Some(bytes.to_vec()));
    }

    /// Queue a response deadline miss.
    pub fn push_timeout(&self) {
        self.responses.lock().unwrap().push_back(None);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl SerialLink for MockSerial {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlashError::PortClosed);
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn await_response(
        &mut self,
        _expected_len: usize,
        _timeout: Duration,
        op: &'static str,
        accept: &dyn Fn(&[u8]) -> bool,
    ) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlashError::PortClosed);
        }
        match self.responses.lock().unwrap().pop_front() {
            Some(Some(response)) if accept(&response) => Ok(response),
            Some(Some(response)) => Err(FlashError::UnexpectedResponse(response)),
            Some(None) | None => Err(FlashError::Timeout(op)),
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Scripted HID report exchange.
#[derive(Clone, Default)]
pub struct MockHid {
    responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    reports: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockHid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, bytes: &[u8]) {
        self.responses.lock().unwrap().push_back(bytes.to_vec());
    }

    pub fn reports(&self) -> Vec<Vec<u8>> {
        self.reports.lock().unwrap().clone()
    }
}

impl HidIo for MockHid {
    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        self.reports.lock().unwrap().push(report.to_vec());
        Ok(())
    }

    fn read_report(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(FlashError::Timeout("HID report"))
    }
}

/// Backend over the mocks. Serial and HID handles are dealt from queues so a
/// test can script re-opens (e.g. after a bootloader update's reset).
#[derive(Default)]
pub struct MockBackend {
    port_present: AtomicBool,
    absent_polls: AtomicU32,
    serials: Mutex<VecDeque<MockSerial>>,
    hids: Mutex<VecDeque<MockHid>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_port_present(&self, present: bool) {
        self.port_present.store(present, Ordering::SeqCst);
    }

    /// Report the port absent for the next `polls` discovery calls; models a
    /// device that re-enumerates after a mode switch.
    pub fn set_absent_polls(&self, polls: u32) {
        self.absent_polls.store(polls, Ordering::SeqCst);
    }

    pub fn queue_serial(&self, serial: MockSerial) {
        self.serials.lock().unwrap().push_back(serial);
    }

    pub fn queue_hid(&self, hid: MockHid) {
        self.hids.lock().unwrap().push_back(hid);
    }
}

impl Backend for MockBackend {
    type Serial = MockSerial;
    type Hid = MockHid;

    fn find_bootloader_port(&self) -> Option<String> {
        if self.absent_polls.load(Ordering::SeqCst) > 0 {
            self.absent_polls.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        if self.port_present.load(Ordering::SeqCst) {
            Some("MOCK0".to_string())
        } else {
            None
        }
    }

    fn open_serial(&self, _port: &str) -> Result<Self::Serial> {
        self.serials
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(FlashError::PortUnavailable { attempts: 1 })
    }

    fn open_hid(&self) -> Result<Self::Hid> {
        self.hids
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| FlashError::DeviceUnreachable("no HID device present".into()))
    }
}
