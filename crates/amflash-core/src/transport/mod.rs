//! Transport abstraction: serial line and HID packet channel.
//!
//! The traits let the flashing state machines run against real hardware
//! (serialport, nusb) or the mock implementations used by the tests.

pub mod hid;
pub mod mock;
pub mod serial;

use std::time::Duration;

use crate::error::Result;

/// Byte-oriented serial line to the device's bootloader.
///
/// Exactly one outstanding response wait exists at a time (`&mut self`);
/// bytes arriving early stay buffered until the next wait consumes them.
pub trait SerialLink: Send {
    /// Hand bytes to the OS; returns once they are queued for transmission.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Accumulate incoming bytes until at least `expected_len` have arrived,
    /// then test the buffer with `accept`. Returns the buffer on a match,
    /// `UnexpectedResponse` on a reject, `Timeout(op)` on deadline and
    /// `PortClosed` if the port drops mid-wait.
    fn await_response(
        &mut self,
        expected_len: usize,
        timeout: Duration,
        op: &'static str,
        accept: &dyn Fn(&[u8]) -> bool,
    ) -> Result<Vec<u8>>;

    /// Discard buffered input and output.
    fn flush(&mut self) -> Result<()>;

    /// Release the OS handle. Idempotent.
    fn close(&mut self);
}

/// Raw HID report exchange. [`hid::HidChannel`] layers the attempt loop and
/// message formats on top of this.
pub trait HidIo: Send {
    /// Queue one outgoing report (padded to the report size by the caller).
    fn write_report(&mut self, report: &[u8]) -> Result<()>;

    /// Read the next incoming report.
    fn read_report(&mut self, timeout: Duration) -> Result<Vec<u8>>;
}

/// Factory for the transports plus bootloader-port discovery. The dispatcher
/// and the flashers are generic over this seam.
pub trait Backend {
    type Serial: SerialLink;
    type Hid: HidIo;

    /// First serial port whose USB identifiers match the serial-bootloader
    /// profile, if any.
    fn find_bootloader_port(&self) -> Option<String>;

    fn open_serial(&self, port: &str) -> Result<Self::Serial>;

    fn open_hid(&self) -> Result<Self::Hid>;
}

/// Production backend: serialport for the line, nusb for the HID channel.
pub struct SystemBackend;

impl Backend for SystemBackend {
    type Serial = serial::SerialPortLine;
    type Hid = hid::NusbHid;

    fn find_bootloader_port(&self) -> Option<String> {
        serial::find_bootloader_port()
    }

    fn open_serial(&self, port: &str) -> Result<Self::Serial> {
        serial::SerialPortLine::open(port)
    }

    fn open_hid(&self) -> Result<Self::Hid> {
        hid::NusbHid::open()
    }
}
