//! Serial line implementation over the `serialport` crate.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use tracing::{debug, info};

use super::SerialLink;
use crate::error::{FlashError, Result};
use crate::protocol::constants::{BOOTLOADER_PRODUCT_ID, SERIAL_BAUD, VENDOR_IDS};

/// Granularity of the accumulate loop inside `await_response`.
const READ_SLICE: Duration = Duration::from_millis(20);

/// Enumerate OS serial ports and return the first one exposing the device's
/// serial-bootloader USB identifiers.
pub fn find_bootloader_port() -> Option<String> {
    let ports = serialport::available_ports().ok()?;
    ports.into_iter().find_map(|p| match p.port_type {
        SerialPortType::UsbPort(ref usb)
            if VENDOR_IDS.contains(&usb.vid) && usb.pid == BOOTLOADER_PRODUCT_ID =>
        {
            Some(p.port_name)
        }
        _ => None,
    })
}

/// A 9600 8-N-1 line to the serial bootloader.
pub struct SerialPortLine {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl SerialPortLine {
    pub fn open(name: &str) -> Result<Self> {
        let port = serialport::new(name, SERIAL_BAUD)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_SLICE)
            .open()?;

        info!(port = %name, baud = SERIAL_BAUD, "Opened serial port");
        Ok(Self {
            port: Some(port),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(FlashError::PortClosed)
    }
}

impl SerialLink for SerialPortLine {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(bytes).map_err(io_to_flash)?;
        Ok(())
    }

    fn await_response(
        &mut self,
        expected_len: usize,
        timeout: Duration,
        op: &'static str,
        accept: &dyn Fn(&[u8]) -> bool,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buffer = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 256];

        loop {
            let port = self.port_mut()?;
            match port.read(&mut chunk) {
                Ok(0) => return Err(FlashError::PortClosed),
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(io_to_flash(e)),
            }

            if buffer.len() >= expected_len {
                debug!(op, len = buffer.len(), "Response accumulated");
                return if accept(&buffer) {
                    Ok(buffer)
                } else {
                    Err(FlashError::UnexpectedResponse(buffer))
                };
            }
            if Instant::now() >= deadline {
                return Err(FlashError::Timeout(op));
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        let port = self.port_mut()?;
        port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.name, "Closed serial port");
        }
    }
}

impl Drop for SerialPortLine {
    fn drop(&mut self) {
        self.close();
    }
}

/// A vanished port surfaces as `PortClosed`; everything else carries through.
fn io_to_flash(e: std::io::Error) -> FlashError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotFound => FlashError::PortClosed,
        _ => FlashError::Io(e),
    }
}
