//! HID packet channel.
//!
//! `HidChannel` owns the message formats and the attempt loop; the raw
//! report exchange behind it is the `HidIo` trait, implemented for real
//! hardware by `NusbHid` and for tests by the mock in this crate.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::HidIo;
use crate::error::{FlashError, Result};
use crate::protocol::constants::{
    HID_PACKET_SIZE, HID_RETRY_BASE, MAX_HID_ATTEMPTS, MSG_GET_FIRMWARE_DESCRIPTION,
    MSG_GET_FIRMWARE_VERSION, MSG_QUERY_BOOTLOADER, MSG_QUERY_USBHID_BOOTLOADER,
    MSG_SWITCH_TO_BOOTLOADER, RUNNING_PRODUCT_ID, VENDOR_IDS,
};
use crate::protocol::packets;

/// How long a single report read may take before the attempt loop retries.
const REPORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Request/response channel to the device, every operation wrapped in the
/// attempt loop: up to [`MAX_HID_ATTEMPTS`] tries with a jittered pause of
/// `RETRY_BASE/2 + rand(0..RETRY_BASE/2)` between them.
pub struct HidChannel<H: HidIo> {
    io: H,
    retry_base: Duration,
}

impl<H: HidIo> HidChannel<H> {
    pub fn new(io: H) -> Self {
        Self {
            io,
            retry_base: HID_RETRY_BASE,
        }
    }

    /// Override the retry pause; tests shrink it to zero.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    fn attempt<T>(
        &mut self,
        op: &'static str,
        mut call: impl FnMut(&mut H) -> Result<T>,
    ) -> Result<T> {
        let mut last = None;
        for n in 1..=MAX_HID_ATTEMPTS {
            match call(&mut self.io) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(op, attempt = n, error = %e, "HID attempt failed");
                    last = Some(e);
                    if n < MAX_HID_ATTEMPTS {
                        thread::sleep(jittered(self.retry_base));
                    }
                }
            }
        }
        warn!(op, attempts = MAX_HID_ATTEMPTS, "HID operation exhausted its attempts");
        Err(FlashError::DeviceUnreachable(format!(
            "{op} failed after {MAX_HID_ATTEMPTS} attempts: {}",
            last.map_or_else(|| "no response".into(), |e| e.to_string())
        )))
    }

    pub fn query_usbhid_bootloader(&mut self) -> Result<bool> {
        self.attempt("USB-HID bootloader query", |io| {
            let response = exchange(io, &[MSG_QUERY_USBHID_BOOTLOADER])?;
            packets::parse_bool(MSG_QUERY_USBHID_BOOTLOADER, &response)
        })
    }

    pub fn query_bootloader(&mut self) -> Result<bool> {
        self.attempt("bootloader query", |io| {
            let response = exchange(io, &[MSG_QUERY_BOOTLOADER])?;
            packets::parse_bool(MSG_QUERY_BOOTLOADER, &response)
        })
    }

    pub fn firmware_version(&mut self) -> Result<String> {
        self.attempt("firmware version query", |io| {
            let response = exchange(io, &[MSG_GET_FIRMWARE_VERSION])?;
            packets::parse_version(MSG_GET_FIRMWARE_VERSION, &response)
        })
    }

    pub fn firmware_description(&mut self) -> Result<String> {
        self.attempt("firmware description query", |io| {
            let response = exchange(io, &[MSG_GET_FIRMWARE_DESCRIPTION])?;
            packets::parse_description(MSG_GET_FIRMWARE_DESCRIPTION, &response)
        })
    }

    pub fn switch_to_bootloader(&mut self) -> Result<()> {
        self.attempt("bootloader switch", |io| {
            let response = exchange(io, &[MSG_SWITCH_TO_BOOTLOADER])?;
            if response.len() < 2 || response[1] != MSG_SWITCH_TO_BOOTLOADER {
                return Err(FlashError::UnexpectedResponse(response));
            }
            Ok(())
        })
    }

    /// Send one packet and return its response.
    pub fn send_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        self.attempt("packet exchange", |io| exchange(io, packet))
    }

    /// Send a batch of packets as one host-side transaction and return the
    /// response to the batch.
    pub fn send_multiple(&mut self, packets: &[Vec<u8>]) -> Result<Vec<u8>> {
        self.attempt("packet batch", |io| {
            for packet in packets {
                io.write_report(&pad(packet))?;
            }
            io.read_report(REPORT_TIMEOUT)
        })
    }
}

fn exchange<H: HidIo>(io: &mut H, request: &[u8]) -> Result<Vec<u8>> {
    io.write_report(&pad(request))?;
    io.read_report(REPORT_TIMEOUT)
}

fn pad(request: &[u8]) -> Vec<u8> {
    let mut report = vec![0u8; HID_PACKET_SIZE];
    let len = request.len().min(HID_PACKET_SIZE);
    report[..len].copy_from_slice(&request[..len]);
    report
}

/// Pause in `[base/2, base)`, spread by the clock's sub-millisecond noise so
/// concurrent retriers do not stay in lockstep.
fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let half = (base / 2).as_nanos() as u64;
    let noise = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0);
    Duration::from_nanos(half + noise % half.max(1))
}

// ============================================================================
// nusb-backed implementation
// ============================================================================

use nusb::transfer::{In, Interrupt, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use std::io::{Read, Write};

/// HID report exchange over nusb interrupt endpoints.
pub struct NusbHid {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbHid {
    /// Open the first device running application firmware.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self> {
        let devices = list_devices()
            .wait()
            .map_err(|e| FlashError::Usb(e.to_string()))?;

        for device_info in devices {
            if VENDOR_IDS.contains(&device_info.vendor_id())
                && device_info.product_id() == RUNNING_PRODUCT_ID
            {
                return Self::open_device_info(device_info);
            }
        }

        Err(FlashError::DeviceUnreachable("no HID device present".into()))
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| FlashError::Usb(e.to_string()))?;

        let interface = device
            .claim_interface(0)
            .wait()
            .map_err(|e| FlashError::Usb(format!("claim interface 0: {e}")))?;

        // Find the interrupt endpoint pair on the HID interface.
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == 0 {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Interrupt {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 || out_endpoint == 0 {
            return Err(FlashError::Usb("no interrupt endpoint pair".into()));
        }

        debug!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "HID channel open"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }

    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    pub fn product_id(&self) -> u16 {
        self.pid
    }
}

impl HidIo for NusbHid {
    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        let ep = self
            .interface
            .endpoint::<Interrupt, Out>(self.out_endpoint)
            .map_err(|e| FlashError::Usb(e.to_string()))?;

        let mut writer = ep.writer(HID_PACKET_SIZE);
        writer
            .write_all(report)
            .map_err(|e| FlashError::Usb(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| FlashError::Usb(e.to_string()))?;
        Ok(())
    }

    fn read_report(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        // The device answers with the next IN report; the channel's attempt
        // loop bounds how long we keep asking.
        let ep = self
            .interface
            .endpoint::<Interrupt, In>(self.in_endpoint)
            .map_err(|e| FlashError::Usb(e.to_string()))?;

        let mut reader = ep.reader(HID_PACKET_SIZE);
        let mut report = vec![0u8; HID_PACKET_SIZE];
        let n = reader
            .read(&mut report)
            .map_err(|e| FlashError::Usb(e.to_string()))?;
        report.truncate(n);
        Ok(report)
    }
}
