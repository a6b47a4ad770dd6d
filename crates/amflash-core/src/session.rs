//! Flash session: the dispatch controller.
//!
//! Owns the busy flag, the probe cadence hook, path selection between the
//! two flashers, and the destructive-image guard. `flash` is the single
//! public operation; everything protocol-related below it lives in the
//! flasher modules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::config::FlashConfig;
use crate::crc::format_crc;
use crate::device::{probe, DeviceStatus};
use crate::error::{FlashError, Result};
use crate::events::{FlashEvent, FlashObserver, LogLevel, TracingObserver};
use crate::flasher::usbhid::UsbHidFlasher;
use crate::flasher::xmodem::{XmodemFlasher, XmodemOptions};
use crate::flasher::Timing;
use crate::image::{is_release_image_name, FirmwareImage};
use crate::transport::hid::HidChannel;
use crate::transport::Backend;

/// Job options, immutable for the duration of one flash.
#[derive(Debug, Default, Clone)]
pub struct FlashOptions {
    /// Overwrite the bootloader region as well as the application region.
    pub destructive: bool,
    /// Erase the device's user-data region as part of the job.
    pub clear_user_data: bool,
    /// Take the USB-HID path when the device supports it.
    pub prefer_usbhid: bool,
    /// Compare the device-reported CRC against this value.
    pub expected_crc: Option<u16>,
    /// Label shown in progress text.
    pub version: Option<String>,
}

/// Which transfer path carried the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPath {
    Serial,
    UsbHid,
}

/// Successful job summary.
#[derive(Debug, Clone)]
pub struct FlashOutcome {
    pub path: FlashPath,
    /// CRC the device reported after the transfer.
    pub reported_crc: u16,
}

/// Confirmation hook into the embedding UI.
pub trait ConfirmPrompt: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// Prompt that accepts everything; for non-interactive use.
pub struct AssumeYes;

impl ConfirmPrompt for AssumeYes {
    fn confirm(&self, _question: &str) -> bool {
        true
    }
}

/// One device, one job at a time.
pub struct FlashSession<B: Backend, O: FlashObserver> {
    backend: B,
    observer: Arc<O>,
    config: FlashConfig,
    timing: Timing,
    busy: AtomicBool,
}

impl<B: Backend> FlashSession<B, TracingObserver> {
    /// Session with the default tracing observer.
    pub fn new(backend: B, config: FlashConfig) -> Self {
        Self::with_observer(backend, config, Arc::new(TracingObserver))
    }
}

impl<B: Backend, O: FlashObserver> FlashSession<B, O> {
    pub fn with_observer(backend: B, config: FlashConfig, observer: Arc<O>) -> Self {
        Self {
            backend,
            observer,
            config,
            timing: Timing::default(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// One probe tick. Returns `None` while a job is in flight so the
    /// caller's cadence never overlaps a transfer.
    pub fn probe(&self) -> Option<DeviceStatus> {
        if self.busy.load(Ordering::SeqCst) {
            return None;
        }
        Some(probe(&self.backend))
    }

    /// Run one flash job. Fails fast with `Busy` when another job holds the
    /// session; the flag clears on every exit path.
    #[instrument(skip_all, fields(len = image.len(), destructive = options.destructive))]
    pub fn flash(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        prompt: &dyn ConfirmPrompt,
    ) -> Result<FlashOutcome> {
        let _guard = BusyGuard::acquire(&self.busy)?;

        if let Some(version) = &options.version {
            self.observer.on_event(&FlashEvent::Log {
                level: LogLevel::Info,
                message: format!("Flashing firmware {version}"),
            });
        }

        let result = self.run_job(image, options, prompt);
        match &result {
            Ok(outcome) => {
                self.observer.on_event(&FlashEvent::Completed {
                    reported_crc: Some(format_crc(outcome.reported_crc)),
                });
            }
            Err(e) => {
                self.observer.on_event(&FlashEvent::Aborted {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    fn run_job(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        prompt: &dyn ConfirmPrompt,
    ) -> Result<FlashOutcome> {
        image.validate(options.destructive)?;

        let status = probe(&self.backend);
        info!(status = %status, "Device status");

        if options.destructive && status.is_running_firmware() {
            if image.file_name().is_some_and(is_release_image_name) {
                return Err(FlashError::InvalidImage(
                    "released firmware images already include a bootloader; \
                     flash them non-destructively"
                        .into(),
                ));
            }
            let question = "Overwrite the bootloader region with this image?";
            if !prompt.confirm(question) {
                return Err(FlashError::UserAborted);
            }
        }

        let usbhid_supported = matches!(status, DeviceStatus::RunningAutoSwitch { usbhid: true, .. });
        if options.prefer_usbhid && usbhid_supported && !options.destructive {
            self.flash_usbhid(image, options)
        } else {
            self.flash_serial(image, options, &status, prompt)
        }
    }

    fn flash_usbhid(&self, image: &FirmwareImage, options: &FlashOptions) -> Result<FlashOutcome> {
        image.validate_for_usbhid()?;

        let channel = HidChannel::new(self.backend.open_hid()?);
        let mut flasher =
            UsbHidFlasher::new(channel, self.observer.as_ref()).with_timing(self.timing);
        let reported_crc =
            flasher.run(image.data(), options.clear_user_data, options.expected_crc)?;

        Ok(FlashOutcome {
            path: FlashPath::UsbHid,
            reported_crc,
        })
    }

    fn flash_serial(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        status: &DeviceStatus,
        prompt: &dyn ConfirmPrompt,
    ) -> Result<FlashOutcome> {
        if matches!(status, DeviceStatus::RunningAutoSwitch { .. }) {
            self.switch_to_bootloader()?;
        }

        let updater = match &self.config.bootloader_updater_path {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };

        let flasher =
            XmodemFlasher::new(&self.backend, self.observer.as_ref()).with_timing(self.timing);
        let xmodem_options = XmodemOptions {
            destructive: options.destructive,
            clear_user_data: options.clear_user_data,
            expected_crc: options.expected_crc,
            updater_image: updater.as_deref(),
            port_override: self.config.port.as_deref(),
        };
        let mut gate = |ident: &crate::protocol::xmodem::BootloaderIdent| {
            let question = format!(
                "Device bootloader {} is obsolete and must be updated before \
                 flashing. Update it now?",
                ident.version
            );
            if prompt.confirm(&question) {
                Ok(())
            } else {
                Err(FlashError::UserAborted)
            }
        };

        let reported_crc = flasher.run(image.data(), &xmodem_options, &mut gate)?;
        Ok(FlashOutcome {
            path: FlashPath::Serial,
            reported_crc,
        })
    }

    /// Ask the running firmware to re-enumerate as the serial bootloader and
    /// wait for the port to appear.
    fn switch_to_bootloader(&self) -> Result<()> {
        self.observer.on_event(&FlashEvent::SwitchingMode);
        let mut channel = HidChannel::new(self.backend.open_hid()?);
        channel.switch_to_bootloader()?;

        let start = Instant::now();
        loop {
            if self.backend.find_bootloader_port().is_some() {
                return Ok(());
            }
            if start.elapsed() >= self.timing.switch_watch {
                warn!("Bootloader port never appeared after mode switch");
                return Err(FlashError::BootloaderSwitchFailed);
            }
            thread::sleep(self.timing.poll_step);
        }
    }
}

/// Single-job exclusion; clears on drop so every exit path releases it.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| FlashError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::recording::RecordingObserver;
    use crate::protocol::constants::{
        ACK, CMD_RESET, MAX_NON_DESTRUCTIVE, MSG_GET_FIRMWARE_DESCRIPTION,
        MSG_GET_FIRMWARE_VERSION, MSG_QUERY_BOOTLOADER, MSG_QUERY_USBHID_BOOTLOADER,
        MSG_SWITCH_TO_BOOTLOADER,
    };
    use crate::transport::mock::{MockBackend, MockHid, MockSerial};

    struct DenyAll;

    impl ConfirmPrompt for DenyAll {
        fn confirm(&self, _question: &str) -> bool {
            false
        }
    }

    fn valid_image(len: usize) -> FirmwareImage {
        let mut data = vec![0u8; len];
        data[..4].copy_from_slice(&0x2000_4000u32.to_le_bytes());
        FirmwareImage::from_bytes(data)
    }

    fn session(backend: MockBackend) -> FlashSession<MockBackend, RecordingObserver> {
        FlashSession::with_observer(
            backend,
            FlashConfig::default(),
            Arc::new(RecordingObserver::new()),
        )
        .with_timing(Timing::instant())
    }

    fn script_serial_transfer(serial: &MockSerial, blocks: usize, crc_line: &[u8]) {
        serial.push_response(b"\r\nReady\r\n00");
        serial.push_response(b"BOOTLOADER version 1.10, Chip ID 0123456789ABCDEF\r\n   ");
        for _ in 0..blocks {
            serial.push_response(&[ACK]);
        }
        serial.push_response(&[ACK]);
        serial.push_response(crc_line);
        serial.push_response(&[CMD_RESET]);
    }

    #[test]
    fn serial_job_from_bootloader_status() {
        let backend = MockBackend::new();
        backend.set_port_present(true);
        let serial = MockSerial::new();
        script_serial_transfer(&serial, 1, b"CRC: 00000A1B\r\n   ");
        backend.queue_serial(serial.clone());

        let session = session(backend);
        let image = valid_image(100);
        let mut options = FlashOptions::default();
        options.expected_crc = Some(0x0A1B);

        let outcome = session.flash(&image, &options, &AssumeYes).unwrap();
        assert_eq!(outcome.path, FlashPath::Serial);
        assert_eq!(outcome.reported_crc, 0x0A1B);
        assert!(serial.is_closed());
        assert!(session.probe().is_some(), "busy flag must clear");
    }

    #[test]
    fn oversized_image_rejected_before_any_transport() {
        let backend = MockBackend::new();
        let session = session(backend);
        let image = valid_image(MAX_NON_DESTRUCTIVE + 1);

        let err = session
            .flash(&image, &FlashOptions::default(), &AssumeYes)
            .unwrap_err();
        assert!(matches!(err, FlashError::InvalidImage(_)));
    }

    #[test]
    fn release_image_refused_for_destructive_write() {
        let backend = MockBackend::new();
        let hid = MockHid::new();
        hid.push_response(&[0x00, MSG_QUERY_USBHID_BOOTLOADER, 0x01]);
        hid.push_response(&[0x00, MSG_QUERY_BOOTLOADER, 0x01]);
        hid.push_response(&[0x00, MSG_GET_FIRMWARE_VERSION, 1, 8, 1]);
        let mut description = vec![0x00, MSG_GET_FIRMWARE_DESCRIPTION];
        description.extend_from_slice(b"AudioMoth\0");
        hid.push_response(&description);
        backend.queue_hid(hid);

        let session = session(backend);
        let image = valid_image(100).with_file_name("audiomoth-firmware-basic-1.8.1.bin");
        let mut options = FlashOptions::default();
        options.destructive = true;

        let err = session.flash(&image, &options, &AssumeYes).unwrap_err();
        assert!(matches!(err, FlashError::InvalidImage(_)));
    }

    #[test]
    fn declined_destructive_prompt_aborts() {
        let backend = MockBackend::new();
        let hid = MockHid::new();
        hid.push_response(&[0x00, MSG_QUERY_USBHID_BOOTLOADER, 0x00]);
        hid.push_response(&[0x00, MSG_QUERY_BOOTLOADER, 0x00]);
        hid.push_response(&[0x00, MSG_GET_FIRMWARE_VERSION, 1, 8, 1]);
        let mut description = vec![0x00, MSG_GET_FIRMWARE_DESCRIPTION];
        description.extend_from_slice(b"AudioMoth\0");
        hid.push_response(&description);
        backend.queue_hid(hid);

        let session = session(backend);
        let image = valid_image(100).with_file_name("custom.bin");
        let mut options = FlashOptions::default();
        options.destructive = true;

        let err = session.flash(&image, &options, &DenyAll).unwrap_err();
        assert!(matches!(err, FlashError::UserAborted));
    }

    #[test]
    fn usbhid_path_selected_when_preferred_and_supported() {
        use crate::crc::image_crc;
        use crate::protocol::constants::{
            CMD_CALC_SRAM_CRC, CMD_FLASH_FW, CMD_GET_FW_CRC, CMD_INIT_SRAM,
            CMD_SET_SRAM_FW_PACKET, FW_PACKET_PAYLOAD, HID_BATCH_SIZE,
        };

        let backend = MockBackend::new();
        // Probe responses.
        let probe_hid = MockHid::new();
        probe_hid.push_response(&[0x00, MSG_QUERY_USBHID_BOOTLOADER, 0x01]);
        probe_hid.push_response(&[0x00, MSG_QUERY_BOOTLOADER, 0x01]);
        probe_hid.push_response(&[0x00, MSG_GET_FIRMWARE_VERSION, 1, 8, 1]);
        let mut description = vec![0x00, MSG_GET_FIRMWARE_DESCRIPTION];
        description.extend_from_slice(b"AudioMoth\0");
        probe_hid.push_response(&description);
        backend.queue_hid(probe_hid);

        // Flash responses.
        let image = valid_image(1000);
        let crc = image_crc(image.data());
        let flash_hid = MockHid::new();
        flash_hid.push_response(&[0x00, CMD_INIT_SRAM, 0x01]);
        let packets = image.len().div_ceil(FW_PACKET_PAYLOAD);
        for _ in 0..packets.div_ceil(HID_BATCH_SIZE) {
            flash_hid.push_response(&[0x00, CMD_SET_SRAM_FW_PACKET, 0x01]);
        }
        flash_hid.push_response(&[0x00, CMD_CALC_SRAM_CRC, 0x01]);
        let [lo, hi] = crc.to_le_bytes();
        flash_hid.push_response(&[0x00, CMD_GET_FW_CRC, 0x01, lo, hi]);
        flash_hid.push_response(&[0x00, CMD_FLASH_FW, 0x01]);
        backend.queue_hid(flash_hid);

        let session = session(backend);
        let mut options = FlashOptions::default();
        options.prefer_usbhid = true;

        let outcome = session.flash(&image, &options, &AssumeYes).unwrap();
        assert_eq!(outcome.path, FlashPath::UsbHid);
        assert_eq!(outcome.reported_crc, crc);
    }

    #[test]
    fn auto_switch_runs_before_serial_path() {
        let backend = MockBackend::new();
        // Probe sees running firmware without USB-HID support.
        let probe_hid = MockHid::new();
        probe_hid.push_response(&[0x00, MSG_QUERY_USBHID_BOOTLOADER, 0x00]);
        probe_hid.push_response(&[0x00, MSG_QUERY_BOOTLOADER, 0x01]);
        probe_hid.push_response(&[0x00, MSG_GET_FIRMWARE_VERSION, 1, 8, 1]);
        let mut description = vec![0x00, MSG_GET_FIRMWARE_DESCRIPTION];
        description.extend_from_slice(b"AudioMoth\0");
        probe_hid.push_response(&description);
        backend.queue_hid(probe_hid);

        // Switch command channel.
        let switch_hid = MockHid::new();
        switch_hid.push_response(&[0x00, MSG_SWITCH_TO_BOOTLOADER, 0x01]);
        backend.queue_hid(switch_hid.clone());
        // The bootloader port only appears once the switch has been issued.
        backend.set_port_present(true);
        backend.set_absent_polls(1);

        let serial = MockSerial::new();
        script_serial_transfer(&serial, 1, b"CRC: 00001234\r\n   ");
        backend.queue_serial(serial.clone());

        let session = session(backend);
        let image = valid_image(100);

        let outcome = session
            .flash(&image, &FlashOptions::default(), &AssumeYes)
            .unwrap();
        assert_eq!(outcome.path, FlashPath::Serial);
        assert_eq!(switch_hid.reports().len(), 1);
        assert!(serial.is_closed());
    }

    #[test]
    fn switch_failure_when_port_never_appears() {
        let backend = MockBackend::new();
        let probe_hid = MockHid::new();
        probe_hid.push_response(&[0x00, MSG_QUERY_USBHID_BOOTLOADER, 0x00]);
        probe_hid.push_response(&[0x00, MSG_QUERY_BOOTLOADER, 0x01]);
        probe_hid.push_response(&[0x00, MSG_GET_FIRMWARE_VERSION, 1, 8, 1]);
        let mut description = vec![0x00, MSG_GET_FIRMWARE_DESCRIPTION];
        description.extend_from_slice(b"AudioMoth\0");
        probe_hid.push_response(&description);
        backend.queue_hid(probe_hid);

        let switch_hid = MockHid::new();
        switch_hid.push_response(&[0x00, MSG_SWITCH_TO_BOOTLOADER, 0x01]);
        backend.queue_hid(switch_hid);

        let session = session(backend);
        let image = valid_image(100);

        let err = session
            .flash(&image, &FlashOptions::default(), &AssumeYes)
            .unwrap_err();
        assert!(matches!(err, FlashError::BootloaderSwitchFailed));
        assert!(session.probe().is_some(), "busy flag must clear on failure");
    }

    #[test]
    fn probe_skipped_while_busy() {
        let busy = AtomicBool::new(false);
        let guard = BusyGuard::acquire(&busy).unwrap();
        assert!(busy.load(Ordering::SeqCst));
        assert!(BusyGuard::acquire(&busy).is_err());
        drop(guard);
        assert!(!busy.load(Ordering::SeqCst));
    }

    #[test]
    fn two_sessions_are_independent() {
        let first = session(MockBackend::new());
        let second = session(MockBackend::new());
        assert_eq!(first.probe(), Some(DeviceStatus::Absent));
        assert_eq!(second.probe(), Some(DeviceStatus::Absent));
    }
}
