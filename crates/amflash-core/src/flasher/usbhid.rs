//! USB-HID SRAM-staged flasher.
//!
//! The image is streamed into on-device SRAM, the device computes the image
//! CRC over its full firmware region, and only after a successful compare is
//! the SRAM committed to flash in one device-side operation.

use std::thread;

use tracing::{debug, info, instrument};

use super::Timing;
use crate::crc::{format_crc, image_crc};
use crate::error::{FlashError, Result};
use crate::events::{FlashEvent, FlashObserver};
use crate::protocol::constants::{
    CMD_CALC_SRAM_CRC, CMD_CLEAR_USER_DATA, CMD_FLASH_FW, CMD_GET_FW_CRC, CMD_INIT_SRAM,
    CMD_SET_SRAM_FW_PACKET, FW_PACKET_PAYLOAD, HID_BATCH_SIZE, MAX_CRC_POLLS,
};
use crate::protocol::packets::{expect_success, parse_fw_crc, sram_fw_packet};
use crate::transport::hid::HidChannel;
use crate::transport::HidIo;

pub struct UsbHidFlasher<'a, H: HidIo, O: FlashObserver> {
    channel: HidChannel<H>,
    observer: &'a O,
    timing: Timing,
}

impl<'a, H: HidIo, O: FlashObserver> UsbHidFlasher<'a, H, O> {
    pub fn new(channel: HidChannel<H>, observer: &'a O) -> Self {
        Self {
            channel,
            observer,
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Run the SRAM-staged flash. Returns the device-computed image CRC.
    #[instrument(skip_all, fields(len = image.len()))]
    pub fn run(
        &mut self,
        image: &[u8],
        clear_user_data: bool,
        expected_crc: Option<u16>,
    ) -> Result<u16> {
        let response = self.channel.send_packet(&[CMD_INIT_SRAM])?;
        expect_success(CMD_INIT_SRAM, &response)?;
        debug!("SRAM initialised");

        self.stream_image(image)?;

        let expected = expected_crc.unwrap_or_else(|| image_crc(image));

        let response = self.channel.send_packet(&[CMD_CALC_SRAM_CRC])?;
        expect_success(CMD_CALC_SRAM_CRC, &response)?;

        let reported = self.poll_crc()?;
        if reported != expected {
            return Err(FlashError::CrcMismatch {
                expected: format_crc(expected),
                actual: format_crc(reported),
            });
        }
        info!(crc = %format_crc(reported), "SRAM image verified");

        if clear_user_data {
            self.observer.on_event(&FlashEvent::ClearingUserData);
            let response = self.channel.send_packet(&[CMD_CLEAR_USER_DATA])?;
            expect_success(CMD_CLEAR_USER_DATA, &response)?;
        }

        let response = self.channel.send_packet(&[CMD_FLASH_FW])?;
        expect_success(CMD_FLASH_FW, &response)?;

        // No completion signal exists for the commit; give the device its
        // reboot window and report success.
        self.observer.on_event(&FlashEvent::Restarting {
            timeout_ms: self.timing.reboot_wait.as_millis() as u64,
        });
        thread::sleep(self.timing.reboot_wait);
        self.observer.on_event(&FlashEvent::Restart { percent: 100 });

        Ok(reported)
    }

    /// Stream the image in batches of [`HID_BATCH_SIZE`] packets, each batch
    /// one host-side transaction followed by a short pause.
    fn stream_image(&mut self, image: &[u8]) -> Result<()> {
        let total = image.len();
        let mut offset = 0usize;

        while offset < total {
            let mut batch = Vec::with_capacity(HID_BATCH_SIZE);
            while batch.len() < HID_BATCH_SIZE && offset < total {
                let end = (offset + FW_PACKET_PAYLOAD).min(total);
                batch.push(sram_fw_packet(offset as u32, &image[offset..end]));
                offset = end;
            }

            let response = self.channel.send_multiple(&batch)?;
            expect_success(CMD_SET_SRAM_FW_PACKET, &response)?;

            self.observer.on_event(&FlashEvent::Flashing {
                current: offset,
                total,
            });
            thread::sleep(self.timing.batch_pause);
        }
        Ok(())
    }

    fn poll_crc(&mut self) -> Result<u16> {
        for poll in 0..MAX_CRC_POLLS {
            let response = self.channel.send_packet(&[CMD_GET_FW_CRC])?;
            if let Some(crc) = parse_fw_crc(&response)? {
                return Ok(crc);
            }
            debug!(poll = poll + 1, "Image CRC not ready yet");
            thread::sleep(self.timing.crc_poll_interval);
        }
        Err(FlashError::CrcTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::recording::RecordingObserver;
    use crate::transport::mock::MockHid;
    use std::time::Duration;

    fn channel(hid: &MockHid) -> HidChannel<MockHid> {
        HidChannel::new(hid.clone()).with_retry_base(Duration::ZERO)
    }

    fn ok(command: u8) -> [u8; 3] {
        [0x00, command, 0x01]
    }

    fn crc_ready(crc: u16) -> [u8; 5] {
        let [lo, hi] = crc.to_le_bytes();
        [0x00, CMD_GET_FW_CRC, 0x01, lo, hi]
    }

    fn script_happy(hid: &MockHid, image: &[u8], crc: u16) {
        hid.push_response(&ok(CMD_INIT_SRAM));
        let packet_count = image.len().div_ceil(FW_PACKET_PAYLOAD);
        for _ in 0..packet_count.div_ceil(HID_BATCH_SIZE) {
            hid.push_response(&ok(CMD_SET_SRAM_FW_PACKET));
        }
        hid.push_response(&ok(CMD_CALC_SRAM_CRC));
        hid.push_response(&crc_ready(crc));
        hid.push_response(&ok(CMD_FLASH_FW));
    }

    #[test]
    fn happy_path_usbhid() {
        let image = vec![0xA5u8; 5000];
        let crc = image_crc(&image);
        let hid = MockHid::new();
        script_happy(&hid, &image, crc);

        let observer = RecordingObserver::new();
        let mut flasher =
            UsbHidFlasher::new(channel(&hid), &observer).with_timing(Timing::instant());
        let reported = flasher.run(&image, false, None).unwrap();
        assert_eq!(reported, crc);

        let reports = hid.reports();
        // init + 90 firmware packets + calc + poll + flash.
        let packets = image.len().div_ceil(FW_PACKET_PAYLOAD);
        assert_eq!(reports.len(), 1 + packets + 3);
        assert_eq!(reports[0][0], CMD_INIT_SRAM);
        assert_eq!(reports[1][0], CMD_SET_SRAM_FW_PACKET);
        assert_eq!(&reports[1][1..5], &0u32.to_le_bytes());
        assert_eq!(reports[1][5] as usize, FW_PACKET_PAYLOAD);
        // Second packet continues at the next offset.
        assert_eq!(&reports[2][1..5], &(FW_PACKET_PAYLOAD as u32).to_le_bytes());
        assert_eq!(reports[reports.len() - 1][0], CMD_FLASH_FW);
    }

    #[test]
    fn supplied_expected_crc_overrides_local_computation() {
        let image = vec![0x01u8; 100];
        let hid = MockHid::new();
        hid.push_response(&ok(CMD_INIT_SRAM));
        hid.push_response(&ok(CMD_SET_SRAM_FW_PACKET));
        hid.push_response(&ok(CMD_CALC_SRAM_CRC));
        hid.push_response(&crc_ready(0x2F44));
        hid.push_response(&ok(CMD_FLASH_FW));

        let observer = RecordingObserver::new();
        let mut flasher =
            UsbHidFlasher::new(channel(&hid), &observer).with_timing(Timing::instant());
        assert_eq!(flasher.run(&image, false, Some(0x2F44)).unwrap(), 0x2F44);
    }

    #[test]
    fn crc_mismatch_skips_flash_commit() {
        let image = vec![0x02u8; 100];
        let hid = MockHid::new();
        hid.push_response(&ok(CMD_INIT_SRAM));
        hid.push_response(&ok(CMD_SET_SRAM_FW_PACKET));
        hid.push_response(&ok(CMD_CALC_SRAM_CRC));
        hid.push_response(&crc_ready(0x9999));

        let observer = RecordingObserver::new();
        let mut flasher =
            UsbHidFlasher::new(channel(&hid), &observer).with_timing(Timing::instant());
        let err = flasher.run(&image, false, Some(0xA435)).unwrap_err();
        assert!(matches!(err, FlashError::CrcMismatch { .. }));
        assert!(!hid.reports().iter().any(|r| r[0] == CMD_FLASH_FW));
    }

    #[test]
    fn crc_poll_exhaustion_times_out() {
        let image = vec![0x03u8; 56];
        let hid = MockHid::new();
        hid.push_response(&ok(CMD_INIT_SRAM));
        hid.push_response(&ok(CMD_SET_SRAM_FW_PACKET));
        hid.push_response(&ok(CMD_CALC_SRAM_CRC));
        for _ in 0..MAX_CRC_POLLS {
            hid.push_response(&[0x00, CMD_GET_FW_CRC, 0x00, 0x00, 0x00]);
        }

        let observer = RecordingObserver::new();
        let mut flasher =
            UsbHidFlasher::new(channel(&hid), &observer).with_timing(Timing::instant());
        let err = flasher.run(&image, false, None).unwrap_err();
        assert!(matches!(err, FlashError::CrcTimeout));
    }

    #[test]
    fn clear_user_data_runs_between_verify_and_commit() {
        let image = vec![0x04u8; 56];
        let crc = image_crc(&image);
        let hid = MockHid::new();
        hid.push_response(&ok(CMD_INIT_SRAM));
        hid.push_response(&ok(CMD_SET_SRAM_FW_PACKET));
        hid.push_response(&ok(CMD_CALC_SRAM_CRC));
        hid.push_response(&crc_ready(crc));
        hid.push_response(&ok(CMD_CLEAR_USER_DATA));
        hid.push_response(&ok(CMD_FLASH_FW));

        let observer = RecordingObserver::new();
        let mut flasher =
            UsbHidFlasher::new(channel(&hid), &observer).with_timing(Timing::instant());
        flasher.run(&image, true, None).unwrap();

        let commands: Vec<u8> = hid.reports().iter().map(|r| r[0]).collect();
        let clear_at = commands
            .iter()
            .position(|&c| c == CMD_CLEAR_USER_DATA)
            .unwrap();
        let flash_at = commands.iter().position(|&c| c == CMD_FLASH_FW).unwrap();
        assert!(clear_at < flash_at);
    }
}
