//! Device status detection.

use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::transport::hid::HidChannel;
use crate::transport::Backend;

/// Which of the device's personalities is currently attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Nothing answering on serial or HID.
    Absent,
    /// Serial bootloader port is enumerated.
    InSerialBootloader,
    /// Application firmware running; it can switch itself into the
    /// bootloader, and `usbhid` reports whether the SRAM-staged HID path is
    /// available.
    RunningAutoSwitch {
        usbhid: bool,
        fw_version: String,
        fw_description: String,
    },
    /// Application firmware running; the user must switch modes manually.
    RunningManual {
        fw_version: String,
        fw_description: String,
    },
}

impl DeviceStatus {
    pub fn is_running_firmware(&self) -> bool {
        matches!(
            self,
            DeviceStatus::RunningAutoSwitch { .. } | DeviceStatus::RunningManual { .. }
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Absent => write!(f, "No device found"),
            DeviceStatus::InSerialBootloader => write!(f, "Device in serial bootloader"),
            DeviceStatus::RunningAutoSwitch {
                fw_version,
                fw_description,
                ..
            } => write!(f, "{fw_description} ({fw_version})"),
            DeviceStatus::RunningManual {
                fw_version,
                fw_description,
            } => write!(
                f,
                "{fw_description} ({fw_version}), switch to flash mode manually"
            ),
        }
    }
}

/// Classify the attached device. Any failure on the HID queries collapses to
/// `Absent`; the caller retries on its own cadence.
pub fn probe<B: Backend>(backend: &B) -> DeviceStatus {
    if backend.find_bootloader_port().is_some() {
        return DeviceStatus::InSerialBootloader;
    }
    match probe_running(backend) {
        Ok(status) => status,
        Err(e) => {
            debug!(error = %e, "Probe found no usable device");
            DeviceStatus::Absent
        }
    }
}

fn probe_running<B: Backend>(backend: &B) -> Result<DeviceStatus> {
    let mut channel = HidChannel::new(backend.open_hid()?);
    let usbhid = channel.query_usbhid_bootloader()?;
    let bootloader = channel.query_bootloader()?;
    let fw_version = channel.firmware_version()?;
    let fw_description = channel.firmware_description()?;

    Ok(if bootloader {
        DeviceStatus::RunningAutoSwitch {
            usbhid,
            fw_version,
            fw_description,
        }
    } else {
        DeviceStatus::RunningManual {
            fw_version,
            fw_description,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{
        MSG_GET_FIRMWARE_DESCRIPTION, MSG_GET_FIRMWARE_VERSION, MSG_QUERY_BOOTLOADER,
        MSG_QUERY_USBHID_BOOTLOADER,
    };
    use crate::transport::mock::{MockBackend, MockHid};

    fn queue_running_responses(hid: &MockHid, usbhid: bool, bootloader: bool) {
        hid.push_response(&[0x00, MSG_QUERY_USBHID_BOOTLOADER, usbhid as u8]);
        hid.push_response(&[0x00, MSG_QUERY_BOOTLOADER, bootloader as u8]);
        hid.push_response(&[0x00, MSG_GET_FIRMWARE_VERSION, 1, 8, 1]);
        let mut description = vec![0x00, MSG_GET_FIRMWARE_DESCRIPTION];
        description.extend_from_slice(b"AudioMoth\0");
        hid.push_response(&description);
    }

    #[test]
    fn serial_port_wins_over_hid() {
        let backend = MockBackend::new();
        backend.set_port_present(true);
        assert_eq!(probe(&backend), DeviceStatus::InSerialBootloader);
    }

    #[test]
    fn running_with_auto_switch() {
        let backend = MockBackend::new();
        let hid = MockHid::new();
        queue_running_responses(&hid, true, true);
        backend.queue_hid(hid);

        match probe(&backend) {
            DeviceStatus::RunningAutoSwitch {
                usbhid,
                fw_version,
                fw_description,
            } => {
                assert!(usbhid);
                assert_eq!(fw_version, "1.8.1");
                assert_eq!(fw_description, "AudioMoth");
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn running_without_auto_switch_is_manual() {
        let backend = MockBackend::new();
        let hid = MockHid::new();
        queue_running_responses(&hid, false, false);
        backend.queue_hid(hid);

        assert!(matches!(
            probe(&backend),
            DeviceStatus::RunningManual { .. }
        ));
    }

    #[test]
    fn no_device_is_absent() {
        let backend = MockBackend::new();
        assert_eq!(probe(&backend), DeviceStatus::Absent);
    }
}
