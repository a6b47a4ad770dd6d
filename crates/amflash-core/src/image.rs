//! Firmware image container and pre-flight validation.

use std::path::Path;

use crate::error::{FlashError, Result};
use crate::protocol::constants::{
    MAX_DESTRUCTIVE, MAX_NON_DESTRUCTIVE, MAX_USBHID, SRAM_END, SRAM_START,
};
use crate::protocol::xmodem::block_count;

/// An in-memory firmware image, alive for the duration of one job.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    file_name: Option<String>,
}

impl FirmwareImage {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            file_name: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(Self { data, file_name })
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn block_count(&self) -> usize {
        block_count(self.data.len())
    }

    /// Size gate and reset-stack-pointer heuristic; runs before any device
    /// interaction.
    pub fn validate(&self, destructive: bool) -> Result<()> {
        if self.data.is_empty() {
            return Err(FlashError::InvalidImage("file is empty".into()));
        }
        let limit = if destructive {
            MAX_DESTRUCTIVE
        } else {
            MAX_NON_DESTRUCTIVE
        };
        if self.data.len() > limit {
            return Err(FlashError::InvalidImage(format!(
                "{} bytes exceeds the {} byte limit",
                self.data.len(),
                limit
            )));
        }
        if !self.stack_pointer_ok() {
            return Err(FlashError::InvalidImage(
                "reset stack pointer does not point into SRAM".into(),
            ));
        }
        Ok(())
    }

    /// Additional gates for the USB-HID path: its own size limit and the
    /// accepted file extension when a filename is known.
    pub fn validate_for_usbhid(&self) -> Result<()> {
        if self.data.len() > MAX_USBHID {
            return Err(FlashError::InvalidImage(format!(
                "{} bytes exceeds the {} byte USB-HID limit",
                self.data.len(),
                MAX_USBHID
            )));
        }
        if let Some(name) = self.file_name() {
            if !name.ends_with(".bin") {
                return Err(FlashError::InvalidImage(format!(
                    "{name} is not a .bin file"
                )));
            }
        }
        Ok(())
    }

    /// First 32-bit little-endian word must land in the SRAM window.
    fn stack_pointer_ok(&self) -> bool {
        if self.data.len() < 4 {
            return false;
        }
        let sp = u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        (SRAM_START..=SRAM_END).contains(&sp)
    }
}

/// Released firmware builds are named `<family>-N.N.N.bin`; those images
/// ship with a bootloader and must not be written destructively.
pub fn is_release_image_name(name: &str) -> bool {
    const FAMILIES: &[&str] = &[
        "audiomoth-firmware-basic",
        "audiomoth-usb-microphone",
        "audiomoth-gps-sync",
    ];

    let Some(stem) = name.strip_suffix(".bin") else {
        return false;
    };
    FAMILIES.iter().any(|family| {
        stem.strip_prefix(family)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(is_dotted_triple)
    })
}

fn is_dotted_triple(text: &str) -> bool {
    let mut parts = text.split('.');
    let fields = (parts.next(), parts.next(), parts.next(), parts.next());
    match fields {
        (Some(a), Some(b), Some(c), None) => [a, b, c]
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|ch| ch.is_ascii_digit())),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_sp(sp: u32, len: usize) -> FirmwareImage {
        let mut data = vec![0u8; len.max(4)];
        data[..4].copy_from_slice(&sp.to_le_bytes());
        FirmwareImage::from_bytes(data)
    }

    #[test]
    fn valid_image_passes() {
        let image = image_with_sp(0x2000_4000, 81_920);
        assert!(image.validate(false).is_ok());
        assert!(image.validate(true).is_ok());
    }

    #[test]
    fn zero_stack_pointer_is_rejected() {
        let image = image_with_sp(0x0000_0000, 1024);
        assert!(matches!(
            image.validate(false),
            Err(FlashError::InvalidImage(_))
        ));
    }

    #[test]
    fn non_destructive_boundary() {
        let image = image_with_sp(0x2000_0000, MAX_NON_DESTRUCTIVE);
        assert!(image.validate(false).is_ok());

        let too_big = image_with_sp(0x2000_0000, MAX_NON_DESTRUCTIVE + 1);
        assert!(too_big.validate(false).is_err());
        // Still inside the destructive limit.
        assert!(too_big.validate(true).is_ok());
    }

    #[test]
    fn destructive_boundary() {
        let image = image_with_sp(0x2000_0000, MAX_DESTRUCTIVE + 1);
        assert!(image.validate(true).is_err());
    }

    #[test]
    fn usbhid_size_gate() {
        let image = image_with_sp(0x2000_0000, MAX_USBHID);
        assert!(image.validate_for_usbhid().is_ok());
        let too_big = image_with_sp(0x2000_0000, MAX_USBHID + 1);
        assert!(too_big.validate_for_usbhid().is_err());
    }

    #[test]
    fn usbhid_extension_gate() {
        let image = image_with_sp(0x2000_0000, 64).with_file_name("custom.hex");
        assert!(image.validate_for_usbhid().is_err());
        let ok = image_with_sp(0x2000_0000, 64).with_file_name("custom.bin");
        assert!(ok.validate_for_usbhid().is_ok());
    }

    #[test]
    fn empty_image_is_rejected() {
        let image = FirmwareImage::from_bytes(Vec::new());
        assert!(image.validate(false).is_err());
    }

    #[test]
    fn release_names_match() {
        assert!(is_release_image_name("audiomoth-firmware-basic-1.8.1.bin"));
        assert!(is_release_image_name("audiomoth-usb-microphone-1.3.0.bin"));
        assert!(is_release_image_name("audiomoth-gps-sync-1.0.10.bin"));
    }

    #[test]
    fn other_names_do_not_match() {
        assert!(!is_release_image_name("custom-firmware-1.0.0.bin"));
        assert!(!is_release_image_name("audiomoth-firmware-basic.bin"));
        assert!(!is_release_image_name("audiomoth-firmware-basic-1.8.bin"));
        assert!(!is_release_image_name("audiomoth-firmware-basic-1.8.x.bin"));
        assert!(!is_release_image_name("audiomoth-firmware-basic-1.8.1.hex"));
    }
}
