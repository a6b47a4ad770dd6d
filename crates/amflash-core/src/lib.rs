//! amflash-core: AudioMoth firmware flashing engine.
//!
//! Reprograms an attached AudioMoth over either of its two flashing paths:
//! the serial bootloader's XMODEM-CRC protocol, or the USB-HID channel that
//! stages the image in on-device SRAM before a single commit-to-flash step.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **CRC**: the block checksum and the bit-serial image checksum
//! - **Protocol**: constants, XMODEM framing, HID packet formats
//! - **Transport**: serial line (serialport) and HID channel (nusb), plus
//!   mocks for testing
//! - **Device**: probe for the attached device's current personality
//! - **Flasher**: the two transfer state machines
//! - **Events**: observer pattern for UI decoupling
//! - **Session**: high-level dispatcher exposing `flash`
//!
//! # Example
//!
//! ```no_run
//! use amflash_core::{
//!     AssumeYes, FirmwareImage, FlashConfig, FlashOptions, FlashSession, SystemBackend,
//! };
//!
//! let session = FlashSession::new(SystemBackend, FlashConfig::default());
//! let image = FirmwareImage::from_file("firmware.bin".as_ref()).expect("read image");
//! let outcome = session
//!     .flash(&image, &FlashOptions::default(), &AssumeYes)
//!     .expect("flash failed");
//! println!("device CRC {:04X}", outcome.reported_crc);
//! ```

pub mod config;
pub mod crc;
pub mod device;
pub mod error;
pub mod events;
pub mod flasher;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::FlashConfig;
pub use crc::{block_crc, format_crc, image_crc};
pub use device::{probe, DeviceStatus};
pub use error::{FlashError, Result};
pub use events::{FlashEvent, FlashObserver, LogLevel, NullObserver, TracingObserver};
pub use flasher::Timing;
pub use image::{is_release_image_name, FirmwareImage};
pub use session::{
    AssumeYes, ConfirmPrompt, FlashOptions, FlashOutcome, FlashPath, FlashSession,
};
pub use transport::hid::{HidChannel, NusbHid};
pub use transport::mock::{MockBackend, MockHid, MockSerial};
pub use transport::serial::SerialPortLine;
pub use transport::{Backend, HidIo, SerialLink, SystemBackend};
