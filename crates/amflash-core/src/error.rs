//! Unified error kinds for flashing operations.
//!
//! Every fallible operation in the crate returns `Result<T, FlashError>`.
//! Retries are internal to the component that owns them; an error escaping a
//! component terminates the job.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Device produced no usable response: {0}")]
    DeviceUnreachable(String),

    #[error("Serial port could not be opened after {attempts} attempts")]
    PortUnavailable { attempts: u32 },

    #[error("Serial port closed mid-transfer")]
    PortClosed,

    #[error("Unexpected response from device: {}", format_raw(.0))]
    UnexpectedResponse(Vec<u8>),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Device never reported Ready")]
    ReadyTimeout,

    #[error("Device did not re-enumerate after bootloader switch")]
    BootloaderSwitchFailed,

    #[error("Block {block} exceeded its retry budget")]
    FlashStalled { block: usize },

    #[error("CRC mismatch: expected {expected}, device reported {actual}")]
    CrcMismatch { expected: String, actual: String },

    #[error("Device did not finish computing the image CRC")]
    CrcTimeout,

    #[error("User data clear failed")]
    UserDataClearFailed,

    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    #[error("Another flash job is already in progress")]
    Busy,

    #[error("Cancelled by user")]
    UserAborted,

    #[error("USB error: {0}")]
    Usb(String),

    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlashError>;

/// Render raw device bytes for error messages: printable ASCII stays,
/// everything else becomes `\xNN`.
fn format_raw(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02X}"));
        }
    }
    out
}
