//! Protocol constants for the AudioMoth bootloaders.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Vendor IDs the device enumerates under (Silicon Labs, and the relabelled
/// production ID).
pub const VENDOR_IDS: &[u16] = &[0x10C4, 0x2544];

/// Product ID while the application firmware is running (HID interface).
pub const RUNNING_PRODUCT_ID: u16 = 0x0002;

/// Product ID while the serial bootloader is active (CDC interface).
pub const BOOTLOADER_PRODUCT_ID: u16 = 0x0003;

// ============================================================================
// Size Constants
// ============================================================================

/// Total flash available to firmware plus bootloader.
pub const MAX_DESTRUCTIVE: usize = 256 * 1024;

/// Largest firmware-only image: total flash minus the 16 KiB bootloader.
pub const MAX_NON_DESTRUCTIVE: usize = 256 * 1024 - 16 * 1024;

/// Largest image accepted by the USB-HID path.
pub const MAX_USBHID: usize = 0x34000;

/// Firmware region covered by the device-side image CRC. Applies only to the
/// HID-path CRC prediction; the serial size gates are independent of it.
pub const FIRMWARE_TOTAL_SIZE: usize = 240 * 1024;

/// Reset-stack-pointer window: the first word of a valid image points into
/// on-chip SRAM.
pub const SRAM_START: u32 = 0x2000_0000;
pub const SRAM_END: u32 = 0x2000_8000;

// ============================================================================
// Serial bootloader (XMODEM-CRC path)
// ============================================================================

pub const SERIAL_BAUD: u32 = 9600;

/// XMODEM control bytes.
pub const SOH: u8 = 0x01;
pub const EOF: u8 = 0x04;
pub const ACK: u8 = 0x06;

/// Payload bytes per XMODEM block.
pub const BLOCK_SIZE: usize = 128;

/// Full frame: SOH, block number, its complement, payload, CRC-16.
pub const FRAME_SIZE: usize = 3 + BLOCK_SIZE + 2;

/// Pad value for a partial final block. The user-data clear sub-protocol
/// deliberately uses 0x00 blocks instead; the asymmetry matches the device's
/// erase semantics.
pub const BLOCK_FILLER: u8 = 0xFF;

/// Command bytes understood by the serial bootloader.
pub const CMD_READY_DESTRUCTIVE: u8 = b'd';
pub const CMD_READY_NON_DESTRUCTIVE: u8 = b'u';
pub const CMD_READY_CLEAR_USER_DATA: u8 = b't';
pub const CMD_IDENTITY: u8 = b'i';
pub const CMD_CRC_FULL: u8 = b'v';
pub const CMD_CRC_FIRMWARE: u8 = b'c';
pub const CMD_CRC_USER_DATA: u8 = b'n';
pub const CMD_RESET: u8 = b'r';

/// Expected response lengths for the ASCII commands above.
pub const READY_RESPONSE_LEN: usize = 11;
pub const IDENTITY_RESPONSE_LEN: usize = 54;
pub const CRC_RESPONSE_LEN: usize = 18;

/// Blocks transmitted by the user-data clear sub-protocol.
pub const USER_DATA_BLOCKS: usize = 16;

/// Retry budgets and backoffs for the serial state machine.
pub const MAX_PORT_OPEN_ATTEMPTS: u32 = 5;
pub const PORT_OPEN_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_READY_ATTEMPTS: u32 = 7;
pub const READY_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_BLOCK_REPEATS: u32 = 10;
pub const BLOCK_ACK_TIMEOUT: Duration = Duration::from_millis(1500);
pub const MAX_USER_DATA_CRC_ATTEMPTS: u32 = 5;

/// How long to watch for the bootloader port to disappear after reset.
pub const RESET_WATCH: Duration = Duration::from_millis(7500);
pub const PORT_POLL_STEP: Duration = Duration::from_millis(100);

/// How long to wait for the bootloader port to appear after a mode switch.
pub const SWITCH_WATCH: Duration = Duration::from_secs(10);

/// Bootloader versions that must be replaced before flashing proceeds.
pub const OBSOLETE_BOOTLOADER_VERSIONS: &[&str] = &["1.00", "1.01"];

/// Image CRC of the bootloader-updater payload, as the device reports it.
pub const BOOTLOADER_UPDATE_CRC: u16 = 0xA435;

// ============================================================================
// HID packet channel
// ============================================================================

/// HID report payload size.
pub const HID_PACKET_SIZE: usize = 64;

/// Application-mode message types. The response echoes the type at byte [1];
/// byte [0] is the transport-level tag.
pub const MSG_GET_FIRMWARE_VERSION: u8 = 0x05;
pub const MSG_GET_FIRMWARE_DESCRIPTION: u8 = 0x06;
pub const MSG_QUERY_BOOTLOADER: u8 = 0x07;
pub const MSG_SWITCH_TO_BOOTLOADER: u8 = 0x08;
pub const MSG_QUERY_USBHID_BOOTLOADER: u8 = 0x09;

/// USB-HID bootloader commands (SRAM-staged flashing).
pub const CMD_INIT_SRAM: u8 = 0x02;
pub const CMD_CLEAR_USER_DATA: u8 = 0x03;
pub const CMD_SET_SRAM_FW_PACKET: u8 = 0x04;
pub const CMD_CALC_SRAM_CRC: u8 = 0x05;
pub const CMD_CALC_FLASH_CRC: u8 = 0x06;
pub const CMD_GET_FW_CRC: u8 = 0x07;
pub const CMD_FLASH_FW: u8 = 0x08;

/// Firmware bytes carried per SET_SRAM_FW_PACKET.
pub const FW_PACKET_PAYLOAD: usize = 56;

/// Packets per host-side transaction. Windows HID buffering tolerates fewer
/// in-flight reports than the other platforms.
#[cfg(windows)]
pub const HID_BATCH_SIZE: usize = 30;
#[cfg(not(windows))]
pub const HID_BATCH_SIZE: usize = 60;

/// Pause between packet batches.
pub const HID_BATCH_PAUSE: Duration = Duration::from_millis(10);

/// Attempt loop for every HID operation.
pub const MAX_HID_ATTEMPTS: u32 = 10;
pub const HID_RETRY_BASE: Duration = Duration::from_millis(100);

/// CRC computation polling after CALC_SRAM_CRC.
pub const MAX_CRC_POLLS: u32 = 10;
pub const CRC_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period for the device to commit flash and reboot.
pub const REBOOT_WAIT: Duration = Duration::from_millis(7500);
