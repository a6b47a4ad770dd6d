//! The two flashing state machines.

pub mod usbhid;
pub mod xmodem;

use std::time::Duration;

use crate::protocol::constants::{
    BLOCK_ACK_TIMEOUT, CRC_POLL_INTERVAL, HID_BATCH_PAUSE, PORT_OPEN_BACKOFF, PORT_POLL_STEP,
    READY_BACKOFF, REBOOT_WAIT, RESET_WATCH, SWITCH_WATCH,
};

/// Timeouts and pauses used by the state machines. Defaults are the protocol
/// values; tests shrink them to zero so retry paths run instantly.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Base for the port-open backoff (doubles per attempt).
    pub port_open_backoff: Duration,
    /// Base for the ready-handshake and user-data CRC backoffs.
    pub retry_backoff: Duration,
    /// Per-block (and EOF) acknowledgement deadline.
    pub ack_timeout: Duration,
    /// Deadline for single-command responses (identity, CRC report, reset).
    pub command_timeout: Duration,
    /// How long to watch for the bootloader port to vanish after reset.
    pub reset_watch: Duration,
    /// Step between port presence polls.
    pub poll_step: Duration,
    /// Pause between GET_FW_CRC polls.
    pub crc_poll_interval: Duration,
    /// Pause between HID packet batches.
    pub batch_pause: Duration,
    /// Grace period for the device to commit flash and reboot.
    pub reboot_wait: Duration,
    /// How long to wait for the bootloader port after a mode switch.
    pub switch_watch: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            port_open_backoff: PORT_OPEN_BACKOFF,
            retry_backoff: READY_BACKOFF,
            ack_timeout: BLOCK_ACK_TIMEOUT,
            command_timeout: BLOCK_ACK_TIMEOUT,
            reset_watch: RESET_WATCH,
            poll_step: PORT_POLL_STEP,
            crc_poll_interval: CRC_POLL_INTERVAL,
            batch_pause: HID_BATCH_PAUSE,
            reboot_wait: REBOOT_WAIT,
            switch_watch: SWITCH_WATCH,
        }
    }
}

impl Timing {
    /// All-zero timing for tests.
    pub fn instant() -> Self {
        Self {
            port_open_backoff: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            ack_timeout: Duration::ZERO,
            command_timeout: Duration::ZERO,
            reset_watch: Duration::ZERO,
            poll_step: Duration::ZERO,
            crc_poll_interval: Duration::ZERO,
            batch_pause: Duration::ZERO,
            reboot_wait: Duration::ZERO,
            switch_watch: Duration::ZERO,
        }
    }
}
