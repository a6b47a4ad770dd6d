//! Serial XMODEM-CRC flashing state machine.
//!
//! One state enum, one drive loop. Each state performs its entry action
//! (send a command, transfer a payload) and the transition is decided by the
//! transport's answer; `Failed` is simply the `Err` channel of the drive
//! loop, reachable from every state.

use std::thread;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use super::Timing;
use crate::crc::format_crc;
use crate::error::{FlashError, Result};
use crate::events::{FlashEvent, FlashObserver};
use crate::protocol::constants::{
    ACK, BLOCK_SIZE, BOOTLOADER_UPDATE_CRC, CMD_CRC_FIRMWARE, CMD_CRC_FULL, CMD_CRC_USER_DATA,
    CMD_IDENTITY, CMD_READY_CLEAR_USER_DATA, CMD_READY_DESTRUCTIVE, CMD_READY_NON_DESTRUCTIVE,
    CMD_RESET, CRC_RESPONSE_LEN, EOF, IDENTITY_RESPONSE_LEN, MAX_BLOCK_REPEATS,
    MAX_PORT_OPEN_ATTEMPTS, MAX_READY_ATTEMPTS, MAX_USER_DATA_CRC_ATTEMPTS,
    OBSOLETE_BOOTLOADER_VERSIONS, READY_RESPONSE_LEN, USER_DATA_BLOCKS,
};
use crate::protocol::xmodem::{
    block_count, block_payload, frame_block, is_ready, parse_crc_report, parse_identity,
    BootloaderIdent, TransferWindow,
};
use crate::transport::{Backend, SerialLink};

/// Job parameters for one serial flash.
pub struct XmodemOptions<'a> {
    /// Overwrite the bootloader region as well (`d` handshake).
    pub destructive: bool,
    /// Run the user-data clear sub-protocol before sending the image.
    pub clear_user_data: bool,
    /// Compare the device-reported CRC against this when present.
    pub expected_crc: Option<u16>,
    /// Updater image for the obsolete-bootloader gate.
    pub updater_image: Option<&'a [u8]>,
    /// Fixed port name instead of USB-identifier discovery.
    pub port_override: Option<&'a str>,
}

/// Dispatcher decision hook for the obsolete-bootloader gate. Returning an
/// error (typically `UserAborted`) stops the job before the update.
pub type BootloaderGate<'a> = dyn FnMut(&BootloaderIdent) -> Result<()> + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpeningPort,
    ReadyCheck,
    CheckingBootloaderVersion,
    UpdatingBootloader,
    ClearUserData,
    Sending,
    ConfirmingEof,
    CrcCheck,
    Resetting,
    Done,
}

pub struct XmodemFlasher<'a, B: Backend, O: FlashObserver> {
    backend: &'a B,
    observer: &'a O,
    timing: Timing,
}

impl<'a, B: Backend, O: FlashObserver> XmodemFlasher<'a, B, O> {
    pub fn new(backend: &'a B, observer: &'a O) -> Self {
        Self {
            backend,
            observer,
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Run the full state machine. Returns the device-reported image CRC.
    /// The port is released on every exit path.
    #[instrument(skip_all, fields(len = image.len(), destructive = opts.destructive))]
    pub fn run(
        &self,
        image: &[u8],
        opts: &XmodemOptions<'_>,
        gate: &mut BootloaderGate<'_>,
    ) -> Result<u16> {
        let mut slot: Option<B::Serial> = None;
        let result = self.drive(&mut slot, image, opts, gate);
        if let Some(mut port) = slot.take() {
            port.close();
        }
        result
    }

    fn drive(
        &self,
        slot: &mut Option<B::Serial>,
        image: &[u8],
        opts: &XmodemOptions<'_>,
        gate: &mut BootloaderGate<'_>,
    ) -> Result<u16> {
        let ready_cmd = if opts.destructive {
            CMD_READY_DESTRUCTIVE
        } else {
            CMD_READY_NON_DESTRUCTIVE
        };
        let mut state = State::OpeningPort;
        let mut version_checked = false;
        let mut user_data_cleared = false;
        let mut reported: u16 = 0;

        loop {
            state = match state {
                State::OpeningPort => {
                    *slot = Some(self.open_port(opts.port_override)?);
                    State::ReadyCheck
                }

                State::ReadyCheck => {
                    self.ready_handshake(port(slot)?, ready_cmd)?;
                    if !version_checked {
                        State::CheckingBootloaderVersion
                    } else if opts.clear_user_data && !user_data_cleared {
                        State::ClearUserData
                    } else {
                        State::Sending
                    }
                }

                State::CheckingBootloaderVersion => {
                    self.observer.on_event(&FlashEvent::CheckingBootloader);
                    let ident = self.read_identity(port(slot)?)?;
                    info!(version = %ident.version, chip_id = %ident.chip_id, "Bootloader identity");
                    if OBSOLETE_BOOTLOADER_VERSIONS.contains(&ident.version.as_str()) {
                        gate(&ident)?;
                        self.observer.on_event(&FlashEvent::UpdatingBootloader {
                            version: ident.version.clone(),
                        });
                        State::UpdatingBootloader
                    } else {
                        version_checked = true;
                        if opts.clear_user_data && !user_data_cleared {
                            State::ClearUserData
                        } else {
                            State::Sending
                        }
                    }
                }

                State::UpdatingBootloader => {
                    let updater = opts.updater_image.ok_or_else(|| {
                        FlashError::InvalidImage(
                            "device bootloader is obsolete and no updater image is configured"
                                .into(),
                        )
                    })?;
                    self.flash_updater(port(slot)?, updater)?;
                    if let Some(mut old) = slot.take() {
                        old.close();
                    }
                    self.watch_restart()?;
                    State::OpeningPort
                }

                State::ClearUserData => {
                    self.clear_user_data(port(slot)?)?;
                    user_data_cleared = true;
                    State::ReadyCheck
                }

                State::Sending => {
                    self.send_blocks(port(slot)?, image)?;
                    State::ConfirmingEof
                }

                State::ConfirmingEof => {
                    self.confirm_eof(port(slot)?)?;
                    State::CrcCheck
                }

                State::CrcCheck => {
                    let cmd = if opts.destructive {
                        CMD_CRC_FULL
                    } else {
                        CMD_CRC_FIRMWARE
                    };
                    reported = self.read_image_crc(port(slot)?, cmd)?;
                    if let Some(expected) = opts.expected_crc {
                        if reported != expected {
                            return Err(FlashError::CrcMismatch {
                                expected: format_crc(expected),
                                actual: format_crc(reported),
                            });
                        }
                    }
                    State::Resetting
                }

                State::Resetting => {
                    self.reset_device(port(slot)?)?;
                    if let Some(mut old) = slot.take() {
                        old.close();
                    }
                    self.watch_restart()?;
                    State::Done
                }

                State::Done => {
                    info!(crc = %format_crc(reported), "Serial flash complete");
                    return Ok(reported);
                }
            };
        }
    }

    fn open_port(&self, port_override: Option<&str>) -> Result<B::Serial> {
        for attempt in 0..MAX_PORT_OPEN_ATTEMPTS {
            self.observer.on_event(&FlashEvent::Opening {
                attempt: attempt + 1,
            });
            let name = port_override
                .map(str::to_owned)
                .or_else(|| self.backend.find_bootloader_port());
            match name {
                Some(name) => match self.backend.open_serial(&name) {
                    Ok(line) => return Ok(line),
                    Err(e) => warn!(port = %name, error = %e, "Port open failed"),
                },
                None => debug!("Bootloader port not enumerated yet"),
            }
            if attempt + 1 < MAX_PORT_OPEN_ATTEMPTS {
                thread::sleep(self.timing.port_open_backoff * 2u32.pow(attempt));
            }
        }
        Err(FlashError::PortUnavailable {
            attempts: MAX_PORT_OPEN_ATTEMPTS,
        })
    }

    fn ready_handshake(&self, port: &mut B::Serial, command: u8) -> Result<()> {
        for attempt in 0..MAX_READY_ATTEMPTS {
            self.observer.on_event(&FlashEvent::ReadyCheck {
                attempt: attempt + 1,
            });
            port.write(&[command])?;
            let wait = self.timing.retry_backoff * 2u32.pow(attempt);
            match port.await_response(READY_RESPONSE_LEN, wait, "write-ready handshake", &is_ready)
            {
                Ok(_) => return Ok(()),
                Err(FlashError::Timeout(_)) => {}
                Err(FlashError::UnexpectedResponse(raw)) => {
                    debug!(raw = ?raw, "Handshake noise, flushing");
                    port.flush()?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(FlashError::ReadyTimeout)
    }

    fn read_identity(&self, port: &mut B::Serial) -> Result<BootloaderIdent> {
        port.write(&[CMD_IDENTITY])?;
        let response = port.await_response(
            IDENTITY_RESPONSE_LEN,
            self.timing.command_timeout,
            "bootloader identity",
            &|buf| parse_identity(buf).is_ok(),
        )?;
        parse_identity(&response)
    }

    /// Transfer `image` block by block under the sliding window discipline.
    fn send_blocks(&self, port: &mut B::Serial, image: &[u8]) -> Result<()> {
        let total = block_count(image.len());
        let mut window = TransferWindow::new();
        let mut next = window.cursor();
        let mut write_failures: u32 = 0;

        while !window.is_done(total) {
            let payload = block_payload(image, next);
            let frame = frame_block(next, &payload);

            if let Err(e) = port.write(&frame) {
                if matches!(e, FlashError::PortClosed) {
                    return Err(e);
                }
                write_failures += 1;
                if write_failures >= MAX_BLOCK_REPEATS {
                    return Err(e);
                }
                warn!(block = next + 1, error = %e, "Block write failed, flushing");
                port.flush()?;
                continue;
            }
            write_failures = 0;

            match port.await_response(
                1,
                self.timing.ack_timeout,
                "block acknowledgement",
                &|buf| buf.contains(&ACK),
            ) {
                Ok(_) => {
                    window.acked(next);
                    self.observer.on_event(&FlashEvent::Flashing {
                        current: window.lower(),
                        total,
                    });
                    next = window.cursor();
                }
                Err(FlashError::Timeout(_)) => {
                    debug!(block = next + 1, "Acknowledgement timeout");
                    window.widen(next, total);
                    next = window.cursor();
                    if window.bump_timeouts() {
                        return Err(FlashError::FlashStalled {
                            block: window.lower() + 1,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn confirm_eof(&self, port: &mut B::Serial) -> Result<()> {
        port.write(&[EOF])?;
        port.await_response(
            1,
            self.timing.ack_timeout,
            "end-of-file acknowledgement",
            &|buf| buf.contains(&ACK),
        )?;
        Ok(())
    }

    fn read_image_crc(&self, port: &mut B::Serial, command: u8) -> Result<u16> {
        port.write(&[command])?;
        let response = port.await_response(
            CRC_RESPONSE_LEN,
            self.timing.command_timeout,
            "image CRC report",
            &|buf| parse_crc_report(buf).is_ok(),
        )?;
        parse_crc_report(&response)
    }

    /// Replace the bootloader with the updater image, verify its fixed CRC
    /// and reset. The caller reopens the port afterwards.
    fn flash_updater(&self, port: &mut B::Serial, updater: &[u8]) -> Result<()> {
        self.ready_handshake(port, CMD_READY_NON_DESTRUCTIVE)?;
        self.send_blocks(port, updater)?;
        self.confirm_eof(port)?;
        let crc = self.read_image_crc(port, CMD_CRC_FIRMWARE)?;
        if crc != BOOTLOADER_UPDATE_CRC {
            return Err(FlashError::CrcMismatch {
                expected: format_crc(BOOTLOADER_UPDATE_CRC),
                actual: format_crc(crc),
            });
        }
        self.reset_device(port)
    }

    /// Ready-handshake with `t`, sixteen blank blocks, EOF, then poll the
    /// user-data CRC until the device reports all zeroes.
    fn clear_user_data(&self, port: &mut B::Serial) -> Result<()> {
        self.observer.on_event(&FlashEvent::ClearingUserData);
        self.ready_handshake(port, CMD_READY_CLEAR_USER_DATA)?;

        let blank = [0u8; BLOCK_SIZE];
        for index in 0..USER_DATA_BLOCKS {
            let frame = frame_block(index, &blank);
            port.write(&frame)?;
            port.await_response(
                1,
                self.timing.ack_timeout,
                "user-data block acknowledgement",
                &|buf| buf.contains(&ACK),
            )
            .map_err(|_| FlashError::UserDataClearFailed)?;
        }

        port.write(&[EOF])?;
        port.await_response(
            1,
            self.timing.ack_timeout,
            "user-data end-of-file acknowledgement",
            &|buf| buf.contains(&ACK),
        )
        .map_err(|_| FlashError::UserDataClearFailed)?;

        for attempt in 0..MAX_USER_DATA_CRC_ATTEMPTS {
            port.write(&[CMD_CRC_USER_DATA])?;
            let wait = self.timing.retry_backoff * 2u32.pow(attempt);
            match port.await_response(CRC_RESPONSE_LEN, wait, "user-data CRC report", &|buf| {
                matches!(parse_crc_report(buf), Ok(0))
            }) {
                Ok(_) => return Ok(()),
                Err(FlashError::Timeout(_)) | Err(FlashError::UnexpectedResponse(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Err(FlashError::UserDataClearFailed)
    }

    fn reset_device(&self, port: &mut B::Serial) -> Result<()> {
        port.write(&[CMD_RESET])?;
        port.await_response(
            1,
            self.timing.command_timeout,
            "reset acknowledgement",
            &|buf| buf.contains(&CMD_RESET),
        )?;
        Ok(())
    }

    /// Watch for the bootloader port to drop off the bus. The device may
    /// re-enumerate faster than the poll step, so an expired watch still
    /// counts as success.
    fn watch_restart(&self) -> Result<()> {
        self.observer.on_event(&FlashEvent::Restarting {
            timeout_ms: self.timing.reset_watch.as_millis() as u64,
        });
        let start = Instant::now();
        while start.elapsed() < self.timing.reset_watch {
            if self.backend.find_bootloader_port().is_none() {
                break;
            }
            let percent = (start.elapsed().as_millis() * 100
                / self.timing.reset_watch.as_millis().max(1)) as u8;
            self.observer.on_event(&FlashEvent::Restart { percent });
            thread::sleep(self.timing.poll_step);
        }
        self.observer.on_event(&FlashEvent::Restart { percent: 100 });
        Ok(())
    }
}

fn port<S>(slot: &mut Option<S>) -> Result<&mut S> {
    slot.as_mut().ok_or(FlashError::PortClosed)
}
