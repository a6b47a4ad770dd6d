//! XMODEM-CRC framing, the sliding transfer window, and the serial
//! bootloader's ASCII responses.

use crate::crc::block_crc;
use crate::error::{FlashError, Result};
use crate::protocol::constants::{
    BLOCK_FILLER, BLOCK_SIZE, FRAME_SIZE, MAX_BLOCK_REPEATS, SOH,
};

/// Number of 128-byte blocks needed for an image.
pub fn block_count(image_len: usize) -> usize {
    image_len.div_ceil(BLOCK_SIZE)
}

/// Payload for block `index` (0-based), right-padded with [`BLOCK_FILLER`]
/// when the image ends inside the block.
pub fn block_payload(image: &[u8], index: usize) -> [u8; BLOCK_SIZE] {
    let mut payload = [BLOCK_FILLER; BLOCK_SIZE];
    let start = index * BLOCK_SIZE;
    if start < image.len() {
        let end = (start + BLOCK_SIZE).min(image.len());
        payload[..end - start].copy_from_slice(&image[start..end]);
    }
    payload
}

/// Frame block `index` (0-based) for the wire. On-wire block numbers count
/// from 1 and wrap at 256.
pub fn frame_block(index: usize, payload: &[u8; BLOCK_SIZE]) -> [u8; FRAME_SIZE] {
    let number = (index as u8).wrapping_add(1);
    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = SOH;
    frame[1] = number;
    frame[2] = 0xFF - number;
    frame[3..3 + BLOCK_SIZE].copy_from_slice(payload);
    let crc = block_crc(payload);
    frame[3 + BLOCK_SIZE] = (crc >> 8) as u8;
    frame[4 + BLOCK_SIZE] = (crc & 0xFF) as u8;
    frame
}

/// Sliding acknowledgement window over 0-based block indices.
///
/// `lower` is the oldest unacknowledged block; `upper` the furthest block
/// queued for (re)send. A delayed ACK can advance `lower` past a block that
/// was also re-sent without desynchronizing the numbering: sender and device
/// converge on the same next index.
///
/// Driver order on a timeout matters: `widen` first, read `cursor` for the
/// retry, then `bump_timeouts`. The retry cursor therefore cycles with the
/// count of timeouts *before* this send, so the first retry re-sends the
/// timed-out block itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferWindow {
    lower: usize,
    upper: usize,
    repeats: u32,
}

impl TransferWindow {
    pub fn new() -> Self {
        Self {
            lower: 0,
            upper: 0,
            repeats: 0,
        }
    }

    /// Index of the block to (re)send next.
    pub fn cursor(&self) -> usize {
        self.lower + self.repeats as usize % (self.upper - self.lower + 1)
    }

    /// All blocks below `total` acknowledged.
    pub fn is_done(&self, total: usize) -> bool {
        self.lower >= total
    }

    /// Record an acknowledgement of block `index`.
    pub fn acked(&mut self, index: usize) {
        self.lower = index + 1;
        self.upper = self.lower;
        self.repeats = 0;
    }

    /// Widen the window after an ACK timeout for block `index`.
    pub fn widen(&mut self, index: usize, total: usize) {
        self.upper = self.upper.max(index + 1).min(total.saturating_sub(1));
    }

    /// Count a timeout. Returns `true` when the retry budget is exhausted.
    pub fn bump_timeouts(&mut self) -> bool {
        self.repeats += 1;
        self.repeats >= MAX_BLOCK_REPEATS
    }

    pub fn lower(&self) -> usize {
        self.lower
    }

    pub fn upper(&self) -> usize {
        self.upper
    }
}

impl Default for TransferWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ASCII responses
// ============================================================================

/// The write-ready handshake answer contains the literal `Ready`.
pub fn is_ready(buf: &[u8]) -> bool {
    buf.windows(5).any(|w| w == b"Ready")
}

/// Parsed `i` command answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderIdent {
    /// `X.YY`, single-digit major.
    pub version: String,
    /// Sixteen uppercase hex characters.
    pub chip_id: String,
}

const IDENT_PREFIX: &[u8] = b"BOOTLOADER version ";
const IDENT_SEPARATOR: &[u8] = b", Chip ID ";

/// Parse the 54-byte bootloader identity line. The version field is a fixed
/// four-character slice; a two-digit major version does not fit the line
/// format and is rejected as an unexpected response.
pub fn parse_identity(buf: &[u8]) -> Result<BootloaderIdent> {
    let reject = || FlashError::UnexpectedResponse(buf.to_vec());

    let version_at = IDENT_PREFIX.len();
    let separator_at = version_at + 4;
    let chip_at = separator_at + IDENT_SEPARATOR.len();
    if buf.len() < chip_at + 16 || !buf.starts_with(IDENT_PREFIX) {
        return Err(reject());
    }

    let version = &buf[version_at..separator_at];
    let ok = version[0].is_ascii_digit()
        && version[1] == b'.'
        && version[2].is_ascii_digit()
        && version[3].is_ascii_digit();
    if !ok || &buf[separator_at..chip_at] != IDENT_SEPARATOR {
        return Err(reject());
    }

    let chip_id = &buf[chip_at..chip_at + 16];
    if !chip_id
        .iter()
        .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
    {
        return Err(reject());
    }

    Ok(BootloaderIdent {
        version: String::from_utf8_lossy(version).into_owned(),
        chip_id: String::from_utf8_lossy(chip_id).into_owned(),
    })
}

/// Parse a `CRC: 0000XXXX` report (`v`, `c` and `n` commands) into the
/// 16-bit value.
pub fn parse_crc_report(buf: &[u8]) -> Result<u16> {
    let reject = || FlashError::UnexpectedResponse(buf.to_vec());

    if buf.len() < 13 || !buf.starts_with(b"CRC: 0000") {
        return Err(reject());
    }
    let digits = &buf[9..13];
    if !digits
        .iter()
        .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b))
    {
        return Err(reject());
    }
    let text = std::str::from_utf8(digits).map_err(|_| reject())?;
    u16::from_str_radix(text, 16).map_err(|_| reject())
}
