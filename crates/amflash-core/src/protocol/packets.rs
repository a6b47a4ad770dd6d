//! HID packet construction and response parsing.
//!
//! Requests carry the command in byte `[0]`. Responses echo the command at
//! byte `[1]`; byte `[0]` is a transport-level tag the parsers skip. For the
//! bootloader command set, byte `[2]` is the status (`0x01` = success).

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{FlashError, Result};
use crate::protocol::constants::{CMD_GET_FW_CRC, CMD_SET_SRAM_FW_PACKET, FW_PACKET_PAYLOAD};

/// Response status byte offset (after tag and command echo).
const STATUS: usize = 2;

/// Build a `SET_SRAM_FW_PACKET` request: command, 32-bit little-endian
/// offset, payload length, then up to [`FW_PACKET_PAYLOAD`] image bytes.
pub fn sram_fw_packet(offset: u32, chunk: &[u8]) -> Vec<u8> {
    debug_assert!(chunk.len() <= FW_PACKET_PAYLOAD);
    let mut packet = Vec::with_capacity(6 + chunk.len());
    packet.push(CMD_SET_SRAM_FW_PACKET);
    packet.write_u32::<LittleEndian>(offset).unwrap();
    packet.push(chunk.len() as u8);
    packet.extend_from_slice(chunk);
    packet
}

/// Check that `response` echoes `command` and reports success.
pub fn expect_success(command: u8, response: &[u8]) -> Result<()> {
    if response.len() <= STATUS || response[1] != command {
        return Err(FlashError::UnexpectedResponse(response.to_vec()));
    }
    if response[STATUS] != 0x01 {
        return Err(FlashError::UnexpectedResponse(response.to_vec()));
    }
    Ok(())
}

/// Parse a `GET_FW_CRC` response. `Ok(None)` means the device has not
/// finished computing yet; `Ok(Some(crc))` carries the little-endian value
/// from bytes `[3]` and `[4]`.
pub fn parse_fw_crc(response: &[u8]) -> Result<Option<u16>> {
    if response.len() < 5 || response[1] != CMD_GET_FW_CRC {
        return Err(FlashError::UnexpectedResponse(response.to_vec()));
    }
    if response[STATUS] != 0x01 {
        return Ok(None);
    }
    Ok(Some(u16::from_le_bytes([response[3], response[4]])))
}

/// Parse a boolean query response (bootloader / USB-HID support probes).
pub fn parse_bool(command: u8, response: &[u8]) -> Result<bool> {
    if response.len() <= STATUS || response[1] != command {
        return Err(FlashError::UnexpectedResponse(response.to_vec()));
    }
    Ok(response[STATUS] == 0x01)
}

/// Parse a firmware version response: three bytes, `major.minor.patch`.
pub fn parse_version(command: u8, response: &[u8]) -> Result<String> {
    if response.len() < 5 || response[1] != command {
        return Err(FlashError::UnexpectedResponse(response.to_vec()));
    }
    Ok(format!(
        "{}.{}.{}",
        response[2], response[3], response[4]
    ))
}

/// Parse a firmware description response: NUL-padded ASCII after the echo.
pub fn parse_description(command: u8, response: &[u8]) -> Result<String> {
    if response.len() <= STATUS || response[1] != command {
        return Err(FlashError::UnexpectedResponse(response.to_vec()));
    }
    let text = &response[STATUS..];
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    Ok(String::from_utf8_lossy(&text[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{CMD_INIT_SRAM, MSG_GET_FIRMWARE_VERSION};

    #[test]
    fn sram_packet_layout() {
        let chunk = [0xAAu8; 56];
        let packet = sram_fw_packet(0x0001_2345, &chunk);
        assert_eq!(packet[0], CMD_SET_SRAM_FW_PACKET);
        assert_eq!(&packet[1..5], &[0x45, 0x23, 0x01, 0x00]);
        assert_eq!(packet[5], 56);
        assert_eq!(&packet[6..], &chunk);
    }

    #[test]
    fn sram_packet_short_tail() {
        let packet = sram_fw_packet(0x34000 - 8, &[1, 2, 3]);
        assert_eq!(packet[5], 3);
        assert_eq!(packet.len(), 9);
    }

    #[test]
    fn success_requires_echo_and_status() {
        assert!(expect_success(CMD_INIT_SRAM, &[0x00, CMD_INIT_SRAM, 0x01]).is_ok());
        assert!(expect_success(CMD_INIT_SRAM, &[0x00, CMD_INIT_SRAM, 0x00]).is_err());
        assert!(expect_success(CMD_INIT_SRAM, &[0x00, 0x09, 0x01]).is_err());
        assert!(expect_success(CMD_INIT_SRAM, &[]).is_err());
    }

    #[test]
    fn fw_crc_pending_then_ready() {
        let pending = [0x00, CMD_GET_FW_CRC, 0x00, 0x00, 0x00];
        assert_eq!(parse_fw_crc(&pending).unwrap(), None);
        let ready = [0x00, CMD_GET_FW_CRC, 0x01, 0x44, 0x2F];
        assert_eq!(parse_fw_crc(&ready).unwrap(), Some(0x2F44));
    }

    #[test]
    fn version_formats_dotted_triple() {
        let response = [0x00, MSG_GET_FIRMWARE_VERSION, 1, 8, 1];
        assert_eq!(
            parse_version(MSG_GET_FIRMWARE_VERSION, &response).unwrap(),
            "1.8.1"
        );
    }

    #[test]
    fn description_stops_at_nul() {
        let mut response = vec![0x00, 0x06];
        response.extend_from_slice(b"AudioMoth 1.2.0\0\0\0\0");
        assert_eq!(parse_description(0x06, &response).unwrap(), "AudioMoth 1.2.0");
    }
}
