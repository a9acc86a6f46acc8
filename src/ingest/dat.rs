//! DAT dialect: one frame per line as `timestamp-bus-hexID#hexbytes`.
//!
//! Identifiers longer than three hex digits are 29-bit (extended) frames. The
//! payload is read two hex characters per byte; `dlc` is the number of bytes
//! present, and the stored payload is zero padded to eight bytes.

use crate::error::RowError;
use crate::frame::{Frame, DIRECTION_RX, MAX_DLC};

use super::{parse_hex, parse_timestamp};

const STANDARD_ID_DIGITS: usize = 3;

/// Some loggers write a column title line directly after the header. A line
/// that starts with a timestamp is a damaged row, not a title.
pub(super) fn is_column_title(line: &str) -> bool {
    if line.contains('#') {
        return false;
    }
    let leading = line.split_once('-').map_or(line, |(first, _)| first);
    parse_timestamp(leading).is_none()
}

pub(super) fn parse_line(line: &str) -> Result<Frame, RowError> {
    let (ts_text, rest) = line.split_once('-').ok_or(RowError::Shape)?;
    let timestamp =
        parse_timestamp(ts_text).ok_or_else(|| RowError::Timestamp(ts_text.to_string()))?;

    let (bus_text, rest) = rest.split_once('-').ok_or(RowError::Shape)?;
    if bus_text.is_empty() || !bus_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RowError::Bus(bus_text.to_string()));
    }
    let bus: u8 = bus_text
        .parse()
        .map_err(|_| RowError::Bus(bus_text.to_string()))?;

    let (id_text, payload) = rest.split_once('#').ok_or(RowError::Shape)?;
    let arbitration_id =
        parse_hex(id_text).ok_or_else(|| RowError::ArbitrationId(id_text.to_string()))?;
    let extended = id_text.len() > STANDARD_ID_DIGITS;

    if !payload.is_ascii() {
        return Err(RowError::DataByte(payload.to_string()));
    }
    let tokens: Vec<&str> = payload
        .as_bytes()
        .chunks(2)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect();
    if tokens.len() > usize::from(MAX_DLC) {
        return Err(RowError::PayloadTooLong(tokens.len()));
    }

    let mut bytes = [0u8; 8];
    for (slot, token) in bytes.iter_mut().zip(tokens.iter()) {
        *slot = u8::from_str_radix(token, 16).map_err(|_| RowError::DataByte(token.to_string()))?;
    }

    Ok(Frame {
        timestamp,
        bus,
        arbitration_id,
        extended,
        dlc: tokens.len() as u8,
        bytes,
        direction: DIRECTION_RX,
    })
}
