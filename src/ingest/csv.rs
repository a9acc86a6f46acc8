//! CSV dialect: `timestamp,bus,extended,id,len,d0,d1,d2,d3,d4,d5,d6,d7`.
//!
//! Empty or missing data cells read as `00`, matching what loggers emit for
//! short frames.

use crate::error::RowError;
use crate::frame::{Frame, DIRECTION_RX, MAX_DLC};

use super::{parse_hex, parse_timestamp};

const FIXED_COLUMNS: usize = 5;
const MAX_COLUMNS: usize = FIXED_COLUMNS + 8;

pub(super) fn is_column_title(line: &str) -> bool {
    line.split(',')
        .next()
        .map(|cell| cell.trim().eq_ignore_ascii_case("timestamp"))
        .unwrap_or(false)
}

pub(super) fn parse_row(line: &str) -> Result<Frame, RowError> {
    let cells: Vec<&str> = line.split(',').map(str::trim).collect();
    if cells.len() < FIXED_COLUMNS || cells.len() > MAX_COLUMNS {
        return Err(RowError::Columns(cells.len()));
    }

    let timestamp =
        parse_timestamp(cells[0]).ok_or_else(|| RowError::Timestamp(cells[0].to_string()))?;
    let bus = parse_small_int(cells[1], u8::MAX).ok_or_else(|| RowError::Bus(cells[1].to_string()))?;
    let extended = parse_flag(cells[2]).ok_or_else(|| RowError::Extended(cells[2].to_string()))?;
    let arbitration_id = parse_hex(or_zero(cells[3]))
        .ok_or_else(|| RowError::ArbitrationId(cells[3].to_string()))?;
    let dlc = parse_small_int(cells[4], MAX_DLC).ok_or_else(|| RowError::Length(cells[4].to_string()))?;

    let mut bytes = [0u8; 8];
    for (slot, cell) in bytes.iter_mut().zip(cells[FIXED_COLUMNS..].iter()) {
        *slot = parse_hex(or_zero(cell))
            .and_then(|value| u8::try_from(value).ok())
            .ok_or_else(|| RowError::DataByte(cell.to_string()))?;
    }

    Ok(Frame {
        timestamp,
        bus,
        arbitration_id,
        extended,
        dlc,
        bytes,
        direction: DIRECTION_RX,
    })
}

fn or_zero(cell: &str) -> &str {
    if cell.is_empty() {
        "00"
    } else {
        cell
    }
}

/// Integral numeric cell (`1` or `1.0`) no larger than `max`.
fn parse_small_int(cell: &str, max: u8) -> Option<u8> {
    let value = cell.parse::<f64>().ok()?;
    if value.fract() != 0.0 || value < 0.0 || value > f64::from(max) {
        return None;
    }
    Some(value as u8)
}

fn parse_flag(cell: &str) -> Option<bool> {
    if cell.eq_ignore_ascii_case("true") {
        return Some(true);
    }
    if cell.eq_ignore_ascii_case("false") {
        return Some(false);
    }
    let value = cell.parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some(value != 0.0)
}
