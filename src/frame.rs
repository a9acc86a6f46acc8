//! CAN frame record and frame-sequence hashing.
//!
//! Every decoded row becomes a fixed-width `Frame`. The content hash used for
//! deduplication is computed over a canonical little-endian byte layout of the
//! frames, so it is independent of the dialect the file was written in.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum classic CAN payload.
pub const MAX_DLC: u8 = 8;

/// Direction value for frames received by the logger.
pub const DIRECTION_RX: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Seconds since the segment (or session) start.
    pub timestamp: f64,
    pub bus: u8,
    pub arbitration_id: u32,
    /// 29-bit identifier.
    pub extended: bool,
    pub dlc: u8,
    /// Payload, zero padded past `dlc`.
    pub bytes: [u8; 8],
    pub direction: u8,
}

impl Frame {
    /// Payload bytes actually carried by the frame.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..usize::from(self.dlc.min(MAX_DLC))]
    }

    fn canonical_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..8].copy_from_slice(&self.timestamp.to_bits().to_le_bytes());
        out[8] = self.bus;
        out[9..13].copy_from_slice(&self.arbitration_id.to_le_bytes());
        out[13] = u8::from(self.extended);
        out[14] = self.dlc;
        out[15..23].copy_from_slice(&self.bytes);
        out[23] = self.direction;
        out
    }
}

/// SHA-256 over the canonical encoding of `frames`, hex encoded.
pub fn content_hash(frames: &[Frame]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((frames.len() as u64).to_le_bytes());
    for frame in frames {
        hasher.update(frame.canonical_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Length in seconds of a frame sequence: the last frame's timestamp.
pub fn sequence_length(frames: &[Frame]) -> f64 {
    frames.last().map(|f| f.timestamp).unwrap_or(0.0)
}
