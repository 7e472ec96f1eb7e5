//! Operation log frame format
//!
//! # Frame Layout
//!
//! ```text
//! ┌─────────────────┬────────────────┬─────────────────────────┬───────────┐
//! │ Length (4 bytes)│ Format Ver (1) │ LogEntry (msgpack)      │ CRC32 (4) │
//! └─────────────────┴────────────────┴─────────────────────────┴───────────┘
//! ```
//!
//! `Length` counts the format byte and the payload. The CRC covers the
//! format byte and the payload. All integers are little-endian.

use crate::error::{LogError, LogResult};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tabletsnap_core::{RecordKey, SysRecord};

/// Current frame format version
pub const FRAME_FORMAT_VERSION: u8 = 1;

/// Bytes before the payload: length + format version
pub const FRAME_HEADER_SIZE: usize = 5;

/// Bytes after the payload: CRC32
pub const FRAME_TRAILER_SIZE: usize = 4;

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Record key
    pub key: RecordKey,
    /// Version assigned by the log
    pub version: u64,
    /// New record contents; `None` removes the record
    pub record: Option<SysRecord>,
}

/// Outcome of decoding the frame at the start of a buffer
#[derive(Debug)]
pub enum DecodedFrame {
    /// A valid frame of `len` bytes
    Complete {
        /// Decoded entry
        entry: LogEntry,
        /// Total frame size
        len: usize,
    },
    /// The buffer ends before the frame does
    Incomplete,
    /// The frame is complete but its checksum does not match
    BadChecksum {
        /// Total frame size
        len: usize,
    },
}

/// Encode an entry into a frame
pub fn encode_frame(entry: &LogEntry) -> LogResult<Vec<u8>> {
    let payload = rmp_serde::to_vec(entry)?;
    let body_len = payload.len() + 1;

    let mut frame = vec![0u8; FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE];
    LittleEndian::write_u32(&mut frame[0..4], body_len as u32);
    frame[4] = FRAME_FORMAT_VERSION;
    frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload.len()].copy_from_slice(&payload);

    let crc = crc32fast::hash(&frame[4..FRAME_HEADER_SIZE + payload.len()]);
    let crc_at = FRAME_HEADER_SIZE + payload.len();
    LittleEndian::write_u32(&mut frame[crc_at..crc_at + 4], crc);
    Ok(frame)
}

/// Decode the frame at the start of `buf`
pub fn decode_frame(buf: &[u8]) -> LogResult<DecodedFrame> {
    if buf.len() < 4 {
        return Ok(DecodedFrame::Incomplete);
    }
    let body_len = LittleEndian::read_u32(&buf[0..4]) as usize;
    let total = 4 + body_len + FRAME_TRAILER_SIZE;
    if body_len == 0 || buf.len() < total {
        return Ok(DecodedFrame::Incomplete);
    }

    let body = &buf[4..4 + body_len];
    let stored_crc = LittleEndian::read_u32(&buf[4 + body_len..total]);
    if crc32fast::hash(body) != stored_crc {
        return Ok(DecodedFrame::BadChecksum { len: total });
    }
    if body[0] != FRAME_FORMAT_VERSION {
        return Err(LogError::Serialization(format!(
            "unsupported frame format version {}",
            body[0]
        )));
    }

    let entry: LogEntry = rmp_serde::from_slice(&body[1..])?;
    Ok(DecodedFrame::Complete { entry, len: total })
}
