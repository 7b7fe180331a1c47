use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::telemetry::TelemetryReport;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Every frame the logger sends starts with these two bytes.
pub const FRAME_START: &[u8; 2] = &[0x68, 0x00];
/// Every frame ends with this terminator byte.
pub const FRAME_END: u8 = 0x16;

/// Length of a telemetry frame, carrying readings of both channels.
pub const TELEMETRY_FRAME_LEN: usize = 86;
/// Length of an announce ("poll message") frame.
pub const ANNOUNCE_FRAME_LEN: usize = 32;
/// Frames shorter than this carry no serial field, so they cannot be ACKed.
pub const MIN_ACK_LEN: usize = 24;

/// Offset of the 4 serial bytes that the ACK echoes back to the logger.
const ACK_SERIAL_OFFSET: usize = 20;
/// Offset of the logger serial number inside an announce frame.
const ANNOUNCE_SERIAL_OFFSET: usize = 6;

/// An unterminated frame can only grow so large before it is junk.
const MAX_BUFFERED: usize = 4096;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: got {0} bytes, expect {1}")]
    TooSmall(usize, usize),
}

/// Splits the raw TCP byte stream into logger frames.
///
/// The logger marks frame boundaries rather than sending a usable length
/// field, so the scanner looks for the start marker, drops any garbage in
/// front of it, and cuts at the first terminator after it. Incomplete
/// frames stay buffered until more bytes arrive.
#[derive(Default)]
pub struct FrameScanner {
    buffer: BytesMut,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(2 * TELEMETRY_FRAME_LEN),
        }
    }

    /// Append freshly received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFERED {
            self.buffer.clear();
        }
    }

    /// Pop the next complete frame, start marker through terminator.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        match self.buffer.windows(2).position(|w| w == FRAME_START) {
            Some(start) => self.buffer.advance(start),
            None => {
                // Keep a possibly split start marker, the rest is garbage.
                let keep = usize::from(self.buffer.last() == Some(&FRAME_START[0]));
                self.buffer.advance(self.buffer.len() - keep);
                return None;
            }
        }
        let end = self.buffer.iter().position(|&b| b == FRAME_END)?;
        Some(self.buffer.split_to(end + 1).freeze())
    }
}

/// A frame sorted by its length. The logger speaks only two frame kinds;
/// anything else passes through as [`Packet::Unknown`] and is still ACKed.
#[derive(Debug)]
pub enum Packet {
    /// 86-byte frame with readings of both inverter channels.
    Telemetry(TelemetryReport),
    /// 32-byte frame announcing the logger serial number.
    Announce { serial: String },
    /// Any other length.
    Unknown,
}

impl Packet {
    pub fn classify(frame: &[u8]) -> Result<Packet> {
        match frame.len() {
            TELEMETRY_FRAME_LEN => Ok(Packet::Telemetry(TelemetryReport::parse(frame)?)),
            ANNOUNCE_FRAME_LEN => Ok(Packet::Announce {
                serial: to_hex(&frame[ANNOUNCE_SERIAL_OFFSET..ANNOUNCE_SERIAL_OFFSET + 4]),
            }),
            _ => Ok(Packet::Unknown),
        }
    }
}

/// Build the ACK for a received frame, or `None` if the frame is too short
/// to carry the serial bytes the ACK must echo.
pub fn build_ack(frame: &[u8]) -> Option<Bytes> {
    if frame.len() < MIN_ACK_LEN {
        return None;
    }
    let mut ack = BytesMut::with_capacity(16);
    ack.put_slice(&[0x68, 0x00, 0x10, 0x68, 0x10, 0x50]);
    ack.put_slice(&frame[ACK_SERIAL_OFFSET..ACK_SERIAL_OFFSET + 4]);
    ack.put_slice(&[0x00, 0x00, 0x00, 0x00, 0x78, FRAME_END]);
    Some(ack.freeze())
}

/// Render bytes as a lowercase hex string, as the logger tooling does.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::new(), |mut s, b| {
        // write! to a String cannot fail.
        let _ = write!(s, "{:02x}", b);
        s
    })
}
