use bytes::Buf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{ProtocolError, TELEMETRY_FRAME_LEN};

/// Frame offsets of the two 32-byte channel blocks.
const CHANNEL_OFFSETS: [usize; 2] = [20, 52];
const CHANNEL_BLOCK_LEN: usize = 32;
/// Frame offset of the two firmware version bytes.
const FIRMWARE_OFFSET: usize = 24;

/// Readings of a single inverter channel.
///
/// The EVT800 drives two panels, so every telemetry frame carries two of
/// these blocks with an identical layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    /// Inverter id, as printed on the device label.
    pub id: u32,
    /// DC voltage from the panel, in volts.
    pub input_voltage: f64,
    /// AC output power, in watts.
    pub power: f64,
    /// Grid voltage, in volts.
    pub ac_voltage: f64,
    /// Grid frequency, in hertz.
    pub ac_frequency: f64,
    /// Inverter temperature, in degrees Celsius.
    pub temperature: f64,
    /// Lifetime energy production, in kilowatt hours.
    pub total_energy: f64,
    /// AC output current, in amperes, derived from power and grid voltage.
    pub current: f64,
}

impl ChannelReport {
    /// Decode one 32-byte channel block.
    ///
    /// All readings are big-endian raw counts with a per-field scale of
    /// `full_scale / 32768`. The id is not binary: each byte holds a pair
    /// of decimal digits.
    fn parse(block: &[u8]) -> Self {
        let id = u32::from(block[0]) * 1_000_000
            + u32::from(block[1]) * 10_000
            + u32::from(block[2]) * 100
            + u32::from(block[3]);

        let mut cursor = &block[6..];
        let input_voltage = f64::from(cursor.get_u16()) * 64.0 / 32768.0;
        let power = f64::from(cursor.get_u16()) * 512.0 / 32768.0;
        let total_energy = f64::from(cursor.get_u32()) * 4.0 / 32768.0;
        let temperature = f64::from(cursor.get_u16()) * 256.0 / 32768.0 - 40.0;
        let ac_voltage = f64::from(cursor.get_u16()) * 512.0 / 32768.0;
        let ac_frequency = f64::from(cursor.get_u16()) * 128.0 / 32768.0;

        Self {
            id,
            input_voltage,
            power,
            ac_voltage,
            ac_frequency,
            temperature,
            total_energy,
            current: safe_divide(power, ac_voltage),
        }
    }
}

/// One parsed telemetry frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Firmware version, e.g. `7A.7A`.
    pub sw_version: String,
    /// Both inverter channels, in frame order.
    pub channels: [ChannelReport; 2],
    /// When the frame was read from the socket.
    pub received_at: DateTime<Utc>,
}

impl TelemetryReport {
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < TELEMETRY_FRAME_LEN {
            return Err(ProtocolError::TooSmall(frame.len(), TELEMETRY_FRAME_LEN));
        }
        let sw_version = format!(
            "{:02X}.{:02X}",
            frame[FIRMWARE_OFFSET],
            frame[FIRMWARE_OFFSET + 1]
        );
        let channels = CHANNEL_OFFSETS.map(|at| ChannelReport::parse(&frame[at..at + CHANNEL_BLOCK_LEN]));

        Ok(Self {
            sw_version,
            channels,
            received_at: Utc::now(),
        })
    }
}

/// `numerator / denominator`, or 0 when the denominator is 0.
fn safe_divide(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
