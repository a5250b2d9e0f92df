//! Wire format of the external head tracker.
//!
//! The device reports fixed 100-byte frames. Each frame carries up to three
//! sub-samples of accelerometer/gyroscope readings packed as 21-bit
//! two's-complement triples, a 16-bit rolling millisecond timestamp, and a
//! 16-bit magnetometer triple. This layout is bit-exact against the physical
//! device and must not change.

use crate::error::PacketError;

/// Fixed frame size read from the device.
pub const PACKET_LEN: usize = 100;

/// Bytes needed to decode every field we consume (mag triple ends at 62).
const MIN_DECODE_LEN: usize = 62;

/// One accelerometer/gyroscope sub-sample, raw device units
/// (multiply by 1e-4 for m/s^2 and rad/s).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSample {
    pub accel: [i32; 3],
    pub gyro: [i32; 3],
}

/// A decoded tracker frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerPacket {
    /// Number of 1 ms sample ticks this frame accounts for. May exceed 3;
    /// only the latest 3 sub-samples are present.
    pub sample_count: u8,
    /// Rolling 16-bit millisecond timestamp.
    pub timestamp: u16,
    pub last_command_id: u16,
    pub temperature: i16,
    pub samples: [TrackerSample; 3],
    pub mag: [i16; 3],
}

/// Sign-extend a 21-bit two's-complement value.
fn sign_extend_21(v: u32) -> i32 {
    ((v << 11) as i32) >> 11
}

/// Unpack three 21-bit signed values from 8 bytes.
fn unpack_triple(b: &[u8]) -> [i32; 3] {
    let x = ((b[0] as u32) << 13) | ((b[1] as u32) << 5) | (((b[2] & 0xF8) as u32) >> 3);
    let y = (((b[2] & 0x07) as u32) << 18)
        | ((b[3] as u32) << 10)
        | ((b[4] as u32) << 2)
        | (((b[5] & 0xC0) as u32) >> 6);
    let z = (((b[5] & 0x3F) as u32) << 15) | ((b[6] as u32) << 7) | ((b[7] as u32) >> 1);
    [sign_extend_21(x), sign_extend_21(y), sign_extend_21(z)]
}

/// Decode a raw device frame.
pub fn decode(buf: &[u8]) -> Result<TrackerPacket, PacketError> {
    if buf.len() < MIN_DECODE_LEN {
        return Err(PacketError::TooShort { len: buf.len() });
    }

    let mut packet = TrackerPacket {
        sample_count: buf[1],
        timestamp: u16::from_le_bytes([buf[2], buf[3]]),
        last_command_id: u16::from_le_bytes([buf[4], buf[5]]),
        temperature: i16::from_le_bytes([buf[6], buf[7]]),
        ..Default::default()
    };

    let present = packet.sample_count.min(3) as usize;
    for i in 0..present {
        packet.samples[i].accel = unpack_triple(&buf[8 + 16 * i..]);
        packet.samples[i].gyro = unpack_triple(&buf[16 + 16 * i..]);
    }

    packet.mag = [
        i16::from_le_bytes([buf[56], buf[57]]),
        i16::from_le_bytes([buf[58], buf[59]]),
        i16::from_le_bytes([buf[60], buf[61]]),
    ];

    Ok(packet)
}
