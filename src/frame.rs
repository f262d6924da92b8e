//! Wire format of the telemetry notification.
//!
//! Every notification carries exactly one 49 byte frame, all integers
//! little-endian, fields in this order:
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0  | 4  | timestamp, seconds (u32) |
//! | 4  | 32 | 16 cell voltages, mV (u16) |
//! | 36 | 2  | pack total, mV (u16) |
//! | 38 | 2  | pack under load, mV (u16) |
//! | 40 | 2  | sum of active cells, mV (u16) |
//! | 42 | 2  | current, mA (i16) |
//! | 44 | 2  | TS1 temperature, centi-°C (i16) |
//! | 46 | 2  | internal temperature, centi-°C (i16) |
//! | 48 | 1  | state of charge, % (u8) |
//!
//! There is no header, version or checksum: the length is the only thing
//! that can be validated.

use crate::message::{TelemetryReading, CELL_COUNT};

pub const FRAME_LEN: usize = 4 + CELL_COUNT * 2 + 2 * 6 + 1;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("malformed frame: expected {expected} bytes, got {actual}")]
pub struct MalformedFrame {
    pub expected: usize,
    pub actual: usize,
}

struct Reader<'a> {
    buf: &'a [u8; FRAME_LEN],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
}

/// Decode one notification payload.
///
/// Fails unless `buf` is exactly [`FRAME_LEN`] bytes long; nothing is
/// decoded from a short or long buffer.
pub fn decode(buf: &[u8]) -> Result<TelemetryReading, MalformedFrame> {
    let buf: &[u8; FRAME_LEN] = buf.try_into().map_err(|_| MalformedFrame {
        expected: FRAME_LEN,
        actual: buf.len(),
    })?;
    let mut r = Reader { buf, pos: 0 };

    let timestamp_seconds = r.u32();
    let mut cell_millivolts = [0u16; CELL_COUNT];
    for cell in cell_millivolts.iter_mut() {
        *cell = r.u16();
    }

    Ok(TelemetryReading {
        timestamp_seconds,
        cell_millivolts,
        pack_total_millivolts: r.u16(),
        pack_load_millivolts: r.u16(),
        pack_sum_active_millivolts: r.u16(),
        current_milliamps: r.i16(),
        temp_ts1_centidegrees_c: r.i16(),
        temp_int_centidegrees_c: r.i16(),
        state_of_charge_percent: r.u8(),
    })
}

/// Reference encoder, the exact inverse of [`decode`].
///
/// Only the simulator and tests produce frames; a real monitor does this
/// in firmware.
pub fn encode(reading: &TelemetryReading) -> [u8; FRAME_LEN] {
    let mut out = Vec::with_capacity(FRAME_LEN);
    out.extend_from_slice(&reading.timestamp_seconds.to_le_bytes());
    for cell in reading.cell_millivolts.iter() {
        out.extend_from_slice(&cell.to_le_bytes());
    }
    out.extend_from_slice(&reading.pack_total_millivolts.to_le_bytes());
    out.extend_from_slice(&reading.pack_load_millivolts.to_le_bytes());
    out.extend_from_slice(&reading.pack_sum_active_millivolts.to_le_bytes());
    out.extend_from_slice(&reading.current_milliamps.to_le_bytes());
    out.extend_from_slice(&reading.temp_ts1_centidegrees_c.to_le_bytes());
    out.extend_from_slice(&reading.temp_int_centidegrees_c.to_le_bytes());
    out.push(reading.state_of_charge_percent);

    let mut frame = [0u8; FRAME_LEN];
    frame.copy_from_slice(&out);
    frame
}

/// Parse a frame written as hex, as printed by most BLE sniffers.
///
/// Bytes may be separated by spaces, `-` or `:`.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != ':')
        .collect();
    hex::decode(compact)
}
