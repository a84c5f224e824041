//! Fixed-point scaling between raw big-endian frame fields and physical units.
//!
//! The converter transports every measurement as a signed 16-bit integer.
//! Voltage and current use a resolution of 0.02, power a resolution of 5.

/// Volts per raw unit.
pub const VOLTAGE_SCALE: f32 = 0.02;
/// Amps per raw unit.
pub const CURRENT_SCALE: f32 = 0.02;
/// Watts per raw unit.
pub const POWER_SCALE: f32 = 5.0;
/// Used for the commanded value while the channel is in standby.
pub const RAW_SCALE: f32 = 1.0;

pub fn to_physical(raw: i16, scale: f32) -> f32 {
    raw as f32 * scale
}

/// Converts a physical value to its raw representation, rounding to the
/// nearest step. Values outside the i16 range saturate.
pub fn to_raw(value: f32, scale: f32) -> i16 {
    // `as` saturates on overflow and maps NaN to zero
    (value / scale).round() as i16
}

pub fn read_i16_be(buffer: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

pub fn read_u16_be(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

pub fn read_u32_be(buffer: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

/// Reads the 40-bit station identifier.
pub fn read_u40_be(buffer: &[u8], offset: usize) -> u64 {
    buffer[offset..offset + 5]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

pub fn write_u40_be(value: u64, buffer: &mut [u8], offset: usize) {
    for (i, byte) in buffer[offset..offset + 5].iter_mut().enumerate() {
        *byte = (value >> (8 * (4 - i))) as u8;
    }
}

pub fn write_i16_be(value: i16, buffer: &mut [u8], offset: usize) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}
