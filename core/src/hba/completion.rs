//! Completion codes reported by the direct command path

/// Maps fixed-format sense data to a direct-command completion code.
///
/// Only the additional sense code (byte 12) is considered. Unknown codes
/// map to 0xFF.
pub fn completion_code(sense: &[u8]) -> u8 {
    let Some(&asc) = sense.get(12) else {
        return 0xFF;
    };

    match asc {
        0x00 => 0x00,
        0x20 | 0x24 | 0x26 | 0x4B => 0x01,
        0x12 | 0x21 => 0x02,
        0x27 => 0x03,
        0x14 | 0x16 => 0x04,
        0x30 | 0x64 => 0x0C,
        0x10 | 0x11 => 0x10,
        0x17 | 0x18 => 0x11,
        0x01 | 0x03 | 0x05..=0x09 | 0x1B..=0x1D | 0x40..=0x49 => 0x20,
        0x15 | 0x02 => 0x40,
        0x25 => 0x80,
        0x04 | 0x28 | 0x29 | 0x2A | 0x3A => 0xAA,
        _ => 0xFF,
    }
}
