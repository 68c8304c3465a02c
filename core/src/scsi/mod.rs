//! SCSI devices, logical units and the device registry

pub mod cdrom;
pub mod disk;
pub mod lun;
pub mod registry;
pub mod target;

pub const STATUS_GOOD: u8 = 0;
pub const STATUS_CHECK_CONDITION: u8 = 2;

// Sense keys
pub const CC_KEY_NONE: u8 = 0x00;
pub const CC_KEY_NOT_READY: u8 = 0x02;
pub const CC_KEY_MEDIUM_ERROR: u8 = 0x03;
pub const CC_KEY_HARDWARE_ERROR: u8 = 0x04;
pub const CC_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const CC_KEY_UNIT_ATTENTION: u8 = 0x06;

// Additional sense code (high byte) and qualifier (low byte)
pub const ASC_NONE: u16 = 0x0000;
pub const ASC_INVALID_COMMAND_OPCODE: u16 = 0x2000;
pub const ASC_LBA_OUT_OF_RANGE: u16 = 0x2100;
pub const ASC_INVALID_FIELD_IN_CDB: u16 = 0x2400;
pub const ASC_WRITE_PROTECTED: u16 = 0x2700;
pub const ASC_MEDIUM_MAY_HAVE_CHANGED: u16 = 0x2800;
pub const ASC_MEDIUM_NOT_PRESENT: u16 = 0x3A00;
pub const ASC_INTERNAL_TARGET_FAILURE: u16 = 0x4400;

/// Length of fixed format sense data with 10 additional bytes
pub const SENSE_LEN: usize = 18;

/// Length of a CDB given its operation code, by command group.
pub const fn scsi_cmd_len(cmdnum: u8) -> Option<usize> {
    match cmdnum >> 5 {
        // Group 0: TEST UNIT READY, REQUEST SENSE, READ(6), INQUIRY, ...
        0 => Some(6),
        // Group 1/2: READ CAPACITY, READ(10), READ TOC, ...
        1 | 2 => Some(10),
        // Group 4: 16-byte commands
        4 => Some(16),
        // Group 5: READ(12), ...
        5 => Some(12),
        // Reserved and vendor specific
        _ => None,
    }
}

/// Builds fixed format sense data of exactly `len` bytes.
pub fn sense_data(key: u8, asc: u16, len: usize) -> Vec<u8> {
    let mut result = vec![0; SENSE_LEN.max(len)];
    // Current error
    result[0] = 0x70;
    result[2] = key & 0x0F;
    // Additional sense length
    result[7] = 10;
    result[12..14].copy_from_slice(&asc.to_be_bytes());
    result.truncate(len);
    result
}

/// Result of a command
pub enum ScsiCmdResult {
    /// Immediately turn to the Status phase
    Status(u8),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}
