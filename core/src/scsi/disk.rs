//! SCSI hard disk drive (block device)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use super::target::{ScsiTarget, ScsiTargetType};
use super::{
    ASC_INVALID_COMMAND_OPCODE, CC_KEY_ILLEGAL_REQUEST, STATUS_GOOD, ScsiCmdResult,
};

pub const DISK_BLOCKSIZE: usize = 512;

pub struct ScsiTargetDisk {
    /// Disk contents
    pub(super) disk: Vec<u8>,

    /// Path where the original image resides
    pub(super) path: Option<PathBuf>,

    /// Check condition code
    cc_code: u8,

    /// Check condition ASC
    cc_asc: u16,
}

impl ScsiTargetDisk {
    /// Creates a zero-filled disk of the given amount of blocks
    pub fn new(blocks: usize) -> Self {
        Self {
            disk: vec![0; blocks * DISK_BLOCKSIZE],
            path: None,
            cc_code: 0,
            cc_asc: 0,
        }
    }

    /// Wraps an in-memory disk image
    pub fn from_image(disk: Vec<u8>) -> Result<Self> {
        if !disk.len().is_multiple_of(DISK_BLOCKSIZE) {
            bail!(
                "Disk image size {} is not a multiple of {}",
                disk.len(),
                DISK_BLOCKSIZE
            );
        }
        Ok(Self {
            disk,
            path: None,
            cc_code: 0,
            cc_asc: 0,
        })
    }

    /// Try to load a disk image, given the filename of the image.
    pub fn load_disk(filename: &Path) -> Result<Self> {
        if !filename.exists() {
            bail!("File not found: {}", filename.display());
        }

        let disk = std::fs::read(filename)
            .with_context(|| format!("Failed to open file {}", filename.display()))?;

        let mut result = Self::from_image(disk)
            .with_context(|| format!("Cannot load disk image {}", filename.display()))?;
        result.path = Some(filename.to_path_buf());
        Ok(result)
    }

    pub fn image_fn(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl ScsiTarget for ScsiTargetDisk {
    fn target_type(&self) -> ScsiTargetType {
        ScsiTargetType::Disk
    }

    fn set_cc(&mut self, key: u8, asc: u16) {
        self.cc_code = key;
        self.cc_asc = asc;
    }

    fn sense(&self) -> (u8, u16) {
        (self.cc_code, self.cc_asc)
    }

    fn req_sense(&mut self) -> (u8, u16) {
        (
            std::mem::take(&mut self.cc_code),
            std::mem::take(&mut self.cc_asc),
        )
    }

    fn unit_ready(&mut self) -> Result<ScsiCmdResult> {
        Ok(ScsiCmdResult::Status(STATUS_GOOD))
    }

    fn inquiry(&mut self, _cmd: &[u8]) -> Result<ScsiCmdResult> {
        let mut result = vec![0; 36];

        // 0 Peripheral qualifier (5-7), peripheral device type (4-0)
        result[0] = 0; // Magnetic disk
        // Device Type Modifier
        result[1] = 0;

        // SCSI version compliance
        result[2] = 0x02; // ANSI-2
        result[3] = 0x02; // Response data format

        // 4 Additional length (N-4), min. 32
        result[4] = result.len() as u8 - 4;

        // 8..16 Vendor identification
        result[8..16].copy_from_slice(b"HBACORE ");

        // 16..32 Product identification
        result[16..32].copy_from_slice(b"VIRTUAL DISK    ");

        // 32..36 Revision
        result[32..36].copy_from_slice(b"1.00");

        Ok(ScsiCmdResult::DataIn(result))
    }

    fn mode_sense(&self, page: u8) -> Option<Vec<u8>> {
        match page {
            0x01 => {
                // Read/write error recovery page
                Some(vec![
                    0x01,        // Page code
                    0x0A,        // Page length
                    0b1100_0000, // AWRE, ARRE
                    8,           // Read retry count
                    0,           // Correction span
                    0,           // Head offset count
                    0,           // Data strobe offset count
                    0,           // Reserved
                    0,           // Write retry count
                    0,           // Reserved
                    0,           // Recovery time limit (MSB)
                    0,           // Recovery time limit (LSB)
                ])
            }
            0x02 => {
                // Disconnect-reconnect page, all limits zero
                let mut result = vec![0; 16];
                result[0] = 0x02;
                result[1] = 0x0E;
                Some(result)
            }
            0x03 => {
                // Format device page
                let mut result = vec![0; 24];
                result[0] = 0x03;
                result[1] = 0x16;
                // Sectors per track
                result[10..12].copy_from_slice(&63u16.to_be_bytes());
                // Bytes per physical sector
                result[12..14].copy_from_slice(&(DISK_BLOCKSIZE as u16).to_be_bytes());
                // Interleave
                result[14..16].copy_from_slice(&1u16.to_be_bytes());
                Some(result)
            }
            0x04 => {
                // Rigid disk geometry page, 16 heads x 63 sectors
                let cylinders = (self.disk.len() / DISK_BLOCKSIZE).div_ceil(16 * 63) as u32;
                let mut result = vec![0; 24];
                result[0] = 0x04;
                result[1] = 0x16;
                result[2..5].copy_from_slice(&cylinders.to_be_bytes()[1..]);
                result[5] = 16;
                // Rotation rate
                result[20..22].copy_from_slice(&3600u16.to_be_bytes());
                Some(result)
            }
            _ => None,
        }
    }

    fn ms_density(&self) -> u8 {
        0
    }

    fn ms_media_type(&self) -> u8 {
        0
    }

    fn ms_device_specific(&self) -> u8 {
        0
    }

    fn blocksize(&self) -> Option<usize> {
        Some(DISK_BLOCKSIZE)
    }

    fn blocks(&self) -> Option<usize> {
        Some(self.disk.len() / DISK_BLOCKSIZE)
    }

    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8> {
        self.disk[(block_offset * DISK_BLOCKSIZE)..((block_offset + block_count) * DISK_BLOCKSIZE)]
            .to_vec()
    }

    fn write(&mut self, block_offset: usize, data: &[u8]) {
        let offset = block_offset * DISK_BLOCKSIZE;
        let end = (offset + data.len()).min(self.disk.len());
        self.disk[offset..end].copy_from_slice(&data[..(end - offset)]);
    }

    fn specific_cmd(&mut self, cmd: &[u8], _outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            // START/STOP UNIT, PREVENT/ALLOW MEDIUM REMOVAL, SYNCHRONIZE CACHE
            0x1B | 0x1E | 0x35 => Ok(ScsiCmdResult::Status(STATUS_GOOD)),
            _ => {
                log::warn!("Unknown command {:02X}", cmd[0]);
                self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_COMMAND_OPCODE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::{ASC_LBA_OUT_OF_RANGE, STATUS_CHECK_CONDITION};

    fn data_in(r: ScsiCmdResult) -> Vec<u8> {
        match r {
            ScsiCmdResult::DataIn(d) => d,
            _ => panic!("Expected data in"),
        }
    }

    fn status(r: ScsiCmdResult) -> u8 {
        match r {
            ScsiCmdResult::Status(s) => s,
            _ => panic!("Expected status"),
        }
    }

    #[test]
    fn inquiry() {
        let mut d = ScsiTargetDisk::new(16);
        let r = data_in(d.cmd(&[0x12, 0, 0, 0, 36, 0], None).unwrap());
        assert_eq!(r.len(), 36);
        assert_eq!(r[0], 0);
        assert_eq!(&r[8..16], b"HBACORE ");

        // Allocation length truncates
        let r = data_in(d.cmd(&[0x12, 0, 0, 0, 5, 0], None).unwrap());
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn read_write_10() {
        let mut d = ScsiTargetDisk::new(16);
        let cdb = [0x2A, 0, 0, 0, 0, 2, 0, 0, 1, 0];
        let ScsiCmdResult::DataOut(len) = d.cmd(&cdb, None).unwrap() else {
            panic!("Expected data out");
        };
        assert_eq!(len, 512);
        let block = vec![0x5A; 512];
        assert_eq!(status(d.cmd(&cdb, Some(&block)).unwrap()), STATUS_GOOD);

        let r = data_in(d.cmd(&[0x28, 0, 0, 0, 0, 2, 0, 0, 1, 0], None).unwrap());
        assert_eq!(r, block);
        let r = data_in(d.cmd(&[0x08, 0, 0, 1, 2, 0], None).unwrap());
        assert_eq!(r.len(), 1024);
        assert_eq!(&r[512..], &block[..]);
    }

    #[test]
    fn read_beyond_end() {
        let mut d = ScsiTargetDisk::new(16);
        let r = d.cmd(&[0x28, 0, 0, 0, 0, 15, 0, 0, 2, 0], None).unwrap();
        assert_eq!(status(r), STATUS_CHECK_CONDITION);
        assert_eq!(d.sense(), (CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE));

        // REQUEST SENSE consumes the condition
        let s = data_in(d.cmd(&[0x03, 0, 0, 0, 18, 0], None).unwrap());
        assert_eq!(s[2], CC_KEY_ILLEGAL_REQUEST);
        assert_eq!(s[12], 0x21);
        assert_eq!(d.sense(), (0, 0));
    }

    #[test]
    fn read_capacity() {
        let mut d = ScsiTargetDisk::new(100);
        let r = data_in(d.cmd(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], None).unwrap());
        assert_eq!(r, vec![0, 0, 0, 99, 0, 0, 2, 0]);
        assert_eq!(d.capacity(), Some(100 * 512));
    }

    #[test]
    fn mode_sense_all_pages() {
        let mut d = ScsiTargetDisk::new(100);
        let r = data_in(d.cmd(&[0x1A, 0, 0x3F, 0, 0xFF, 0], None).unwrap());
        // Header + descriptor + pages 1, 2, 3, 4
        assert_eq!(r.len(), 4 + 8 + 12 + 16 + 24 + 24);
        assert_eq!(r[0] as usize, r.len() - 1);
        assert_eq!(r[3], 8);
        assert_eq!(&r[5..8], &[0, 0, 100]);
        assert_eq!(&r[9..12], &[0, 2, 0]);
        assert_eq!(r[12], 0x01);

        let r = data_in(d.cmd(&[0x1A, 0x08, 0x03, 0, 0xFF, 0], None).unwrap());
        assert_eq!(r.len(), 4 + 24);
        assert_eq!(r[4], 0x03);

        let r = d.cmd(&[0x1A, 0, 0x20, 0, 0xFF, 0], None).unwrap();
        assert_eq!(status(r), STATUS_CHECK_CONDITION);
    }

    #[test]
    fn unknown_opcode() {
        let mut d = ScsiTargetDisk::new(1);
        let r = d.cmd(&[0xC5, 0, 0, 0, 0, 0], None).unwrap();
        assert_eq!(status(r), STATUS_CHECK_CONDITION);
        assert_eq!(d.sense(), (CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_COMMAND_OPCODE));
    }

    #[test]
    fn bad_image_size() {
        assert!(ScsiTargetDisk::from_image(vec![0; 513]).is_err());
        assert!(ScsiTargetDisk::from_image(vec![0; 1024]).is_ok());
    }
}
