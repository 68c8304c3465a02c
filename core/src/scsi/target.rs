//! SCSI target generic/shared code

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::{
    ASC_INVALID_FIELD_IN_CDB, ASC_LBA_OUT_OF_RANGE, ASC_MEDIUM_NOT_PRESENT, CC_KEY_ILLEGAL_REQUEST,
    CC_KEY_NOT_READY, STATUS_CHECK_CONDITION, STATUS_GOOD, ScsiCmdResult, scsi_cmd_len,
    sense_data,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
/// Enumeration of supported emulated SCSI target types (devices)
pub enum ScsiTargetType {
    Disk,
    Cdrom,
}

/// Some events that may occur to feed to the front end
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScsiTargetEvent {
    MediaEjected,
}

/// An abstraction of a generic SCSI target
pub trait ScsiTarget {
    fn take_event(&mut self) -> Option<ScsiTargetEvent> {
        None
    }

    fn target_type(&self) -> ScsiTargetType;
    fn unit_ready(&mut self) -> Result<ScsiCmdResult>;
    fn inquiry(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult>;

    /// Contents of a single mode page, including page code and length
    fn mode_sense(&self, page: u8) -> Option<Vec<u8>>;
    fn ms_density(&self) -> u8;
    fn ms_media_type(&self) -> u8;
    fn ms_device_specific(&self) -> u8;

    /// Sets the check condition reported by the next REQUEST SENSE
    fn set_cc(&mut self, key: u8, asc: u16);

    /// Pending check condition (key, asc << 8 | ascq), not cleared
    fn sense(&self) -> (u8, u16);

    /// Pending check condition (key, asc << 8 | ascq), cleared after reading
    fn req_sense(&mut self) -> (u8, u16);

    // For block devices
    fn blocksize(&self) -> Option<usize>;
    fn blocks(&self) -> Option<usize>;
    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8>;
    fn write(&mut self, block_offset: usize, data: &[u8]);

    fn set_blocksize(&mut self, _blocksize: usize) -> bool {
        false
    }

    /// Device-specific commands
    fn specific_cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult>;

    /// CDB length the device latches from an initiator
    fn cdb_len(&self) -> usize {
        12
    }

    /// Bus or device reset
    fn reset(&mut self) {
        self.req_sense();
    }

    /// Returns the drives total capacity in bytes
    fn capacity(&self) -> Option<usize> {
        Some(self.blocksize()? * self.blocks()?)
    }

    /// Sets a check condition and returns the matching status
    fn check_condition(&mut self, key: u8, asc: u16) -> Result<ScsiCmdResult> {
        self.set_cc(key, asc);
        Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
    }

    /// Validates a block range, returning the block size if it can be accessed.
    fn check_range(&mut self, blocknum: usize, blockcnt: usize) -> Option<usize> {
        let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
            self.set_cc(CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
            return None;
        };
        if blocknum + blockcnt > blocks {
            log::warn!(
                "Access beyond end of medium: {} + {} > {}",
                blocknum,
                blockcnt,
                blocks
            );
            self.set_cc(CC_KEY_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE);
            return None;
        }
        Some(blocksize)
    }

    fn read_blocks(&mut self, blocknum: usize, blockcnt: usize) -> Result<ScsiCmdResult> {
        if self.check_range(blocknum, blockcnt).is_none() {
            return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
        }
        Ok(ScsiCmdResult::DataIn(self.read(blocknum, blockcnt)))
    }

    fn write_blocks(
        &mut self,
        blocknum: usize,
        blockcnt: usize,
        outdata: Option<&[u8]>,
    ) -> Result<ScsiCmdResult> {
        let Some(blocksize) = self.check_range(blocknum, blockcnt) else {
            return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
        };
        if let Some(data) = outdata {
            self.write(blocknum, data);
            Ok(ScsiCmdResult::Status(STATUS_GOOD))
        } else {
            Ok(ScsiCmdResult::DataOut(blockcnt * blocksize))
        }
    }

    /// MODE SENSE(6) response: header, block descriptor, pages
    fn mode_sense6(&mut self, cmd: &[u8]) -> Result<ScsiCmdResult> {
        let page = cmd[2] & 0x3F;
        let dbd = cmd[1] & 0x08 != 0;
        let alloc_len = cmd[4] as usize;

        let pages = if page == 0x3F {
            (0x01..0x3F).filter_map(|p| self.mode_sense(p)).flatten().collect()
        } else if let Some(p) = self.mode_sense(page) {
            p
        } else {
            log::warn!("Unsupported mode page {:02X}", page);
            return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
        };

        let mut result = vec![0, self.ms_media_type(), self.ms_device_specific(), 0];
        if !dbd {
            let blocks = self.blocks().unwrap_or(0).min(0xFF_FFFF) as u32;
            let blocksize = self.blocksize().unwrap_or(0) as u32;
            result[3] = 8;
            result.push(self.ms_density());
            result.extend_from_slice(&blocks.to_be_bytes()[1..]);
            result.push(0);
            result.extend_from_slice(&blocksize.to_be_bytes()[1..]);
        }
        result.extend(pages);
        // Mode data length excludes itself
        result[0] = (result.len() - 1).min(0xFF) as u8;
        result.truncate(alloc_len);
        Ok(ScsiCmdResult::DataIn(result))
    }

    fn cmd(&mut self, cmd: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        let Some(&opcode) = cmd.first() else {
            bail!("Empty CDB");
        };
        if cmd.len() < scsi_cmd_len(opcode).unwrap_or(6) {
            bail!("Short CDB for {:02X}: {} bytes", opcode, cmd.len());
        }

        match opcode {
            0x00 => {
                // TEST UNIT READY
                self.unit_ready()
            }
            0x01 | 0x0B | 0x2B => {
                // REZERO UNIT, SEEK(6), SEEK(10)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x03 => {
                // REQUEST SENSE
                let (key, asc) = self.req_sense();
                // Zero means 4 bytes for SCSI-1 initiators
                let len = if cmd[4] == 0 { 4 } else { cmd[4] as usize };
                Ok(ScsiCmdResult::DataIn(sense_data(key, asc, len)))
            }
            0x04 => {
                // FORMAT UNIT(6)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x08 => {
                // READ(6)
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };
                self.read_blocks(blocknum, blockcnt)
            }
            0x0A => {
                // WRITE(6)
                let blocknum = (u32::from_be_bytes(cmd[0..4].try_into()?) & 0x1F_FFFF) as usize;
                let blockcnt = if cmd[4] == 0 { 256 } else { cmd[4] as usize };
                self.write_blocks(blocknum, blockcnt, outdata)
            }
            0x12 => {
                // INQUIRY
                if cmd[1] & 0x01 != 0 {
                    // No vital product data pages
                    return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
                }
                match self.inquiry(cmd)? {
                    ScsiCmdResult::DataIn(mut data) => {
                        data.truncate(cmd[4] as usize);
                        Ok(ScsiCmdResult::DataIn(data))
                    }
                    r => Ok(r),
                }
            }
            0x15 => {
                // MODE SELECT(6)
                let Some(data) = outdata else {
                    return Ok(ScsiCmdResult::DataOut(cmd[4] as usize));
                };
                // Header (4) followed by an optional block descriptor
                if data.len() >= 12 && data[3] >= 8 {
                    let blocksize = u32::from_be_bytes([0, data[9], data[10], data[11]]) as usize;
                    if !self.set_blocksize(blocksize) {
                        log::warn!("MODE SELECT with unsupported block size {}", blocksize);
                        return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
                    }
                }
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x1A => {
                // MODE SENSE(6)
                self.mode_sense6(cmd)
            }
            0x25 => {
                // READ CAPACITY(10)
                let (Some(blocksize), Some(blocks)) = (self.blocksize(), self.blocks()) else {
                    return self.check_condition(CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
                };

                let mut result = vec![0; 8];
                result[0..4].copy_from_slice(&(blocks as u32).saturating_sub(1).to_be_bytes());
                result[4..8].copy_from_slice(&(blocksize as u32).to_be_bytes());
                Ok(ScsiCmdResult::DataIn(result))
            }
            0x28 => {
                // READ(10)
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;
                self.read_blocks(blocknum, blockcnt)
            }
            0x2A => {
                // WRITE(10)
                let blocknum = (u32::from_be_bytes(cmd[2..6].try_into()?)) as usize;
                let blockcnt = (u16::from_be_bytes(cmd[7..9].try_into()?)) as usize;
                self.write_blocks(blocknum, blockcnt, outdata)
            }
            0x2F => {
                // VERIFY(10)
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            0x3C => {
                // READ BUFFER(10)
                // 0 reserved, 1-3 buffer length (0)
                Ok(ScsiCmdResult::DataIn(vec![0; 4]))
            }
            _ => self.specific_cmd(cmd, outdata),
        }
    }
}
