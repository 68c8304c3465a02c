//! SCSI CD-ROM drive (optical block device)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::types::LatchingEvent;

use super::target::{ScsiTarget, ScsiTargetEvent, ScsiTargetType};
use super::{
    ASC_INVALID_COMMAND_OPCODE, ASC_INVALID_FIELD_IN_CDB, ASC_MEDIUM_MAY_HAVE_CHANGED,
    ASC_MEDIUM_NOT_PRESENT, ASC_WRITE_PROTECTED, CC_KEY_ILLEGAL_REQUEST, CC_KEY_NOT_READY,
    CC_KEY_UNIT_ATTENTION, STATUS_CHECK_CONDITION, STATUS_GOOD, ScsiCmdResult,
};

const TRACK_LEADOUT: u8 = 0xAA;

pub struct ScsiTargetCdrom {
    /// Disc contents
    pub(super) disk: Option<Vec<u8>>,

    /// Path where the original image resides
    pub(super) path: PathBuf,

    /// Check condition code
    cc_code: u8,

    /// Check condition ASC
    cc_asc: u16,

    /// Media eject event
    event_eject: LatchingEvent,

    /// Media changed since the last TEST UNIT READY
    media_changed: bool,

    /// Block size
    blocksize: usize,

    /// Latches 16-byte CDBs instead of 12
    cdb16: bool,
}

impl Default for ScsiTargetCdrom {
    fn default() -> Self {
        Self {
            disk: None,
            path: Default::default(),
            cc_code: 0,
            cc_asc: 0,
            event_eject: Default::default(),
            media_changed: false,
            blocksize: 2048,
            cdb16: false,
        }
    }
}

impl ScsiTargetCdrom {
    const VALID_BLOCKSIZES: [usize; 2] = [512, 2048];

    pub fn new(cdb16: bool) -> Self {
        Self {
            cdb16,
            ..Default::default()
        }
    }

    /// Inserts an in-memory disc image
    pub fn insert_image(&mut self, image: Vec<u8>) {
        self.disk = Some(image);
        self.path = PathBuf::new();
        self.media_changed = true;
    }

    /// Loads a disc image from a file
    pub fn load_media(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            bail!("File not found: {}", path.display());
        }

        let disk =
            std::fs::read(path).with_context(|| format!("Failed to open file {}", path.display()))?;

        self.insert_image(disk);
        self.path = path.to_path_buf();
        Ok(())
    }

    pub fn image_fn(&self) -> Option<&Path> {
        if self.disk.is_none() {
            None
        } else {
            Some(self.path.as_ref())
        }
    }

    fn read_toc(&mut self, format: u8, track: u8, alloc_len: usize) -> Result<ScsiCmdResult> {
        if self.disk.is_none() {
            // No CD inserted
            return self.check_condition(CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT);
        }
        let leadout_lba = self.blocks().unwrap_or(0) as u32;

        let mut result = match (format, track) {
            // SCSI-2 TOC, track 1 and lead-out
            (0, 0 | 1) => {
                let mut result = vec![0; 0x14];
                // Length
                result[1] = 0x12;
                // First track
                result[2] = 1;
                // Last track
                result[3] = 1;

                // Track descriptor for track 1, digital, starts at 0
                result[5] = 0x14;
                result[6] = 1;

                // Track descriptor for lead-out
                result[13] = 0x14;
                result[14] = TRACK_LEADOUT;
                result[16..20].copy_from_slice(&leadout_lba.to_be_bytes());
                result
            }
            // SCSI-2 TOC, lead-out only
            (0, TRACK_LEADOUT) => {
                let mut result = vec![0; 12];
                result[1] = 0x0A;
                result[2] = 1;
                result[3] = 1;
                result[5] = 0x14;
                result[6] = TRACK_LEADOUT;
                result[8..12].copy_from_slice(&leadout_lba.to_be_bytes());
                result
            }
            // Session info
            (1, _) => {
                let mut result = vec![0; 12];
                result[1] = 0x0A;
                // First and last session
                result[2] = 1;
                result[3] = 1;
                result[5] = 0x14;
                result[6] = 1;
                result
            }
            _ => {
                log::warn!("Unsupported READ TOC format {} track {}", format, track);
                return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
            }
        };
        result.truncate(alloc_len);
        Ok(ScsiCmdResult::DataIn(result))
    }

    fn eject_media(&mut self) {
        self.event_eject.set();
        self.disk = None;
    }
}

impl ScsiTarget for ScsiTargetCdrom {
    fn take_event(&mut self) -> Option<ScsiTargetEvent> {
        if self.event_eject.get_clear() {
            Some(ScsiTargetEvent::MediaEjected)
        } else {
            None
        }
    }

    fn target_type(&self) -> ScsiTargetType {
        ScsiTargetType::Cdrom
    }

    fn cdb_len(&self) -> usize {
        if self.cdb16 { 16 } else { 12 }
    }

    fn unit_ready(&mut self) -> Result<ScsiCmdResult> {
        if self.disk.is_none() {
            // No CD inserted
            self.check_condition(CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT)
        } else if std::mem::take(&mut self.media_changed) {
            self.check_condition(CC_KEY_UNIT_ATTENTION, ASC_MEDIUM_MAY_HAVE_CHANGED)
        } else {
            Ok(ScsiCmdResult::Status(STATUS_GOOD))
        }
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

    fn inquiry(&mut self, _cmd: &[u8]) -> Result<ScsiCmdResult> {
        let mut result = vec![0; 36];

        // 0 Peripheral qualifier (5-7), peripheral device type (4-0)
        result[0] = 5; // CD-ROM drive
        result[1] = 0x80; // Media removable
        result[2] = 0x02; // ANSI-2
        result[3] = 0x02; // Response data format

        // 4 Additional length (N-4), min. 32
        result[4] = result.len() as u8 - 4;

        // 8..16 Vendor identification
        result[8..16].copy_from_slice(b"HBACORE ");

        // 16..32 Product identification
        result[16..32].copy_from_slice(b"VIRTUAL CDROM   ");
        // 32..36 Revision
        result[32..36].copy_from_slice(b"1.00");
        Ok(ScsiCmdResult::DataIn(result))
    }

    fn mode_sense(&self, page: u8) -> Option<Vec<u8>> {
        match page {
            0x01 => {
                // Read error recovery page, can remain at 0.
                let mut result = vec![0; 8];
                result[0] = 0x01;
                result[1] = 0x06;
                Some(result)
            }
            0x0E => {
                // CD audio control page
                let mut result = vec![0; 16];
                result[0] = 0x0E;
                result[1] = 0x0E;
                // Immediate
                result[2] = 0x04;
                Some(result)
            }
            0x2A => {
                // CD capabilities page
                let mut result = vec![0; 20];
                result[0] = 0x2A;
                result[1] = 0x12;
                // Reads CD-R, tray loader with eject
                result[2] = 0x01;
                result[6] = 0x29;
                // Maximum read speed, 8x
                result[8..10].copy_from_slice(&1408u16.to_be_bytes());
                Some(result)
            }
            _ => None,
        }
    }

    fn ms_density(&self) -> u8 {
        1 // User data only
    }

    fn ms_media_type(&self) -> u8 {
        if self.disk.is_some() {
            0x01 // 120mm data disc
        } else {
            0x70 // Door closed, no disc
        }
    }

    fn ms_device_specific(&self) -> u8 {
        0
    }

    fn blocksize(&self) -> Option<usize> {
        Some(self.blocksize)
    }

    fn set_blocksize(&mut self, blocksize: usize) -> bool {
        if Self::VALID_BLOCKSIZES.contains(&blocksize) {
            self.blocksize = blocksize;
            return true;
        }
        false
    }

    fn blocks(&self) -> Option<usize> {
        Some(self.disk.as_ref()?.len().div_ceil(self.blocksize))
    }

    fn read(&self, block_offset: usize, block_count: usize) -> Vec<u8> {
        let blocksize = self.blocksize;
        let Some(disk) = self.disk.as_ref() else {
            // Range checks keep this from happening
            return vec![0; block_count * blocksize];
        };
        let end_offset = (block_offset + block_count) * blocksize;
        let image_end_offset = std::cmp::min(end_offset, disk.len());

        let mut result = disk[(block_offset * blocksize)..image_end_offset].to_vec();
        // CD-ROM images may not be exactly aligned on block size
        // Pad the end to a full block size
        result.resize(block_count * blocksize, 0);
        result
    }

    fn write(&mut self, _block_offset: usize, _data: &[u8]) {
        log::error!("Write command to CD-ROM");
    }

    fn specific_cmd(&mut self, cmd: &[u8], _outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        match cmd[0] {
            // WRITE(6), WRITE(10)
            0x0A | 0x2A => self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_WRITE_PROTECTED),
            // START/STOP UNIT
            0x1B => {
                // LoEj + !start = eject
                let eject = cmd[4] & 0b11 == 0b10;

                if eject {
                    self.eject_media();
                }

                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
            // PREVENT/ALLOW MEDIA REMOVAL
            0x1E => Ok(ScsiCmdResult::Status(STATUS_GOOD)),
            // READ TOC
            0x43 => {
                let msf = cmd[1] & 0x02 != 0;
                if msf {
                    log::warn!("READ TOC in MSF format not supported");
                    return self.check_condition(CC_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB);
                }
                let format = cmd[9] >> 6;
                let track = cmd[6];
                let alloc_len = u16::from_be_bytes(cmd[7..9].try_into()?) as usize;

                self.read_toc(format, track, alloc_len)
            }
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

    fn status(r: ScsiCmdResult) -> u8 {
        match r {
            ScsiCmdResult::Status(s) => s,
            _ => panic!("Expected status"),
        }
    }

    fn data_in(r: ScsiCmdResult) -> Vec<u8> {
        match r {
            ScsiCmdResult::DataIn(d) => d,
            _ => panic!("Expected data in"),
        }
    }

    #[test]
    fn no_media() {
        let mut c = ScsiTargetCdrom::default();
        assert_eq!(
            status(c.cmd(&[0, 0, 0, 0, 0, 0], None).unwrap()),
            STATUS_CHECK_CONDITION
        );
        assert_eq!(c.req_sense(), (CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT));

        let r = c.cmd(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], None).unwrap();
        assert_eq!(status(r), STATUS_CHECK_CONDITION);
        assert_eq!(c.sense(), (CC_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT));
    }

    #[test]
    fn media_change_attention() {
        let mut c = ScsiTargetCdrom::default();
        c.insert_image(vec![0x11; 4096]);
        assert_eq!(
            status(c.cmd(&[0, 0, 0, 0, 0, 0], None).unwrap()),
            STATUS_CHECK_CONDITION
        );
        assert_eq!(
            c.req_sense(),
            (CC_KEY_UNIT_ATTENTION, ASC_MEDIUM_MAY_HAVE_CHANGED)
        );
        assert_eq!(status(c.cmd(&[0, 0, 0, 0, 0, 0], None).unwrap()), STATUS_GOOD);
    }

    #[test]
    fn read_padded() {
        let mut c = ScsiTargetCdrom::default();
        c.insert_image(vec![0x11; 3000]);
        assert_eq!(c.blocks(), Some(2));
        let r = data_in(c.cmd(&[0x28, 0, 0, 0, 0, 1, 0, 0, 1, 0], None).unwrap());
        assert_eq!(r.len(), 2048);
        assert!(r[..952].iter().all(|&b| b == 0x11));
        assert!(r[952..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_toc() {
        let mut c = ScsiTargetCdrom::default();
        c.insert_image(vec![0; 2048 * 10]);
        let r = data_in(c.cmd(&[0x43, 0, 0, 0, 0, 0, 1, 0, 0xFF, 0], None).unwrap());
        assert_eq!(r.len(), 0x14);
        assert_eq!(r[14], TRACK_LEADOUT);
        assert_eq!(&r[16..20], &[0, 0, 0, 10]);

        let r = data_in(c.cmd(&[0x43, 0, 0, 0, 0, 0, 1, 0, 4, 0], None).unwrap());
        assert_eq!(r.len(), 4);

        let r = c.cmd(&[0x43, 0, 0, 0, 0, 0, 1, 0, 0xFF, 0x80], None).unwrap();
        assert_eq!(status(r), STATUS_CHECK_CONDITION);
    }

    #[test]
    fn eject() {
        let mut c = ScsiTargetCdrom::default();
        c.insert_image(vec![0; 2048]);
        assert_eq!(
            status(c.cmd(&[0x1B, 0, 0, 0, 0x02, 0], None).unwrap()),
            STATUS_GOOD
        );
        assert_eq!(c.take_event(), Some(ScsiTargetEvent::MediaEjected));
        assert_eq!(c.take_event(), None);
        assert!(c.image_fn().is_none());
    }

    #[test]
    fn blocksize_select() {
        let mut c = ScsiTargetCdrom::default();
        c.insert_image(vec![0; 4096]);
        let mut params = vec![0; 12];
        params[3] = 8;
        params[10] = 0x02;
        let cdb = [0x15, 0, 0, 0, 12, 0];
        assert!(matches!(
            c.cmd(&cdb, None).unwrap(),
            ScsiCmdResult::DataOut(12)
        ));
        assert_eq!(status(c.cmd(&cdb, Some(&params)).unwrap()), STATUS_GOOD);
        assert_eq!(c.blocks(), Some(8));

        params[10] = 0x03;
        assert_eq!(
            status(c.cmd(&cdb, Some(&params)).unwrap()),
            STATUS_CHECK_CONDITION
        );
    }

    #[test]
    fn cdb_length() {
        assert_eq!(ScsiTargetCdrom::new(false).cdb_len(), 12);
        assert_eq!(ScsiTargetCdrom::new(true).cdb_len(), 16);
    }
}
