//! Logical unit: a backend target plus the two-stage command completion state

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use super::registry::UnitKind;
use super::target::{ScsiTarget, ScsiTargetEvent, ScsiTargetType};
use super::{
    ASC_INTERNAL_TARGET_FAILURE, CC_KEY_HARDWARE_ERROR, SENSE_LEN, STATUS_CHECK_CONDITION,
    STATUS_GOOD, ScsiCmdResult, sense_data,
};

const LUN_TRACE: bool = false;

/// Bus phase the unit wants next
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum UnitPhase {
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
}

/// Whether the command still needs `advance()` calls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    MorePending,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
enum Stage {
    Idle,
    /// Data phase outstanding
    Transfer,
    /// Status known, sense not yet latched
    Finalize,
    Done,
}

pub struct LogicalUnit {
    target: Box<dyn ScsiTarget>,
    kind: UnitKind,

    /// Command data buffer (both directions)
    buffer: Vec<u8>,

    /// Amount of data the target expects to transfer
    init_length: usize,

    /// Current CDB
    cdb: ArrayVec<u8, 16>,

    status: u8,
    phase: UnitPhase,
    stage: Stage,

    /// Sense latched on completion of a failed command
    sense: Option<(u8, u16)>,
}

impl LogicalUnit {
    pub fn new(target: Box<dyn ScsiTarget>) -> Self {
        let kind = match target.target_type() {
            ScsiTargetType::Disk => UnitKind::Disk,
            ScsiTargetType::Cdrom => UnitKind::Optical,
        };
        Self {
            target,
            kind,
            buffer: vec![],
            init_length: 0,
            cdb: ArrayVec::new(),
            status: STATUS_GOOD,
            phase: UnitPhase::Status,
            stage: Stage::Idle,
            sense: None,
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn target(&self) -> &dyn ScsiTarget {
        self.target.as_ref()
    }

    pub fn target_mut(&mut self) -> &mut dyn ScsiTarget {
        self.target.as_mut()
    }

    /// Starts a command. A CDB is latched up to the unit's CDB length.
    pub fn execute(&mut self, cdb: &[u8]) {
        let len = cdb.len().min(self.cdb_length()).min(self.cdb.capacity());
        self.cdb.clear();
        self.cdb.extend(cdb[..len].iter().copied());
        self.sense = None;
        self.buffer.clear();
        self.init_length = 0;

        if LUN_TRACE {
            log::debug!("{:?} command: {:02X?}", self.kind, self.cdb);
        }

        match self.target.cmd(&self.cdb, None) {
            Ok(ScsiCmdResult::Status(s)) => {
                self.status = s;
                self.phase = UnitPhase::Status;
                self.stage = Stage::Finalize;
            }
            Ok(ScsiCmdResult::DataIn(data)) => {
                self.status = STATUS_GOOD;
                self.init_length = data.len();
                self.buffer = data;
                self.phase = UnitPhase::DataIn;
                self.stage = Stage::Transfer;
            }
            Ok(ScsiCmdResult::DataOut(len)) => {
                self.status = STATUS_GOOD;
                self.init_length = len;
                self.buffer = vec![0; len];
                self.phase = UnitPhase::DataOut;
                self.stage = Stage::Transfer;
            }
            Err(e) => {
                log::error!("SCSI command ({:02X?}) error: {:#}", self.cdb, e);
                self.fail();
            }
        }
    }

    fn fail(&mut self) {
        self.target
            .set_cc(CC_KEY_HARDWARE_ERROR, ASC_INTERNAL_TARGET_FAILURE);
        self.status = STATUS_CHECK_CONDITION;
        self.phase = UnitPhase::Status;
        self.stage = Stage::Finalize;
    }

    /// Performs the next completion stage.
    ///
    /// The first call after a data phase completes it (a DATA OUT command
    /// consumes the buffer here), the next latches sense for a failed
    /// command.
    pub fn advance(&mut self) {
        match self.stage {
            Stage::Transfer => {
                if self.phase == UnitPhase::DataOut {
                    let outdata = std::mem::take(&mut self.buffer);
                    match self.target.cmd(&self.cdb, Some(&outdata)) {
                        Ok(ScsiCmdResult::Status(s)) => self.status = s,
                        Ok(_) => {
                            log::warn!("Target requested another data phase for {:02X?}", self.cdb);
                            self.status = STATUS_GOOD;
                        }
                        Err(e) => {
                            log::error!("SCSI command ({:02X?}) error: {:#}", self.cdb, e);
                            self.fail();
                        }
                    }
                    self.buffer = outdata;
                }
                self.phase = UnitPhase::Status;
                self.stage = Stage::Finalize;
            }
            Stage::Finalize => {
                if self.status == STATUS_CHECK_CONDITION {
                    self.sense = Some(self.target.sense());
                }
                self.stage = Stage::Done;
            }
            Stage::Idle | Stage::Done => (),
        }
    }

    /// Drops the rest of the command without delivering outstanding data
    pub fn abort(&mut self) {
        self.buffer.clear();
        self.phase = UnitPhase::Status;
        self.stage = Stage::Done;
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn phase(&self) -> UnitPhase {
        self.phase
    }

    pub fn progress(&self) -> Progress {
        match self.stage {
            Stage::Transfer | Stage::Finalize => Progress::MorePending,
            Stage::Idle | Stage::Done => Progress::Complete,
        }
    }

    pub fn init_length(&self) -> usize {
        self.init_length
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn cdb_length(&self) -> usize {
        self.target.cdb_len()
    }

    /// log2 of the block size
    pub fn block_shift(&self) -> u32 {
        match self.kind {
            UnitKind::Optical => 11,
            _ => 9,
        }
    }

    /// Last addressable block and block size
    pub fn read_capacity(&self) -> Option<(u32, u32)> {
        let blocks = self.target.blocks()?;
        let blocksize = self.target.blocksize()?;
        Some(((blocks as u32).saturating_sub(1), blocksize as u32))
    }

    /// Current sense data without clearing it
    pub fn sense_buffer(&self) -> Vec<u8> {
        let (key, asc) = self.sense.unwrap_or_else(|| self.target.sense());
        sense_data(key, asc, SENSE_LEN)
    }

    /// Produces `len` bytes of sense data and clears the pending condition
    pub fn request_sense(&mut self, len: usize) -> Vec<u8> {
        let pending = self.target.req_sense();
        let (key, asc) = self.sense.take().unwrap_or(pending);
        sense_data(key, asc, len)
    }

    pub fn take_event(&mut self) -> Option<ScsiTargetEvent> {
        self.target.take_event()
    }

    pub fn reset(&mut self) {
        self.target.reset();
        self.buffer.clear();
        self.init_length = 0;
        self.status = STATUS_GOOD;
        self.phase = UnitPhase::Status;
        self.stage = Stage::Idle;
        self.sense = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::cdrom::ScsiTargetCdrom;
    use crate::scsi::disk::ScsiTargetDisk;
    use crate::scsi::{ASC_LBA_OUT_OF_RANGE, CC_KEY_ILLEGAL_REQUEST};

    fn disk_unit() -> LogicalUnit {
        LogicalUnit::new(Box::new(ScsiTargetDisk::new(32)))
    }

    #[test]
    fn data_in_two_stage() {
        let mut lun = disk_unit();
        lun.execute(&[0x12, 0, 0, 0, 36, 0]);
        assert_eq!(lun.status(), STATUS_GOOD);
        assert_eq!(lun.phase(), UnitPhase::DataIn);
        assert_eq!(lun.progress(), Progress::MorePending);
        assert_eq!(lun.init_length(), 36);
        assert_eq!(lun.buffer().len(), 36);

        lun.advance();
        assert_eq!(lun.phase(), UnitPhase::Status);
        assert_eq!(lun.progress(), Progress::MorePending);
        lun.advance();
        assert_eq!(lun.progress(), Progress::Complete);
        assert_eq!(lun.status(), STATUS_GOOD);
    }

    #[test]
    fn data_out_consumed_on_advance() {
        let mut lun = disk_unit();
        lun.execute(&[0x0A, 0, 0, 3, 1, 0]);
        assert_eq!(lun.phase(), UnitPhase::DataOut);
        assert_eq!(lun.init_length(), 512);
        lun.buffer_mut().fill(0xA5);
        lun.advance();
        lun.advance();
        assert_eq!(lun.status(), STATUS_GOOD);

        lun.execute(&[0x08, 0, 0, 3, 1, 0]);
        assert!(lun.buffer().iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn check_condition_latches_sense() {
        let mut lun = disk_unit();
        lun.execute(&[0x08, 0, 0, 40, 1, 0]);
        assert_eq!(lun.status(), STATUS_CHECK_CONDITION);
        assert_eq!(lun.phase(), UnitPhase::Status);
        lun.advance();
        assert_eq!(lun.progress(), Progress::Complete);

        let sense = lun.sense_buffer();
        assert_eq!(sense.len(), SENSE_LEN);
        assert_eq!(sense[2], CC_KEY_ILLEGAL_REQUEST);

        let sense = lun.request_sense(14);
        assert_eq!(sense.len(), 14);
        assert_eq!(
            u16::from_be_bytes([sense[12], sense[13]]),
            ASC_LBA_OUT_OF_RANGE
        );
        // Consumed
        assert_eq!(lun.request_sense(14)[2], 0);
    }

    #[test]
    fn abort_drops_data_out() {
        let mut lun = disk_unit();
        lun.execute(&[0x0A, 0, 0, 3, 1, 0]);
        lun.buffer_mut().fill(0xA5);
        lun.abort();
        lun.advance();
        assert_eq!(lun.progress(), Progress::Complete);
        lun.execute(&[0x08, 0, 0, 3, 1, 0]);
        assert!(lun.buffer().iter().all(|&b| b == 0));
    }

    #[test]
    fn short_cdb_fails() {
        let mut lun = disk_unit();
        lun.execute(&[0x28, 0, 0]);
        assert_eq!(lun.status(), STATUS_CHECK_CONDITION);
        lun.advance();
        assert_eq!(lun.sense_buffer()[2], CC_KEY_HARDWARE_ERROR);
    }

    #[test]
    fn optical_geometry() {
        let mut cd = ScsiTargetCdrom::default();
        cd.insert_image(vec![0; 2048 * 4]);
        let lun = LogicalUnit::new(Box::new(cd));
        assert_eq!(lun.kind(), UnitKind::Optical);
        assert_eq!(lun.block_shift(), 11);
        assert_eq!(lun.read_capacity(), Some((3, 2048)));
        assert_eq!(disk_unit().block_shift(), 9);
        assert_eq!(disk_unit().read_capacity(), Some((31, 512)));
    }
}
