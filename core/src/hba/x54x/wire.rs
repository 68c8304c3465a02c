//! Guest-visible mailbox and CCB layouts

use num_derive::{FromPrimitive, ToPrimitive};
use proc_bitfield::bitfield;

use crate::bus::Address;
use crate::dma::{AddressWidth, DataDescriptor, u32_to_addr24};

/// Outgoing mailbox action codes
pub const MBO_FREE: u8 = 0x00;
pub const MBO_START: u8 = 0x01;
pub const MBO_ABORT: u8 = 0x02;

/// Incoming mailbox completion codes
pub const MBI_SUCCESS: u8 = 0x01;
pub const MBI_NOT_FOUND: u8 = 0x03;
pub const MBI_ERROR: u8 = 0x04;

/// CCB host adapter status
pub const HS_COMPLETE: u8 = 0x00;
pub const HS_SELECTION_TIMEOUT: u8 = 0x11;
pub const HS_BAD_MBO_COMMAND: u8 = 0x15;
pub const HS_INVALID_OP_CODE: u8 = 0x16;
pub const HS_INVALID_DIRECTION: u8 = 0x18;
pub const HS_INVALID_CCB: u8 = 0x1A;
pub const HS_ABORT_NOT_FOUND: u8 = 0x26;

/// Transfer direction bits of the CCB control field
pub const CTRL_DIR_BY_CDB: u8 = 0;
pub const CTRL_DATA_IN: u8 = 1;
pub const CTRL_DATA_OUT: u8 = 2;
pub const CTRL_NO_TRANSFER: u8 = 3;

pub const CCB_LEN_24: usize = 30;
pub const CCB_LEN_32: usize = 40;
pub const CCB_CDB_LEN: usize = 12;

/// Offset of the data length field, rewritten with the residual
pub const CCB_DATA_LEN_OFFSET: Address = 4;
/// Start of the 4-byte window holding host and target status
pub const CCB_STATUS_OFFSET: Address = 0x0C;
const CCB_CDB_OFFSET: usize = 18;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
pub enum CcbOpcode {
    Initiator = 0x00,
    Target = 0x01,
    ScatterGather = 0x02,
    InitiatorResidual = 0x03,
    ScatterGatherResidual = 0x04,
    BusReset = 0x81,
}

impl CcbOpcode {
    pub const fn scatter_gather(self) -> bool {
        matches!(self, Self::ScatterGather | Self::ScatterGatherResidual)
    }

    pub const fn residual(self) -> bool {
        matches!(self, Self::InitiatorResidual | Self::ScatterGatherResidual)
    }
}

bitfield! {
    /// Byte 1 of a CCB
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CcbAddress(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub lun: u8 @ 0..=2,
        pub control: u8 @ 3..=4,
        pub id: u8 @ 5..=7,
    }
}

bitfield! {
    /// Byte 17 of a 32-bit CCB
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CcbLun32(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub lun: u8 @ 0..=4,
        pub tag_enable: bool @ 5,
        pub tag: u8 @ 6..=7,
    }
}

/// Command Control Block, as read from guest memory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ccb {
    pub opcode: u8,
    pub control: u8,
    pub target: u8,
    pub lun: u8,
    pub cdb_len: u8,
    /// Raw request sense length field, see [`Ccb::sense_len`]
    pub sense_len_raw: u8,
    pub data_len: u32,
    pub data_ptr: u32,
    pub link_ptr: u32,
    pub link_id: u8,
    pub host_status: u8,
    pub target_status: u8,
    pub cdb: [u8; CCB_CDB_LEN],
    /// Separate sense buffer pointer (32-bit layout only)
    pub sense_ptr: u32,
}

impl Ccb {
    pub const fn wire_len(width: AddressWidth) -> usize {
        match width {
            AddressWidth::Bits24 => CCB_LEN_24,
            AddressWidth::Bits32 => CCB_LEN_32,
        }
    }

    pub fn decode(width: AddressWidth, b: &[u8]) -> Self {
        let addr = CcbAddress(b[1]);
        let mut cdb = [0; CCB_CDB_LEN];
        cdb.copy_from_slice(&b[CCB_CDB_OFFSET..(CCB_CDB_OFFSET + CCB_CDB_LEN)]);

        match width {
            AddressWidth::Bits24 => Self {
                opcode: b[0],
                control: addr.control(),
                target: addr.id(),
                lun: addr.lun(),
                cdb_len: b[2],
                sense_len_raw: b[3],
                data_len: width.decode(&b[4..7]),
                data_ptr: width.decode(&b[7..10]),
                link_ptr: width.decode(&b[10..13]),
                link_id: b[13],
                host_status: b[14],
                target_status: b[15],
                cdb,
                sense_ptr: 0,
            },
            AddressWidth::Bits32 => Self {
                opcode: b[0],
                control: addr.control(),
                target: b[16],
                lun: CcbLun32(b[17]).lun(),
                cdb_len: b[2],
                sense_len_raw: b[3],
                data_len: width.decode(&b[4..8]),
                data_ptr: width.decode(&b[8..12]),
                link_ptr: 0,
                link_id: 0,
                host_status: b[14],
                target_status: b[15],
                cdb,
                sense_ptr: width.decode(&b[36..40]),
            },
        }
    }

    pub fn encode(&self, width: AddressWidth) -> Vec<u8> {
        let mut b = vec![0; Self::wire_len(width)];
        b[0] = self.opcode;
        b[2] = self.cdb_len;
        b[3] = self.sense_len_raw;
        b[14] = self.host_status;
        b[15] = self.target_status;
        b[CCB_CDB_OFFSET..(CCB_CDB_OFFSET + CCB_CDB_LEN)].copy_from_slice(&self.cdb);

        match width {
            AddressWidth::Bits24 => {
                b[1] = CcbAddress(0)
                    .with_lun(self.lun)
                    .with_control(self.control)
                    .with_id(self.target)
                    .0;
                width.encode(self.data_len, &mut b[4..7]);
                width.encode(self.data_ptr, &mut b[7..10]);
                width.encode(self.link_ptr, &mut b[10..13]);
                b[13] = self.link_id;
            }
            AddressWidth::Bits32 => {
                b[1] = CcbAddress(0).with_control(self.control).0;
                width.encode(self.data_len, &mut b[4..8]);
                width.encode(self.data_ptr, &mut b[8..12]);
                b[16] = self.target;
                b[17] = CcbLun32(0).with_lun(self.lun).0;
                width.encode(self.sense_ptr, &mut b[36..40]);
            }
        }
        b
    }

    pub fn opcode(&self) -> Option<CcbOpcode> {
        num_traits::FromPrimitive::from_u8(self.opcode)
    }

    /// Number of sense bytes the guest asked for.
    ///
    /// 0 requests the legacy 14 bytes, 1 disables sense copying.
    pub const fn sense_len(&self) -> usize {
        match self.sense_len_raw {
            0 => 14,
            1 => 0,
            n => n as usize,
        }
    }

    /// Guest address of the sense area for a CCB at `ccb_addr`
    pub fn sense_addr(&self, width: AddressWidth, ccb_addr: Address) -> Address {
        match width {
            AddressWidth::Bits24 => ccb_addr
                .wrapping_add(CCB_CDB_OFFSET as Address)
                .wrapping_add(Address::from(self.cdb_len)),
            AddressWidth::Bits32 => self.sense_ptr,
        }
    }

    /// Describes the guest data buffer.
    ///
    /// For scatter/gather opcodes the data length is the size of the
    /// segment list in bytes.
    pub fn descriptor(&self, width: AddressWidth) -> DataDescriptor {
        match self.opcode() {
            Some(op) if op.scatter_gather() => {
                DataDescriptor::list(self.data_ptr, self.data_len, width)
            }
            _ => DataDescriptor::Flat {
                ptr: self.data_ptr,
                len: self.data_len,
            },
        }
    }
}

/// Outgoing mailbox entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxOut {
    pub ccb_ptr: u32,
    pub action: u8,
}

impl MailboxOut {
    pub fn decode(width: AddressWidth, b: &[u8]) -> Self {
        match width {
            AddressWidth::Bits24 => Self {
                action: b[0],
                ccb_ptr: width.decode(&b[1..4]),
            },
            AddressWidth::Bits32 => Self {
                ccb_ptr: width.decode(&b[0..4]),
                action: b[7],
            },
        }
    }

    pub fn encode(&self, width: AddressWidth) -> Vec<u8> {
        let mut b = vec![0; width.mailbox_len()];
        match width {
            AddressWidth::Bits24 => {
                b[0] = self.action;
                b[1..4].copy_from_slice(&u32_to_addr24(self.ccb_ptr));
            }
            AddressWidth::Bits32 => {
                width.encode(self.ccb_ptr, &mut b[0..4]);
                b[7] = self.action;
            }
        }
        b
    }

    /// Offset of the action code within an entry
    pub const fn action_offset(width: AddressWidth) -> Address {
        match width {
            AddressWidth::Bits24 => 0,
            AddressWidth::Bits32 => 7,
        }
    }
}

/// Incoming mailbox entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxIn {
    pub ccb_ptr: u32,
    pub host_status: u8,
    pub target_status: u8,
    pub completion: u8,
}

impl MailboxIn {
    pub fn decode(width: AddressWidth, b: &[u8]) -> Self {
        match width {
            // Statuses only live in the CCB for the short layout
            AddressWidth::Bits24 => Self {
                completion: b[0],
                ccb_ptr: width.decode(&b[1..4]),
                host_status: 0,
                target_status: 0,
            },
            AddressWidth::Bits32 => Self {
                ccb_ptr: width.decode(&b[0..4]),
                host_status: b[4],
                target_status: b[5],
                completion: b[7],
            },
        }
    }

    pub fn encode(&self, width: AddressWidth) -> Vec<u8> {
        let mut b = vec![0; width.mailbox_len()];
        match width {
            AddressWidth::Bits24 => {
                b[0] = self.completion;
                b[1..4].copy_from_slice(&u32_to_addr24(self.ccb_ptr));
            }
            AddressWidth::Bits32 => {
                width.encode(self.ccb_ptr, &mut b[0..4]);
                b[4] = self.host_status;
                b[5] = self.target_status;
                b[7] = self.completion;
            }
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_24() {
        let mbo = MailboxOut::decode(AddressWidth::Bits24, &[MBO_START, 0x01, 0x23, 0x45]);
        assert_eq!(mbo.action, MBO_START);
        assert_eq!(mbo.ccb_ptr, 0x012345);

        let mbi = MailboxIn {
            ccb_ptr: 0x00ABCDEF,
            host_status: HS_COMPLETE,
            target_status: 0,
            completion: MBI_SUCCESS,
        };
        assert_eq!(
            mbi.encode(AddressWidth::Bits24),
            vec![MBI_SUCCESS, 0xAB, 0xCD, 0xEF]
        );
    }

    #[test]
    fn mailbox_32() {
        let mbo = MailboxOut::decode(
            AddressWidth::Bits32,
            &[0x78, 0x56, 0x34, 0x12, 0, 0, 0, MBO_ABORT],
        );
        assert_eq!(mbo.ccb_ptr, 0x12345678);
        assert_eq!(mbo.action, MBO_ABORT);

        let mbi = MailboxIn {
            ccb_ptr: 0x12345678,
            host_status: HS_SELECTION_TIMEOUT,
            target_status: 2,
            completion: MBI_ERROR,
        };
        let b = mbi.encode(AddressWidth::Bits32);
        assert_eq!(b, vec![0x78, 0x56, 0x34, 0x12, 0x11, 0x02, 0x00, MBI_ERROR]);
        assert_eq!(MailboxIn::decode(AddressWidth::Bits32, &b), mbi);
    }

    #[test]
    fn ccb_24_layout() {
        let mut b = [0u8; CCB_LEN_24];
        b[0] = 0x03;
        // id 5, control 1 (in), lun 2
        b[1] = (5 << 5) | (1 << 3) | 2;
        b[2] = 6;
        b[3] = 0;
        b[4..7].copy_from_slice(&[0x00, 0x02, 0x00]);
        b[7..10].copy_from_slice(&[0x01, 0x00, 0x00]);
        b[18] = 0x08;

        let ccb = Ccb::decode(AddressWidth::Bits24, &b);
        assert_eq!(ccb.opcode(), Some(CcbOpcode::InitiatorResidual));
        assert_eq!(ccb.target, 5);
        assert_eq!(ccb.lun, 2);
        assert_eq!(ccb.control, CTRL_DATA_IN);
        assert_eq!(ccb.data_len, 0x200);
        assert_eq!(ccb.data_ptr, 0x10000);
        assert_eq!(ccb.cdb[0], 0x08);
        assert_eq!(ccb.sense_len(), 14);
        assert_eq!(ccb.sense_addr(AddressWidth::Bits24, 0x1000), 0x1000 + 18 + 6);
        assert_eq!(ccb.encode(AddressWidth::Bits24), b.to_vec());
    }

    #[test]
    fn ccb_32_layout() {
        let mut b = [0u8; CCB_LEN_32];
        b[0] = 0x02;
        b[1] = 2 << 3;
        b[2] = 10;
        b[3] = 1;
        b[4..8].copy_from_slice(&16u32.to_le_bytes());
        b[8..12].copy_from_slice(&0x0010_0000u32.to_le_bytes());
        b[16] = 12;
        b[17] = 0x23;
        b[36..40].copy_from_slice(&0x0020_0000u32.to_le_bytes());

        let ccb = Ccb::decode(AddressWidth::Bits32, &b);
        assert_eq!(ccb.opcode(), Some(CcbOpcode::ScatterGather));
        assert_eq!(ccb.control, CTRL_DATA_OUT);
        assert_eq!(ccb.target, 12);
        assert_eq!(ccb.lun, 3);
        assert_eq!(ccb.sense_len(), 0);
        assert_eq!(ccb.sense_addr(AddressWidth::Bits32, 0x1000), 0x0020_0000);
        assert_eq!(
            ccb.descriptor(AddressWidth::Bits32),
            DataDescriptor::List {
                ptr: 0x0010_0000,
                entries: 2
            }
        );
    }

    #[test]
    fn opcodes() {
        let mut ccb = Ccb::decode(AddressWidth::Bits24, &[0; CCB_LEN_24]);
        assert_eq!(ccb.opcode(), Some(CcbOpcode::Initiator));
        ccb.opcode = 0x81;
        assert_eq!(ccb.opcode(), Some(CcbOpcode::BusReset));
        ccb.opcode = 0x05;
        assert_eq!(ccb.opcode(), None);
        assert!(CcbOpcode::ScatterGatherResidual.scatter_gather());
        assert!(CcbOpcode::ScatterGatherResidual.residual());
        assert!(!CcbOpcode::Initiator.residual());
    }

    #[test]
    fn sense_len_encoding() {
        let mut ccb = Ccb::decode(AddressWidth::Bits24, &[0; CCB_LEN_24]);
        assert_eq!(ccb.sense_len(), 14);
        ccb.sense_len_raw = 1;
        assert_eq!(ccb.sense_len(), 0);
        ccb.sense_len_raw = 8;
        assert_eq!(ccb.sense_len(), 8);
    }
}
