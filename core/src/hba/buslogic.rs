//! BusLogic BT-542/545/958 personality of the x54x engine

use anyhow::{Result, bail};
use proc_bitfield::bitfield;

use crate::bus::{Address, HostContext};
use crate::config::{BusLogicConfig, BusLogicModel};
use crate::debuggable::*;
use crate::dma::{self, AddressWidth, DataDescriptor, Direction};
use crate::hba::completion::completion_code;
use crate::hba::x54x::wire::{
    CCB_CDB_LEN, CTRL_DATA_IN, CTRL_DATA_OUT, CTRL_DIR_BY_CDB, HS_COMPLETE,
    HS_INVALID_CCB, HS_SELECTION_TIMEOUT,
};
use crate::hba::x54x::{CmdOutcome, X54x, X54xCore, X54xVendor};
use crate::scsi::lun::UnitPhase;
use crate::scsi::registry::{MAX_LUNS, MAX_TARGETS};
use crate::scsi::{STATUS_CHECK_CONDITION, STATUS_GOOD};
use crate::{dbgprop_bool, dbgprop_enum, dbgprop_udec};

const BUSLOGIC_TRACE: bool = false;

const CMD_RESET: u8 = 0x20;
const CMD_INQUIRE_TARGETS_8_15: u8 = 0x23;
const CMD_INSTALLED_DEVICES: u8 = 0x24;
const CMD_INTERRUPT_ENABLE: u8 = 0x25;
const CMD_MBINIT_EXTENDED: u8 = 0x81;
const CMD_EXECUTE_SCSI: u8 = 0x83;
const CMD_FW_REV_DIGIT: u8 = 0x84;
const CMD_FW_REV_LETTER: u8 = 0x85;
const CMD_MODEL_NUMBER: u8 = 0x8B;
const CMD_SYNC_PERIOD: u8 = 0x8C;
const CMD_EXTENDED_SETUP: u8 = 0x8D;
const CMD_ROUND_ROBIN: u8 = 0x8F;
const CMD_STORE_LOCAL_RAM: u8 = 0x90;
const CMD_FETCH_LOCAL_RAM: u8 = 0x91;
const CMD_AUTOSCSI: u8 = 0x92;
const CMD_EXTENDED_LUN: u8 = 0x96;

/// Fixed part of the direct execute command, the CDB follows
const ESCMD_HEADER_LEN: usize = 12;

/// AutoSCSI block location and size in local RAM
pub const AUTOSCSI_OFFSET: usize = 64;
pub const AUTOSCSI_LEN: usize = 64;

// Field offsets within the AutoSCSI block
const AS_SIGNATURE: usize = 0;
const AS_INFO_LEN: usize = 2;
const AS_ADAPTER_TYPE: usize = 3;
const AS_RESERVED1: usize = 9;
const AS_FLAGS: usize = 10;
const AS_DMA: usize = 11;
const AS_IRQ: usize = 12;
const AS_DMA_RATE: usize = 13;
const AS_SCSI_ID: usize = 14;
const AS_SCSI_CONFIG: usize = 15;
const AS_BUS_ON: usize = 16;
const AS_BUS_OFF: usize = 17;
const AS_BIOS_CONFIG: usize = 18;
const AS_DEVICE_ENABLED: usize = 19;
const AS_WIDE_PERMITTED: usize = 21;
const AS_FAST_PERMITTED: usize = 23;
const AS_SYNC_PERMITTED: usize = 25;
const AS_DISCONNECT_PERMITTED: usize = 27;
const AS_BUS_OPTIONS: usize = 33;
const AS_MAX_LUN: usize = 41;
const AS_BOOT_OPTIONS: usize = 43;
const AS_SCAN_ORDER: usize = 45;

/// Offset of the vendor area in the setup information
const SETUP_VENDOR: usize = 17;

bitfield! {
    /// AutoSCSI byte 10
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct AutoScsiFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub floppy_enabled: bool @ 0,
        pub floppy_secondary: bool @ 1,
        pub level_sensitive: bool @ 2,
        pub bios_ram: u8 @ 5..=7,
    }
}

bitfield! {
    /// AutoSCSI byte 33
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct AutoScsiBusOptions(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub pci_pin: u8 @ 0..=1,
        pub io_port: u8 @ 2..=3,
        /// Set for aggressive round-robin
        pub round_robin: bool @ 4,
        pub vesa_fast: bool @ 5,
    }
}

bitfield! {
    /// Direction byte of the direct execute command
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EscmdControl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub direction: u8 @ 3..=4,
    }
}

pub struct BusLogic {
    config: BusLogicConfig,
    /// CCBs carry the wide LUN field
    extended_lun: bool,
    /// AutoSCSI block last saved by the guest
    nvram: Option<[u8; AUTOSCSI_LEN]>,
}

pub type BusLogicAdapter = X54x<BusLogic>;

impl BusLogic {
    pub fn new(config: BusLogicConfig) -> Self {
        Self {
            config,
            extended_lun: false,
            nvram: None,
        }
    }

    /// Creates the adapter with a previously saved AutoSCSI block
    pub fn with_nvram(config: BusLogicConfig, data: &[u8]) -> Result<Self> {
        if data.len() != AUTOSCSI_LEN {
            bail!("AutoSCSI image must be {} bytes, got {}", AUTOSCSI_LEN, data.len());
        }
        let mut nvram = [0; AUTOSCSI_LEN];
        nvram.copy_from_slice(data);
        Ok(Self {
            nvram: Some(nvram),
            ..Self::new(config)
        })
    }

    pub fn adapter(config: BusLogicConfig) -> BusLogicAdapter {
        X54x::new(Self::new(config))
    }

    pub fn model(&self) -> BusLogicModel {
        self.config.model
    }

    /// AutoSCSI block to persist, if the guest saved one
    pub fn nvram(&self) -> Option<&[u8]> {
        self.nvram.as_ref().map(|n| n.as_slice())
    }

    pub fn extended_lun(&self) -> bool {
        self.extended_lun
    }

    fn is_pci(&self) -> bool {
        self.config.model == BusLogicModel::Bt958d
    }

    fn model_name(&self) -> &'static [u8] {
        match self.config.model {
            BusLogicModel::Bt542bh => b"542BH",
            BusLogicModel::Bt545s => b"545S",
            BusLogicModel::Bt958d => b"958D",
        }
    }

    /// Factory AutoSCSI settings. `safe` selects the conservative set.
    fn autoscsi_defaults(&self, safe: bool) -> [u8; AUTOSCSI_LEN] {
        let pci = self.is_pci();
        let mut a = [0u8; AUTOSCSI_LEN];

        a[AS_SIGNATURE..(AS_SIGNATURE + 2)].copy_from_slice(b"FA");
        a[AS_INFO_LEN] = AUTOSCSI_LEN as u8;
        let name = self.model_name();
        a[AS_ADAPTER_TYPE..(AS_ADAPTER_TYPE + 6)].fill(b' ');
        a[(AS_ADAPTER_TYPE + 1)..(AS_ADAPTER_TYPE + 1 + name.len())].copy_from_slice(name);
        a[AS_RESERVED1] = 6;
        a[AS_FLAGS] = AutoScsiFlags(0)
            .with_level_sensitive(pci)
            .with_bios_ram(6)
            .0;

        if !pci {
            let dma = match self.config.dma {
                5 => 1,
                6 => 2,
                7 => 3,
                _ => 0,
            };
            let irq = match self.config.irq {
                9 => 1,
                10 => 2,
                11 => 3,
                12 => 4,
                14 => 5,
                15 => 6,
                _ => 0,
            };
            // Bit 7 selects auto configuration
            a[AS_DMA] = dma | 0x80;
            a[AS_IRQ] = irq | 0x80;
            a[AS_DMA_RATE] = 1;
            a[AS_BUS_ON] = 7;
            a[AS_BUS_OFF] = 4;
        }

        a[AS_SCSI_ID] = self.config.host_id & 0x0F;
        a[AS_SCSI_CONFIG] = 0x3F;
        a[AS_BIOS_CONFIG] = if safe { 0x32 } else { 0x36 };
        for field in [
            AS_DEVICE_ENABLED,
            AS_WIDE_PERMITTED,
            AS_FAST_PERMITTED,
            AS_DISCONNECT_PERMITTED,
        ] {
            a[field..(field + 2)].copy_from_slice(&0xFFFFu16.to_le_bytes());
        }
        a[AS_BUS_OPTIONS] = AutoScsiBusOptions(0)
            .with_io_port(2)
            .with_round_robin(safe)
            .with_vesa_fast(true)
            .0;
        a[AS_MAX_LUN] = (MAX_LUNS - 1) as u8;
        // INT 13h extension, CD-ROM boot and multi-boot
        a[AS_BOOT_OPTIONS] = if safe { 0 } else { 0x25 };
        a[AS_SCAN_ORDER] = 1;
        a
    }

    fn autoscsi(core: &X54xCore) -> &[u8] {
        &core.state.local_ram[AUTOSCSI_OFFSET..(AUTOSCSI_OFFSET + AUTOSCSI_LEN)]
    }

    fn set_autoscsi(core: &mut X54xCore, data: &[u8; AUTOSCSI_LEN]) {
        core.state.local_ram[AUTOSCSI_OFFSET..(AUTOSCSI_OFFSET + AUTOSCSI_LEN)]
            .copy_from_slice(data);
    }

    /// Runs a CDB without going through a CCB. Returns the 4-byte reply:
    /// completion code, reserved, host status, target status.
    fn execute_direct(&self, ctx: &mut HostContext<'_>, p: &[u8]) -> [u8; 4] {
        let data_len = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
        let data_ptr: Address = u32::from_le_bytes([p[4], p[5], p[6], p[7]]);
        let (target, lun) = (p[8], p[9]);
        let control = EscmdControl(p[10]).direction();
        let cdb_len = usize::from(p[11]);

        if usize::from(target) >= MAX_TARGETS || usize::from(lun) >= MAX_LUNS {
            return [0, 0, HS_INVALID_CCB, STATUS_GOOD];
        }
        let Some(unit) = ctx.devices.resolve(target, lun) else {
            if BUSLOGIC_TRACE {
                log::debug!("{}: direct command to absent {}:{}", self.name(), target, lun);
            }
            return [0, 0, HS_SELECTION_TIMEOUT, STATUS_GOOD];
        };

        let mut cdb = vec![0; unit.cdb_length()];
        let cdb_bytes = &p[ESCMD_HEADER_LEN..];
        let len = cdb.len().min(cdb_len).min(cdb_bytes.len());
        cdb[..len].copy_from_slice(&cdb_bytes[..len]);
        unit.execute(&cdb);

        if unit.phase() != UnitPhase::Status {
            let dir = match (unit.phase(), control) {
                (UnitPhase::DataOut, CTRL_DIR_BY_CDB | CTRL_DATA_OUT) => Some(Direction::FromGuest),
                (UnitPhase::DataIn, CTRL_DIR_BY_CDB | CTRL_DATA_IN) => Some(Direction::ToGuest),
                _ => None,
            };
            if let Some(dir) = dir {
                if data_len > 0 {
                    let desc = DataDescriptor::Flat {
                        ptr: data_ptr,
                        len: data_len,
                    };
                    let buf = unit.buffer_mut();
                    let n = buf.len().min(data_len as usize);
                    if let Err(e) =
                        dma::transfer(&mut *ctx.mem, AddressWidth::Bits32, &desc, dir, &mut buf[..n], 0)
                    {
                        log::error!("{}: direct command data {:?}: {}", self.name(), dir, e);
                    }
                }
            }
            unit.advance();
        }
        unit.advance();

        let status = unit.status();
        let code = if status == STATUS_CHECK_CONDITION {
            completion_code(&unit.sense_buffer())
        } else {
            0
        };
        [code, 0, HS_COMPLETE, status]
    }
}

impl X54xVendor for BusLogic {
    fn name(&self) -> &'static str {
        match self.config.model {
            BusLogicModel::Bt542bh => "BT-542BH",
            BusLogicModel::Bt545s => "BT-545S",
            BusLogicModel::Bt958d => "BT-958D",
        }
    }

    fn fw_rev(&self) -> &'static [u8] {
        match self.config.model {
            BusLogicModel::Bt542bh => b"AA335",
            BusLogicModel::Bt545s => b"AA421E",
            BusLogicModel::Bt958d => b"AA507B",
        }
    }

    fn host_id(&self) -> u8 {
        self.config.host_id
    }

    fn irq(&self) -> u8 {
        self.config.irq
    }

    fn dma(&self) -> u8 {
        self.config.dma
    }

    fn max_target(&self) -> u8 {
        if self.is_pci() { 15 } else { 7 }
    }

    fn bus_rate(&self) -> u64 {
        match self.config.model {
            BusLogicModel::Bt542bh => 5_000_000,
            BusLogicModel::Bt545s => 10_000_000,
            BusLogicModel::Bt958d => 20_000_000,
        }
    }

    fn geometry_writable(&self) -> bool {
        true
    }

    fn param_len(&self, cmd: u8) -> usize {
        match cmd {
            CMD_INTERRUPT_ENABLE
            | CMD_MODEL_NUMBER
            | CMD_SYNC_PERIOD
            | CMD_EXTENDED_SETUP
            | CMD_ROUND_ROBIN
            | CMD_AUTOSCSI
            | CMD_EXTENDED_LUN => 1,
            CMD_MBINIT_EXTENDED => 5,
            CMD_EXECUTE_SCSI => ESCMD_HEADER_LEN,
            CMD_STORE_LOCAL_RAM | CMD_FETCH_LOCAL_RAM => 2,
            _ => 0,
        }
    }

    fn param_received(&mut self, core: &mut X54xCore) {
        // Both commands announce a variable tail in their fixed header
        match (core.command, core.params.len()) {
            (Some(CMD_EXECUTE_SCSI), ESCMD_HEADER_LEN) => {
                core.param_left = usize::from(core.params[11]).min(CCB_CDB_LEN);
            }
            (Some(CMD_STORE_LOCAL_RAM), 2) => core.param_left = usize::from(core.params[1]),
            _ => (),
        }
    }

    fn command(&mut self, core: &mut X54xCore, ctx: &mut HostContext<'_>, cmd: u8) -> CmdOutcome {
        let p = core.params.clone();
        if BUSLOGIC_TRACE {
            log::debug!("{}: command {:02X} {:02X?}", self.name(), cmd, p);
        }
        let host_id = self.host_id();
        let max_target = self.max_target();

        match cmd {
            CMD_RESET => return CmdOutcome::Reset,
            CMD_INQUIRE_TARGETS_8_15 => {
                let mut reply = [0u8; 8];
                for (i, r) in reply.iter_mut().enumerate() {
                    let id = (i + 8) as u8;
                    if id <= max_target && id != host_id && ctx.devices.target_present(id) {
                        *r = 1;
                    }
                }
                core.set_reply(&reply);
            }
            CMD_INSTALLED_DEVICES => {
                let mask = (0..=max_target)
                    .filter(|&id| id != host_id && ctx.devices.target_present(id))
                    .fold(0u16, |m, id| m | (1 << id));
                core.set_reply(&mask.to_le_bytes());
            }
            CMD_INTERRUPT_ENABLE => {
                core.state.irq_enabled = p[0] != 0;
                return CmdOutcome::Silent;
            }
            CMD_MBINIT_EXTENDED => {
                let base = u32::from_le_bytes([p[1], p[2], p[3], p[4]]);
                core.init_mailboxes(AddressWidth::Bits32, p[0], base);
            }
            CMD_EXECUTE_SCSI => {
                let reply = self.execute_direct(ctx, &p);
                core.set_reply(&reply);
            }
            CMD_FW_REV_DIGIT => core.set_reply(&[self.fw_rev()[4]]),
            CMD_FW_REV_LETTER => {
                let letter = self.fw_rev().get(5).copied().unwrap_or(b' ');
                core.set_reply(&[letter]);
            }
            CMD_MODEL_NUMBER => {
                let mut reply = vec![0; usize::from(p[0])];
                let name = &Self::autoscsi(core)[(AS_ADAPTER_TYPE + 1)..(AS_ADAPTER_TYPE + 6)];
                let n = reply.len().min(self.model_name().len());
                reply[..n].copy_from_slice(&name[..n]);
                core.set_reply(&reply);
            }
            CMD_SYNC_PERIOD => core.set_reply(&vec![0; usize::from(p[0])]),
            CMD_EXTENDED_SETUP => {
                let mut data = [0u8; 14];
                data[0] = if self.is_pci() { b'E' } else { b'A' };
                // BIOS segment D800
                data[1] = 0xD8;
                data[2..4].copy_from_slice(&8192u16.to_le_bytes());
                data[4] = core.state.count as u8;
                data[5..9].copy_from_slice(&core.state.out_base.to_le_bytes());
                if self.config.model != BusLogicModel::Bt542bh
                    && AutoScsiFlags(Self::autoscsi(core)[AS_FLAGS]).level_sensitive()
                {
                    data[9] |= 0x40;
                }
                let rev = self.fw_rev();
                data[10..13].copy_from_slice(&rev[(rev.len() - 3)..]);
                // Wide, and ultra for PCI
                data[13] = 0x01 | if self.is_pci() { 0x08 } else { 0 };

                let mut reply = vec![0; usize::from(p[0])];
                let n = reply.len().min(data.len());
                reply[..n].copy_from_slice(&data[..n]);
                core.set_reply(&reply);
            }
            CMD_ROUND_ROBIN => core.state.aggressive = p[0] & 1 != 0,
            CMD_STORE_LOCAL_RAM => {
                let off = usize::from(p[0]);
                for (i, &b) in p[2..].iter().enumerate() {
                    core.state.local_ram[(off + i) & 0xFF] = b;
                }
            }
            CMD_FETCH_LOCAL_RAM => {
                let (off, len) = (usize::from(p[0]), usize::from(p[1]));
                let data: Vec<u8> = (0..len)
                    .map(|i| core.state.local_ram[(off + i) & 0xFF])
                    .collect();
                core.set_reply(&data);
            }
            CMD_AUTOSCSI => {
                if self.config.model == BusLogicModel::Bt542bh {
                    return CmdOutcome::Invalid;
                }
                match p[0] {
                    0 | 2 => Self::set_autoscsi(core, &self.autoscsi_defaults(false)),
                    3 => Self::set_autoscsi(core, &self.autoscsi_defaults(true)),
                    1 => {
                        let mut saved = [0; AUTOSCSI_LEN];
                        saved.copy_from_slice(Self::autoscsi(core));
                        self.nvram = Some(saved);
                    }
                    _ => return CmdOutcome::Invalid,
                }
            }
            CMD_EXTENDED_LUN => match p[0] {
                0 => self.extended_lun = false,
                1 => self.extended_lun = true,
                _ => (),
            },
            _ => return CmdOutcome::Invalid,
        }
        CmdOutcome::Done
    }

    fn setup_data(&self, core: &X54xCore, data: &mut [u8]) {
        let autoscsi = Self::autoscsi(core);
        let sync = autoscsi[AS_SYNC_PERMITTED] | autoscsi[AS_SYNC_PERMITTED + 1] != 0;
        let parity = autoscsi[AS_SCSI_CONFIG] & 2 != 0;
        data[0] = u8::from(sync) | (u8::from(parity) << 1);

        let vendor = &mut data[SETUP_VENDOR..];
        vendor[0] = b'B';
        vendor[1] = b'D';
        vendor[2] = if self.is_pci() { b'F' } else { b'A' };
    }

    fn init(&mut self, core: &mut X54xCore) {
        let autoscsi = self.nvram.unwrap_or_else(|| self.autoscsi_defaults(false));
        Self::set_autoscsi(core, &autoscsi);
    }

    fn reset(&mut self, core: &mut X54xCore, hard: bool) {
        self.extended_lun = false;
        // Firmware comes up in aggressive round-robin mode
        if hard {
            core.state.aggressive = true;
        }
    }
}

impl Debuggable for BusLogic {
    fn get_debug_properties(&self) -> DebuggableProperties {
        vec![
            dbgprop_enum!("Model", self.config.model),
            dbgprop_udec!("Host ID", self.host_id()),
            dbgprop_udec!("IRQ", self.irq()),
            dbgprop_udec!("DMA", self.dma()),
            dbgprop_bool!("Extended LUN CCBs", self.extended_lun),
            dbgprop_bool!("AutoSCSI saved", self.nvram.is_some()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{IoDevice, IrqSource};
    use crate::dma::u32_to_addr24;
    use crate::hba::x54x::tests::{Bench, command, run};
    use crate::hba::x54x::wire::{Ccb, MBI_ERROR, MBI_SUCCESS, MBO_START, MailboxIn, MailboxOut};
    use crate::scsi::disk::ScsiTargetDisk;

    fn config(model: BusLogicModel) -> BusLogicConfig {
        BusLogicConfig {
            model,
            ..Default::default()
        }
    }

    fn escmd(target: u8, control: u8, data_len: u32, cdb: &[u8]) -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&data_len.to_le_bytes());
        p.extend_from_slice(&0x3000u32.to_le_bytes());
        p.extend_from_slice(&[target, 0, EscmdControl(0).with_direction(control).0]);
        p.push(cdb.len() as u8);
        p.extend_from_slice(cdb);
        p
    }

    #[test]
    fn firmware_revision() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        assert_eq!(command(&mut hba, &mut bench, 0x04, &[]), b"AA42");
        assert_eq!(command(&mut hba, &mut bench, CMD_FW_REV_DIGIT, &[]), b"1");
        assert_eq!(command(&mut hba, &mut bench, CMD_FW_REV_LETTER, &[]), b"E");

        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt542bh));
        assert_eq!(command(&mut hba, &mut bench, CMD_FW_REV_LETTER, &[]), b" ");
    }

    #[test]
    fn model_number() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        assert_eq!(command(&mut hba, &mut bench, CMD_MODEL_NUMBER, &[6]), b"545S\0\0");
        assert_eq!(command(&mut hba, &mut bench, CMD_MODEL_NUMBER, &[2]), b"54");

        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt542bh));
        assert_eq!(command(&mut hba, &mut bench, CMD_MODEL_NUMBER, &[6]), b"542BH\0");
    }

    #[test]
    fn setup_information() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt958d));
        let reply = command(&mut hba, &mut bench, 0x0D, &[20]);
        assert_eq!(reply.len(), 20);
        // Parity checking on, synchronous negotiation off
        assert_eq!(reply[0], 0x02);
        assert_eq!(&reply[17..20], b"BDF");

        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        assert_eq!(&command(&mut hba, &mut bench, 0x0D, &[20])[17..20], b"BDA");
    }

    #[test]
    fn extended_setup() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt958d));
        command(&mut hba, &mut bench, CMD_MBINIT_EXTENDED, &[4, 0x00, 0x00, 0x01, 0x00]);
        let reply = command(&mut hba, &mut bench, CMD_EXTENDED_SETUP, &[16]);
        assert_eq!(
            reply,
            vec![
                b'E', 0xD8, 0x00, 0x20, 4, 0x00, 0x00, 0x01, 0x00, 0x40, b'0', b'7', b'B', 0x09,
                0, 0
            ]
        );

        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt542bh));
        let reply = command(&mut hba, &mut bench, CMD_EXTENDED_SETUP, &[14]);
        assert_eq!(reply[0], b'A');
        assert_eq!(reply[9], 0);
        assert_eq!(&reply[10..13], b"335");
        assert_eq!(reply[13], 0x01);
    }

    #[test]
    fn installed_devices() {
        let mut bench = Bench::new();
        bench
            .devices
            .attach(9, 0, Box::new(ScsiTargetDisk::new(8)))
            .unwrap();

        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt958d));
        assert_eq!(command(&mut hba, &mut bench, CMD_INSTALLED_DEVICES, &[]), vec![0x05, 0x02]);
        assert_eq!(
            command(&mut hba, &mut bench, CMD_INQUIRE_TARGETS_8_15, &[]),
            vec![0, 1, 0, 0, 0, 0, 0, 0]
        );

        // Narrow adapters do not see the wide IDs
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        assert_eq!(command(&mut hba, &mut bench, CMD_INSTALLED_DEVICES, &[]), vec![0x05, 0x00]);
        assert_eq!(
            command(&mut hba, &mut bench, CMD_INQUIRE_TARGETS_8_15, &[]),
            vec![0; 8]
        );
    }

    #[test]
    fn interrupt_enable() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        command(&mut hba, &mut bench, CMD_INTERRUPT_ENABLE, &[0]);
        assert!(!hba.state().irq_enabled);
        assert!(!hba.get_irq());

        command(&mut hba, &mut bench, 0x00, &[]);
        assert!(hba.core().intr.hacc());
        assert!(!hba.get_irq());

        command(&mut hba, &mut bench, CMD_INTERRUPT_ENABLE, &[1]);
        assert!(hba.state().irq_enabled);
    }

    #[test]
    fn local_ram() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        assert_eq!(command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[64, 2]), b"FA");
        assert_eq!(command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[64 + 3, 6]), b" 545S ");

        command(&mut hba, &mut bench, CMD_STORE_LOCAL_RAM, &[0x10, 3, 1, 2, 3]);
        assert!(hba.core().status.idle());
        assert_eq!(
            command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[0x0F, 5]),
            vec![0, 1, 2, 3, 0]
        );
        // Offsets wrap within the 256 bytes
        command(&mut hba, &mut bench, CMD_STORE_LOCAL_RAM, &[0xFF, 2, 0xAA, 0xBB]);
        assert_eq!(command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[0xFF, 2]), vec![0xAA, 0xBB]);
    }

    #[test]
    fn autoscsi_defaults() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        let a = command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[64, 64]);
        assert_eq!(a[AS_INFO_LEN], 64);
        assert_eq!(a[AS_SCSI_ID], 7);
        assert_eq!(a[AS_SCSI_CONFIG], 0x3F);
        // IRQ 11, DMA 6, auto configured
        assert_eq!(a[AS_IRQ], 0x83);
        assert_eq!(a[AS_DMA], 0x82);
        assert_eq!((a[AS_BUS_ON], a[AS_BUS_OFF]), (7, 4));
        assert_eq!(a[AS_MAX_LUN], 7);
        assert!(!AutoScsiBusOptions(a[AS_BUS_OPTIONS]).round_robin());

        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt958d));
        let a = command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[64, 64]);
        assert!(AutoScsiFlags(a[AS_FLAGS]).level_sensitive());
        assert_eq!(a[AS_IRQ], 0);
        assert_eq!((a[AS_BUS_ON], a[AS_BUS_OFF]), (0, 0));
    }

    #[test]
    fn autoscsi_save_and_restore() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        command(&mut hba, &mut bench, CMD_STORE_LOCAL_RAM, &[64 + AS_SCSI_ID as u8, 1, 5]);
        command(&mut hba, &mut bench, CMD_AUTOSCSI, &[1]);
        let saved = hba.vendor().nvram().unwrap().to_vec();
        assert_eq!(saved[AS_SCSI_ID], 5);

        // Factory defaults
        command(&mut hba, &mut bench, CMD_AUTOSCSI, &[0]);
        assert_eq!(command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[64 + 14, 1]), vec![7]);
        command(&mut hba, &mut bench, CMD_AUTOSCSI, &[3]);
        let a = command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[64, 64]);
        assert!(AutoScsiBusOptions(a[AS_BUS_OPTIONS]).round_robin());
        command(&mut hba, &mut bench, CMD_AUTOSCSI, &[9]);
        assert!(hba.core().status.invcmd());

        let vendor = BusLogic::with_nvram(config(BusLogicModel::Bt545s), &saved).unwrap();
        let mut hba = X54x::new(vendor);
        assert_eq!(command(&mut hba, &mut bench, CMD_FETCH_LOCAL_RAM, &[64 + 14, 1]), vec![5]);
        assert!(BusLogic::with_nvram(config(BusLogicModel::Bt545s), &[0; 10]).is_err());

        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt542bh));
        command(&mut hba, &mut bench, CMD_AUTOSCSI, &[1]);
        assert!(hba.core().status.invcmd());
    }

    #[test]
    fn round_robin_and_extended_lun() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        assert!(hba.state().aggressive);
        command(&mut hba, &mut bench, CMD_ROUND_ROBIN, &[0]);
        assert!(!hba.state().aggressive);
        command(&mut hba, &mut bench, CMD_ROUND_ROBIN, &[1]);
        assert!(hba.state().aggressive);

        // Soft reset keeps the selected mode, hard reset restores the default
        command(&mut hba, &mut bench, CMD_ROUND_ROBIN, &[0]);
        hba.write(&mut bench.ctx(), 0, 0x40).unwrap();
        assert!(!hba.state().aggressive);
        hba.write(&mut bench.ctx(), 0, 0x80).unwrap();
        assert!(hba.state().aggressive);

        command(&mut hba, &mut bench, CMD_EXTENDED_LUN, &[1]);
        assert!(hba.vendor().extended_lun());
        command(&mut hba, &mut bench, CMD_EXTENDED_LUN, &[7]);
        assert!(hba.vendor().extended_lun());
        hba.write(&mut bench.ctx(), 0, 0x40).unwrap();
        assert!(!hba.vendor().extended_lun());
    }

    #[test]
    fn reset_command() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        command(&mut hba, &mut bench, CMD_MBINIT_EXTENDED, &[4, 0x00, 0x00, 0x01, 0x00]);
        command(&mut hba, &mut bench, CMD_RESET, &[]);
        assert!(hba.core().status.stst());
        assert!(!hba.state().mailbox_init);
        assert_eq!(hba.state().width, AddressWidth::Bits24);
    }

    #[test]
    fn writable_registers() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        let mut ctx = bench.ctx();
        assert_eq!(hba.read(&mut ctx, 3), Some(0x80));
        hba.write(&mut ctx, 3, 0x12).unwrap();
        assert_eq!(hba.read(&mut ctx, 3), Some(0x12));
        hba.write(&mut ctx, 2, 0x70).unwrap();
        assert_eq!(hba.read(&mut ctx, 2), Some(0x70));
    }

    #[test]
    fn mailbox_32bit_end_to_end() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt958d));
        command(&mut hba, &mut bench, CMD_MBINIT_EXTENDED, &[2, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(hba.state().in_base, 0x10010);
        hba.write(&mut bench.ctx(), 0, 0x20).unwrap();

        let mut ccb = Ccb {
            opcode: 0,
            control: CTRL_DATA_IN,
            target: 0,
            lun: 0,
            cdb_len: 6,
            sense_len_raw: 0,
            data_len: 512,
            data_ptr: 0x3000,
            link_ptr: 0,
            link_id: 0,
            host_status: 0,
            target_status: 0,
            cdb: [0; CCB_CDB_LEN],
            sense_ptr: 0x5000,
        };
        // Past the end of the 32 block disk
        ccb.cdb[..6].copy_from_slice(&[0x08, 0, 0, 40, 1, 0]);
        bench.mem.poke(0x2000, &ccb.encode(AddressWidth::Bits32));
        let mbo = MailboxOut {
            ccb_ptr: 0x2000,
            action: MBO_START,
        };
        bench.mem.poke(0x10000, &mbo.encode(AddressWidth::Bits32));
        hba.write(&mut bench.ctx(), 1, 0x02).unwrap();
        run(&mut hba, &mut bench);

        let mbi = MailboxIn::decode(AddressWidth::Bits32, &bench.mem.peek(0x10010, 8));
        assert_eq!(
            mbi,
            MailboxIn {
                ccb_ptr: 0x2000,
                host_status: HS_COMPLETE,
                target_status: STATUS_CHECK_CONDITION,
                completion: MBI_ERROR,
            }
        );
        let sense = bench.mem.peek(0x5000, 15);
        assert_eq!(sense[0], 0x70);
        assert_eq!(sense[12], 0x21);
        assert_eq!(sense[14], 0);
        assert_eq!(hba.state().out_cursor, 1);

        // Second slot, INQUIRY
        ccb.cdb[..6].copy_from_slice(&[0x12, 0, 0, 0, 36, 0]);
        ccb.data_len = 36;
        bench.mem.poke(0x2100, &ccb.encode(AddressWidth::Bits32));
        let mbo = MailboxOut {
            ccb_ptr: 0x2100,
            action: MBO_START,
        };
        bench.mem.poke(0x10008, &mbo.encode(AddressWidth::Bits32));
        hba.write(&mut bench.ctx(), 1, 0x02).unwrap();
        run(&mut hba, &mut bench);

        let mbi = MailboxIn::decode(AddressWidth::Bits32, &bench.mem.peek(0x10018, 8));
        assert_eq!(mbi.completion, MBI_SUCCESS);
        assert_eq!(mbi.ccb_ptr, 0x2100);
        assert_eq!(&bench.mem.peek(0x3008, 8), b"HBACORE ");
        assert_eq!(hba.state().out_cursor, 0);
        assert_eq!(hba.state().in_cursor, 0);
    }

    #[test]
    fn direct_execute() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));

        let reply = command(
            &mut hba,
            &mut bench,
            CMD_EXECUTE_SCSI,
            &escmd(0, CTRL_DATA_IN, 36, &[0x12, 0, 0, 0, 36, 0]),
        );
        assert_eq!(reply, vec![0, 0, HS_COMPLETE, STATUS_GOOD]);
        assert_eq!(&bench.mem.peek(0x3008, 8), b"HBACORE ");
        assert!(hba.core().status.idle());
    }

    #[test]
    fn direct_execute_write() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        bench.mem.poke(0x3000, &[0xC3; 512]);
        let reply = command(
            &mut hba,
            &mut bench,
            CMD_EXECUTE_SCSI,
            &escmd(0, CTRL_DIR_BY_CDB, 512, &[0x0A, 0, 0, 2, 1, 0]),
        );
        assert_eq!(reply, vec![0, 0, HS_COMPLETE, STATUS_GOOD]);

        let unit = bench.devices.resolve(0, 0).unwrap();
        unit.execute(&[0x08, 0, 0, 2, 1, 0]);
        assert!(unit.buffer().iter().all(|&b| b == 0xC3));

        // Wrong direction moves nothing
        bench.mem.poke(0x3000, &[0x11; 512]);
        command(
            &mut hba,
            &mut bench,
            CMD_EXECUTE_SCSI,
            &escmd(0, CTRL_DATA_IN, 512, &[0x0A, 0, 0, 2, 1, 0]),
        );
        let unit = bench.devices.resolve(0, 0).unwrap();
        unit.execute(&[0x08, 0, 0, 2, 1, 0]);
        assert!(unit.buffer().iter().all(|&b| b == 0));
    }

    #[test]
    fn direct_execute_errors() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));

        let reply = command(
            &mut hba,
            &mut bench,
            CMD_EXECUTE_SCSI,
            &escmd(0, CTRL_DATA_IN, 512, &[0x08, 0, 0, 40, 1, 0]),
        );
        // LBA out of range
        assert_eq!(reply, vec![0x02, 0, HS_COMPLETE, STATUS_CHECK_CONDITION]);

        let reply = command(&mut hba, &mut bench, CMD_EXECUTE_SCSI, &escmd(5, 0, 0, &[0; 6]));
        assert_eq!(reply, vec![0, 0, HS_SELECTION_TIMEOUT, STATUS_GOOD]);

        let reply = command(&mut hba, &mut bench, CMD_EXECUTE_SCSI, &escmd(16, 0, 0, &[0; 6]));
        assert_eq!(reply, vec![0, 0, HS_INVALID_CCB, STATUS_GOOD]);
        assert!(bench.mem.peek(0x3000, 16).iter().all(|&b| b == 0));
    }

    #[test]
    fn extended_mailbox_init() {
        let mut bench = Bench::new();
        let mut hba = BusLogic::adapter(config(BusLogicModel::Bt545s));
        command(&mut hba, &mut bench, CMD_MBINIT_EXTENDED, &[8, 0x78, 0x56, 0x34, 0x12]);
        let st = hba.state();
        assert_eq!(st.width, AddressWidth::Bits32);
        assert_eq!(st.count, 8);
        assert_eq!(st.out_base, 0x1234_5678);
        assert_eq!(st.in_base, 0x1234_5678 + 64);
        assert!(!hba.core().status.init());

        // Legacy init drops back to 24-bit mailboxes
        let base = u32_to_addr24(0x4000);
        command(&mut hba, &mut bench, 0x01, &[2, base[0], base[1], base[2]]);
        assert_eq!(hba.state().width, AddressWidth::Bits24);
        assert_eq!(hba.state().in_base, 0x4008);
    }
}
