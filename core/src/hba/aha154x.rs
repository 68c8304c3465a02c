//! Adaptec AHA-154x personality of the x54x engine

use crate::bus::HostContext;
use crate::config::{Aha154xConfig, Aha154xModel};
use crate::debuggable::*;
use crate::hba::x54x::{CmdOutcome, X54x, X54xCore, X54xVendor};
use crate::{dbgprop_bool, dbgprop_byte, dbgprop_enum, dbgprop_udec};

const AHA_TRACE: bool = false;

const CMD_WRITE_EEPROM: u8 = 0x22;
const CMD_READ_EEPROM: u8 = 0x23;
const CMD_SHADOW_RAM: u8 = 0x24;
const CMD_BIOS_MBINIT: u8 = 0x25;
const CMD_EXTBIOS: u8 = 0x28;
const CMD_MBENABLE: u8 = 0x29;
const CMD_TERMINATION: u8 = 0x2C;
const CMD_MICROCODE_2D: u8 = 0x2D;
const CMD_POKE: u8 = 0x39;
const CMD_PEEK: u8 = 0x40;

pub const EEPROM_SIZE: usize = 256;

/// EEPROM byte 0
const EE0_HOSTID: u8 = 0x07;
const EE0_ALTFLOP: u8 = 0x80;
/// EEPROM byte 2
const EE2_RMVOK: u8 = 0x01;
const EE2_HABIOS: u8 = 0x02;
const EE2_DYNSCAN: u8 = 0x08;
const EE2_EXT1G: u8 = 0x80;
/// EEPROM byte 3, DMA speed
const SPEED_50: u8 = 0x00;
/// EEPROM byte 6
const EE6_TERM: u8 = 0x02;
const EE6_RSTBUS: u8 = 0x04;

/// Offset of the vendor area in the setup information
const SETUP_VENDOR: usize = 17;

pub struct Aha154x {
    config: Aha154xConfig,
    /// Configuration EEPROM (154xC and later)
    eeprom: Option<[u8; EEPROM_SIZE]>,
    shadow_mode: u8,
    mbx_lock: u8,
    sync: bool,
    parity: bool,
}

pub type Aha154xAdapter = X54x<Aha154x>;

impl Aha154x {
    pub fn new(config: Aha154xConfig) -> Self {
        let eeprom = match config.model {
            Aha154xModel::Aha154xC | Aha154xModel::Aha154xCF | Aha154xModel::Aha154xCP => {
                Some(Self::default_eeprom(&config))
            }
            _ => None,
        };
        Self {
            config,
            eeprom,
            shadow_mode: 0,
            mbx_lock: 0,
            sync: false,
            parity: true,
        }
    }

    pub fn adapter(config: Aha154xConfig) -> Aha154xAdapter {
        X54x::new(Self::new(config))
    }

    fn default_eeprom(config: &Aha154xConfig) -> [u8; EEPROM_SIZE] {
        let mut nvr = [0; EEPROM_SIZE];
        nvr[0] = (config.host_id & EE0_HOSTID) | 0x70;
        nvr[1] = (config.irq.saturating_sub(9) & 0x07) | ((config.dma & 0x07) << 4);
        nvr[2] = EE2_HABIOS | EE2_DYNSCAN | EE2_EXT1G | EE2_RMVOK;
        nvr[3] = SPEED_50;
        nvr[6] = EE6_TERM | EE6_RSTBUS;
        nvr
    }

    pub fn model(&self) -> Aha154xModel {
        self.config.model
    }

    pub fn eeprom(&self) -> Option<&[u8]> {
        self.eeprom.as_ref().map(|e| e.as_slice())
    }

    /// Replaces the EEPROM contents, e.g. with a previously saved image
    pub fn load_eeprom(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let Some(nvr) = self.eeprom.as_mut() else {
            anyhow::bail!("{:?} has no EEPROM", self.config.model);
        };
        if data.len() != EEPROM_SIZE {
            anyhow::bail!("EEPROM image must be {} bytes, got {}", EEPROM_SIZE, data.len());
        }
        nvr.copy_from_slice(data);
        Ok(())
    }

    pub fn floppy_alt_address(&self) -> bool {
        self.eeprom.is_some_and(|e| e[0] & EE0_ALTFLOP != 0)
    }
}

impl X54xVendor for Aha154x {
    fn name(&self) -> &'static str {
        match self.config.model {
            Aha154xModel::Aha154xA => "AHA-154xA",
            Aha154xModel::Aha154xB => "AHA-154xB",
            Aha154xModel::Aha154xC => "AHA-154xC",
            Aha154xModel::Aha154xCF => "AHA-154xCF",
            Aha154xModel::Aha154xCP => "AHA-154xCP",
            Aha154xModel::Aha1640 => "AHA-1640",
        }
    }

    fn fw_rev(&self) -> &'static [u8] {
        match self.config.model {
            Aha154xModel::Aha154xA => b"A003",
            Aha154xModel::Aha154xB => b"A005",
            Aha154xModel::Aha154xC => b"D001",
            Aha154xModel::Aha154xCF => b"E001",
            Aha154xModel::Aha154xCP => b"F001",
            Aha154xModel::Aha1640 => b"BB01",
        }
    }

    fn host_id(&self) -> u8 {
        self.eeprom
            .map_or(self.config.host_id, |e| e[0] & EE0_HOSTID)
    }

    fn irq(&self) -> u8 {
        self.eeprom.map_or(self.config.irq, |e| (e[1] & 0x07) + 9)
    }

    fn dma(&self) -> u8 {
        self.eeprom.map_or(self.config.dma, |e| (e[1] >> 4) & 0x07)
    }

    fn bus_rate(&self) -> u64 {
        match self.config.model {
            Aha154xModel::Aha154xCF | Aha154xModel::Aha154xCP => 10_000_000,
            _ => 5_000_000,
        }
    }

    fn always_aggressive(&self) -> bool {
        true
    }

    fn param_len(&self, cmd: u8) -> usize {
        match cmd {
            CMD_BIOS_MBINIT => 4,
            CMD_SHADOW_RAM => 1,
            CMD_WRITE_EEPROM => 35,
            CMD_READ_EEPROM | CMD_POKE => 3,
            CMD_MBENABLE | CMD_PEEK => 2,
            _ => 0,
        }
    }

    fn command(&mut self, core: &mut X54xCore, _ctx: &mut HostContext<'_>, cmd: u8) -> CmdOutcome {
        let p = core.params.clone();
        if AHA_TRACE {
            log::debug!("{}: command {:02X} {:02X?}", self.name(), cmd, p);
        }

        match cmd {
            CMD_WRITE_EEPROM => {
                let Some(nvr) = self.eeprom.as_mut() else {
                    return CmdOutcome::Invalid;
                };
                let (len, off) = (usize::from(p[1]).min(32), usize::from(p[2]));
                for (i, &b) in p[3..(3 + len)].iter().enumerate() {
                    nvr[(off + i) & 0xFF] = b;
                }
            }
            CMD_READ_EEPROM => {
                let Some(nvr) = self.eeprom.as_ref() else {
                    return CmdOutcome::Invalid;
                };
                let (len, off) = (usize::from(p[1]), usize::from(p[2]));
                let data: Vec<u8> = (0..len).map(|i| nvr[(off + i) & 0xFF]).collect();
                core.set_reply(&data);
            }
            CMD_SHADOW_RAM => {
                // Bit 0 enables writes, bit 1 reads
                self.shadow_mode = p[0];
            }
            CMD_EXTBIOS => core.set_reply(&[0x08, self.mbx_lock]),
            CMD_MBENABLE => {
                if p[1] == self.mbx_lock {
                    self.mbx_lock = p[0] & 1;
                }
            }
            CMD_TERMINATION => core.set_reply(&[0x40]),
            CMD_MICROCODE_2D => core.set_reply(&[0x00, 0x00]),
            CMD_POKE => {
                log::debug!("{}: poke {:02X}{:02X} = {:02X}", self.name(), p[0], p[1], p[2]);
            }
            CMD_PEEK => core.set_reply(&[0xFF]),
            _ => return CmdOutcome::Invalid,
        }
        CmdOutcome::Done
    }

    fn setup_data(&self, _core: &X54xCore, data: &mut [u8]) {
        data[0] = u8::from(self.sync) | (u8::from(self.parity) << 1);
        let vendor = &mut data[SETUP_VENDOR..];
        // Customer signature (20 bytes) followed by auto-retry and board switches
        vendor[22] = 0xA3;
        vendor[23] = 0xC2;
    }

    fn reset(&mut self, core: &mut X54xCore, _hard: bool) {
        self.shadow_mode = 0;
        core.state.aggressive = true;
    }
}

impl Debuggable for Aha154x {
    fn get_debug_properties(&self) -> DebuggableProperties {
        vec![
            dbgprop_enum!("Model", self.config.model),
            dbgprop_udec!("Host ID", self.host_id()),
            dbgprop_udec!("IRQ", self.irq()),
            dbgprop_udec!("DMA", self.dma()),
            dbgprop_bool!("EEPROM", self.eeprom.is_some()),
            dbgprop_byte!("Shadow RAM mode", self.shadow_mode),
            dbgprop_byte!("Mailbox lock", self.mbx_lock),
        ]
    }
}
