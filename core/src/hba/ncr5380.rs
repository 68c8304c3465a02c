//! NCR 5380 SCSI bus controller

use arrayvec::ArrayVec;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::bus::{HostContext, IoDevice, IoPort, IrqSource};
use crate::debuggable::*;
use crate::scsi::lun::{LogicalUnit, UnitPhase};
use crate::scsi::registry::DeviceRegistry;
use crate::scsi::{STATUS_CHECK_CONDITION, scsi_cmd_len};
use crate::{dbgprop_bool, dbgprop_byte, dbgprop_enum, dbgprop_group, dbgprop_string, dbgprop_udec};

const NCR_TRACE: bool = false;

/// COMMAND COMPLETE message
const MSG_COMMAND_COMPLETE: u8 = 0x00;

/// IDENTIFY message flag
const MSG_IDENTIFY: u8 = 0x80;

#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
enum NcrReg {
    /// Current Data Register (r) / Output Data Register (w)
    CDR_ODR,
    /// Initiator Command Register
    ICR,
    /// Mode Register
    MR,
    /// Target Command Register
    TCR,
    /// Current SCSI Bus Status (r) / Select Enable (w)
    CSR_SER,
    /// Bus and Status Register (r) / Start DMA Send (w)
    BSR_SDS,
    /// Input Data Register (r) / Start DMA Target Receive (w)
    IDR_SDTR,
    /// Reset Parity/Interrupt (r) / Start DMA Initiator Receive (w)
    RPI_SDIR,
}

bitfield! {
    /// NCR 5380 Mode Register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NcrRegMr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub arbitrate: bool @ 0,
        pub dma_mode: bool @ 1,
        pub monitor_busy: bool @ 2,
        pub eop_irq: bool @ 3,
        pub parity_irq: bool @ 4,
        pub parity_check: bool @ 5,
        pub target_mode: bool @ 6,
        pub block_dma: bool @ 7,
    }
}

bitfield! {
    /// NCR 5380 Initiator Command Register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NcrRegIcr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub assert_databus: bool @ 0,
        pub assert_atn: bool @ 1,
        pub assert_sel: bool @ 2,
        pub assert_bsy: bool @ 3,
        pub assert_ack: bool @ 4,
        /// (r) Lost arbitration
        pub la: bool @ 5,
        /// (r) Arbitration In Progress
        pub aip: bool @ 6,
        pub assert_rst: bool @ 7,
    }
}

bitfield! {
    /// NCR 5380 Bus and Status Register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NcrRegBsr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// ACK bus condition
        pub ack: bool @ 0,
        /// ATN bus condition
        pub atn: bool @ 1,
        /// Busy error (loss of BSY condition)
        pub busy_err: bool @ 2,
        /// Phase match
        pub phase_match: bool @ 3,
        /// Interrupt request active
        pub irq: bool @ 4,
        /// Parity error during transfer
        pub parity_err: bool @ 5,
        /// DMA request
        pub dma_req: bool @ 6,
        /// End of DMA transfer
        pub dma_end: bool @ 7,
    }
}

bitfield! {
    /// NCR 5380 Target Command Register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NcrRegTcr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub phase_match_bits: u8 @ 0..=2,

        pub assert_io: bool @ 0,
        pub assert_cd: bool @ 1,
        pub assert_msg: bool @ 2,
        pub assert_req: bool @ 3,

        pub last_byte_sent: bool @ 7,
    }
}

bitfield! {
    /// SCSI bus lines. The low byte has the layout of the current bus
    /// status register.
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BusSignals(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub dbp: bool @ 0,
        pub sel: bool @ 1,
        pub io: bool @ 2,
        pub cd: bool @ 3,
        pub msg: bool @ 4,
        pub req: bool @ 5,
        pub bsy: bool @ 6,
        pub rst: bool @ 7,
        pub ack: bool @ 8,
        pub atn: bool @ 9,
        pub arb: bool @ 10,

        /// MSG, C/D, I/O in target command register order
        pub phase: u8 @ 2..=4,
        pub data: u8 @ 16..=23,
    }
}

/// SCSI bus phases
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum BusPhase {
    Free,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MessageIn,
    MessageOut,
}

impl BusPhase {
    /// MSG, C/D and I/O as driven by the target
    const fn lines(self) -> u8 {
        match self {
            Self::Free | Self::DataOut => 0b000,
            Self::DataIn => 0b001,
            Self::Command => 0b010,
            Self::Status => 0b011,
            Self::MessageOut => 0b110,
            Self::MessageIn => 0b111,
        }
    }

    /// Target drives the data lines
    const fn target_drives(self) -> bool {
        matches!(self, Self::DataIn | Self::Status | Self::MessageIn)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum DmaMode {
    Idle,
    Send,
    TargetReceive,
    InitiatorReceive,
}

/// Numeric ID of the highest bit set in a selection byte, the
/// initiator's bit 7 excluded
pub fn selected_id(data: u8) -> Option<u8> {
    let bits = data & 0x7F;
    if bits == 0 {
        None
    } else {
        Some(7 - bits.leading_zeros() as u8)
    }
}

/// Target side of the bus: follows the initiator's lines and plays the
/// selected logical unit through the bus phases.
#[derive(Serialize, Deserialize)]
pub struct ScsiBus {
    phase: BusPhase,
    /// Lines last driven by the initiator
    host: BusSignals,
    req: bool,
    /// Byte on the data lines driven by the target, or latched from the
    /// initiator on ACK
    data: u8,

    target: u8,
    lun: u8,
    /// LUN taken from an IDENTIFY message
    identified: bool,

    cdb: ArrayVec<u8, 16>,
    cdb_len: usize,

    /// Data phase position and length
    pos: usize,
    len: usize,
}

impl Default for ScsiBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ScsiBus {
    pub fn new() -> Self {
        Self {
            phase: BusPhase::Free,
            host: BusSignals(0),
            req: false,
            data: 0,
            target: 0,
            lun: 0,
            identified: false,
            cdb: ArrayVec::new(),
            cdb_len: 0,
            pos: 0,
            len: 0,
        }
    }

    pub fn phase(&self) -> BusPhase {
        self.phase
    }

    /// Selected target and LUN
    pub fn nexus(&self) -> Option<(u8, u8)> {
        (self.phase != BusPhase::Free).then_some((self.target, self.lun))
    }

    /// Lines currently on the bus, initiator and target combined
    pub fn signals(&self) -> BusSignals {
        let host = self.host;
        BusSignals(0)
            .with_dbp(host.dbp())
            .with_sel(host.sel())
            .with_atn(host.atn())
            .with_ack(host.ack())
            .with_rst(host.rst())
            .with_arb(host.arb())
            .with_bsy(host.bsy() || self.phase != BusPhase::Free)
            .with_req(self.req)
            .with_phase(self.phase.lines())
            .with_data(if self.phase.target_drives() {
                self.data
            } else {
                host.data()
            })
    }

    /// Whether the phase the initiator expects is the one on the bus
    pub fn matches(&self, host: BusSignals) -> bool {
        host.phase() == self.phase.lines()
    }

    /// Reacts to the initiator changing its lines
    pub fn update(&mut self, devices: &mut DeviceRegistry, host: BusSignals) {
        let prev = std::mem::replace(&mut self.host, host);

        if host.rst() {
            if !prev.rst() {
                log::debug!("SCSI bus reset");
                devices.reset_all();
            }
            self.enter(BusPhase::Free);
            return;
        }

        if self.phase == BusPhase::Free {
            if host.sel() && !host.bsy() {
                self.select(devices, host);
            }
            return;
        }

        if host.ack() && !prev.ack() && self.req {
            self.req = false;
            if !self.phase.target_drives() {
                self.data = host.data();
            }
        } else if !host.ack() && prev.ack() && !self.req {
            self.next(devices);
        }
    }

    fn enter(&mut self, phase: BusPhase) {
        if NCR_TRACE {
            log::debug!("Bus phase: {:?}", phase);
        }
        self.phase = phase;
        self.req = phase != BusPhase::Free;
    }

    fn select(&mut self, devices: &DeviceRegistry, host: BusSignals) {
        let Some(id) = selected_id(host.data()) else {
            return;
        };
        if !devices.target_present(id) {
            if NCR_TRACE {
                log::debug!("Not selecting {}, no device", id);
            }
            return;
        }

        self.target = id;
        self.lun = 0;
        self.identified = false;
        self.cdb.clear();
        if NCR_TRACE {
            log::debug!("Selected SCSI ID {}, attention = {}", id, host.atn());
        }
        self.enter(if host.atn() {
            BusPhase::MessageOut
        } else {
            BusPhase::Command
        });
    }

    /// Completes the byte just acknowledged
    fn next(&mut self, devices: &mut DeviceRegistry) {
        match self.phase {
            BusPhase::MessageOut => {
                if self.data & MSG_IDENTIFY != 0 {
                    self.lun = self.data & 0x07;
                    self.identified = true;
                }
                if self.host.atn() {
                    self.req = true;
                } else {
                    self.enter(BusPhase::Command);
                }
            }
            BusPhase::Command => {
                if self.cdb.is_empty() {
                    self.cdb_len = scsi_cmd_len(self.data).unwrap_or_else(|| {
                        log::warn!("Command length unknown for {:02X}", self.data);
                        6
                    });
                }
                if self.cdb.try_push(self.data).is_err() || self.cdb.len() >= self.cdb_len {
                    self.execute(devices);
                } else {
                    self.req = true;
                }
            }
            BusPhase::DataIn | BusPhase::DataOut => {
                let Some(unit) = devices.resolve(self.target, self.lun) else {
                    self.unit_lost();
                    return;
                };
                if self.phase == BusPhase::DataOut {
                    unit.buffer_mut()[self.pos] = self.data;
                }
                self.pos += 1;
                if self.pos < self.len {
                    if self.phase == BusPhase::DataIn {
                        self.data = unit.buffer()[self.pos];
                    }
                    self.req = true;
                } else {
                    unit.advance();
                    self.enter_status(unit);
                }
            }
            BusPhase::Status => {
                self.data = MSG_COMMAND_COMPLETE;
                self.enter(BusPhase::MessageIn);
            }
            BusPhase::MessageIn => self.enter(BusPhase::Free),
            BusPhase::Free => (),
        }
    }

    fn execute(&mut self, devices: &mut DeviceRegistry) {
        if !self.identified {
            // SCSI-1 LUN field
            self.lun = self.cdb.get(1).map_or(0, |b| b >> 5);
        }
        let Some(unit) = devices.resolve(self.target, self.lun) else {
            log::warn!("Command {:02X?} to absent LUN {}:{}", self.cdb, self.target, self.lun);
            self.unit_lost();
            return;
        };

        unit.execute(&self.cdb);
        self.cdb.clear();
        self.pos = 0;
        self.len = unit.buffer().len();

        match unit.phase() {
            UnitPhase::DataIn if self.len > 0 => {
                self.data = unit.buffer()[0];
                self.enter(BusPhase::DataIn);
            }
            UnitPhase::DataOut if self.len > 0 => self.enter(BusPhase::DataOut),
            UnitPhase::Status => self.enter_status(unit),
            _ => {
                unit.advance();
                self.enter_status(unit);
            }
        }
    }

    fn enter_status(&mut self, unit: &mut LogicalUnit) {
        unit.advance();
        self.data = unit.status();
        self.enter(BusPhase::Status);
    }

    fn unit_lost(&mut self) {
        self.data = STATUS_CHECK_CONDITION;
        self.enter(BusPhase::Status);
    }
}

/// NCR 5380 SCSI controller, initiator role
#[derive(Serialize, Deserialize)]
pub struct Ncr5380 {
    reg_mr: NcrRegMr,
    reg_icr: NcrRegIcr,
    reg_tcr: NcrRegTcr,
    reg_odr: u8,
    reg_ser: u8,
    /// Latched interrupt and end of DMA conditions
    reg_isr: NcrRegBsr,

    dma_mode: DmaMode,

    bus: ScsiBus,
}

impl Default for Ncr5380 {
    fn default() -> Self {
        Self::new()
    }
}

impl Ncr5380 {
    pub fn new() -> Self {
        Self {
            reg_mr: NcrRegMr(0),
            reg_icr: NcrRegIcr(0),
            reg_tcr: NcrRegTcr(0),
            reg_odr: 0,
            reg_ser: 0,
            reg_isr: NcrRegBsr(0),
            dma_mode: DmaMode::Idle,
            bus: ScsiBus::new(),
        }
    }

    pub fn bus(&self) -> &ScsiBus {
        &self.bus
    }

    pub fn dma_mode(&self) -> DmaMode {
        self.dma_mode
    }

    /// DMA mode set and a DMA transfer started
    pub fn dma_enabled(&self) -> bool {
        self.reg_mr.dma_mode() && self.dma_mode != DmaMode::Idle
    }

    /// Lines driven by this controller
    fn host_signals(&self) -> BusSignals {
        let icr = self.reg_icr;
        let tcr = self.reg_tcr;
        BusSignals(0)
            .with_dbp(icr.assert_databus())
            .with_sel(icr.assert_sel())
            .with_atn(icr.assert_atn())
            .with_bsy(icr.assert_bsy())
            .with_ack(icr.assert_ack())
            .with_rst(icr.assert_rst())
            .with_phase(tcr.phase_match_bits())
            .with_req(tcr.assert_req())
            .with_arb(self.reg_mr.arbitrate())
            .with_data(self.reg_odr)
    }

    pub fn bus_signals(&self) -> BusSignals {
        self.bus.signals()
    }

    pub fn phase_match(&self) -> bool {
        self.bus.matches(self.host_signals())
    }

    fn read_datareg(&self) -> u8 {
        if self.reg_icr.assert_databus() {
            self.reg_odr
        } else {
            self.bus.signals().data()
        }
    }

    fn read_bsr(&mut self) -> u8 {
        let bus = self.bus.signals();
        let drq = bus.req() && self.reg_mr.dma_mode();
        let phase_match = self.phase_match();
        if drq && !phase_match {
            self.reg_isr.set_irq(true);
        }

        NcrRegBsr(0)
            .with_ack(bus.ack())
            .with_atn(bus.atn())
            .with_busy_err(!bus.bsy() && self.reg_mr.monitor_busy())
            .with_phase_match(phase_match)
            .with_irq(self.reg_isr.irq())
            .with_dma_req(drq)
            .with_dma_end(self.reg_isr.dma_end())
            .0
    }

    fn write_icr(&mut self, val: u8) {
        let new = NcrRegIcr(val);
        let old = self.reg_icr;

        if new.assert_rst() && !old.assert_rst() {
            self.reg_isr.set_irq(true);
        }
        self.reg_icr = new.with_la(old.la()).with_aip(old.aip());
    }

    fn write_mr(&mut self, val: u8) {
        let new = NcrRegMr(val);

        if new.arbitrate() && !self.reg_mr.arbitrate() {
            self.reg_icr.set_la(false);
            self.reg_icr.set_aip(true);
        } else if !new.arbitrate() {
            self.reg_icr.set_aip(false);
        }
        if !new.dma_mode() {
            self.reg_tcr.set_last_byte_sent(false);
            self.reg_isr.set_dma_end(false);
            self.dma_mode = DmaMode::Idle;
        }
        self.reg_mr = new;
    }

    pub fn read_reg(&mut self, port: IoPort) -> u8 {
        let Some(reg) = NcrReg::from_u16(port & 7) else {
            return 0xFF;
        };
        let val = match reg {
            NcrReg::CDR_ODR => self.read_datareg(),
            NcrReg::ICR => self.reg_icr.0,
            NcrReg::MR => self.reg_mr.0,
            NcrReg::TCR => self.reg_tcr.0,
            NcrReg::CSR_SER => self.bus.signals().0 as u8,
            NcrReg::BSR_SDS => self.read_bsr(),
            NcrReg::IDR_SDTR => self.bus.signals().data(),
            NcrReg::RPI_SDIR => {
                self.reg_isr.set_irq(false);
                0xFF
            }
        };
        if NCR_TRACE && reg != NcrReg::CSR_SER && reg != NcrReg::BSR_SDS {
            log::debug!("NCR read {:?} = {:02X}", reg, val);
        }
        val
    }

    pub fn write_reg(&mut self, devices: &mut DeviceRegistry, port: IoPort, val: u8) {
        let Some(reg) = NcrReg::from_u16(port & 7) else {
            return;
        };
        if NCR_TRACE {
            log::debug!("NCR write {:?} = {:02X}", reg, val);
        }

        match reg {
            NcrReg::CDR_ODR => self.reg_odr = val,
            NcrReg::ICR => self.write_icr(val),
            NcrReg::MR => self.write_mr(val),
            NcrReg::TCR => {
                self.reg_tcr = NcrRegTcr(val).with_last_byte_sent(self.reg_tcr.last_byte_sent());
            }
            NcrReg::CSR_SER => self.reg_ser = val,
            NcrReg::BSR_SDS => self.dma_mode = DmaMode::Send,
            NcrReg::IDR_SDTR => {
                log::warn!("DMA target receive started, target mode is not supported");
                self.dma_mode = DmaMode::TargetReceive;
            }
            NcrReg::RPI_SDIR => self.dma_mode = DmaMode::InitiatorReceive,
        }

        let host = self.host_signals();
        self.bus.update(devices, host);
    }

    /// One DMA REQ/ACK handshake. Puts `out` on the data lines when
    /// sending and returns the byte the target presented.
    pub fn dma_handshake(&mut self, devices: &mut DeviceRegistry, out: Option<u8>) -> u8 {
        let data = self.bus.signals().data();
        let mut host = self.host_signals();
        if let Some(b) = out {
            host.set_data(b);
        }
        self.bus.update(devices, host.with_ack(true));
        self.bus.update(devices, host.with_ack(false));
        data
    }

    /// Flags a phase change seen during DMA
    pub fn dma_phase_mismatch(&mut self) {
        self.reg_isr.set_irq(true);
    }

    /// Block counter ran out
    pub fn end_of_dma(&mut self) {
        if self.dma_mode == DmaMode::Send {
            self.reg_tcr.set_last_byte_sent(true);
        }
        self.reg_isr.set_dma_end(true);
        if self.reg_mr.eop_irq() {
            self.reg_isr.set_irq(true);
        }
    }

    /// Drops out of DMA mode when the target released BSY while it is
    /// being monitored. Returns true if DMA was stopped.
    pub fn check_busy(&mut self) -> bool {
        if self.reg_mr.monitor_busy() && !self.bus.signals().bsy() && self.reg_mr.dma_mode() {
            log::debug!("Target released BSY, leaving DMA mode");
            self.reg_mr.set_dma_mode(false);
            self.dma_mode = DmaMode::Idle;
            return true;
        }
        false
    }
}

impl IoDevice for Ncr5380 {
    fn read(&mut self, _ctx: &mut HostContext<'_>, port: IoPort) -> Option<u8> {
        Some(self.read_reg(port))
    }

    fn write(&mut self, ctx: &mut HostContext<'_>, port: IoPort, val: u8) -> Option<()> {
        self.write_reg(ctx.devices, port, val);
        Some(())
    }
}

impl IrqSource for Ncr5380 {
    fn get_irq(&self) -> bool {
        self.reg_isr.irq()
    }
}

impl Debuggable for Ncr5380 {
    fn get_debug_properties(&self) -> DebuggableProperties {
        let bus = self.bus.signals();
        vec![
            dbgprop_group!(
                "Registers",
                vec![
                    dbgprop_byte!("MR", self.reg_mr.0),
                    dbgprop_byte!("ICR", self.reg_icr.0),
                    dbgprop_byte!("TCR", self.reg_tcr.0),
                    dbgprop_byte!("ODR", self.reg_odr),
                    dbgprop_byte!("SER", self.reg_ser),
                    dbgprop_byte!("CSR", bus.0 as u8),
                ]
            ),
            dbgprop_enum!("Bus phase", self.bus.phase),
            dbgprop_enum!("DMA mode", self.dma_mode),
            dbgprop_string!(
                "Nexus",
                self.bus
                    .nexus()
                    .map_or_else(|| "-".to_string(), |(t, l)| format!("{}:{}", t, l))
            ),
            dbgprop_udec!("Data position", self.bus.pos),
            dbgprop_bool!("IRQ", self.get_irq()),
        ]
    }
}
