//! Mailbox/CCB host adapter engine shared by the AHA-154x and BusLogic
//! adapters.
//!
//! The guest talks to the adapter through four I/O ports and a pair of
//! mailbox rings in guest memory. Commands are processed one at a time by
//! a cooperative state machine that advances on `tick()`.

pub mod wire;


use anyhow::Result;
use arrayvec::ArrayVec;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::bus::{Address, GuestMemory, HostContext, IoDevice, IoPort, IrqSource};
use crate::debuggable::*;
use crate::dma::{self, AddressWidth, Direction, addr24_to_u32};
use crate::scsi::lun::{LogicalUnit, Progress, UnitPhase};
use crate::scsi::{STATUS_GOOD, registry::MAX_LUNS};
use crate::tickable::{TICKS_PER_SEC, TICKS_PER_USEC, Tickable, Ticks};
use crate::{
    dbgprop_addr, dbgprop_bool, dbgprop_byte, dbgprop_enum, dbgprop_group, dbgprop_header,
    dbgprop_nest, dbgprop_udec,
};

use wire::*;

const X54X_TRACE: bool = false;

/// Self-test time after a hard reset
pub const RESET_DURATION: Ticks = 50_000 * TICKS_PER_USEC;

/// Fixed cost of each processing step
const STEP_OVERHEAD: Ticks = 10 * TICKS_PER_USEC;

/// Longest parameter block a command can take
const PARAM_MAX: usize = 260;

pub const INTR_MBIF: u8 = 0x01;
pub const INTR_MBOA: u8 = 0x02;
pub const INTR_HACC: u8 = 0x04;
pub const INTR_SCRD: u8 = 0x08;
pub const INTR_ANY: u8 = 0x80;

bitfield! {
    /// Status register (port 0, read)
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct X54xStatus(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Invalid command
        pub invcmd: bool @ 0,
        /// Data in register full
        pub dfull: bool @ 2,
        /// Command/data out register full
        pub cdf: bool @ 3,
        pub idle: bool @ 4,
        /// Mailbox initialization required
        pub init: bool @ 5,
        /// Diagnostic failure
        pub diagf: bool @ 6,
        /// Self-test in progress
        pub stst: bool @ 7,
    }
}

bitfield! {
    /// Interrupt flags register (port 2, read)
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct X54xIntr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Mailbox in full
        pub mbif: bool @ 0,
        /// Mailbox out available
        pub mboa: bool @ 1,
        /// Host adapter command complete
        pub hacc: bool @ 2,
        /// SCSI reset detected
        pub scrd: bool @ 3,
        pub any: bool @ 7,
    }
}

bitfield! {
    /// Control register (port 0, write)
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct X54xCtrl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// SCSI bus reset
        pub scrst: bool @ 4,
        /// Interrupt reset
        pub irst: bool @ 5,
        /// Soft reset
        pub srst: bool @ 6,
        /// Hard reset
        pub hrst: bool @ 7,
    }
}

/// Adapter commands common to all x54x adapters
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
pub enum X54xCmd {
    Nop = 0x00,
    MailboxInit = 0x01,
    StartScsi = 0x02,
    BiosCommand = 0x03,
    Inquiry = 0x04,
    EnableMboInterrupt = 0x05,
    SelectionTimeout = 0x06,
    BusOnTime = 0x07,
    BusOffTime = 0x08,
    DmaSpeed = 0x09,
    ReturnDevices = 0x0A,
    ReturnConfig = 0x0B,
    ReturnSetup = 0x0D,
    WriteChannel2 = 0x1A,
    ReadChannel2 = 0x1B,
    Echo = 0x1F,
    Options = 0x21,
}

impl X54xCmd {
    const fn param_len(self) -> usize {
        match self {
            Self::MailboxInit | Self::SelectionTimeout => 4,
            Self::BiosCommand => 10,
            Self::EnableMboInterrupt
            | Self::BusOnTime
            | Self::BusOffTime
            | Self::DmaSpeed
            | Self::ReturnSetup
            | Self::Echo
            | Self::Options => 1,
            Self::WriteChannel2 | Self::ReadChannel2 => 3,
            Self::Nop
            | Self::StartScsi
            | Self::Inquiry
            | Self::ReturnDevices
            | Self::ReturnConfig => 0,
        }
    }
}

/// Result of executing an adapter command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdOutcome {
    Done,
    /// Completes without raising the command complete interrupt
    Silent,
    /// Command requests a hard reset of the adapter
    Reset,
    Invalid,
}

/// Where the mailbox engine is in processing a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, strum::IntoStaticStr)]
pub enum SubPhase {
    /// Looking for an outgoing mailbox to process
    #[default]
    Scan,
    /// CCB fetched, command to be issued to the unit
    Execute,
    /// Data phase
    Transfer,
    /// Sense and residual write-back
    Complete,
    /// Mailbox in and interrupt
    Notify,
}

/// Mailbox ring configuration and engine flags
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAdapterState {
    pub width: AddressWidth,
    pub mailbox_init: bool,
    pub count: u32,
    pub out_base: Address,
    pub in_base: Address,
    pub out_cursor: u32,
    pub in_cursor: u32,
    /// Start requests received since the last scan
    pub mailbox_req: u32,
    /// Hunt for the next non-free outgoing mailbox
    pub aggressive: bool,
    pub irq_enabled: bool,
    /// Outgoing mailbox available interrupts
    pub mbo_irq: bool,
    #[serde(with = "BigArray")]
    pub local_ram: [u8; 256],
}

impl Default for HostAdapterState {
    fn default() -> Self {
        Self {
            width: AddressWidth::Bits24,
            mailbox_init: false,
            count: 0,
            out_base: 0,
            in_base: 0,
            out_cursor: 0,
            in_cursor: 0,
            mailbox_req: 0,
            aggressive: false,
            irq_enabled: true,
            mbo_irq: false,
            local_ram: [0; 256],
        }
    }
}

/// An in-flight request
#[derive(Clone, Debug)]
struct Request {
    mbo_addr: Address,
    ccb_addr: Address,
    ccb: Option<Ccb>,
    host_status: u8,
    target_status: u8,
    completion: u8,
    /// Bytes the guest buffer can hold
    transfer_len: u32,
}

impl Request {
    const fn new(mbo_addr: Address, ccb_addr: Address) -> Self {
        Self {
            mbo_addr,
            ccb_addr,
            ccb: None,
            host_status: HS_COMPLETE,
            target_status: STATUS_GOOD,
            completion: MBI_SUCCESS,
            transfer_len: 0,
        }
    }

    fn finish(&mut self, host_status: u8, target_status: u8, completion: u8) {
        self.host_status = host_status;
        self.target_status = target_status;
        self.completion = completion;
    }
}

/// Adapter specific behavior plugged into the engine
pub trait X54xVendor: Debuggable {
    fn name(&self) -> &'static str;

    /// Firmware revision, the first four bytes are returned by INQUIRY
    fn fw_rev(&self) -> &'static [u8];

    fn host_id(&self) -> u8;
    fn irq(&self) -> u8;
    fn dma(&self) -> u8;

    /// Highest SCSI ID on the bus
    fn max_target(&self) -> u8 {
        7
    }

    /// SCSI bus rate in bytes/sec
    fn bus_rate(&self) -> u64;

    /// Interrupt and geometry registers are plain read/write registers
    fn geometry_writable(&self) -> bool {
        false
    }

    /// Mailbox scanning ignores the configured round-robin mode
    fn always_aggressive(&self) -> bool {
        false
    }

    /// Parameter bytes for a vendor command
    fn param_len(&self, cmd: u8) -> usize;

    /// Called after every parameter byte received
    fn param_received(&mut self, _core: &mut X54xCore) {}

    fn command(&mut self, core: &mut X54xCore, ctx: &mut HostContext<'_>, cmd: u8)
    -> CmdOutcome;

    /// Fills in the vendor part of the setup information reply
    fn setup_data(&self, core: &X54xCore, data: &mut [u8]);

    /// Called once when the adapter is created
    fn init(&mut self, _core: &mut X54xCore) {}

    /// Adapter reset, `hard` for a full firmware restart
    fn reset(&mut self, _core: &mut X54xCore, _hard: bool) {}
}

/// Vendor independent adapter state
pub struct X54xCore {
    pub status: X54xStatus,
    pub intr: X54xIntr,
    /// Mailbox interrupts held back while a command complete is unacknowledged
    pending: u8,
    irq_line: bool,
    pub geometry: u8,

    pub command: Option<u8>,
    pub params: ArrayVec<u8, PARAM_MAX>,
    pub param_left: usize,
    reply: Vec<u8>,
    reply_pos: usize,

    pub state: HostAdapterState,
    pub bus_on: u8,
    pub bus_off: u8,
    pub dma_speed: u8,
    channel2: [u8; 64],

    request: Option<Request>,
    sub_phase: SubPhase,
    countdown: Ticks,
    selftest: Ticks,
}

impl X54xCore {
    fn new() -> Self {
        Self {
            status: X54xStatus(0).with_init(true).with_idle(true),
            intr: X54xIntr(0),
            pending: 0,
            irq_line: false,
            geometry: 0,
            command: None,
            params: ArrayVec::new(),
            param_left: 0,
            reply: vec![],
            reply_pos: 0,
            state: HostAdapterState::default(),
            bus_on: 7,
            bus_off: 4,
            dma_speed: 0,
            channel2: [0; 64],
            request: None,
            sub_phase: SubPhase::Scan,
            countdown: STEP_OVERHEAD,
            selftest: 0,
        }
    }

    pub fn sub_phase(&self) -> SubPhase {
        self.sub_phase
    }

    pub fn busy(&self) -> bool {
        self.request.is_some()
    }

    /// Queues a command reply for the guest to read from the data port
    pub fn set_reply(&mut self, data: &[u8]) {
        self.reply = data.to_vec();
        self.reply_pos = 0;
    }

    pub fn reply_pending(&self) -> usize {
        self.reply.len() - self.reply_pos
    }

    /// Sets up the mailbox rings. The incoming ring directly follows the
    /// outgoing ring.
    pub fn init_mailboxes(&mut self, width: AddressWidth, count: u8, base: Address) {
        let st = &mut self.state;
        st.width = width;
        st.mailbox_init = true;
        st.count = u32::from(count);
        st.out_base = base;
        st.in_base = base.wrapping_add(st.count * width.mailbox_len() as u32);
        st.out_cursor = 0;
        st.in_cursor = 0;
        self.status.set_init(false);

        log::debug!(
            "Mailbox init ({:?}): {} entries, out {:08X}, in {:08X}",
            width,
            count,
            st.out_base,
            st.in_base
        );
    }

    pub fn raise_irq(&mut self, suppress: bool, bits: u8) {
        if bits & (INTR_MBIF | INTR_MBOA) != 0 {
            if self.intr.hacc() {
                self.pending |= bits & (INTR_MBIF | INTR_MBOA);
            } else {
                self.intr.0 |= bits & (INTR_MBIF | INTR_MBOA);
            }
        } else if bits & INTR_HACC != 0 {
            self.intr.set_hacc(true);
        }
        self.intr.set_any(true);

        if self.state.irq_enabled && !suppress {
            self.irq_line = true;
        }
    }

    pub fn clear_irq(&mut self) {
        self.intr = X54xIntr(0);
        self.irq_line = false;

        let mut pending = std::mem::take(&mut self.pending);
        if !self.state.mbo_irq {
            pending &= !INTR_MBOA;
        }
        if pending != 0 {
            self.raise_irq(false, pending);
        }
    }

    fn cmd_done(&mut self, suppress: bool) {
        self.reply.clear();
        self.reply_pos = 0;
        self.status.set_idle(true);
        self.status.set_dfull(false);
        if self.command != Some(X54xCmd::StartScsi as u8) {
            self.raise_irq(suppress, INTR_HACC);
        }
        self.command = None;
        self.params.clear();
        self.param_left = 0;
    }

    /// Next outgoing mailbox to process, if any
    fn scan(&mut self, ctx: &mut HostContext<'_>) -> Option<(Address, MailboxOut)> {
        let HostAdapterState {
            width,
            count,
            out_base,
            out_cursor,
            aggressive,
            ..
        } = self.state;
        let mbl = width.mailbox_len();
        let slots = if aggressive { count } else { 1 };
        let mut raw = [0u8; 8];

        for i in 0..slots {
            let slot = (out_cursor + i) % count;
            let addr = out_base.wrapping_add(slot * mbl as u32);
            if let Err(e) = ctx.mem.read_block(addr, &mut raw[..mbl]) {
                log::error!("Outgoing mailbox {} read: {}", slot, e);
                return None;
            }
            let mbo = MailboxOut::decode(width, &raw[..mbl]);
            if X54X_TRACE {
                log::debug!("MBO {} @ {:08X}: {:?}", slot, addr, mbo);
            }
            if mbo.action != MBO_FREE {
                self.state.out_cursor = (slot + 1) % count;
                return Some((addr, mbo));
            }
        }
        None
    }
}

/// A mailbox host adapter
pub struct X54x<V: X54xVendor> {
    core: X54xCore,
    vendor: V,
}

impl<V: X54xVendor> X54x<V> {
    pub fn new(vendor: V) -> Self {
        let mut s = Self {
            core: X54xCore::new(),
            vendor,
        };
        if s.vendor.geometry_writable() {
            s.core.geometry = 0x80;
        }
        s.vendor.init(&mut s.core);
        s.vendor.reset(&mut s.core, true);
        s
    }

    pub fn core(&self) -> &X54xCore {
        &self.core
    }

    pub fn state(&self) -> &HostAdapterState {
        &self.core.state
    }

    pub fn vendor(&self) -> &V {
        &self.vendor
    }

    pub fn vendor_mut(&mut self) -> &mut V {
        &mut self.vendor
    }

    fn aggressive(&self) -> bool {
        self.vendor.always_aggressive() || self.core.state.aggressive
    }

    /// Hard or soft adapter reset.
    ///
    /// Any request in flight is dropped without an incoming mailbox.
    pub fn reset_ctrl(&mut self, ctx: &mut HostContext<'_>, hard: bool) {
        let core = &mut self.core;

        if core.request.take().is_some() {
            log::debug!("{}: reset drops request in flight", self.vendor.name());
        }
        core.sub_phase = SubPhase::Scan;
        core.countdown = STEP_OVERHEAD;

        core.pending = 0;
        core.clear_irq();
        core.geometry = if self.vendor.geometry_writable() { 0x80 } else { 0 };
        core.command = None;
        core.params.clear();
        core.param_left = 0;
        core.reply.clear();
        core.reply_pos = 0;

        let st = &mut core.state;
        st.out_cursor = 0;
        st.in_cursor = 0;
        st.mailbox_req = 0;
        st.mbo_irq = false;
        st.irq_enabled = true;
        if hard {
            st.width = AddressWidth::Bits24;
            st.mailbox_init = false;
            st.count = 0;
            st.out_base = 0;
            st.in_base = 0;
        }

        ctx.devices.reset_all();
        self.vendor.reset(core, hard);

        if hard {
            core.status = X54xStatus(0).with_stst(true);
            core.selftest = RESET_DURATION;
        } else {
            core.status = X54xStatus(0).with_init(true).with_idle(true);
            core.selftest = 0;
        }
        log::debug!("{}: {} reset", self.vendor.name(), if hard { "hard" } else { "soft" });
    }

    fn write_control(&mut self, ctx: &mut HostContext<'_>, val: u8) {
        let ctrl = X54xCtrl(val);
        if ctrl.hrst() || ctrl.srst() {
            self.reset_ctrl(ctx, ctrl.hrst());
            return;
        }
        if ctrl.scrst() {
            ctx.devices.reset_all();
        }
        if ctrl.irst() {
            self.core.clear_irq();
        }
    }

    fn write_command(&mut self, ctx: &mut HostContext<'_>, val: u8) {
        let core = &mut self.core;

        match core.command {
            None if val == X54xCmd::StartScsi as u8 => {
                core.state.mailbox_req = core.state.mailbox_req.saturating_add(1);
                return;
            }
            Some(_) if core.param_left > 0 => {
                if core.params.try_push(val).is_err() {
                    log::warn!("{}: parameter overflow, cmd {:02X?}", self.vendor.name(), core.command);
                }
                core.param_left -= 1;
                self.vendor.param_received(core);
            }
            _ => {
                if core.command.is_some() {
                    log::warn!(
                        "{}: command {:02X} while {:02X?} has reply pending",
                        self.vendor.name(),
                        val,
                        core.command
                    );
                }
                core.command = Some(val);
                core.params.clear();
                core.reply.clear();
                core.reply_pos = 0;
                core.status.set_invcmd(false);
                core.status.set_idle(false);
                core.param_left = X54xCmd::from_u8(val)
                    .map_or_else(|| self.vendor.param_len(val), X54xCmd::param_len);
                if X54X_TRACE {
                    log::debug!("{}: command {:02X}", self.vendor.name(), val);
                }
            }
        }

        if self.core.param_left == 0 {
            self.run_command(ctx);
        }
    }

    fn run_command(&mut self, ctx: &mut HostContext<'_>) {
        let Some(cmd) = self.core.command else {
            return;
        };

        let outcome = match X54xCmd::from_u8(cmd) {
            Some(c) => self.generic_command(ctx, c),
            None => self.vendor.command(&mut self.core, ctx, cmd),
        };

        match outcome {
            CmdOutcome::Reset => {
                self.reset_ctrl(ctx, true);
                return;
            }
            CmdOutcome::Invalid => {
                log::warn!("{}: invalid command {:02X}", self.vendor.name(), cmd);
                self.core.status.set_invcmd(true);
                self.core.reply.clear();
            }
            CmdOutcome::Done | CmdOutcome::Silent => (),
        }

        if self.core.reply_pending() > 0 {
            self.core.status.set_dfull(true);
        } else if self.core.param_left == 0 {
            self.core.cmd_done(outcome == CmdOutcome::Silent);
        }
    }

    fn generic_command(&mut self, ctx: &mut HostContext<'_>, cmd: X54xCmd) -> CmdOutcome {
        let core = &mut self.core;
        let p = core.params.clone();

        match cmd {
            X54xCmd::Nop | X54xCmd::SelectionTimeout => (),
            X54xCmd::MailboxInit => {
                core.init_mailboxes(AddressWidth::Bits24, p[0], addr24_to_u32([p[1], p[2], p[3]]));
            }
            X54xCmd::StartScsi => {
                core.state.mailbox_req = core.state.mailbox_req.saturating_add(1);
            }
            // Disk BIOS services are not provided
            X54xCmd::BiosCommand => return CmdOutcome::Invalid,
            X54xCmd::Inquiry => {
                let rev = self.vendor.fw_rev();
                core.set_reply(&rev[..4]);
            }
            X54xCmd::EnableMboInterrupt => {
                if p[0] > 1 {
                    return CmdOutcome::Invalid;
                }
                core.state.mbo_irq = p[0] == 1;
                return CmdOutcome::Silent;
            }
            X54xCmd::BusOnTime => core.bus_on = p[0],
            X54xCmd::BusOffTime => core.bus_off = p[0],
            X54xCmd::DmaSpeed => core.dma_speed = p[0],
            X54xCmd::ReturnDevices => {
                let host_id = self.vendor.host_id();
                let mut luns = [0u8; 8];
                for (id, mask) in luns.iter_mut().enumerate() {
                    if id == usize::from(host_id) {
                        continue;
                    }
                    for lun in 0..MAX_LUNS {
                        if ctx.devices.present(id as u8, lun as u8) {
                            *mask |= 1 << lun;
                        }
                    }
                }
                core.set_reply(&luns);
            }
            X54xCmd::ReturnConfig => {
                let irq = self.vendor.irq();
                core.set_reply(&[
                    1 << (self.vendor.dma() & 7),
                    if (9..=15).contains(&irq) { 1 << (irq - 9) } else { 0 },
                    self.vendor.host_id(),
                ]);
            }
            X54xCmd::ReturnSetup => {
                let mut data = [0u8; 256];
                data[1] = core.dma_speed;
                data[2] = core.bus_on;
                data[3] = core.bus_off;
                data[4] = core.state.count as u8;
                data[5..8].copy_from_slice(&dma::u32_to_addr24(core.state.out_base));
                self.vendor.setup_data(core, &mut data);
                core.set_reply(&data[..usize::from(p[0])]);
            }
            X54xCmd::WriteChannel2 => {
                let addr = addr24_to_u32([p[0], p[1], p[2]]);
                if let Err(e) = ctx.mem.read_block(addr, &mut core.channel2) {
                    log::error!("{}: channel 2 buffer read: {}", self.vendor.name(), e);
                }
            }
            X54xCmd::ReadChannel2 => {
                let addr = addr24_to_u32([p[0], p[1], p[2]]);
                if let Err(e) = ctx.mem.write_block(addr, &core.channel2) {
                    log::error!("{}: channel 2 buffer write: {}", self.vendor.name(), e);
                }
            }
            X54xCmd::Echo => core.set_reply(&[p[0]]),
            X54xCmd::Options => {
                // First parameter is the amount of option bytes that follow
                if p.len() == 1 {
                    core.param_left = usize::from(p[0]);
                }
            }
        }
        CmdOutcome::Done
    }

    fn read_data(&mut self) -> u8 {
        let core = &mut self.core;
        let Some(&val) = core.reply.get(core.reply_pos) else {
            return 0;
        };
        core.reply_pos += 1;
        if core.reply_pos == core.reply.len() {
            core.cmd_done(false);
        }
        val
    }

    fn read_geometry(&mut self) -> u8 {
        if self.vendor.geometry_writable() {
            return self.core.geometry;
        }
        let sig = [b'A', b'D', b'A', b'P'][usize::from(self.core.geometry & 3)];
        self.core.geometry = (self.core.geometry + 1) & 3;
        sig ^ 1
    }

    /// Time to run a step that moved `bytes` bytes
    fn step_time(&self, bytes: usize) -> Ticks {
        let rate = self.vendor.bus_rate().max(1);
        STEP_OVERHEAD + (bytes as Ticks) * TICKS_PER_SEC / rate
    }

    /// Performs one step of mailbox processing. Returns the amount of
    /// bytes moved.
    fn step(&mut self, ctx: &mut HostContext<'_>) -> usize {
        let Some(mut req) = self.core.request.take() else {
            return self.step_scan(ctx);
        };

        let bytes = match self.core.sub_phase {
            SubPhase::Scan | SubPhase::Execute => self.step_execute(ctx, &mut req),
            SubPhase::Transfer => self.step_transfer(ctx, &mut req),
            SubPhase::Complete => self.step_complete(ctx, &mut req),
            SubPhase::Notify => return self.step_notify(ctx, &req),
        };
        self.core.request = Some(req);
        bytes
    }

    fn step_scan(&mut self, ctx: &mut HostContext<'_>) -> usize {
        let st = &self.core.state;
        if self.core.status.init()
            || self.core.status.stst()
            || !st.mailbox_init
            || st.count == 0
            || st.mailbox_req == 0
        {
            return 0;
        }

        self.core.state.aggressive = self.aggressive();
        let Some((mbo_addr, mbo)) = self.core.scan(ctx) else {
            return 0;
        };
        self.dispatch(ctx, mbo_addr, mbo)
    }

    fn dispatch(&mut self, ctx: &mut HostContext<'_>, mbo_addr: Address, mbo: MailboxOut) -> usize {
        let width = self.core.state.width;
        let mut req = Request::new(mbo_addr, mbo.ccb_ptr);
        self.core.state.mailbox_req = self.core.state.mailbox_req.saturating_sub(1);
        let mut bytes = width.mailbox_len();

        match mbo.action {
            MBO_START => {
                let mut raw = vec![0; Ccb::wire_len(width)];
                bytes += raw.len();
                match ctx.mem.read_block(mbo.ccb_ptr, &mut raw) {
                    Ok(()) => self.start(ctx, &mut req, Ccb::decode(width, &raw)),
                    Err(e) => {
                        log::warn!("{}: CCB fetch at {:08X}: {}", self.vendor.name(), mbo.ccb_ptr, e);
                        req.finish(HS_INVALID_CCB, STATUS_GOOD, MBI_ERROR);
                        self.core.sub_phase = SubPhase::Notify;
                    }
                }
            }
            MBO_ABORT => {
                // Commands complete before the next mailbox is looked at
                req.finish(HS_ABORT_NOT_FOUND, STATUS_GOOD, MBI_NOT_FOUND);
                self.core.sub_phase = SubPhase::Notify;
            }
            code => {
                log::warn!("{}: bad mailbox action code {:02X}", self.vendor.name(), code);
                req.finish(HS_BAD_MBO_COMMAND, STATUS_GOOD, MBI_ERROR);
                self.core.sub_phase = SubPhase::Notify;
            }
        }

        self.core.request = Some(req);
        bytes
    }

    fn start(&mut self, ctx: &mut HostContext<'_>, req: &mut Request, ccb: Ccb) {
        if X54X_TRACE {
            log::debug!("{}: CCB @ {:08X}: {:?}", self.vendor.name(), req.ccb_addr, ccb);
        }

        self.core.sub_phase = SubPhase::Notify;
        if ccb.target > self.vendor.max_target()
            || usize::from(ccb.lun) >= MAX_LUNS
            || !ctx.devices.present(ccb.target, ccb.lun)
        {
            req.finish(HS_SELECTION_TIMEOUT, STATUS_GOOD, MBI_ERROR);
        } else {
            match ccb.opcode() {
                None => {
                    log::warn!("{}: invalid CCB opcode {:02X}", self.vendor.name(), ccb.opcode);
                    req.finish(HS_INVALID_OP_CODE, STATUS_GOOD, MBI_ERROR);
                }
                Some(CcbOpcode::BusReset) => {
                    ctx.devices.reset_target(ccb.target);
                    req.finish(HS_COMPLETE, STATUS_GOOD, MBI_SUCCESS);
                }
                Some(_) => self.core.sub_phase = SubPhase::Execute,
            }
        }
        req.ccb = Some(ccb);
    }

    fn step_execute(&mut self, ctx: &mut HostContext<'_>, req: &mut Request) -> usize {
        let width = self.core.state.width;
        let Some(ccb) = req.ccb.clone() else {
            self.core.sub_phase = SubPhase::Notify;
            return 0;
        };

        req.transfer_len = match ccb.opcode() {
            _ if ccb.data_len == 0 || ccb.control == CTRL_NO_TRANSFER => 0,
            Some(op) if op.scatter_gather() => {
                match dma::total_length(ctx.mem, width, &ccb.descriptor(width)) {
                    Ok(len) => len,
                    Err(e) => {
                        log::error!("{}: S/G list at {:08X}: {}", self.vendor.name(), ccb.data_ptr, e);
                        0
                    }
                }
            }
            Some(CcbOpcode::Initiator | CcbOpcode::InitiatorResidual) => ccb.data_len,
            _ => 0,
        };

        let Some(unit) = ctx.devices.resolve(ccb.target, ccb.lun) else {
            req.finish(HS_SELECTION_TIMEOUT, STATUS_GOOD, MBI_ERROR);
            self.core.sub_phase = SubPhase::Notify;
            return 0;
        };

        let mut cdb = vec![0; unit.cdb_length()];
        let len = cdb.len().min(usize::from(ccb.cdb_len)).min(CCB_CDB_LEN);
        cdb[..len].copy_from_slice(&ccb.cdb[..len]);
        unit.execute(&cdb);

        if unit.status() != STATUS_GOOD || unit.phase() == UnitPhase::Status {
            while unit.progress() == Progress::MorePending {
                unit.advance();
            }
            self.core.sub_phase = SubPhase::Complete;
        } else {
            self.core.sub_phase = SubPhase::Transfer;
        }
        cdb.len()
    }

    fn step_transfer(&mut self, ctx: &mut HostContext<'_>, req: &mut Request) -> usize {
        let width = self.core.state.width;
        let Some(ccb) = req.ccb.clone() else {
            self.core.sub_phase = SubPhase::Notify;
            return 0;
        };
        let Some(unit) = ctx.devices.resolve(ccb.target, ccb.lun) else {
            req.finish(HS_SELECTION_TIMEOUT, STATUS_GOOD, MBI_ERROR);
            self.core.sub_phase = SubPhase::Notify;
            return 0;
        };

        let phase = unit.phase();
        if (ccb.control == CTRL_DATA_IN && phase == UnitPhase::DataOut)
            || (ccb.control == CTRL_DATA_OUT && phase == UnitPhase::DataIn)
        {
            log::warn!(
                "{}: control {} conflicts with {:?} for {:02X?}",
                self.vendor.name(),
                ccb.control,
                phase,
                &ccb.cdb[..]
            );
            unit.abort();
            req.finish(HS_INVALID_DIRECTION, STATUS_GOOD, MBI_ERROR);
            self.core.sub_phase = SubPhase::Notify;
            return 0;
        }

        let mut moved = 0;
        let dir = match phase {
            UnitPhase::DataIn => Some(Direction::ToGuest),
            UnitPhase::DataOut => Some(Direction::FromGuest),
            UnitPhase::Status => None,
        };
        if req.transfer_len > 0 && ccb.control != CTRL_NO_TRANSFER {
            if let Some(dir) = dir {
                moved = Self::move_data(&mut *ctx.mem, unit, width, &ccb, dir, req.transfer_len);
            }
        }

        if phase == UnitPhase::DataOut && ccb.control == CTRL_NO_TRANSFER {
            unit.abort();
        } else {
            // Data stage, then sense
            unit.advance();
            if unit.progress() == Progress::MorePending {
                unit.advance();
            }
        }
        self.core.sub_phase = SubPhase::Complete;
        moved
    }

    fn move_data(
        mem: &mut dyn GuestMemory,
        unit: &mut LogicalUnit,
        width: AddressWidth,
        ccb: &Ccb,
        dir: Direction,
        limit: u32,
    ) -> usize {
        let buf = unit.buffer_mut();
        let len = buf.len().min(limit as usize);
        match dma::transfer(mem, width, &ccb.descriptor(width), dir, &mut buf[..len], 0) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Data {:?} at {:08X}: {}", dir, ccb.data_ptr, e);
                0
            }
        }
    }

    fn step_complete(&mut self, ctx: &mut HostContext<'_>, req: &mut Request) -> usize {
        let width = self.core.state.width;
        self.core.sub_phase = SubPhase::Notify;
        let Some(ccb) = req.ccb.clone() else {
            return 0;
        };
        let Some(unit) = ctx.devices.resolve(ccb.target, ccb.lun) else {
            req.finish(HS_SELECTION_TIMEOUT, STATUS_GOOD, MBI_ERROR);
            return 0;
        };

        let status = unit.status();
        let sense_addr = ccb.sense_addr(width, req.ccb_addr);
        let mut moved = 0;

        if ccb.cdb[0] == 0x03 && ccb.control == CTRL_NO_TRANSFER {
            // REQUEST SENSE without a data buffer lands in the sense area,
            // sized by the CCB's sense length
            let len = ccb.sense_len();
            if status != STATUS_GOOD && len > 0 {
                let mut data = unit.buffer().to_vec();
                data.resize(len, 0);
                if let Err(e) = ctx.mem.write_block(sense_addr, &data) {
                    log::error!("{}: sense write: {}", self.vendor.name(), e);
                }
                moved += len;
            }
        } else if status != STATUS_GOOD && ccb.sense_len() > 0 {
            let sense = unit.request_sense(ccb.sense_len());
            if let Err(e) = ctx.mem.write_block(sense_addr, &sense) {
                log::error!("{}: sense write: {}", self.vendor.name(), e);
            }
            moved += sense.len();
        }

        if matches!(ccb.opcode(), Some(op) if op.residual()) {
            let residue = if ccb.data_len > 0 && ccb.control != CTRL_NO_TRANSFER {
                req.transfer_len.saturating_sub(unit.init_length() as u32)
            } else {
                0
            };
            let mut field = [0u8; 4];
            width.encode(residue, &mut field);
            let addr = req.ccb_addr.wrapping_add(CCB_DATA_LEN_OFFSET);
            if let Err(e) = ctx.mem.write_block(addr, &field[..width.field_len()]) {
                log::error!("{}: residual write: {}", self.vendor.name(), e);
            }
        }

        if status == STATUS_GOOD {
            req.finish(HS_COMPLETE, status, MBI_SUCCESS);
        } else {
            req.finish(HS_COMPLETE, status, MBI_ERROR);
        }
        moved
    }

    fn step_notify(&mut self, ctx: &mut HostContext<'_>, req: &Request) -> usize {
        let core = &mut self.core;
        let width = core.state.width;
        let mbl = width.mailbox_len();
        core.sub_phase = SubPhase::Scan;

        let free_addr = req.mbo_addr.wrapping_add(MailboxOut::action_offset(width));
        if let Err(e) = ctx.mem.write_byte(free_addr, MBO_FREE) {
            log::error!("{}: mailbox free: {}", self.vendor.name(), e);
        }

        // Only the status bytes of the CCB header are rewritten
        if req.completion != MBI_NOT_FOUND {
            let addr = req.ccb_addr.wrapping_add(CCB_STATUS_OFFSET);
            let mut hdr = [0u8; 4];
            let result = ctx.mem.read_block(addr, &mut hdr).and_then(|()| {
                hdr[2] = req.host_status;
                hdr[3] = req.target_status;
                ctx.mem.write_block(addr, &hdr)
            });
            if let Err(e) = result {
                log::error!("{}: CCB status write: {}", self.vendor.name(), e);
            }
        }

        if core.state.count == 0 {
            return 0;
        }
        let mbi = MailboxIn {
            ccb_ptr: req.ccb_addr,
            host_status: req.host_status,
            target_status: req.target_status,
            completion: req.completion,
        };
        let addr = core
            .state
            .in_base
            .wrapping_add(core.state.in_cursor * mbl as u32);
        if X54X_TRACE {
            log::debug!("MBI {} @ {:08X}: {:?}", core.state.in_cursor, addr, mbi);
        }
        if let Err(e) = ctx.mem.write_block(addr, &mbi.encode(width)) {
            log::error!("{}: mailbox in write: {}", self.vendor.name(), e);
        }
        core.state.in_cursor = (core.state.in_cursor + 1) % core.state.count;

        let bits = if core.state.mbo_irq {
            INTR_MBIF | INTR_MBOA
        } else {
            INTR_MBIF
        };
        core.raise_irq(false, bits);
        mbl + 4
    }
}

impl<V: X54xVendor> IoDevice for X54x<V> {
    fn read(&mut self, _ctx: &mut HostContext<'_>, port: IoPort) -> Option<u8> {
        let val = match port & 3 {
            0 => self.core.status.0,
            1 => self.read_data(),
            2 => {
                if self.vendor.geometry_writable() {
                    self.core.intr.0
                } else {
                    self.core.intr.0 & !0x70
                }
            }
            _ => self.read_geometry(),
        };
        if X54X_TRACE {
            log::debug!("{}: read {} = {:02X}", self.vendor.name(), port & 3, val);
        }
        Some(val)
    }

    fn write(&mut self, ctx: &mut HostContext<'_>, port: IoPort, val: u8) -> Option<()> {
        if X54X_TRACE {
            log::debug!("{}: write {} = {:02X}", self.vendor.name(), port & 3, val);
        }
        match port & 3 {
            0 => self.write_control(ctx, val),
            1 => self.write_command(ctx, val),
            2 => {
                if self.vendor.geometry_writable() {
                    self.core.intr = X54xIntr(val);
                }
            }
            _ => {
                if self.vendor.geometry_writable() {
                    self.core.geometry = val;
                }
            }
        }
        Some(())
    }
}

impl<V: X54xVendor> IrqSource for X54x<V> {
    fn get_irq(&self) -> bool {
        self.core.irq_line
    }
}

impl<V: X54xVendor> Tickable for X54x<V> {
    fn tick(&mut self, ctx: &mut HostContext<'_>, ticks: Ticks) -> Result<Ticks> {
        if self.core.selftest > 0 {
            self.core.selftest = self.core.selftest.saturating_sub(ticks);
            if self.core.selftest == 0 {
                self.core.status = X54xStatus(0).with_init(true).with_idle(true);
            }
        }

        self.core.countdown = self.core.countdown.saturating_sub(ticks);
        if self.core.countdown == 0 {
            let bytes = self.step(ctx);
            self.core.countdown = self.step_time(bytes);
        }
        Ok(ticks)
    }
}

impl<V: X54xVendor> Debuggable for X54x<V> {
    fn get_debug_properties(&self) -> DebuggableProperties {
        let core = &self.core;
        let st = &core.state;

        vec![
            dbgprop_header!("Registers"),
            dbgprop_byte!("Status", core.status.0),
            dbgprop_byte!("Interrupt", core.intr.0),
            dbgprop_byte!("Pending interrupt", core.pending),
            dbgprop_bool!("IRQ", core.irq_line),
            dbgprop_byte!("Command", core.command.unwrap_or(0xFF)),
            dbgprop_udec!("Parameters left", core.param_left),
            dbgprop_udec!("Reply left", core.reply_pending()),
            dbgprop_header!("Mailboxes"),
            dbgprop_group!(
                "Rings",
                vec![
                    dbgprop_enum!("Width", st.width),
                    dbgprop_bool!("Initialized", st.mailbox_init),
                    dbgprop_udec!("Count", st.count),
                    dbgprop_addr!("Out base", st.out_base),
                    dbgprop_addr!("In base", st.in_base),
                    dbgprop_udec!("Out cursor", st.out_cursor),
                    dbgprop_udec!("In cursor", st.in_cursor),
                    dbgprop_udec!("Requests", st.mailbox_req),
                ]
            ),
            dbgprop_bool!("Aggressive", self.aggressive()),
            dbgprop_bool!("MBO interrupts", st.mbo_irq),
            dbgprop_enum!("Sub-phase", core.sub_phase),
            dbgprop_bool!("Busy", core.busy()),
            dbgprop_nest!(self.vendor.name(), self.vendor),
        ]
    }
}
