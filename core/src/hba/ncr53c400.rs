//! NCR 53C400: 5380 core with a 128-byte host buffer and block counter

use anyhow::Result;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::bus::{HostContext, IoDevice, IoPort, IrqSource};
use crate::debuggable::*;
use crate::hba::ncr5380::{DmaMode, Ncr5380};
use crate::scsi::registry::DeviceRegistry;
use crate::tickable::{TICKS_PER_USEC, Tickable, Ticks};
use crate::{dbgprop_bool, dbgprop_byte, dbgprop_nest, dbgprop_udec};

const C400_TRACE: bool = false;

pub const BUFFER_SIZE: usize = 128;

/// DMA poll period, moving up to `BYTES_PER_POLL` each (5 MB/s)
pub const POLL_TIME: Ticks = 10 * TICKS_PER_USEC;
const BYTES_PER_POLL: usize = 50;

bitfield! {
    /// 53C400 status (r) / control (w) register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct C400Status(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Host side of the buffer is not ready
        pub buffer_not_ready: bool @ 2,
        /// Bits written through the control register
        pub control: u8 @ 3..=6,
        /// Transfer from SCSI to host
        pub data_dir: bool @ 6,
        /// 5380 registers may be accessed
        pub ncr_accessible: bool @ 7,
    }
}

#[derive(Serialize, Deserialize)]
pub struct Ncr53c400 {
    ncr: Ncr5380,

    #[serde(with = "BigArray")]
    buffer: [u8; BUFFER_SIZE],
    /// SCSI side position in the buffer
    buffer_pos: usize,
    /// Host side position in the buffer
    host_pos: usize,

    status_ctrl: C400Status,
    block_count: u8,
    block_count_loaded: bool,
    /// Buffer handed to the 5380 and not drained yet
    ncr_busy: bool,

    elapsed: Ticks,
}

impl Default for Ncr53c400 {
    fn default() -> Self {
        Self::new()
    }
}

impl Ncr53c400 {
    pub fn new() -> Self {
        Self {
            ncr: Ncr5380::new(),
            buffer: [0; BUFFER_SIZE],
            buffer_pos: 0,
            host_pos: BUFFER_SIZE,
            status_ctrl: C400Status(0).with_buffer_not_ready(true),
            block_count: 0,
            block_count_loaded: false,
            ncr_busy: false,
            elapsed: 0,
        }
    }

    pub fn ncr(&self) -> &Ncr5380 {
        &self.ncr
    }

    pub fn dma_enabled(&self) -> bool {
        self.ncr.dma_enabled() && self.block_count_loaded
    }

    /// Hands the buffer to the host side, or takes it back, depending on
    /// the transfer direction
    fn rewind_host(&mut self) {
        if self.status_ctrl.data_dir() {
            self.host_pos = BUFFER_SIZE;
            self.status_ctrl.set_buffer_not_ready(true);
        } else {
            self.host_pos = 0;
            self.status_ctrl.set_buffer_not_ready(false);
        }
    }

    fn write_control(&mut self, val: u8) {
        let new = C400Status(val);
        if new.data_dir() != self.status_ctrl.data_dir() {
            self.status_ctrl.set_data_dir(new.data_dir());
            self.rewind_host();
        }
        self.status_ctrl.set_control(new.control());
    }

    fn write_block_count(&mut self, val: u8) {
        self.block_count = val;
        self.block_count_loaded = true;
        self.rewind_host();
    }

    fn read_buffer(&mut self) -> u8 {
        if !self.status_ctrl.data_dir() || self.host_pos >= BUFFER_SIZE {
            return 0xFF;
        }
        let val = self.buffer[self.host_pos];
        self.host_pos += 1;
        if self.host_pos == BUFFER_SIZE {
            self.status_ctrl.set_buffer_not_ready(true);
        }
        val
    }

    fn write_buffer(&mut self, val: u8) {
        if self.status_ctrl.data_dir() || self.host_pos >= BUFFER_SIZE {
            return;
        }
        self.buffer[self.host_pos] = val;
        self.host_pos += 1;
        if self.host_pos == BUFFER_SIZE {
            self.status_ctrl.set_buffer_not_ready(true);
            self.ncr_busy = true;
        }
    }

    /// One DMA poll period
    fn poll(&mut self, devices: &mut DeviceRegistry) {
        match self.ncr.dma_mode() {
            DmaMode::Send if self.status_ctrl.data_dir() => {
                log::warn!("DMA send with buffer direction set to read");
            }
            DmaMode::InitiatorReceive if !self.status_ctrl.data_dir() => {
                log::warn!("DMA receive with buffer direction set to write");
            }
            DmaMode::Send | DmaMode::InitiatorReceive => {
                if self.status_ctrl.buffer_not_ready() && self.block_count_loaded {
                    self.pump(devices);
                }
            }
            mode => log::warn!("DMA poll in mode {:?}", mode),
        }

        self.ncr.check_busy();
    }

    /// Moves bytes between the bus and the buffer while the target
    /// requests them
    fn pump(&mut self, devices: &mut DeviceRegistry) {
        let send = self.ncr.dma_mode() == DmaMode::Send;

        for _ in 0..BYTES_PER_POLL {
            if !self.ncr.bus_signals().req() {
                break;
            }
            if !self.ncr.phase_match() {
                log::debug!("Phase changed during DMA at buffer position {}", self.buffer_pos);
                self.ncr.dma_phase_mismatch();
                break;
            }

            let out = send.then_some(self.buffer[self.buffer_pos]);
            let val = self.ncr.dma_handshake(devices, out);
            if !send {
                self.buffer[self.buffer_pos] = val;
            }
            self.buffer_pos += 1;

            if self.buffer_pos == BUFFER_SIZE {
                self.block_done();
                break;
            }
        }
    }

    fn block_done(&mut self) {
        self.buffer_pos = 0;
        self.host_pos = 0;
        self.status_ctrl.set_buffer_not_ready(false);
        self.ncr_busy = false;
        self.block_count = self.block_count.wrapping_sub(1);
        if C400_TRACE {
            log::debug!("Block done, {} left", self.block_count);
        }

        if self.block_count == 0 {
            self.block_count_loaded = false;
            self.ncr.end_of_dma();
        }
    }
}

impl IoDevice for Ncr53c400 {
    fn read(&mut self, _ctx: &mut HostContext<'_>, port: IoPort) -> Option<u8> {
        let val = match port & 0x0F {
            0 => self.status_ctrl.with_ncr_accessible(!self.ncr_busy).0,
            1 => self.block_count,
            4 | 5 => self.read_buffer(),
            0x08..=0x0F => self.ncr.read_reg(port),
            // Switches
            _ => 0xFF,
        };
        if C400_TRACE {
            log::debug!("53C400 read {:X} = {:02X}", port & 0x0F, val);
        }
        Some(val)
    }

    fn write(&mut self, ctx: &mut HostContext<'_>, port: IoPort, val: u8) -> Option<()> {
        if C400_TRACE {
            log::debug!("53C400 write {:X} = {:02X}", port & 0x0F, val);
        }
        match port & 0x0F {
            0 => self.write_control(val),
            1 => self.write_block_count(val),
            4 | 5 => self.write_buffer(val),
            0x08..=0x0F => self.ncr.write_reg(ctx.devices, port, val),
            _ => (),
        }
        Some(())
    }
}

impl IrqSource for Ncr53c400 {
    fn get_irq(&self) -> bool {
        self.ncr.get_irq()
    }
}

impl Tickable for Ncr53c400 {
    fn tick(&mut self, ctx: &mut HostContext<'_>, ticks: Ticks) -> Result<Ticks> {
        if !self.dma_enabled() {
            self.elapsed = 0;
            return Ok(ticks);
        }

        self.elapsed += ticks;
        while self.elapsed >= POLL_TIME && self.dma_enabled() {
            self.elapsed -= POLL_TIME;
            self.poll(ctx.devices);
        }
        Ok(ticks)
    }
}

impl Debuggable for Ncr53c400 {
    fn get_debug_properties(&self) -> DebuggableProperties {
        vec![
            dbgprop_byte!("Status", self.status_ctrl.0),
            dbgprop_udec!("Block count", self.block_count),
            dbgprop_bool!("Block count loaded", self.block_count_loaded),
            dbgprop_udec!("Buffer position", self.buffer_pos),
            dbgprop_udec!("Host position", self.host_pos),
            dbgprop_bool!("DMA enabled", self.dma_enabled()),
            dbgprop_nest!("NCR 5380", self.ncr),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hba::ncr5380::tests::*;
    use crate::hba::x54x::tests::Bench;

    const NCR: IoPort = 8;
    const MR_DMA: u8 = 0x02;
    const MR_MONITOR_BUSY: u8 = 0x04;
    const MR_EOP_IRQ: u8 = 0x08;
    const CTRL_DIR: u8 = 0x40;

    fn rd(c: &mut Ncr53c400, bench: &mut Bench, port: IoPort) -> u8 {
        c.read(&mut bench.ctx(), port).unwrap()
    }

    fn wr(c: &mut Ncr53c400, bench: &mut Bench, port: IoPort, val: u8) {
        c.write(&mut bench.ctx(), port, val).unwrap();
    }

    fn poll(c: &mut Ncr53c400, bench: &mut Bench, n: usize) {
        for _ in 0..n {
            c.tick(&mut bench.ctx(), POLL_TIME).unwrap();
        }
    }

    /// Selects the disk and sends a CDB through the 5380 registers
    fn start(c: &mut Ncr53c400, bench: &mut Bench, cdb: &[u8], phase: u8) {
        let mut pio = Pio {
            dev: c,
            base: NCR,
            bench,
        };
        assert!(pio.select(0, false));
        pio.send(PHASE_COMMAND, cdb);
        pio.wr(3, phase);
    }

    fn finish(c: &mut Ncr53c400, bench: &mut Bench) -> u8 {
        wr(c, bench, NCR + 2, 0);
        wr(c, bench, NCR + 1, 0);
        Pio {
            dev: c,
            base: NCR,
            bench,
        }
        .finish()
    }

    fn pattern() -> Vec<u8> {
        (0..512).map(|i| (i * 13 + 1) as u8).collect()
    }

    #[test]
    fn power_on_registers() {
        let mut bench = Bench::new();
        let mut c = Ncr53c400::new();
        assert_eq!(rd(&mut c, &mut bench, 0), 0x84);
        assert_eq!(rd(&mut c, &mut bench, 1), 0);
        assert_eq!(rd(&mut c, &mut bench, 2), 0xFF);
        assert_eq!(rd(&mut c, &mut bench, 3), 0xFF);
        // Buffer not readable in the write direction
        assert_eq!(rd(&mut c, &mut bench, 4), 0xFF);
        assert_eq!(rd(&mut c, &mut bench, NCR + 4), 0);

        wr(&mut c, &mut bench, 0, 0xFF);
        assert_eq!(rd(&mut c, &mut bench, 0), 0xFC);
        assert_eq!(rd(&mut c, &mut bench, 4), 0xFF);
    }

    #[test]
    fn dma_receive() {
        let mut bench = Bench::new();
        let unit = bench.devices.resolve(0, 0).unwrap();
        unit.execute(&[0x0A, 0, 0, 1, 1, 0]);
        unit.buffer_mut().copy_from_slice(&pattern());
        unit.advance();
        unit.advance();

        let mut c = Ncr53c400::new();
        start(&mut c, &mut bench, &[0x08, 0, 0, 1, 1, 0], PHASE_DATA_IN);
        wr(&mut c, &mut bench, NCR + 2, MR_DMA | MR_EOP_IRQ);
        wr(&mut c, &mut bench, NCR + 7, 0);
        wr(&mut c, &mut bench, 0, CTRL_DIR);
        wr(&mut c, &mut bench, 1, 4);
        assert!(c.dma_enabled());

        let mut data = vec![];
        for block in 0..4 {
            // 128 bytes take three polls
            poll(&mut c, &mut bench, 2);
            assert_ne!(rd(&mut c, &mut bench, 0) & 0x04, 0);
            poll(&mut c, &mut bench, 1);
            assert_eq!(rd(&mut c, &mut bench, 0) & 0x04, 0, "block {}", block);
            // Nothing moves until the host drained the buffer
            poll(&mut c, &mut bench, 3);
            for _ in 0..BUFFER_SIZE {
                data.push(rd(&mut c, &mut bench, 4));
            }
        }
        assert_eq!(data, pattern());
        assert_eq!(rd(&mut c, &mut bench, 1), 0);
        assert!(!c.dma_enabled());
        assert_ne!(rd(&mut c, &mut bench, NCR + 5) & 0x80, 0);
        assert!(c.get_irq());

        assert_eq!(finish(&mut c, &mut bench), 0);
    }

    #[test]
    fn dma_send() {
        let mut bench = Bench::new();
        let mut c = Ncr53c400::new();
        start(&mut c, &mut bench, &[0x0A, 0, 0, 2, 1, 0], PHASE_DATA_OUT);
        wr(&mut c, &mut bench, NCR + 1, ICR_DBP);
        wr(&mut c, &mut bench, NCR + 2, MR_DMA);
        wr(&mut c, &mut bench, NCR + 5, 0);
        wr(&mut c, &mut bench, 0, 0);
        wr(&mut c, &mut bench, 1, 4);

        let data = pattern();
        for chunk in data.chunks(BUFFER_SIZE) {
            assert_eq!(rd(&mut c, &mut bench, 0) & 0x84, 0x80);
            for &b in chunk {
                wr(&mut c, &mut bench, 4, b);
            }
            assert_eq!(rd(&mut c, &mut bench, 0) & 0x84, 0x04);
            poll(&mut c, &mut bench, 3);
        }
        // Last byte sent
        assert_eq!(rd(&mut c, &mut bench, NCR + 3) & 0x80, 0x80);
        assert!(!c.get_irq());
        assert_ne!(rd(&mut c, &mut bench, NCR + 5) & 0x80, 0);
        assert_eq!(finish(&mut c, &mut bench), 0);

        let unit = bench.devices.resolve(0, 0).unwrap();
        unit.execute(&[0x08, 0, 0, 2, 1, 0]);
        assert_eq!(unit.buffer(), &data[..]);
    }

    #[test]
    fn phase_change_stops_dma() {
        let mut bench = Bench::new();
        let mut c = Ncr53c400::new();
        // TEST UNIT READY goes straight to status
        start(&mut c, &mut bench, &[0x00, 0, 0, 0, 0, 0], PHASE_DATA_IN);
        wr(&mut c, &mut bench, NCR + 2, MR_DMA);
        wr(&mut c, &mut bench, NCR + 7, 0);
        wr(&mut c, &mut bench, 0, CTRL_DIR);
        wr(&mut c, &mut bench, 1, 1);

        poll(&mut c, &mut bench, 1);
        assert!(c.get_irq());
        assert_eq!(c.buffer_pos, 0);
        assert_eq!(finish(&mut c, &mut bench), 0);
    }

    #[test]
    fn debug_view() {
        let c = Ncr53c400::new();
        let props = c.get_debug_properties();
        assert_eq!(find_property(&props, &["Status"]), Some(&DebuggablePropertyValue::Byte(0x04)));
        assert_eq!(
            find_property(&props, &["NCR 5380", "DMA mode"]),
            Some(&DebuggablePropertyValue::StaticStr("Idle"))
        );
        assert_eq!(
            find_property(&props, &["NCR 5380", "Registers", "MR"]).map(ToString::to_string),
            Some("$00".to_string())
        );
    }

    #[test]
    fn monitor_busy_drops_dma() {
        let mut bench = Bench::new();
        let mut c = Ncr53c400::new();
        wr(&mut c, &mut bench, NCR + 2, MR_DMA | MR_MONITOR_BUSY);
        wr(&mut c, &mut bench, NCR + 7, 0);
        wr(&mut c, &mut bench, 0, CTRL_DIR);
        wr(&mut c, &mut bench, 1, 1);
        assert!(c.dma_enabled());

        poll(&mut c, &mut bench, 1);
        assert!(!c.dma_enabled());
        assert_eq!(rd(&mut c, &mut bench, NCR + 2), MR_MONITOR_BUSY);
        assert_ne!(rd(&mut c, &mut bench, NCR + 5) & 0x04, 0);
    }
}
