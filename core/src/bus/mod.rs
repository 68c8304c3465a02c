//! Collaborator interfaces towards the surrounding emulator: guest memory,
//! port I/O and the context passed into every adapter operation.

pub mod testbus;

use thiserror::Error;

use crate::scsi::registry::DeviceRegistry;

/// Guest physical address
pub type Address = u32;

/// Port I/O address
pub type IoPort = u16;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Guest memory access out of bounds: {len} bytes at {addr:08X}")]
    OutOfBounds { addr: Address, len: usize },
}

/// Bounds-checked block access to guest memory, as used for bus-master DMA.
///
/// This is the only way adapters touch guest memory.
pub trait GuestMemory {
    fn read_block(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_block(&mut self, addr: Address, data: &[u8]) -> Result<(), MemoryError>;

    fn read_byte(&mut self, addr: Address) -> Result<u8, MemoryError> {
        let mut b = [0; 1];
        self.read_block(addr, &mut b)?;
        Ok(b[0])
    }

    fn write_byte(&mut self, addr: Address, val: u8) -> Result<(), MemoryError> {
        self.write_block(addr, &[val])
    }
}

/// Flat guest RAM starting at address 0
pub struct Ram {
    mem: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self { mem: vec![0; size] }
    }

    fn range(&self, addr: Address, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.mem.len() => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds { addr, len }),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mem
    }
}

impl GuestMemory for Ram {
    fn read_block(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
        let r = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[r]);
        Ok(())
    }

    fn write_block(&mut self, addr: Address, data: &[u8]) -> Result<(), MemoryError> {
        let r = self.range(addr, data.len())?;
        self.mem[r].copy_from_slice(data);
        Ok(())
    }
}

/// Everything an adapter borrows from the surrounding emulator for the
/// duration of one operation.
pub struct HostContext<'a> {
    pub mem: &'a mut dyn GuestMemory,
    pub devices: &'a mut DeviceRegistry,
}

impl<'a> HostContext<'a> {
    pub fn new(mem: &'a mut dyn GuestMemory, devices: &'a mut DeviceRegistry) -> Self {
        Self { mem, devices }
    }
}

/// A device decoding a window of I/O ports.
///
/// `port` is the offset within the device's window. Accesses the device
/// does not decode return `None`.
pub trait IoDevice {
    fn read(&mut self, ctx: &mut HostContext<'_>, port: IoPort) -> Option<u8>;
    fn write(&mut self, ctx: &mut HostContext<'_>, port: IoPort, val: u8) -> Option<()>;
}

/// Source of an interrupt line
pub trait IrqSource {
    fn get_irq(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_block_access() {
        let mut ram = Ram::new(0x100);
        ram.write_block(0x10, &[1, 2, 3]).unwrap();
        let mut buf = [0; 4];
        ram.read_block(0x0F, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(ram.read_byte(0x12), Ok(3));
    }

    #[test]
    fn ram_out_of_bounds() {
        let mut ram = Ram::new(0x100);
        assert_eq!(
            ram.write_block(0xFE, &[0; 4]),
            Err(MemoryError::OutOfBounds {
                addr: 0xFE,
                len: 4
            })
        );
        let mut buf = [0; 1];
        assert!(ram.read_block(0x100, &mut buf).is_err());
        assert!(ram.read_block(0xFFFF_FFFF, &mut buf).is_err());
        // Zero-length access at the end is fine
        assert!(ram.read_block(0x100, &mut []).is_ok());
    }
}
