use std::collections::HashMap;

use super::{Address, GuestMemory, MemoryError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceEntry {
    pub addr: Address,
    pub access: Access,
    pub len: usize,
    pub seq: usize,
}

/// Sparse guest memory that records every block access.
pub struct TestMemory {
    pub mem: HashMap<Address, u8>,
    trace: Vec<TraceEntry>,
    seq: usize,
    trace_enabled: bool,
    mask: Address,
}

impl TestMemory {
    pub fn new(mask: Address) -> Self {
        Self {
            mem: HashMap::new(),
            trace: vec![],
            seq: 0,
            trace_enabled: false,
            mask,
        }
    }

    /// Writes without tracing
    pub fn poke(&mut self, addr: Address, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.mem.insert(addr + i as Address, b);
        }
    }

    /// Reads without tracing
    pub fn peek(&self, addr: Address, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| *self.mem.get(&(addr + i as Address)).unwrap_or(&0))
            .collect()
    }

    pub fn reset_trace(&mut self) {
        self.trace.clear();
        self.trace_enabled = true;
    }

    pub fn get_trace(&self) -> Vec<TraceEntry> {
        self.trace.clone()
    }

    /// Traced writes only, in issue order
    pub fn get_writes(&self) -> Vec<(Address, usize)> {
        self.trace
            .iter()
            .filter(|t| t.access == Access::Write)
            .map(|t| (t.addr, t.len))
            .collect()
    }

    fn check(&self, addr: Address, len: usize) -> Result<(), MemoryError> {
        let last = (addr as u64) + (len as u64).saturating_sub(1);
        if len > 0 && (last > u64::from(self.mask) || addr & self.mask != addr) {
            return Err(MemoryError::OutOfBounds { addr, len });
        }
        Ok(())
    }

    fn record(&mut self, addr: Address, access: Access, len: usize) {
        if self.trace_enabled {
            self.trace.push(TraceEntry {
                addr,
                access,
                len,
                seq: self.seq,
            });
        }
        self.seq += 1;
    }
}

impl GuestMemory for TestMemory {
    fn read_block(&mut self, addr: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check(addr, buf.len())?;
        self.record(addr, Access::Read, buf.len());
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *self.mem.get(&(addr + i as Address)).unwrap_or(&0);
        }
        Ok(())
    }

    fn write_block(&mut self, addr: Address, data: &[u8]) -> Result<(), MemoryError> {
        self.check(addr, data.len())?;
        self.record(addr, Access::Write, data.len());
        self.poke(addr, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testmemory() {
        let mut m = TestMemory::new(0xFFFF);

        let mut buf = [0xAA; 16];
        m.read_block(0x100, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);

        m.write_block(0x100, &[1, 2, 3, 4]).unwrap();
        m.read_block(0x101, &mut buf[0..2]).unwrap();
        assert_eq!(&buf[0..2], &[2, 3]);
        assert_eq!(m.peek(0x100, 5), vec![1, 2, 3, 4, 0]);
    }

    #[test]
    fn trace() {
        let mut m = TestMemory::new(0xFFFF);
        m.write_block(0x10, &[1]).unwrap();
        m.reset_trace();
        m.write_block(0x20, &[1, 2]).unwrap();
        let mut buf = [0; 3];
        m.read_block(0x30, &mut buf).unwrap();

        let t = m.get_trace();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].access, Access::Write);
        assert_eq!((t[0].addr, t[0].len), (0x20, 2));
        assert_eq!(t[1].access, Access::Read);
        assert!(t[0].seq < t[1].seq);
        assert_eq!(m.get_writes(), vec![(0x20, 2)]);
    }

    #[test]
    fn in_mask() {
        let mut m = TestMemory::new(0xFF);
        assert!(m.write_block(0xFE, &[1, 2]).is_ok());
    }

    #[test]
    fn out_mask() {
        let mut m = TestMemory::new(0xFF);
        assert_eq!(
            m.write_block(0xFF, &[1, 2]),
            Err(MemoryError::OutOfBounds { addr: 0xFF, len: 2 })
        );
        assert!(m.write_block(0x100, &[1]).is_err());
    }
}
