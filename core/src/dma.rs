//! Bus-master DMA: addressing widths and the scatter/gather walker

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Address, GuestMemory, MemoryError};

const DMA_TRACE: bool = false;

/// Scatter/gather entries fetched from guest memory per read
pub const SG_BATCH: usize = 32;

/// Layout of addresses and lengths in mailboxes, CCBs and S/G lists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum AddressWidth {
    /// 3-byte big-endian packed fields
    Bits24,
    /// Native 4-byte little-endian fields
    Bits32,
}

impl AddressWidth {
    pub const fn field_len(self) -> usize {
        match self {
            Self::Bits24 => 3,
            Self::Bits32 => 4,
        }
    }

    pub const fn sg_entry_len(self) -> usize {
        self.field_len() * 2
    }

    pub const fn mailbox_len(self) -> usize {
        match self {
            Self::Bits24 => 4,
            Self::Bits32 => 8,
        }
    }

    /// Reads a field from the start of `b`
    pub fn decode(self, b: &[u8]) -> u32 {
        match self {
            Self::Bits24 => addr24_to_u32([b[0], b[1], b[2]]),
            Self::Bits32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        }
    }

    /// Writes a field to the start of `b`
    pub fn encode(self, val: u32, b: &mut [u8]) {
        match self {
            Self::Bits24 => b[0..3].copy_from_slice(&u32_to_addr24(val)),
            Self::Bits32 => b[0..4].copy_from_slice(&val.to_le_bytes()),
        }
    }
}

/// Converts a packed 24-bit (hi, mid, lo) address
pub const fn addr24_to_u32(a: [u8; 3]) -> u32 {
    ((a[0] as u32) << 16) | ((a[1] as u32) << 8) | (a[2] as u32)
}

/// Packs the low 24 bits of an address
pub const fn u32_to_addr24(val: u32) -> [u8; 3] {
    [(val >> 16) as u8, (val >> 8) as u8, val as u8]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub len: u32,
    pub ptr: Address,
}

impl SgEntry {
    pub fn decode(width: AddressWidth, b: &[u8]) -> Self {
        let f = width.field_len();
        Self {
            len: width.decode(&b[0..f]),
            ptr: width.decode(&b[f..]),
        }
    }
}

/// Where the data of a request lives in guest memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataDescriptor {
    /// One contiguous buffer
    Flat { ptr: Address, len: u32 },
    /// A scatter/gather list of `entries` entries
    List { ptr: Address, entries: u32 },
}

impl DataDescriptor {
    /// A list given its size in bytes, as found in a CCB
    pub fn list(ptr: Address, list_len: u32, width: AddressWidth) -> Self {
        Self::List {
            ptr,
            entries: list_len / width.sg_entry_len() as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device to guest memory (data in)
    ToGuest,
    /// Guest memory to device (data out)
    FromGuest,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("Guest memory fault during DMA: {0}")]
    Memory(#[from] MemoryError),
}

/// Reads scatter/gather entries in batches
struct SgCursor {
    ptr: Address,
    remaining: u32,
    width: AddressWidth,
    batch: ArrayVec<SgEntry, SG_BATCH>,
    pos: usize,
}

impl SgCursor {
    fn new(ptr: Address, entries: u32, width: AddressWidth) -> Self {
        Self {
            ptr,
            remaining: entries,
            width,
            batch: ArrayVec::new(),
            pos: 0,
        }
    }

    fn next(&mut self, mem: &mut dyn GuestMemory) -> Result<Option<SgEntry>, DmaError> {
        if self.pos == self.batch.len() {
            if self.remaining == 0 {
                return Ok(None);
            }
            let count = (self.remaining as usize).min(SG_BATCH);
            let entry_len = self.width.sg_entry_len();
            let mut raw = [0u8; SG_BATCH * 8];
            let raw = &mut raw[..(count * entry_len)];
            mem.read_block(self.ptr, raw)?;

            let width = self.width;
            self.batch.clear();
            self.batch.extend(
                raw.chunks_exact(entry_len)
                    .map(|e| SgEntry::decode(width, e)),
            );
            self.ptr = self.ptr.wrapping_add(raw.len() as u32);
            self.remaining -= count as u32;
            self.pos = 0;
        }
        let entry = self.batch[self.pos];
        self.pos += 1;
        Ok(Some(entry))
    }
}

enum Segments {
    Flat(Option<SgEntry>),
    List(SgCursor),
}

impl Segments {
    fn new(desc: &DataDescriptor, width: AddressWidth) -> Self {
        match *desc {
            DataDescriptor::Flat { ptr, len } => Self::Flat(Some(SgEntry { len, ptr })),
            DataDescriptor::List { ptr, entries } => {
                Self::List(SgCursor::new(ptr, entries, width))
            }
        }
    }

    fn next(&mut self, mem: &mut dyn GuestMemory) -> Result<Option<SgEntry>, DmaError> {
        match self {
            Self::Flat(e) => Ok(e.take()),
            Self::List(c) => c.next(mem),
        }
    }
}

/// Sum of all segment lengths of a descriptor
pub fn total_length(
    mem: &mut dyn GuestMemory,
    width: AddressWidth,
    desc: &DataDescriptor,
) -> Result<u32, DmaError> {
    let mut segs = Segments::new(desc, width);
    let mut total = 0u32;
    while let Some(seg) = segs.next(mem)? {
        total = total.saturating_add(seg.len);
    }
    Ok(total)
}

/// Moves data between `buf` and the guest buffer described by `desc`.
///
/// The first `skip` bytes of the guest buffer are passed over. Copies
/// `min(buf.len(), available - skip)` bytes with one memory access per
/// touched segment, in list order, and returns the amount copied.
pub fn transfer(
    mem: &mut dyn GuestMemory,
    width: AddressWidth,
    desc: &DataDescriptor,
    dir: Direction,
    buf: &mut [u8],
    skip: usize,
) -> Result<usize, DmaError> {
    let mut segs = Segments::new(desc, width);
    let mut skip = skip;
    let mut done = 0;

    while done < buf.len() {
        let Some(seg) = segs.next(mem)? else {
            break;
        };
        let seg_len = seg.len as usize;
        if skip >= seg_len {
            skip -= seg_len;
            continue;
        }

        let n = (seg_len - skip).min(buf.len() - done);
        let addr = seg.ptr.wrapping_add(skip as u32);
        let chunk = &mut buf[done..(done + n)];
        if DMA_TRACE {
            log::debug!("DMA {:?}: {} bytes at {:08X}", dir, n, addr);
        }
        match dir {
            Direction::ToGuest => mem.write_block(addr, chunk)?,
            Direction::FromGuest => mem.read_block(addr, chunk)?,
        }
        done += n;
        skip = 0;
    }
    Ok(done)
}
