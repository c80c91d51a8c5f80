//! A block pool and the chained packet buffers allocated from it.
//!
//! A [`PacketPool`] owns `N` fixed-size blocks and hands them out in O(1) from a free list. A
//! [`Packet`] is a chain of up to [`MAX_SEGMENTS`] blocks plus a header describing the packet.
//! Packets have a single owner and are moved between contexts; dropping a packet returns all
//! of its blocks to the pool.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::phy::RxInfo;

/// Maximum number of blocks a single packet can span.
pub const MAX_SEGMENTS: usize = 4;

/// Index of a block within a pool.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq)]
pub struct BlockId(u16);

/// Pool errors.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free blocks.
    OutOfMemory,
    /// The packet would exceed [`MAX_SEGMENTS`] blocks.
    TooLarge,
    /// Access outside the packet contents.
    OutOfRange,
}

/// Pool usage statistics.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub blocks: usize,
    pub free: usize,
    pub min_free: usize,
}

/// Block storage shared by packets.
pub trait Pool: Sync {
    /// Take a block from the free list.
    fn alloc(&self) -> Option<BlockId>;
    /// Return a block to the free list.
    fn free(&self, id: BlockId);
    /// Size of each block in bytes.
    fn block_size(&self) -> usize;
    /// Number of free blocks.
    fn available(&self) -> usize;
    /// Usage statistics.
    fn stats(&self) -> PoolStats;
    /// Copy `dst.len()` bytes out of block `id` starting at `offset`.
    fn read(&self, id: &BlockId, offset: usize, dst: &mut [u8]);
    /// Copy `src` into block `id` starting at `offset`.
    fn write(&self, id: &BlockId, offset: usize, src: &[u8]);
}

struct State<const BLOCK: usize, const N: usize> {
    blocks: [[u8; BLOCK]; N],
    in_use: [bool; N],
    free: Vec<u16, N>,
    min_free: usize,
}

impl<const BLOCK: usize, const N: usize> State<BLOCK, N> {
    fn new() -> Self {
        let mut free = Vec::new();
        for idx in (0..N).rev() {
            // Capacity is N, this never fails.
            let _ = free.push(idx as u16);
        }
        Self {
            blocks: [[0; BLOCK]; N],
            in_use: [false; N],
            free,
            min_free: N,
        }
    }

    fn alloc(&mut self) -> Option<BlockId> {
        let idx = self.free.pop()?;
        self.in_use[idx as usize] = true;
        self.min_free = self.min_free.min(self.free.len());
        Some(BlockId(idx))
    }

    fn free(&mut self, id: BlockId) {
        let idx = id.0 as usize;
        debug_assert!(self.in_use[idx]);
        self.in_use[idx] = false;
        let _ = self.free.push(id.0);
    }
}

/// A pool of `N` blocks of `BLOCK` bytes.
pub struct PacketPool<M: RawMutex, const BLOCK: usize, const N: usize> {
    state: Mutex<M, RefCell<State<BLOCK, N>>>,
}

impl<M: RawMutex, const BLOCK: usize, const N: usize> Default for PacketPool<M, BLOCK, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const BLOCK: usize, const N: usize> PacketPool<M, BLOCK, N> {
    /// Create a new pool with every block free.
    pub fn new() -> Self {
        assert!(N <= u16::MAX as usize);
        Self {
            state: Mutex::new(RefCell::new(State::new())),
        }
    }
}

impl<M: RawMutex + Sync, const BLOCK: usize, const N: usize> Pool for PacketPool<M, BLOCK, N> {
    fn alloc(&self) -> Option<BlockId> {
        self.state.lock(|state| state.borrow_mut().alloc())
    }

    fn free(&self, id: BlockId) {
        self.state.lock(|state| state.borrow_mut().free(id))
    }

    fn block_size(&self) -> usize {
        BLOCK
    }

    fn available(&self) -> usize {
        self.state.lock(|state| state.borrow().free.len())
    }

    fn stats(&self) -> PoolStats {
        self.state.lock(|state| {
            let state = state.borrow();
            PoolStats {
                blocks: N,
                free: state.free.len(),
                min_free: state.min_free,
            }
        })
    }

    fn read(&self, id: &BlockId, offset: usize, dst: &mut [u8]) {
        self.state.lock(|state| {
            let state = state.borrow();
            dst.copy_from_slice(&state.blocks[id.0 as usize][offset..offset + dst.len()]);
        })
    }

    fn write(&self, id: &BlockId, offset: usize, src: &[u8]) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.blocks[id.0 as usize][offset..offset + src.len()].copy_from_slice(src);
        })
    }
}

/// Metadata carried in the packet header.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketMeta {
    /// Reception details, filled in by the PHY for received PDUs.
    pub rx: RxInfo,
    /// First PDU header byte for transmission.
    pub tx_header: u8,
}

/// A chained packet buffer.
pub struct Packet<'d> {
    pool: &'d dyn Pool,
    segments: Vec<BlockId, MAX_SEGMENTS>,
    head: usize,
    len: usize,
    /// Packet header metadata.
    pub meta: PacketMeta,
}

impl<'d> Packet<'d> {
    /// Allocate an empty packet with one block.
    pub fn new(pool: &'d dyn Pool) -> Result<Self, Error> {
        let block = pool.alloc().ok_or(Error::OutOfMemory)?;
        let mut segments = Vec::new();
        let _ = segments.push(block);
        Ok(Self {
            pool,
            segments,
            head: 0,
            len: 0,
            meta: PacketMeta::default(),
        })
    }

    /// Allocate a packet holding a copy of `data`.
    pub fn from_slice(pool: &'d dyn Pool, data: &[u8]) -> Result<Self, Error> {
        let mut p = Self::new(pool)?;
        p.append(data)?;
        Ok(p)
    }

    /// Total length of the packet contents.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of blocks in the chain.
    pub fn segments(&self) -> usize {
        self.segments.len()
    }

    fn capacity(&self) -> usize {
        self.segments.len() * self.pool.block_size()
    }

    /// Append `data` to the end of the packet, growing the chain as needed.
    ///
    /// On error the packet is left unchanged.
    pub fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        let bs = self.pool.block_size();
        let needed = self.head + self.len + data.len();
        let blocks = needed.div_ceil(bs);
        if blocks > MAX_SEGMENTS {
            return Err(Error::TooLarge);
        }
        let existing = self.segments.len();
        while self.segments.len() < blocks {
            match self.pool.alloc() {
                Some(b) => {
                    let _ = self.segments.push(b);
                }
                None => {
                    while self.segments.len() > existing {
                        if let Some(b) = self.segments.pop() {
                            self.pool.free(b);
                        }
                    }
                    return Err(Error::OutOfMemory);
                }
            }
        }
        let at = self.len;
        self.len += data.len();
        self.write_at(at, data);
        Ok(())
    }

    /// Overwrite packet contents starting at `offset`. The range must be within the packet.
    pub fn copy_from(&mut self, offset: usize, src: &[u8]) -> Result<(), Error> {
        if offset + src.len() > self.len {
            return Err(Error::OutOfRange);
        }
        self.write_at(offset, src);
        Ok(())
    }

    /// Copy `dst.len()` bytes of the packet starting at `offset` into `dst`.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> Result<(), Error> {
        if offset + dst.len() > self.len {
            return Err(Error::OutOfRange);
        }
        let bs = self.pool.block_size();
        let mut pos = self.head + offset;
        let mut done = 0;
        while done < dst.len() {
            let seg = pos / bs;
            let off = pos % bs;
            let n = (bs - off).min(dst.len() - done);
            self.pool.read(&self.segments[seg], off, &mut dst[done..done + n]);
            done += n;
            pos += n;
        }
        Ok(())
    }

    /// Copy the whole packet into `buf`, returning the filled part.
    pub fn read_into<'b>(&self, buf: &'b mut [u8]) -> Result<&'b [u8], Error> {
        let len = self.len;
        if buf.len() < len {
            return Err(Error::OutOfRange);
        }
        self.copy_to(0, &mut buf[..len])?;
        Ok(&buf[..len])
    }

    /// Remove `n` bytes from the front of the packet, releasing blocks that become empty.
    pub fn trim_front(&mut self, n: usize) -> Result<(), Error> {
        if n > self.len {
            return Err(Error::OutOfRange);
        }
        let bs = self.pool.block_size();
        self.head += n;
        self.len -= n;
        while self.head >= bs && self.segments.len() > 1 {
            let b = self.segments.remove(0);
            self.pool.free(b);
            self.head -= bs;
        }
        Ok(())
    }

    /// Shorten the packet to `len` bytes, releasing unused trailing blocks.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        self.len = len;
        let bs = self.pool.block_size();
        let keep = (self.head + self.len).div_ceil(bs).max(1);
        while self.segments.len() > keep {
            if let Some(b) = self.segments.pop() {
                self.pool.free(b);
            }
        }
    }

    fn write_at(&mut self, offset: usize, src: &[u8]) {
        debug_assert!(self.head + offset + src.len() <= self.capacity());
        let bs = self.pool.block_size();
        let mut pos = self.head + offset;
        let mut done = 0;
        while done < src.len() {
            let seg = pos / bs;
            let off = pos % bs;
            let n = (bs - off).min(src.len() - done);
            self.pool.write(&self.segments[seg], off, &src[done..done + n]);
            done += n;
            pos += n;
        }
    }
}

impl Drop for Packet<'_> {
    fn drop(&mut self) {
        while let Some(b) = self.segments.pop() {
            self.pool.free(b);
        }
    }
}

impl core::fmt::Debug for Packet<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Packet<'_> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Packet(len={}, segments={})", self.len, self.segments.len())
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use static_cell::StaticCell;

    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        static POOL: StaticCell<PacketPool<CriticalSectionRawMutex, 16, 8>> = StaticCell::new();
        let pool = POOL.init(PacketPool::new());

        let mut held = std::vec::Vec::new();
        for _ in 0..8 {
            held.push(Packet::new(pool).unwrap());
        }
        assert_eq!(pool.available(), 0);
        assert_eq!(Packet::new(pool).unwrap_err(), Error::OutOfMemory);

        held.pop();
        assert_eq!(pool.available(), 1);
        assert!(Packet::new(pool).is_ok());
        drop(held);
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.stats().min_free, 0);
    }

    #[test]
    fn test_chained_copy() {
        let pool: PacketPool<CriticalSectionRawMutex, 8, 8> = PacketPool::new();
        let data: [u8; 20] = core::array::from_fn(|i| i as u8);
        let mut p = Packet::from_slice(&pool, &data).unwrap();
        assert_eq!(p.len(), 20);
        assert_eq!(p.segments(), 3);
        assert_eq!(pool.available(), 5);

        let mut out = [0; 6];
        p.copy_to(5, &mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8, 9, 10]);
        assert_eq!(p.copy_to(16, &mut out), Err(Error::OutOfRange));

        p.copy_from(7, &[0xEE, 0xFF]).unwrap();
        p.trim_front(9).unwrap();
        assert_eq!(p.segments(), 2);
        let mut buf = [0; 32];
        let contents = p.read_into(&mut buf).unwrap();
        assert_eq!(contents[0], 9);
        assert_eq!(contents.len(), 11);

        p.truncate(2);
        assert_eq!(p.segments(), 1);
        drop(p);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_failed_append_leaves_packet_unchanged() {
        let pool: PacketPool<CriticalSectionRawMutex, 4, 2> = PacketPool::new();
        let mut p = Packet::from_slice(&pool, &[1, 2, 3]).unwrap();
        let _other = Packet::new(&pool).unwrap();
        assert_eq!(p.append(&[4, 5]), Err(Error::OutOfMemory));
        assert_eq!(p.len(), 3);
        assert_eq!(p.append(&[0; 32]), Err(Error::TooLarge));
        p.append(&[4]).unwrap();
        assert_eq!(p.len(), 4);
        assert_eq!(p.segments(), 1);
    }
}
