// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring descriptors and their DMA backing.
//!
//! Transfer, event, and command rings share one descriptor type.  The device
//! requires a ring's bus address to be aligned to the ring length, while the
//! transport only promises cache-line aligned coherent memory.  Rings are
//! therefore over-allocated by `len - 1` bytes and the aligned subregion used.

use std::sync::Arc;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::common::{BusAddr, DmaDir};
use crate::dma::{self, CoherentBuf, DmaAllocator};
use crate::error::{Error, Result};

/// Handle to a 64-bit little-endian field inside a context array.
///
/// Rings use this to publish their write pointer where the device reads it.
#[derive(Clone)]
pub struct CtxtSlot {
    array: Arc<CoherentBuf>,
    off: usize,
}

impl CtxtSlot {
    pub(crate) fn new(array: Arc<CoherentBuf>, off: usize) -> Self {
        assert!(off + size_of::<u64>() <= array.len());
        Self { array, off }
    }

    pub fn write(&self, val: u64) {
        self.array.write_u64(self.off, val);
    }
    pub fn read(&self) -> u64 {
        self.array.read_u64(self.off)
    }
}

impl std::fmt::Debug for CtxtSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CtxtSlot({}+{:#x})", self.array.bus_addr(), self.off)
    }
}

/// Ring descriptor.
///
/// `rp` and `wp` are host byte offsets from the aligned base.  A ring without
/// backing memory has no base, and `rp == wp == 0`.
#[derive(Debug)]
pub struct Ring {
    /// The raw (pre-aligned) allocation, returned as-is on release
    alloc: Option<Arc<CoherentBuf>>,
    /// Offset of the aligned base within `alloc`
    base_off: usize,
    pub iommu_base: BusAddr,
    pub el_size: usize,
    pub elements: usize,
    pub len: usize,
    pub alloc_size: usize,
    pub rp: usize,
    pub wp: usize,
    pub ctxt_wp: Option<CtxtSlot>,
    /// Register offset of the ring's doorbell
    pub db_addr: Option<usize>,
}

impl Ring {
    pub fn new(el_size: usize, elements: usize) -> Self {
        Self {
            alloc: None,
            base_off: 0,
            iommu_base: BusAddr::NULL,
            el_size,
            elements,
            len: el_size * elements,
            alloc_size: 0,
            rp: 0,
            wp: 0,
            ctxt_wp: None,
            db_addr: None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.alloc.is_some()
    }

    /// Bus address of the raw allocation backing this ring.
    pub fn raw_bus_addr(&self) -> Option<BusAddr> {
        self.alloc.as_ref().map(|a| a.bus_addr())
    }

    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    pub fn is_full(&self) -> bool {
        self.next_off(self.wp) == self.rp
    }

    /// Free elements between `wp` and `rp`.
    pub fn free_elements(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let used = (self.wp + self.len - self.rp) % self.len;
        (self.len - used) / self.el_size - 1
    }

    fn next_off(&self, off: usize) -> usize {
        let next = off + self.el_size;
        if next >= self.len {
            0
        } else {
            next
        }
    }

    /// Bus address of a host byte offset in the ring.
    pub fn dev_addr(&self, off: usize) -> BusAddr {
        self.iommu_base.offset(off)
    }
    pub fn dev_rp(&self) -> BusAddr {
        self.dev_addr(self.rp)
    }
    pub fn dev_wp(&self) -> BusAddr {
        self.dev_addr(self.wp)
    }

    /// Whether a device-reported pointer lies inside the ring.
    pub fn contains_dev_addr(&self, addr: u64) -> bool {
        self.is_allocated()
            && addr >= self.iommu_base.0
            && addr < self.iommu_base.0 + self.len as u64
    }

    /// Translate a device pointer into a host byte offset.
    pub fn dev_to_off(&self, addr: u64) -> Option<usize> {
        self.contains_dev_addr(addr)
            .then(|| (addr - self.iommu_base.0) as usize)
    }

    fn backing(&self) -> &CoherentBuf {
        self.alloc.as_deref().expect("ring has backing memory")
    }

    pub fn read_el<T: FromBytes>(&self, off: usize) -> T {
        assert!(off + size_of::<T>() <= self.len);
        self.backing().read(self.base_off + off)
    }

    pub fn write_el<T: IntoBytes + Immutable>(&self, off: usize, val: T) {
        assert!(off + size_of::<T>() <= self.len);
        self.backing().write(self.base_off + off, val)
    }

    /// Append an element at `wp`, advancing it with wrap.
    pub fn push<T: IntoBytes + Immutable>(&mut self, el: T) -> Result<usize> {
        if self.is_full() {
            return Err(Error::OutOfMemory("ring element"));
        }
        let at = self.wp;
        self.write_el(at, el);
        self.wp = self.next_off(at);
        Ok(at)
    }

    /// Retire the element at `rp`.
    pub fn advance_rp(&mut self) {
        if !self.is_empty() {
            self.rp = self.next_off(self.rp);
        }
    }

    /// Publish the current write pointer to the context slot, if bound.
    pub fn publish_wp(&self) {
        if let Some(slot) = self.ctxt_wp.as_ref() {
            slot.write(self.dev_wp().0);
        }
    }

    pub fn reset_pointers(&mut self) {
        self.rp = 0;
        self.wp = 0;
    }
}

/// Allocate the backing for `ring`, aligned to its length.
pub fn alloc_aligned_ring(
    dma: &dyn DmaAllocator,
    ring: &mut Ring,
) -> Result<()> {
    let len = ring.len;
    if len == 0 || !len.is_power_of_two() {
        return Err(Error::invalid(format!(
            "ring length {len:#x} is not a power of two"
        )));
    }
    let alloc_size = len + (len - 1);
    let buf = dma::alloc_coherent(dma, alloc_size, "ring")?;

    let raw = buf.bus_addr();
    let iommu_base = raw.align_up(len as u64);
    let base_off = (iommu_base.0 - raw.0) as usize;
    debug_assert!(buf.contains(iommu_base, len));

    ring.alloc = Some(buf);
    ring.base_off = base_off;
    ring.alloc_size = alloc_size;
    ring.iommu_base = iommu_base;
    ring.reset_pointers();
    Ok(())
}

/// Release the backing for `ring`, returning it to the unallocated state.
pub fn free_ring(ring: &mut Ring) {
    ring.alloc = None;
    ring.base_off = 0;
    ring.alloc_size = 0;
    ring.iommu_base = BusAddr::NULL;
    ring.reset_pointers();
}

/// Host-side record of a buffer queued on a transfer ring.
#[derive(Debug, Default)]
pub struct BufInfo {
    /// Client data, owned by the ring while the transfer is in flight
    pub data: Option<Vec<u8>>,
    pub len: usize,
    pub dir: DmaDir,
    pub p_addr: BusAddr,
    /// Bounce buffer, when the controller maps through one
    pub bb: Option<CoherentBuf>,
    pub pre_mapped: bool,
    pub used: bool,
}

/// Buffer-tracking ring, one [`BufInfo`] per transfer ring element.
#[derive(Debug, Default)]
pub struct BufRing {
    entries: Vec<BufInfo>,
    rp: usize,
    wp: usize,
}

impl BufRing {
    pub fn alloc(elements: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(elements)
            .map_err(|_| Error::OutOfMemory("buffer ring"))?;
        entries.resize_with(elements, BufInfo::default);
        Ok(Self { entries, rp: 0, wp: 0 })
    }

    pub fn elements(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.entries.len().max(1)
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_empty() || self.next(self.wp) == self.rp
    }

    pub fn push(&mut self, info: BufInfo) -> Result<()> {
        if self.is_full() {
            return Err(Error::OutOfMemory("buffer ring slot"));
        }
        self.entries[self.wp] = BufInfo { used: true, ..info };
        self.wp = self.next(self.wp);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<BufInfo> {
        if self.is_empty() {
            return None;
        }
        let info = std::mem::take(&mut self.entries[self.rp]);
        self.rp = self.next(self.rp);
        Some(info)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dma::HeapDma;

    fn heap() -> HeapDma {
        HeapDma::new(0x4000_0000, 0x8000_0000)
    }

    #[test]
    fn alignment_4096() {
        let dma = heap();
        let mut ring = Ring::new(16, 256);
        assert_eq!(ring.len, 4096);

        alloc_aligned_ring(&dma, &mut ring).unwrap();
        assert_eq!(ring.alloc_size, 8191);
        assert_eq!(ring.iommu_base.0 % 4096, 0);

        let raw = ring.raw_bus_addr().unwrap();
        // The heap allocator does not hand out length-aligned memory, so
        // the base really moved
        assert_ne!(raw, ring.iommu_base);
        assert!(ring.iommu_base >= raw);
        assert!(
            ring.iommu_base.0 + ring.len as u64
                <= raw.0 + ring.alloc_size as u64
        );
    }

    #[test]
    fn aligned_over_many_sizes() {
        let dma = heap();
        for shift in 4..=16 {
            let len = 1usize << shift;
            let mut ring = Ring::new(16, len / 16);
            alloc_aligned_ring(&dma, &mut ring).unwrap();
            let raw = ring.raw_bus_addr().unwrap();
            assert_eq!(ring.iommu_base.0 % len as u64, 0);
            let end = ring.iommu_base.0 + len as u64;
            assert!(end <= raw.0 + 2 * len as u64 - 1);
        }
    }

    #[test]
    fn host_and_device_views_agree() {
        let dma = heap();
        let mut ring = Ring::new(16, 8);
        alloc_aligned_ring(&dma, &mut ring).unwrap();

        ring.write_el(16, 0xdead_beef_u64.to_le());
        let raw = ring.alloc.as_ref().unwrap().clone();
        let off = (ring.dev_addr(16).0 - raw.bus_addr().0) as usize;
        assert_eq!(raw.read_u64(off), 0xdead_beef);
    }

    #[test]
    fn rejects_non_power_of_two() {
        let dma = heap();
        let mut ring = Ring::new(16, 3);
        assert!(matches!(
            alloc_aligned_ring(&dma, &mut ring),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!ring.is_allocated());
        assert_eq!(dma.outstanding(), 0);
    }

    #[test]
    fn alloc_failure_leaves_no_state() {
        let dma = heap();
        dma.fail_after(0);
        let mut ring = Ring::new(16, 4);
        assert!(matches!(
            alloc_aligned_ring(&dma, &mut ring),
            Err(Error::OutOfMemory(_))
        ));
        assert!(!ring.is_allocated());
        assert_eq!(ring.iommu_base, BusAddr::NULL);
    }

    #[test]
    fn free_releases_raw_allocation() {
        let dma = heap();
        let mut ring = Ring::new(16, 64);
        alloc_aligned_ring(&dma, &mut ring).unwrap();
        assert_eq!(dma.outstanding(), 1);
        free_ring(&mut ring);
        assert_eq!(dma.outstanding(), 0);
        assert!(!ring.is_allocated());
        assert_eq!((ring.rp, ring.wp), (0, 0));
    }

    #[test]
    fn push_wraps_and_fills() {
        let dma = heap();
        let mut ring = Ring::new(16, 4);
        alloc_aligned_ring(&dma, &mut ring).unwrap();

        assert_eq!(ring.free_elements(), 3);
        for _ in 0..3 {
            ring.push([0u8; 16]).unwrap();
        }
        assert!(ring.is_full());
        assert!(ring.push([0u8; 16]).is_err());

        ring.advance_rp();
        assert_eq!(ring.push([0u8; 16]).unwrap(), 48);
        assert_eq!(ring.wp, 0);
    }

    #[test]
    fn buf_ring_fifo() {
        let mut bufs = BufRing::alloc(4).unwrap();
        assert_eq!(bufs.elements(), 4);
        for len in 1..=3 {
            bufs.push(BufInfo { len, ..Default::default() }).unwrap();
        }
        assert!(bufs.push(BufInfo::default()).is_err());

        let first = bufs.pop().unwrap();
        assert_eq!(first.len, 1);
        assert!(first.used);
        assert_eq!(bufs.pop().unwrap().len, 2);
        assert_eq!(bufs.pop().unwrap().len, 3);
        assert!(bufs.pop().is_none());
    }
}
