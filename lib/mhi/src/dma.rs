// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMA memory as seen by the MHI core.
//!
//! The bus transport supplies coherent allocations through [`DmaAllocator`].
//! Each allocation is exposed as a [`CoherentBuf`]: host-side accessors over
//! memory which the device may access concurrently at
//! [`CoherentBuf::bus_addr`].
//!
//! As with guest memory elsewhere, references into the region are never
//! handed out.  All access is by value through unaligned reads and writes, so
//! the device is free to change the contents underneath us.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::{copy_nonoverlapping, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::common::{BusAddr, DmaDir};
use crate::error::{Error, Result};
use crate::ring::BufInfo;

/// Storage behind a coherent allocation.
///
/// Dropping the backing returns the allocation to whoever provided it.
pub trait CoherentBacking: Send + Sync + 'static {
    /// Host mapping of the region.  Must stay valid for `len()` bytes until
    /// the backing is dropped.
    fn host_ptr(&self) -> NonNull<u8>;
    fn len(&self) -> usize;
    fn bus_addr(&self) -> BusAddr;
}

/// DMA services provided by the bus transport.
pub trait DmaAllocator: Send + Sync + 'static {
    /// Allocate `size` bytes of zeroed, coherent memory.
    ///
    /// The bus address is only required to be cache-line aligned.
    fn alloc_coherent(&self, size: usize) -> Option<CoherentBuf>;

    /// Map a host buffer for a single streaming transfer.
    fn map_single(&self, buf: &[u8], dir: DmaDir) -> Option<BusAddr>;

    /// Release a mapping established by [`DmaAllocator::map_single`].
    fn unmap_single(&self, addr: BusAddr, len: usize, dir: DmaDir);
}

/// A coherent DMA allocation.
pub struct CoherentBuf {
    backing: Box<dyn CoherentBacking>,
    ptr: NonNull<u8>,
    len: usize,
    dma: BusAddr,
}

impl CoherentBuf {
    pub fn new(backing: Box<dyn CoherentBacking>) -> Self {
        let ptr = backing.host_ptr();
        let len = backing.len();
        let dma = backing.bus_addr();
        Self { backing, ptr, len, dma }
    }

    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn bus_addr(&self) -> BusAddr {
        self.dma
    }

    /// Whether `[addr, addr + len)` lies within this allocation.
    pub fn contains(&self, addr: BusAddr, len: usize) -> bool {
        addr >= self.dma
            && addr.0 + len as u64 <= self.dma.0 + self.len as u64
    }

    fn check(&self, off: usize, len: usize) {
        assert!(
            off.checked_add(len).map_or(false, |end| end <= self.len),
            "access [{off:#x}, +{len:#x}) outside coherent region of {:#x}",
            self.len
        );
    }

    /// Reads a `T` at byte offset `off`.
    pub fn read<T: FromBytes>(&self, off: usize) -> T {
        self.check(off, size_of::<T>());
        // Safety:
        // - the range was bounds-checked above against a live backing
        // - `T: FromBytes` is valid for any bit pattern the device may have
        //   left there
        unsafe { (self.ptr.as_ptr().add(off) as *const T).read_unaligned() }
    }

    /// Writes `val` at byte offset `off`.
    pub fn write<T: IntoBytes + Immutable>(&self, off: usize, val: T) {
        self.check(off, size_of::<T>());
        // Safety: bounds-checked above, no references into the region exist
        unsafe { (self.ptr.as_ptr().add(off) as *mut T).write_unaligned(val) }
    }

    pub fn read_u32(&self, off: usize) -> u32 {
        u32::from_le(self.read::<u32>(off))
    }
    pub fn write_u32(&self, off: usize, val: u32) {
        self.write::<u32>(off, val.to_le())
    }
    pub fn read_u64(&self, off: usize) -> u64 {
        u64::from_le(self.read::<u64>(off))
    }
    pub fn write_u64(&self, off: usize, val: u64) {
        self.write::<u64>(off, val.to_le())
    }

    pub fn copy_from(&self, off: usize, src: &[u8]) {
        self.check(off, src.len());
        // Safety: bounds-checked, `src` cannot overlap a region we never
        // expose references to
        unsafe {
            copy_nonoverlapping(
                src.as_ptr(),
                self.ptr.as_ptr().add(off),
                src.len(),
            )
        }
    }

    pub fn copy_to(&self, off: usize, dst: &mut [u8]) {
        self.check(off, dst.len());
        // Safety: as for `copy_from`
        unsafe {
            copy_nonoverlapping(
                self.ptr.as_ptr().add(off),
                dst.as_mut_ptr(),
                dst.len(),
            )
        }
    }

    /// Zero `len` bytes starting at `off`.
    pub fn fill_zero(&self, off: usize, len: usize) {
        self.check(off, len);
        // Safety: bounds-checked above
        unsafe { self.ptr.as_ptr().add(off).write_bytes(0, len) }
    }
}

impl std::fmt::Debug for CoherentBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherentBuf")
            .field("dma", &self.dma)
            .field("len", &self.len)
            .finish()
    }
}

// Safety: `CoherentBuf` never exposes references to the underlying region,
// and the backing is itself `Send + Sync`.
unsafe impl Send for CoherentBuf {}
unsafe impl Sync for CoherentBuf {}

/// Allocate coherent memory, mapping failure to [`Error::OutOfMemory`].
pub(crate) fn alloc_coherent(
    dma: &dyn DmaAllocator,
    size: usize,
    what: &'static str,
) -> Result<Arc<CoherentBuf>> {
    dma.alloc_coherent(size).map(Arc::new).ok_or(Error::OutOfMemory(what))
}

/// How single buffers are made visible to the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapMode {
    /// Map the client buffer in place.
    Direct,
    /// Copy through a coherent bounce buffer.
    BounceBuffer,
}

impl MapMode {
    pub fn from_bounce_flag(bounce_buf: bool) -> Self {
        if bounce_buf {
            MapMode::BounceBuffer
        } else {
            MapMode::Direct
        }
    }

    pub fn map_single(
        self,
        dma: &dyn DmaAllocator,
        info: &mut BufInfo,
    ) -> Result<()> {
        let data = info.data.as_deref().unwrap_or(&[]);
        match self {
            MapMode::Direct => {
                info.p_addr = dma
                    .map_single(&data[..info.len], info.dir)
                    .ok_or(Error::OutOfMemory("streaming mapping"))?;
            }
            MapMode::BounceBuffer => {
                let bb = dma
                    .alloc_coherent(info.len)
                    .ok_or(Error::OutOfMemory("bounce buffer"))?;
                if info.dir == DmaDir::ToDevice {
                    bb.copy_from(0, &data[..info.len]);
                }
                info.p_addr = bb.bus_addr();
                info.bb = Some(bb);
            }
        }
        Ok(())
    }

    pub fn unmap_single(self, dma: &dyn DmaAllocator, info: &mut BufInfo) {
        match self {
            MapMode::Direct => {
                dma.unmap_single(info.p_addr, info.len, info.dir);
            }
            MapMode::BounceBuffer => {
                if let Some(bb) = info.bb.take() {
                    if info.dir == DmaDir::FromDevice {
                        if let Some(data) = info.data.as_deref_mut() {
                            bb.copy_to(0, &mut data[..info.len]);
                        }
                    }
                }
            }
        }
        info.p_addr = BusAddr::NULL;
    }
}

const HEAP_DMA_ALIGN: usize = 64;

#[derive(Default)]
struct HeapStats {
    coherent: AtomicUsize,
    mapped: AtomicUsize,
    /// Live coherent regions by bus address: (length, host address)
    regions: Mutex<BTreeMap<u64, (usize, usize)>>,
}

struct HeapBacking {
    ptr: NonNull<u8>,
    layout: Layout,
    dma: BusAddr,
    stats: Arc<HeapStats>,
}

// Safety: the allocation is exclusively owned by this backing
unsafe impl Send for HeapBacking {}
unsafe impl Sync for HeapBacking {}

impl CoherentBacking for HeapBacking {
    fn host_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
    fn len(&self) -> usize {
        self.layout.size()
    }
    fn bus_addr(&self) -> BusAddr {
        self.dma
    }
}

impl Drop for HeapBacking {
    fn drop(&mut self) {
        self.stats.regions.lock().unwrap().remove(&self.dma.0);
        // Safety: allocated with this layout in `HeapDma::alloc_coherent`
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        self.stats.coherent.fetch_sub(1, Ordering::Relaxed);
    }
}

struct HeapIova {
    next: u64,
    limit: u64,
    fail_after: Option<usize>,
}

/// A [`DmaAllocator`] backed by the process heap, handing out bus addresses
/// from a private IOVA window.
///
/// Bus addresses are only cache-line aligned, like a real coherent
/// allocator, which makes it useful for exercising ring alignment.
pub struct HeapDma {
    iova: Mutex<HeapIova>,
    stats: Arc<HeapStats>,
}

impl HeapDma {
    pub fn new(iova_start: u64, iova_stop: u64) -> Self {
        Self {
            iova: Mutex::new(HeapIova {
                // Deliberately start off any large alignment boundary
                next: BusAddr(iova_start)
                    .align_up(HEAP_DMA_ALIGN as u64)
                    .0
                    + HEAP_DMA_ALIGN as u64,
                limit: iova_stop,
                fail_after: None,
            }),
            stats: Arc::new(HeapStats::default()),
        }
    }

    /// Make the allocator fail once `count` further coherent allocations
    /// have succeeded.
    pub fn fail_after(&self, count: usize) {
        self.iova.lock().unwrap().fail_after = Some(count);
    }

    /// Number of coherent allocations not yet released.
    pub fn outstanding(&self) -> usize {
        self.stats.coherent.load(Ordering::Relaxed)
    }

    /// Number of streaming mappings not yet released.
    pub fn outstanding_mappings(&self) -> usize {
        self.stats.mapped.load(Ordering::Relaxed)
    }

    /// Access coherent memory the way the device would, by bus address.
    ///
    /// Returns `None` if `[addr, addr + len)` is not within a live coherent
    /// allocation.
    fn with_bus<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Option<R> {
        let regions = self.stats.regions.lock().unwrap();
        let (&start, &(size, host)) = regions.range(..=addr).next_back()?;
        let off = (addr - start) as usize;
        if off.checked_add(len)? > size {
            return None;
        }
        // The region cannot be released while `regions` is locked
        Some(f((host + off) as *mut u8))
    }

    /// Device-side read of a `T` at bus address `addr`.
    pub fn read_bus<T: FromBytes>(&self, addr: u64) -> Option<T> {
        self.with_bus(addr, size_of::<T>(), |p| {
            // Safety: range checked against a live allocation
            unsafe { (p as *const T).read_unaligned() }
        })
    }

    /// Device-side write of `val` at bus address `addr`.
    pub fn write_bus<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        val: T,
    ) -> Option<()> {
        self.with_bus(addr, size_of::<T>(), |p| {
            // Safety: range checked against a live allocation
            unsafe { (p as *mut T).write_unaligned(val) }
        })
    }

    fn take_iova(&self, size: usize) -> Option<BusAddr> {
        let mut iova = self.iova.lock().unwrap();
        if let Some(remaining) = iova.fail_after.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let addr = BusAddr(iova.next);
        let end = addr.0.checked_add(size as u64)?;
        if end > iova.limit {
            return None;
        }
        iova.next = BusAddr(end).align_up(HEAP_DMA_ALIGN as u64).0;
        Some(addr)
    }
}

impl DmaAllocator for HeapDma {
    fn alloc_coherent(&self, size: usize) -> Option<CoherentBuf> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, HEAP_DMA_ALIGN).ok()?;
        let dma = self.take_iova(size)?;
        // Safety: `layout` has non-zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.stats.coherent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .regions
            .lock()
            .unwrap()
            .insert(dma.0, (size, ptr.as_ptr() as usize));
        Some(CoherentBuf::new(Box::new(HeapBacking {
            ptr,
            layout,
            dma,
            stats: self.stats.clone(),
        })))
    }

    fn map_single(&self, buf: &[u8], _dir: DmaDir) -> Option<BusAddr> {
        let addr = self.take_iova(buf.len().max(1))?;
        self.stats.mapped.fetch_add(1, Ordering::Relaxed);
        Some(addr)
    }

    fn unmap_single(&self, _addr: BusAddr, _len: usize, _dir: DmaDir) {
        self.stats.mapped.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heap_alloc_is_zeroed_and_tracked() {
        let dma = HeapDma::new(0x1000_0000, 0x2000_0000);
        let buf = dma.alloc_coherent(128).unwrap();
        assert_eq!(dma.outstanding(), 1);
        assert_eq!(buf.read_u64(0), 0);
        assert_eq!(buf.read_u64(120), 0);
        assert_eq!(buf.bus_addr().0 % HEAP_DMA_ALIGN as u64, 0);

        buf.write_u64(8, 0x1122_3344_5566_7788);
        assert_eq!(buf.read_u32(8), 0x5566_7788);
        assert_eq!(buf.read_u32(12), 0x1122_3344);

        drop(buf);
        assert_eq!(dma.outstanding(), 0);
    }

    #[test]
    fn device_view_by_bus_address() {
        let dma = HeapDma::new(0x1000_0000, 0x2000_0000);
        let buf = dma.alloc_coherent(64).unwrap();
        let addr = buf.bus_addr().0;

        buf.write_u32(8, 0xabcd);
        assert_eq!(dma.read_bus::<u32>(addr + 8), Some(0xabcd));
        dma.write_bus(addr + 16, 0x55u8).unwrap();
        assert_eq!(buf.read::<u8>(16), 0x55);

        // Straddling the end of the region
        assert_eq!(dma.read_bus::<u64>(addr + 60), None);
        drop(buf);
        assert_eq!(dma.read_bus::<u32>(addr), None);
    }

    #[test]
    fn heap_fail_after() {
        let dma = HeapDma::new(0x1000_0000, 0x2000_0000);
        dma.fail_after(1);
        assert!(dma.alloc_coherent(64).is_some());
        assert!(dma.alloc_coherent(64).is_none());
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_access_panics() {
        let dma = HeapDma::new(0x1000_0000, 0x2000_0000);
        let buf = dma.alloc_coherent(16).unwrap();
        buf.write_u64(12, 1);
    }

    #[test]
    fn bounce_buffer_round_trip() {
        let dma = HeapDma::new(0x1000_0000, 0x2000_0000);
        let mut info = BufInfo {
            data: Some(vec![0u8; 8]),
            len: 8,
            dir: DmaDir::FromDevice,
            ..Default::default()
        };
        MapMode::BounceBuffer.map_single(&dma, &mut info).unwrap();
        assert!(!info.p_addr.is_null());

        // Device fills the bounce buffer
        info.bb.as_ref().unwrap().copy_from(0, b"mhi-data");
        MapMode::BounceBuffer.unmap_single(&dma, &mut info);
        assert_eq!(info.data.as_deref(), Some(&b"mhi-data"[..]));
        assert_eq!(dma.outstanding(), 0);
    }

    #[test]
    fn direct_mapping_tracked() {
        let dma = HeapDma::new(0x1000_0000, 0x2000_0000);
        let mut info = BufInfo {
            data: Some(vec![1u8; 32]),
            len: 32,
            dir: DmaDir::ToDevice,
            ..Default::default()
        };
        MapMode::Direct.map_single(&dma, &mut info).unwrap();
        assert_eq!(dma.outstanding_mappings(), 1);
        MapMode::Direct.unmap_single(&dma, &mut info);
        assert_eq!(dma.outstanding_mappings(), 0);
    }
}
