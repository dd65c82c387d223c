// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BHIe vector tables and ramdump (RDDM) preparation.

use std::sync::Arc;

use rand::Rng;
use slog::debug;
use zerocopy::byteorder::little_endian::U64;

use crate::bits::{bhie, BhiVecEntry};
use crate::common::DEFAULT_SEG_LEN;
use crate::controller::Controller;
use crate::dma::{self, CoherentBuf};
use crate::error::{Error, Result};

/// A BHIe image: data segments followed by the vector table describing them.
pub struct BhieTable {
    /// Data segments, then the vector table as the last element
    segments: Vec<Arc<CoherentBuf>>,
}

impl BhieTable {
    /// Allocate segments covering `size` bytes plus the vector table.
    pub fn alloc(ctrl: &Controller, size: usize) -> Result<Self> {
        let seg_len = ctrl.seg_len();
        if size == 0 {
            return Err(Error::invalid("empty BHIe table"));
        }
        let nr_segs = size.div_ceil(seg_len) + 1;
        let mut segments = Vec::with_capacity(nr_segs);

        for i in 0..nr_segs {
            let len = if i == nr_segs - 1 {
                BhiVecEntry::SIZE * i
            } else {
                seg_len
            };
            // An allocation failure drops the segments gathered so far
            let seg = dma::alloc_coherent(&*ctrl.dma, len, "BHIe segment")?;
            segments.push(seg);
        }

        let table = Self { segments };
        let vec_table = table.vec_table();
        for (i, seg) in table.data_segments().iter().enumerate() {
            let entry = BhiVecEntry {
                dma_addr: U64::new(seg.bus_addr().0),
                size: U64::new(seg.len() as u64),
            };
            vec_table.write(i * BhiVecEntry::SIZE, entry);
        }
        debug!(ctrl.log, "BHIe table allocated";
            "size" => size, "segments" => nr_segs);
        Ok(table)
    }

    pub fn data_segments(&self) -> &[Arc<CoherentBuf>] {
        &self.segments[..self.segments.len() - 1]
    }

    /// The segment holding the vector table.
    pub fn vec_table(&self) -> &CoherentBuf {
        // Never empty: `alloc` always creates at least two segments
        &self.segments[self.segments.len() - 1]
    }

    pub fn nr_segments(&self) -> usize {
        self.segments.len()
    }
}

impl std::fmt::Debug for BhieTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BhieTable")
            .field("segments", &self.segments.len())
            .field("vec_table", &self.vec_table().bus_addr())
            .finish()
    }
}

impl Controller {
    pub(crate) fn seg_len(&self) -> usize {
        match self.res.seg_len {
            0 => DEFAULT_SEG_LEN,
            n => n,
        }
    }

    /// Point the device's BHIe RX vector at `table`'s vector table and arm it
    /// with a fresh sequence number.
    pub(crate) fn rddm_prepare(&self, bhie_off: usize, table: &BhieTable) {
        let vec = table.vec_table();
        let addr = vec.bus_addr();

        let high = bhie_off + bhie::BHIE_RXVECADDR_HIGH_OFFS;
        let low = bhie_off + bhie::BHIE_RXVECADDR_LOW_OFFS;
        self.write_reg(high, addr.upper_32());
        self.write_reg(low, addr.lower_32());
        self.write_reg(bhie_off + bhie::BHIE_RXVECSIZE_OFFS, vec.len() as u32);

        let seq =
            rand::thread_rng().gen_range(1..=bhie::BHIE_RXVECDB_SEQNUM_BMSK);
        self.write_reg(bhie_off + bhie::BHIE_RXVECDB_OFFS, seq);
        debug!(self.log, "RDDM table armed";
            "vec" => %addr, "seq" => seq);
    }

    /// Zero the BHIe RX vector registers, whose reset values are undefined.
    pub(crate) fn clear_bhie_rx(&self, bhie_off: usize) {
        let regs = (bhie::BHIE_RXVECADDR_LOW_OFFS..=bhie::BHIE_RXVECSTATUS_OFFS)
            .step_by(4);
        for off in regs {
            self.write_reg(bhie_off + off, 0);
        }
    }

    /// Whether a ramdump table is prepared.
    pub fn has_rddm_image(&self) -> bool {
        self.boot.lock().unwrap().rddm_image.is_some()
    }
}
