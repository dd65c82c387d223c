// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device context: the channel, event ring, and command ring context arrays
//! the device reads from coherent memory, and per-channel activation.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use slog::{debug, info};

use crate::bits::{
    ChCfg, ChState, ChanCtxt, CmdCtxt, EventCtxt, IntMod, MHI_ER_TYPE_VALID,
};
use crate::channel::{ChanRings, Channel};
use crate::common::BusAddr;
use crate::controller::Controller;
use crate::dma::{self, CoherentBuf};
use crate::error::{Error, Result};
use crate::ring::{alloc_aligned_ring, free_ring, BufRing, CtxtSlot, Ring};

#[usdt::provider(provider = "mhi")]
mod probes {
    fn mhi_chan_ctxt_init(chan: u32, rbase: u64, rlen: u64) {}
    fn mhi_chan_ctxt_deinit(chan: u32) {}
}

/// The three context arrays shared with the device.
pub(crate) struct DevCtxt {
    pub chan_ctxt: Arc<CoherentBuf>,
    pub er_ctxt: Arc<CoherentBuf>,
    pub cmd_ctxt: Arc<CoherentBuf>,
}

impl DevCtxt {
    pub fn chan_ctxt_addr(&self) -> BusAddr {
        self.chan_ctxt.bus_addr()
    }
    pub fn er_ctxt_addr(&self) -> BusAddr {
        self.er_ctxt.bus_addr()
    }
    pub fn cmd_ctxt_addr(&self) -> BusAddr {
        self.cmd_ctxt.bus_addr()
    }
}

/// Write a freshly allocated ring into an event or command context entry.
fn publish_ring(arr: &CoherentBuf, entry: usize, ring: &Ring) {
    let base = ring.iommu_base.0;
    arr.write_u64(entry + EventCtxt::RBASE, base);
    arr.write_u64(entry + EventCtxt::RP, base);
    arr.write_u64(entry + EventCtxt::WP, base);
    arr.write_u64(entry + EventCtxt::RLEN, ring.len as u64);
}

impl Controller {
    /// Build the device context arrays and the event and command rings.
    ///
    /// Nothing is published to the controller unless every allocation
    /// succeeds.
    pub(crate) fn init_dev_ctxt(&self) -> Result<()> {
        let dma = &*self.dma;
        let max_chan = self.channels.len();

        let chan_ctxt = dma::alloc_coherent(
            dma,
            (ChanCtxt::SIZE * max_chan).max(ChanCtxt::SIZE),
            "channel context array",
        )?;
        for ch in self.channels.iter().filter(|ch| ch.configured && !ch.offload)
        {
            let entry = ch.num as usize * ChanCtxt::SIZE;
            let chcfg = ChCfg(0)
                .with_chstate(ChState::Disabled as u8)
                .with_brstmode(ch.brstmode as u8)
                .with_pollcfg(ch.pollcfg as u8);
            chan_ctxt.write_u32(entry + ChanCtxt::CHCFG, chcfg.0);
            chan_ctxt.write_u32(entry + ChanCtxt::CHTYPE, ch.chtype);
            chan_ctxt.write_u32(entry + ChanCtxt::ERINDEX, ch.er_index);
            ch.rings.lock().unwrap().tre.ctxt_wp =
                Some(CtxtSlot::new(chan_ctxt.clone(), entry + ChanCtxt::WP));
        }

        let res = self.init_er_ctxt().and_then(|er_ctxt| {
            match self.init_cmd_ctxt() {
                Ok(cmd_ctxt) => Ok((er_ctxt, cmd_ctxt)),
                Err(e) => {
                    self.free_er_rings();
                    Err(e)
                }
            }
        });
        let (er_ctxt, cmd_ctxt) = match res {
            Ok(arrays) => arrays,
            Err(e) => {
                self.unbind_chan_rings();
                return Err(e);
            }
        };

        *self.dev_ctxt.lock().unwrap() =
            Some(DevCtxt { chan_ctxt, er_ctxt, cmd_ctxt });
        debug!(self.log, "device context built");
        Ok(())
    }

    fn init_er_ctxt(&self) -> Result<Arc<CoherentBuf>> {
        let er_ctxt = dma::alloc_coherent(
            &*self.dma,
            (EventCtxt::SIZE * self.events.len()).max(EventCtxt::SIZE),
            "event ring context array",
        )?;
        for ev in self.events.iter().filter(|ev| !ev.offload) {
            let entry = ev.index as usize * EventCtxt::SIZE;
            // Bounded to 16 bits by parse_config
            let modt = u16::try_from(ev.intmod).unwrap_or(u16::MAX);
            let intmod = IntMod(0).with_modc(0).with_modt(modt);
            er_ctxt.write_u32(entry + EventCtxt::INTMOD, intmod.0);
            er_ctxt.write_u32(entry + EventCtxt::ERTYPE, MHI_ER_TYPE_VALID);
            er_ctxt.write_u32(entry + EventCtxt::MSIVEC, ev.irq);
            ev.db_mode.store(true, Ordering::Release);

            let mut ring = ev.ring.lock().unwrap();
            if let Err(e) = alloc_aligned_ring(&*self.dma, &mut ring) {
                drop(ring);
                self.free_er_rings();
                return Err(e);
            }
            publish_ring(&er_ctxt, entry, &ring);
            ring.ctxt_wp =
                Some(CtxtSlot::new(er_ctxt.clone(), entry + EventCtxt::WP));
        }
        Ok(er_ctxt)
    }

    fn init_cmd_ctxt(&self) -> Result<Arc<CoherentBuf>> {
        let cmd_ctxt = dma::alloc_coherent(
            &*self.dma,
            CmdCtxt::SIZE * self.cmd_rings.len(),
            "command ring context array",
        )?;
        for (i, cmd) in self.cmd_rings.iter().enumerate() {
            let entry = i * CmdCtxt::SIZE;
            let mut ring = cmd.ring.lock().unwrap();
            if let Err(e) = alloc_aligned_ring(&*self.dma, &mut ring) {
                drop(ring);
                self.free_cmd_rings();
                return Err(e);
            }
            cmd_ctxt.write_u64(entry + CmdCtxt::RBASE, ring.iommu_base.0);
            cmd_ctxt.write_u64(entry + CmdCtxt::RP, ring.iommu_base.0);
            cmd_ctxt.write_u64(entry + CmdCtxt::WP, ring.iommu_base.0);
            cmd_ctxt.write_u64(entry + CmdCtxt::RLEN, ring.len as u64);
            ring.ctxt_wp =
                Some(CtxtSlot::new(cmd_ctxt.clone(), entry + CmdCtxt::WP));
        }
        Ok(cmd_ctxt)
    }

    fn free_cmd_rings(&self) {
        for cmd in self.cmd_rings.iter().rev() {
            let mut ring = cmd.ring.lock().unwrap();
            free_ring(&mut ring);
            ring.ctxt_wp = None;
        }
    }

    fn free_er_rings(&self) {
        for ev in self.events.iter().rev().filter(|ev| !ev.offload) {
            let mut ring = ev.ring.lock().unwrap();
            free_ring(&mut ring);
            ring.ctxt_wp = None;
        }
    }

    fn unbind_chan_rings(&self) {
        for ch in self.channels.iter().rev() {
            ch.rings.lock().unwrap().tre.ctxt_wp = None;
        }
    }

    /// Release the device context arrays and the event and command rings.
    pub(crate) fn deinit_dev_ctxt(&self) {
        let Some(ctxt) = self.dev_ctxt.lock().unwrap().take() else { return };
        self.free_cmd_rings();
        self.free_er_rings();
        self.unbind_chan_rings();
        drop(ctxt);
        debug!(self.log, "device context released");
    }

    pub(crate) fn has_dev_ctxt(&self) -> bool {
        self.dev_ctxt.lock().unwrap().is_some()
    }

    /// Activate the context of `ch`: allocate its rings, publish them, and
    /// mark the channel enabled.
    pub(crate) fn init_chan_ctxt(
        &self,
        ch: &Channel,
        rings: &mut ChanRings,
    ) -> Result<()> {
        let ctxt = self.dev_ctxt.lock().unwrap();
        let arr = &ctxt
            .as_ref()
            .ok_or(Error::NotReady("device context not initialised"))?
            .chan_ctxt;
        let entry = ch.num as usize * ChanCtxt::SIZE;

        alloc_aligned_ring(&*self.dma, &mut rings.tre)?;
        rings.buf = match BufRing::alloc(ch.buf_elements) {
            Ok(buf) => buf,
            Err(e) => {
                free_ring(&mut rings.tre);
                return Err(e);
            }
        };

        let chcfg = ChCfg(arr.read_u32(entry + ChanCtxt::CHCFG))
            .with_chstate(ChState::Enabled as u8);
        arr.write_u32(entry + ChanCtxt::CHCFG, chcfg.0);

        let tre = &mut rings.tre;
        arr.write_u64(entry + ChanCtxt::RBASE, tre.iommu_base.0);
        arr.write_u64(entry + ChanCtxt::RP, tre.iommu_base.0);
        arr.write_u64(entry + ChanCtxt::WP, tre.iommu_base.0);
        arr.write_u64(entry + ChanCtxt::RLEN, tre.len as u64);
        tre.ctxt_wp = Some(CtxtSlot::new(arr.clone(), entry + ChanCtxt::WP));
        tre.reset_pointers();
        rings.db_mode = true;

        // Context contents must be visible before any doorbell
        fence(Ordering::SeqCst);

        probes::mhi_chan_ctxt_init!(|| (
            ch.num,
            rings.tre.iommu_base.0,
            rings.tre.len as u64
        ));
        info!(ch.log, "channel context initialised";
            "rbase" => %rings.tre.iommu_base, "rlen" => rings.tre.len);
        Ok(())
    }

    /// Tear down the context of `ch`.  A context that was never initialised,
    /// or was already torn down, is left alone.
    pub(crate) fn deinit_chan_ctxt(&self, ch: &Channel, rings: &mut ChanRings) {
        let ctxt = self.dev_ctxt.lock().unwrap();
        let Some(arr) = ctxt.as_ref().map(|c| &c.chan_ctxt) else { return };
        let entry = ch.num as usize * ChanCtxt::SIZE;
        if arr.read_u64(entry + ChanCtxt::RBASE) == 0 {
            return;
        }

        free_ring(&mut rings.tre);
        rings.buf = BufRing::default();

        arr.write_u64(entry + ChanCtxt::RBASE, 0);
        arr.write_u64(entry + ChanCtxt::RLEN, 0);
        arr.write_u64(entry + ChanCtxt::RP, 0);
        arr.write_u64(entry + ChanCtxt::WP, 0);

        let chcfg = ChCfg(arr.read_u32(entry + ChanCtxt::CHCFG))
            .with_chstate(ChState::Disabled as u8);
        arr.write_u32(entry + ChanCtxt::CHCFG, chcfg.0);

        fence(Ordering::SeqCst);
        probes::mhi_chan_ctxt_deinit!(|| ch.num);
        info!(ch.log, "channel context released");
    }

    /// Snapshot of the context entry for `chan`.
    pub fn chan_ctxt(&self, chan: u32) -> Result<ChanCtxt> {
        if chan as usize >= self.channels.len() {
            return Err(Error::invalid(format!("channel {chan} out of range")));
        }
        let ctxt = self.dev_ctxt.lock().unwrap();
        let ctxt = ctxt
            .as_ref()
            .ok_or(Error::NotReady("device context not initialised"))?;
        Ok(ctxt.chan_ctxt.read(chan as usize * ChanCtxt::SIZE))
    }

    /// Snapshot of the context entry for event ring `er`.
    pub fn er_ctxt(&self, er: u32) -> Result<EventCtxt> {
        if er as usize >= self.events.len() {
            return Err(Error::invalid(format!("event ring {er} out of range")));
        }
        let ctxt = self.dev_ctxt.lock().unwrap();
        let ctxt = ctxt
            .as_ref()
            .ok_or(Error::NotReady("device context not initialised"))?;
        Ok(ctxt.er_ctxt.read(er as usize * EventCtxt::SIZE))
    }

    /// Snapshot of the primary command ring's context entry.
    pub fn cmd_ctxt(&self) -> Result<CmdCtxt> {
        let ctxt = self.dev_ctxt.lock().unwrap();
        let ctxt = ctxt
            .as_ref()
            .ok_or(Error::NotReady("device context not initialised"))?;
        Ok(ctxt.cmd_ctxt.read(0))
    }
}
