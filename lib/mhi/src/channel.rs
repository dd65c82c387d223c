// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channels: host state, the state-change command protocol, and the
//! prepare/unprepare paths used by client drivers.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use slog::{debug, error, warn, Logger};

use crate::bits::{BrstMode, ChState, CmdType, CompletionCode, RingElement};
use crate::bus::MhiDevice;
use crate::common::{DmaDir, RING_ELEMENT_SIZE};
use crate::config::ChanParams;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::ring::{BufInfo, BufRing, Ring};
use crate::util::sync::Completion;

/// Transfer completion callback installed by a client driver.
pub type XferCb = Arc<dyn Fn(&MhiDevice, &mut XferResult) + Send + Sync>;

/// Outcome of a queued transfer, handed to the transfer callback.
#[derive(Debug)]
pub struct XferResult {
    pub buf: Option<Vec<u8>>,
    pub bytes_xferd: usize,
    pub dir: DmaDir,
    pub status: Result<()>,
}

/// Requested channel state change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChanTransition {
    Start,
    Stop,
    Reset,
    /// Restart a channel quiesced by driver removal
    Resume,
}

/// Ring state guarded by the per-channel mutex.
#[derive(Debug)]
pub(crate) struct ChanRings {
    pub tre: Ring,
    pub buf: BufRing,
    /// Doorbell is in its initial burst
    pub db_mode: bool,
}

/// Host state guarded by the per-channel reader/writer lock.
#[derive(Debug)]
pub(crate) struct ChanState {
    pub ch_state: ChState,
    /// Completion code of the last command
    pub ccs: CompletionCode,
}

pub struct Channel {
    pub(crate) num: u32,
    pub(crate) name: String,
    pub(crate) configured: bool,
    pub(crate) dir: DmaDir,
    pub(crate) chtype: u32,
    pub(crate) er_index: u32,
    pub(crate) ee_mask: u32,
    pub(crate) brstmode: BrstMode,
    pub(crate) pollcfg: u32,
    pub(crate) reset_req: bool,
    pub(crate) offload: bool,
    pub(crate) pre_alloc: bool,
    pub(crate) lpm_notify: bool,
    pub(crate) wake_capable: bool,
    pub(crate) buf_elements: usize,
    /// Batching count, copied from the channel's event ring
    pub(crate) intmod: u32,

    /// Taken before `state` and before the controller's PM lock.
    pub(crate) rings: Mutex<ChanRings>,
    pub(crate) state: RwLock<ChanState>,
    pub(crate) completion: Completion,
    xfer_cb: Mutex<Option<XferCb>>,
    pub(crate) mhi_dev: Mutex<Option<Arc<MhiDevice>>>,
    pub(crate) log: Logger,
}

impl Channel {
    pub(crate) fn new(
        num: u32,
        params: Option<&ChanParams>,
        intmod: u32,
        log: &Logger,
    ) -> Self {
        let (name, tre_elements) = match params {
            Some(p) => (p.name.clone(), p.tre_elements),
            None => (String::new(), 0),
        };
        let log = log.new(slog::o!("chan" => num, "chan_name" => name.clone()));
        Self {
            num,
            name,
            configured: params.is_some(),
            dir: params.map_or(DmaDir::Bidirectional, |p| p.dir),
            chtype: params.map_or(0, |p| p.chtype),
            er_index: params.map_or(0, |p| p.er_index),
            ee_mask: params.map_or(0, |p| p.ee_mask),
            brstmode: params.map_or(BrstMode::default(), |p| p.brstmode),
            pollcfg: params.map_or(0, |p| p.pollcfg),
            reset_req: params.is_some_and(|p| p.reset_req),
            offload: params.is_some_and(|p| p.offload),
            pre_alloc: params.is_some_and(|p| p.pre_alloc),
            lpm_notify: params.is_some_and(|p| p.lpm_notify),
            wake_capable: params.is_some_and(|p| p.wake_capable),
            buf_elements: params.map_or(0, |p| p.buf_elements),
            intmod,
            rings: Mutex::new(ChanRings {
                tre: Ring::new(RING_ELEMENT_SIZE, tre_elements),
                buf: BufRing::default(),
                db_mode: false,
            }),
            state: RwLock::new(ChanState {
                ch_state: ChState::Disabled,
                ccs: CompletionCode::Invalid,
            }),
            completion: Completion::new(),
            xfer_cb: Mutex::new(None),
            mhi_dev: Mutex::new(None),
            log,
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn dir(&self) -> DmaDir {
        self.dir
    }
    pub fn is_offload(&self) -> bool {
        self.offload
    }
    pub fn batching_count(&self) -> u32 {
        self.intmod
    }

    pub(crate) fn set_xfer_cb(&self, cb: Option<XferCb>) {
        *self.xfer_cb.lock().unwrap() = cb;
    }
    pub(crate) fn xfer_cb(&self) -> Option<XferCb> {
        self.xfer_cb.lock().unwrap().clone()
    }
    pub fn has_xfer_cb(&self) -> bool {
        self.xfer_cb.lock().unwrap().is_some()
    }

    pub(crate) fn device(&self) -> Option<Arc<MhiDevice>> {
        self.mhi_dev.lock().unwrap().clone()
    }
}

impl Controller {
    /// A configured channel.
    pub fn channel(&self, chan: u32) -> Result<&Channel> {
        self.channels
            .get(chan as usize)
            .filter(|ch| ch.configured)
            .ok_or_else(|| {
                Error::invalid(format!("channel {chan} is not configured"))
            })
    }

    pub fn channel_state(&self, chan: u32) -> Result<ChState> {
        Ok(self.channel(chan)?.state.read().unwrap().ch_state)
    }

    /// Completion code recorded by the last command on `chan`.
    pub fn channel_ccs(&self, chan: u32) -> Result<CompletionCode> {
        Ok(self.channel(chan)?.state.read().unwrap().ccs)
    }

    /// Move `chan` through a state change, issuing the matching command to
    /// the device and waiting for its completion.
    pub fn update_channel_state(
        &self,
        chan: u32,
        to: ChanTransition,
    ) -> Result<()> {
        let ch = self.channel(chan)?;
        let cmd = {
            let mut state = ch.state.write().unwrap();
            match (to, state.ch_state) {
                (
                    ChanTransition::Reset,
                    ChState::Stop | ChState::Enabled | ChState::Suspended,
                ) => {
                    state.ch_state = ChState::Disabled;
                    CmdType::ResetChan
                }
                (ChanTransition::Stop, ChState::Enabled) => CmdType::StopChan,
                (ChanTransition::Start, ChState::Stop | ChState::Disabled) => {
                    CmdType::StartChan
                }
                (ChanTransition::Resume, ChState::Suspended) => {
                    CmdType::StartChan
                }
                (to, cur) => {
                    error!(ch.log, "invalid channel state change";
                        "from" => cur.as_str(), "to" => ?to);
                    return Err(Error::invalid(format!(
                        "channel {chan}: {to:?} not valid from {}",
                        cur.as_str()
                    )));
                }
            }
        };

        let ctrl_dev = self.device();
        self.device_get_sync(&ctrl_dev)?;
        if let Err(e) = self.ops.runtime_get() {
            warn!(ch.log, "runtime get failed"; "error" => %e);
        }

        ch.completion.reinit();
        let res = self
            .send_cmd(ch.num, cmd)
            .and_then(|()| self.wait_chan_cmd(ch));
        match &res {
            Ok(()) => {
                let mut state = ch.state.write().unwrap();
                match to {
                    ChanTransition::Start | ChanTransition::Resume => {
                        state.ch_state = ChState::Enabled
                    }
                    ChanTransition::Stop => state.ch_state = ChState::Stop,
                    ChanTransition::Reset => {}
                }
                debug!(ch.log, "channel state updated";
                    "state" => state.ch_state.as_str());
            }
            Err(e) => {
                error!(ch.log, "failed to update channel state";
                    "cmd" => ?cmd, "error" => %e);
            }
        }

        self.ops.runtime_put();
        self.device_put(&ctrl_dev);
        res
    }

    fn wait_chan_cmd(&self, ch: &Channel) -> Result<()> {
        let timeout = Duration::from_millis(self.timeout_ms.into());
        let signalled = ch.completion.wait_timeout(timeout);
        let ccs = ch.state.read().unwrap().ccs;
        if !signalled {
            return Err(Error::TimedOut(self.timeout_ms));
        }
        match ccs {
            CompletionCode::Success => Ok(()),
            CompletionCode::Invalid => Err(Error::Cancelled),
            code => Err(Error::CommandFailed { chan: ch.num, code }),
        }
    }

    /// Activate `ch` for transfers: context init and start command, plus
    /// pre-queued buffers for pre-allocating channels.
    fn prepare_channel(&self, ch: &Channel) -> Result<()> {
        if ch.ee_mask & self.exec_env().mask() == 0 {
            error!(ch.log, "channel not supported in current EE";
                "ee" => self.exec_env().as_str());
            return Err(Error::NotConnected(ch.num));
        }

        let mut rings = ch.rings.lock().unwrap();
        if !ch.offload {
            self.init_chan_ctxt(ch, &mut rings)?;
        }
        if let Err(e) = self.update_channel_state(ch.num, ChanTransition::Start)
        {
            if !ch.offload {
                self.deinit_chan_ctxt(ch, &mut rings);
            }
            return Err(e);
        }
        if !ch.pre_alloc {
            return Ok(());
        }

        let res = self.pre_alloc_bufs(ch, &mut rings);
        drop(rings);
        if let Err(e) = &res {
            error!(ch.log, "failed to pre-allocate buffers"; "error" => %e);
            self.unprepare_channel(ch);
        }
        res
    }

    fn pre_alloc_bufs(
        &self,
        ch: &Channel,
        rings: &mut ChanRings,
    ) -> Result<()> {
        let len = self.buffer_len;
        while rings.tre.free_elements() > 0 && !rings.buf.is_full() {
            let mut data = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|_| Error::OutOfMemory("pre-allocated buffer"))?;
            data.resize(len, 0);
            self.gen_tre(
                ch,
                rings,
                BufInfo { data: Some(data), len, ..Default::default() },
                true,
            )?;
        }

        let pm = self.pm.read().unwrap();
        if self.db_access_valid(pm.state) {
            self.ring_chan_db(ch, rings);
        }
        Ok(())
    }

    /// Queue a buffer on the transfer ring: map it, record it in the
    /// buffer-tracking ring, and write its transfer element.
    fn gen_tre(
        &self,
        ch: &Channel,
        rings: &mut ChanRings,
        mut info: BufInfo,
        eot: bool,
    ) -> Result<()> {
        if rings.tre.is_full() || rings.buf.is_full() {
            return Err(Error::Busy);
        }
        info.dir = ch.dir;
        if !info.pre_mapped {
            self.map_single(&mut info)?;
        }
        let el =
            RingElement::transfer(info.p_addr.0, info.len, ch.intmod != 0, eot);
        rings.tre.push(el)?;
        rings.buf.push(info)
    }

    /// Publish the transfer ring write pointer and ring its doorbell.
    pub(crate) fn ring_chan_db(&self, ch: &Channel, rings: &mut ChanRings) {
        let db = rings.tre.dev_wp();
        std::sync::atomic::fence(Ordering::SeqCst);
        rings.tre.publish_wp();
        let Some(db_addr) = rings.tre.db_addr else { return };
        match ch.brstmode {
            BrstMode::Enable => {
                if rings.db_mode {
                    self.write_db(db_addr, db.0);
                    rings.db_mode = false;
                }
            }
            BrstMode::Disable => self.write_db(db_addr, db.0),
        }
    }

    /// Queue `data` for transfer on the device's channel in direction `dir`.
    ///
    /// Completion is reported through the driver's transfer callback.
    pub fn queue_buf(
        &self,
        dev: &MhiDevice,
        dir: DmaDir,
        data: Vec<u8>,
        eot: bool,
    ) -> Result<()> {
        let chan = match dir {
            DmaDir::ToDevice => dev.ul_chan(),
            DmaDir::FromDevice => dev.dl_chan(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::invalid(format!("{} has no {dir:?} channel", dev.name()))
        })?;
        let ch = self.channel(chan)?;

        let mut rings = ch.rings.lock().unwrap();
        let pm = self.pm.read().unwrap();
        if pm.state.in_error_state() {
            return Err(Error::NotReady("controller in error state"));
        }
        if ch.state.read().unwrap().ch_state != ChState::Enabled {
            return Err(Error::invalid(format!("channel {chan} not enabled")));
        }
        if rings.tre.is_full() {
            return Err(Error::Busy);
        }

        let len = data.len();
        if len > self.buffer_len {
            return Err(Error::invalid(format!(
                "buffer of {len} bytes exceeds MTU {}",
                self.buffer_len
            )));
        }
        self.gen_tre(
            ch,
            &mut rings,
            BufInfo { data: Some(data), len, ..Default::default() },
            eot,
        )?;

        if ch.dir == DmaDir::ToDevice {
            self.pending_pkts.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = self.ops.runtime_get() {
                warn!(ch.log, "runtime get failed"; "error" => %e);
            }
        }
        if self.db_access_valid(pm.state) {
            self.ring_chan_db(ch, &mut rings);
        }
        Ok(())
    }

    /// Return every buffer still queued on `ch` to its owner.
    pub(crate) fn reset_chan(&self, ch: &Channel, rings: &mut ChanRings) {
        if ch.offload {
            return;
        }
        let _pm = self.pm.read().unwrap();
        self.reset_data_chan(ch, rings);
    }

    fn reset_data_chan(&self, ch: &Channel, rings: &mut ChanRings) {
        let cb = ch.xfer_cb();
        let dev = ch.device();

        while rings.tre.is_allocated() && !rings.tre.is_empty() {
            rings.tre.advance_rp();
            let Some(mut info) = rings.buf.pop() else { break };

            if ch.dir == DmaDir::ToDevice {
                self.pending_pkts.fetch_sub(1, Ordering::AcqRel);
                self.ops.runtime_put();
            }
            if !info.pre_mapped {
                self.unmap_single(&mut info);
            }
            if ch.pre_alloc {
                continue;
            }
            if let (Some(cb), Some(dev)) = (cb.as_ref(), dev.as_ref()) {
                let mut result = XferResult {
                    buf: info.data.take(),
                    bytes_xferd: 0,
                    dir: ch.dir,
                    status: Err(Error::NotConnected(ch.num)),
                };
                cb(dev, &mut result);
            }
        }
    }

    /// Reset and deactivate `ch`.
    fn unprepare_channel(&self, ch: &Channel) {
        if ch.ee_mask & self.exec_env().mask() != 0 {
            if let Err(e) =
                self.update_channel_state(ch.num, ChanTransition::Reset)
            {
                debug!(ch.log, "reset command failed"; "error" => %e);
            }
        }

        let mut rings = ch.rings.lock().unwrap();
        ch.state.write().unwrap().ch_state = ChState::Disabled;
        if ch.offload {
            return;
        }
        self.reset_chan(ch, &mut rings);
        self.deinit_chan_ctxt(ch, &mut rings);
    }

    /// Start every channel of `dev` for transfers.
    ///
    /// On failure, channels started so far are unprepared again.
    pub fn prepare_for_transfer(&self, dev: &MhiDevice) -> Result<()> {
        let chans: Vec<u32> =
            [dev.ul_chan(), dev.dl_chan()].into_iter().flatten().collect();
        for (i, &chan) in chans.iter().enumerate() {
            let res =
                self.channel(chan).and_then(|ch| self.prepare_channel(ch));
            if let Err(e) = res {
                for &done in chans[..i].iter().rev() {
                    if let Ok(ch) = self.channel(done) {
                        self.unprepare_channel(ch);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reset and deactivate every channel of `dev`.
    pub fn unprepare_from_transfer(&self, dev: &MhiDevice) {
        for chan in [dev.ul_chan(), dev.dl_chan()].into_iter().flatten() {
            if let Ok(ch) = self.channel(chan) {
                self.unprepare_channel(ch);
            }
        }
    }

    /// Number of host-to-device buffers queued and not yet completed.
    pub fn pending_pkts(&self) -> u32 {
        self.pending_pkts.load(Ordering::Acquire)
    }
}
