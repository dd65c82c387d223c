// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MHI controller: registration, power-up preparation, state
//! transitions, and teardown.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use slog::{debug, error, info, o, warn, Logger};

use crate::bits::{bhi, regs, MhiState};
use crate::boot::BhieTable;
use crate::bus::{DeviceKind, MhiBus, MhiDevice};
use crate::channel::Channel;
use crate::cmd::CmdRing;
use crate::common::{DmaDir, NR_OF_CMD_RINGS};
use crate::config::{parse_config, ControllerConfig};
use crate::context::DevCtxt;
use crate::dma::{DmaAllocator, MapMode};
use crate::error::{Error, Result};
use crate::event::{EventProcessor, EventRing};
use crate::irq::{IrqChip, IrqFlags, IrqState};
use crate::pm::{
    pm_state_str, Callback, ExecEnv, PmState, PmStatus, StateTransition,
    WakeState,
};
use crate::ring::BufInfo;
use crate::tasks::Worker;
use crate::util::sync::WaitQueue;

bitflags! {
    /// Optional services an integrator's [`ControllerOps`] provides.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpsCaps: u32 {
        /// [`ControllerOps::edl_trigger`] is implemented
        const EDL_TRIGGER = 1 << 0;
        /// [`ControllerOps::reset`] is implemented
        const SOC_RESET = 1 << 1;
    }
}

/// Callbacks into the integrator owning the controller hardware.
pub trait ControllerOps: Send + Sync + 'static {
    /// Read the 32-bit register at `offset` in the MMIO window.
    fn read_reg(&self, offset: usize) -> io::Result<u32>;

    /// Write the 32-bit register at `offset` in the MMIO window.
    fn write_reg(&self, offset: usize, val: u32);

    fn runtime_get(&self) -> io::Result<()>;
    fn runtime_put(&self);

    /// Controller-level status notification.
    fn status_cb(&self, cb: Callback);

    fn capabilities(&self) -> OpsCaps {
        OpsCaps::empty()
    }

    /// Force the device into emergency download mode.
    fn edl_trigger(&self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Reset the SoC by out-of-band means.
    fn reset(&self) {}

    fn create_debugfs(&self, _name: &str) {}
    fn destroy_debugfs(&self, _name: &str) {}
}

/// Bus transport services a controller is registered against.
pub struct Transport {
    pub ops: Arc<dyn ControllerOps>,
    pub dma: Arc<dyn DmaAllocator>,
    pub irq_chip: Arc<dyn IrqChip>,
    pub event_processor: Option<Arc<dyn EventProcessor>>,
}

/// Hardware resources of a controller, supplied by the integrator.
#[derive(Clone, Debug, Default)]
pub struct ControllerResources {
    /// Length of the MMIO register window
    pub reg_len: usize,
    /// Interrupt lines; entry 0 is the control interrupt
    pub irqs: Vec<u32>,
    /// Device-addressable window
    pub iova_start: u64,
    pub iova_stop: u64,
    /// Overrides the default `SHARED | NO_SUSPEND`
    pub irq_flags: Option<IrqFlags>,
    /// Firmware is downloaded through BHIe
    pub fbc_download: bool,
    /// Ramdump image size; zero disables ramdump
    pub rddm_size: usize,
    /// BHIe segment length; zero selects the default
    pub seg_len: usize,
    /// Name of the integrator's device, for diagnostics
    pub parent: Option<String>,
}

impl ControllerResources {
    fn validate(&self) -> Result<()> {
        if self.reg_len == 0 {
            return Err(Error::invalid("register window length is zero"));
        }
        if self.irqs.is_empty() {
            return Err(Error::invalid("no interrupt lines"));
        }
        if self.iova_start > self.iova_stop {
            return Err(Error::invalid(format!(
                "IOVA window {:#x}..{:#x} is inverted",
                self.iova_start, self.iova_stop
            )));
        }
        Ok(())
    }
}

/// Boot interface state, set up by [`Controller::prepare_for_power_up`].
#[derive(Debug, Default)]
pub(crate) struct BootState {
    pub bhi: Option<usize>,
    pub bhie: Option<usize>,
    pub serial_number: u32,
    pub rddm_image: Option<BhieTable>,
}

pub struct Controller {
    pub(crate) log: Logger,
    index: u32,
    this: Weak<Controller>,
    bus: Arc<MhiBus>,
    mhi_dev: Arc<MhiDevice>,

    pub(crate) ops: Arc<dyn ControllerOps>,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) irq_chip: Arc<dyn IrqChip>,
    pub(crate) event_processor: Option<Arc<dyn EventProcessor>>,
    pub(crate) res: ControllerResources,

    pub(crate) channels: Vec<Channel>,
    pub(crate) events: Vec<EventRing>,
    pub(crate) cmd_rings: Vec<CmdRing>,
    pub(crate) lpm_chans: Vec<u32>,
    pub(crate) hw_ev_rings: u32,

    pub(crate) timeout_ms: u32,
    pub(crate) ready_timeout_ms: u32,
    pub(crate) buffer_len: usize,
    pub(crate) db_access: PmState,
    map_mode: MapMode,

    pub(crate) dev_ctxt: Mutex<Option<DevCtxt>>,
    pub(crate) boot: Mutex<BootState>,
    pm_mutex: Mutex<()>,
    pub(crate) pm: RwLock<PmStatus>,
    pub(crate) wake: Mutex<WakeState>,
    pub(crate) state_event: WaitQueue,
    transitions: Mutex<VecDeque<StateTransition>>,
    hiprio_wq: Mutex<Option<Arc<Worker>>>,
    pub(crate) bh_worker: Mutex<Option<Arc<Worker>>>,
    pub(crate) irqs: Mutex<IrqState>,
    pub(crate) pending_pkts: AtomicU32,
    edl_attr: AtomicBool,
    registered: AtomicBool,
}

impl Controller {
    /// Validate `config`, build the controller, install its interrupts
    /// (disabled), and publish its device on `bus`.
    pub fn register(
        bus: &Arc<MhiBus>,
        transport: Transport,
        res: ControllerResources,
        config: &ControllerConfig,
        log: &Logger,
    ) -> Result<Arc<Self>> {
        res.validate()?;
        let parsed = parse_config(config)?;

        let hiprio_wq = Arc::new(Worker::new("mhi_hiprio_wq")?);
        let bh_worker = Arc::new(Worker::new("mhi_bh")?);

        let index = bus.ids().alloc();
        let name = format!("mhi{index}");
        let log = log.new(o!("component" => "mhi", "dev" => name.clone()));

        let events: Vec<EventRing> =
            parsed.events.iter().map(EventRing::new).collect();
        let channels = parsed
            .channels
            .iter()
            .enumerate()
            .map(|(num, params)| {
                let intmod = params
                    .as_ref()
                    .and_then(|p| events.get(p.er_index as usize))
                    .map_or(0, |ev| ev.intmod);
                Channel::new(num as u32, params.as_ref(), intmod, &log)
            })
            .collect();
        let cmd_rings = (0..NR_OF_CMD_RINGS).map(|_| CmdRing::new()).collect();

        let ctrl = Arc::new_cyclic(|this: &Weak<Controller>| Controller {
            log: log.clone(),
            index,
            this: this.clone(),
            bus: bus.clone(),
            mhi_dev: MhiDevice::new(
                name.clone(),
                name.clone(),
                DeviceKind::Controller,
                this.clone(),
            ),
            ops: transport.ops,
            dma: transport.dma,
            irq_chip: transport.irq_chip,
            event_processor: transport.event_processor,
            res,
            channels,
            events,
            cmd_rings,
            lpm_chans: parsed.lpm_chans.clone(),
            hw_ev_rings: parsed.hw_ev_rings,
            timeout_ms: parsed.timeout_ms,
            ready_timeout_ms: parsed.ready_timeout_ms,
            buffer_len: parsed.buffer_len,
            db_access: parsed.db_access,
            map_mode: MapMode::from_bounce_flag(parsed.bounce_buf),
            dev_ctxt: Mutex::new(None),
            boot: Mutex::new(BootState::default()),
            pm_mutex: Mutex::new(()),
            pm: RwLock::new(PmStatus::default()),
            wake: Mutex::new(WakeState::default()),
            state_event: WaitQueue::new(),
            transitions: Mutex::new(VecDeque::new()),
            hiprio_wq: Mutex::new(Some(hiprio_wq)),
            bh_worker: Mutex::new(Some(bh_worker)),
            irqs: Mutex::new(IrqState::default()),
            pending_pkts: AtomicU32::new(0),
            edl_attr: AtomicBool::new(false),
            registered: AtomicBool::new(true),
        });

        if let Err(e) = ctrl.init_irq_setup() {
            error!(log, "failed to set up interrupts"; "error" => %e);
            ctrl.stop_workers();
            bus.ids().free(index);
            return Err(e);
        }

        let dev = ctrl.device();
        dev.set_wakeup(true);
        if let Err(e) = bus.device_add(dev) {
            error!(log, "failed to publish controller device"; "error" => %e);
            ctrl.deinit_free_irq();
            ctrl.stop_workers();
            bus.ids().free(index);
            return Err(e);
        }

        if ctrl.ops.capabilities().contains(OpsCaps::EDL_TRIGGER) {
            ctrl.edl_attr.store(true, Ordering::Release);
        }
        ctrl.ops.create_debugfs(&name);

        info!(log, "controller registered";
            "channels" => ctrl.channels.len(),
            "event_rings" => ctrl.events.len(),
            "parent" => ctrl.res.parent.as_deref().unwrap_or("none"));
        Ok(ctrl)
    }

    /// Undo [`Controller::register`].  Client devices are removed from the
    /// bus, unbinding their drivers.
    pub fn unregister(&self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        let name = self.name().to_string();

        self.deinit_free_irq();
        self.ops.destroy_debugfs(&name);
        self.edl_attr.store(false, Ordering::Release);
        self.stop_workers();

        let mut devs: Vec<Arc<MhiDevice>> = Vec::new();
        for ch in self.channels.iter() {
            if let Some(dev) = ch.mhi_dev.lock().unwrap().take() {
                if !devs.iter().any(|d| Arc::ptr_eq(d, &dev)) {
                    devs.push(dev);
                }
            }
        }
        for dev in devs.iter() {
            self.bus.device_del(dev);
        }

        self.bus.device_del(&self.mhi_dev);
        self.bus.ids().free(self.index);
        info!(self.log, "controller unregistered");
    }

    fn stop_workers(&self) {
        // Dropping the last reference drains and joins the worker
        let hiprio = self.hiprio_wq.lock().unwrap().take();
        let bh = self.bh_worker.lock().unwrap().take();
        drop(hiprio);
        drop(bh);
    }

    /// Wait for queued state transitions and bottom halves to finish.
    pub fn flush_workers(&self) {
        let hiprio = self.hiprio_wq.lock().unwrap().clone();
        if let Some(worker) = hiprio {
            worker.flush();
        }
        let bh = self.bh_worker.lock().unwrap().clone();
        if let Some(worker) = bh {
            worker.flush();
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        self.mhi_dev.name()
    }

    /// The bus device representing this controller.
    pub fn device(&self) -> Arc<MhiDevice> {
        self.mhi_dev.clone()
    }

    pub fn bus(&self) -> &Arc<MhiBus> {
        &self.bus
    }

    pub(crate) fn has_edl_attr(&self) -> bool {
        self.edl_attr.load(Ordering::Acquire)
    }

    pub fn ready_timeout_ms(&self) -> u32 {
        self.ready_timeout_ms
    }

    /// Channels wanting low-power-mode notifications, in configuration
    /// order.
    pub fn lpm_chans(&self) -> &[u32] {
        &self.lpm_chans
    }

    /// Read a boot interface offset register and check it against the
    /// register window.
    fn read_boot_offset(
        &self,
        reg: usize,
        what: &'static str,
    ) -> Result<usize> {
        let off = self.read_reg(reg)? as usize;
        if off >= self.res.reg_len {
            error!(self.log, "boot interface offset out of range";
                "what" => what, "off" => format!("{off:#x}"));
            return Err(Error::OutOfRange {
                what,
                offset: off,
                limit: self.res.reg_len,
            });
        }
        Ok(off)
    }

    fn prepare_boot(&self) -> Result<()> {
        let bhi_off = self.read_boot_offset(regs::BHIOFF, "BHI")?;
        let serial = self
            .read_reg(bhi_off + bhi::BHI_SERIALNU)
            .unwrap_or_else(|e| {
                warn!(self.log, "could not read serial number"; "error" => %e);
                0
            });
        {
            let mut boot = self.boot.lock().unwrap();
            boot.bhi = Some(bhi_off);
            boot.serial_number = serial;
        }

        if !self.res.fbc_download && self.res.rddm_size == 0 {
            return Ok(());
        }
        let bhie_off = self.read_boot_offset(regs::BHIEOFF, "BHIe")?;
        self.boot.lock().unwrap().bhie = Some(bhie_off);

        if self.res.rddm_size > 0 {
            self.clear_bhie_rx(bhie_off);
            match BhieTable::alloc(self, self.res.rddm_size) {
                Ok(table) => {
                    self.rddm_prepare(bhie_off, &table);
                    self.boot.lock().unwrap().rddm_image = Some(table);
                }
                Err(e) => {
                    warn!(self.log, "ramdump table not available";
                        "error" => %e);
                }
            }
        }
        Ok(())
    }

    fn clear_boot(&self) {
        let mut boot = self.boot.lock().unwrap();
        boot.rddm_image = None;
        boot.bhi = None;
        boot.bhie = None;
    }

    /// Build the device context and discover the boot interfaces ahead of
    /// the (external) power-up sequence.
    pub fn prepare_for_power_up(&self) -> Result<()> {
        let _guard = self.pm_mutex.lock().unwrap();
        if self.has_dev_ctxt() {
            return Ok(());
        }
        self.init_dev_ctxt()?;
        if let Err(e) = self.prepare_boot() {
            error!(self.log, "power-up preparation failed"; "error" => %e);
            self.clear_boot();
            self.deinit_dev_ctxt();
            return Err(e);
        }
        info!(self.log, "prepared for power up");
        Ok(())
    }

    /// Release everything [`Controller::prepare_for_power_up`] set up.
    pub fn unprepare_after_power_down(&self) {
        let _guard = self.pm_mutex.lock().unwrap();
        self.clear_boot();

        for ch in self.channels.iter().filter(|ch| ch.configured) {
            let mut rings = ch.rings.lock().unwrap();
            if rings.tre.is_allocated() {
                self.reset_chan(ch, &mut rings);
                self.deinit_chan_ctxt(ch, &mut rings);
                ch.state.write().unwrap().ch_state =
                    crate::bits::ChState::Disabled;
            }
        }
        self.deinit_dev_ctxt();
        info!(self.log, "unprepared after power down");
    }

    /// Move the host PM state to `to`, failing if the transition is not
    /// allowed from the current state.
    pub fn set_pm_state(&self, to: PmState) -> Result<()> {
        let cur = self.try_set_pm_state(to);
        if cur != to {
            return Err(Error::invalid(format!(
                "PM transition to {} refused in {}",
                pm_state_str(to),
                pm_state_str(cur)
            )));
        }
        Ok(())
    }

    /// Queue a state transition for the high-priority worker.
    pub fn queue_transition(&self, t: StateTransition) {
        debug!(self.log, "queueing state transition"; "state" => t.as_str());
        self.transitions.lock().unwrap().push_back(t);

        let weak = self.this.clone();
        let queued = match self.hiprio_wq.lock().unwrap().as_ref() {
            Some(worker) => worker.queue(move || {
                if let Some(ctrl) = weak.upgrade() {
                    ctrl.process_transitions();
                }
            }),
            None => false,
        };
        if !queued {
            warn!(self.log, "state worker stopped, transition dropped";
                "state" => t.as_str());
            self.transitions.lock().unwrap().clear();
        }
    }

    fn process_transitions(&self) {
        let pending: Vec<_> =
            self.transitions.lock().unwrap().drain(..).collect();
        for t in pending {
            debug!(self.log, "handling state transition";
                "state" => t.as_str());
            match t {
                StateTransition::Pbl => self.set_exec_env(ExecEnv::Pbl),
                StateTransition::Ready => self.set_dev_state(MhiState::Ready),
                StateTransition::Sbl => {
                    self.set_exec_env(ExecEnv::Sbl);
                    self.create_devices();
                }
                StateTransition::MissionMode => {
                    self.set_exec_env(ExecEnv::Amss);
                    self.ops.status_cb(Callback::EeMissionMode);
                    self.create_devices();
                }
                StateTransition::SysErr => self.sys_error_transition(),
                StateTransition::Disable => self.disable_transition(),
            }
        }
    }

    fn sys_error_transition(&self) {
        let cur = self.try_set_pm_state(PmState::SYS_ERR_PROCESS);
        if cur != PmState::SYS_ERR_PROCESS {
            error!(self.log, "cannot process SYS ERROR";
                "pm_state" => pm_state_str(cur));
            return;
        }
        self.ops.status_cb(Callback::SysError);
        for dev in self.client_devices() {
            dev.notify(Callback::SysError);
        }
    }

    fn disable_transition(&self) {
        self.disable_irqs();
        self.try_set_pm_state(PmState::SHUTDOWN_PROCESS);
        self.try_set_pm_state(PmState::DISABLE);
        self.set_dev_state(MhiState::Reset);
        info!(self.log, "device disabled");
    }

    fn client_devices(&self) -> Vec<Arc<MhiDevice>> {
        let mut devs: Vec<Arc<MhiDevice>> = Vec::new();
        for dev in self.channels.iter().filter_map(|ch| ch.device()) {
            if !devs.iter().any(|d| Arc::ptr_eq(d, &dev)) {
                devs.push(dev);
            }
        }
        devs
    }

    /// Create a client device for every channel (or uplink/downlink pair of
    /// adjacent, same-named channels) usable in the current EE.
    pub fn create_devices(&self) {
        let ee = self.exec_env();
        let mut i = 0;
        while i < self.channels.len() {
            let ch = &self.channels[i];
            i += 1;
            if !ch.configured
                || ch.device().is_some()
                || ch.ee_mask & ee.mask() == 0
            {
                continue;
            }
            let mut ul_chan = None;
            let mut dl_chan = None;
            match ch.dir {
                DmaDir::ToDevice => ul_chan = Some(ch.num),
                DmaDir::FromDevice => dl_chan = Some(ch.num),
                dir => {
                    error!(ch.log, "direction not supported for devices";
                        "dir" => ?dir);
                    continue;
                }
            }

            let mut members = vec![ch];
            if let Some(next) = self.channels.get(i) {
                if next.configured && next.name == ch.name {
                    match next.dir {
                        DmaDir::ToDevice => ul_chan = Some(next.num),
                        _ => dl_chan = Some(next.num),
                    }
                    members.push(next);
                    i += 1;
                }
            }

            let dev = MhiDevice::new(
                format!("{}_{}", self.name(), ch.name),
                ch.name.clone(),
                DeviceKind::Xfer { ul_chan, dl_chan },
                self.this.clone(),
            );
            let dl_wake = dl_chan
                .and_then(|c| self.channels.get(c as usize))
                .is_some_and(|c| c.wake_capable);
            dev.set_wakeup(dl_wake);
            for member in members.iter() {
                *member.mhi_dev.lock().unwrap() = Some(dev.clone());
            }

            if let Err(e) = self.bus.device_add(dev) {
                error!(ch.log, "failed to add client device"; "error" => %e);
                for member in members {
                    member.mhi_dev.lock().unwrap().take();
                }
            }
        }
    }

    pub(crate) fn map_single(&self, info: &mut BufInfo) -> Result<()> {
        self.map_mode.map_single(&*self.dma, info)
    }

    pub(crate) fn unmap_single(&self, info: &mut BufInfo) {
        self.map_mode.unmap_single(&*self.dma, info)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name())
            .field("pm_state", &pm_state_str(self.pm_state()))
            .finish()
    }
}
