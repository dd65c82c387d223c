// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `mhi` bus: controller and channel devices, client drivers, and the
//! probe/remove contracts binding them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use slog::{error, info, warn};

use crate::bits::{ChState, CompletionCode};
use crate::channel::{XferCb, XferResult};
use crate::common::DmaDir;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::pm::Callback;
use crate::util::id::IdAllocator;

/// Name of the bus all MHI devices live on.
pub const MHI_BUS_NAME: &str = "mhi";

/// Status notification delivered to a client driver.
pub type StatusCb = Arc<dyn Fn(&MhiDevice, Callback) + Send + Sync>;

/// Variant part of an [`MhiDevice`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    /// The device representing a controller itself
    Controller,
    /// A client device over one uplink and/or downlink channel
    Xfer { ul_chan: Option<u32>, dl_chan: Option<u32> },
}

/// A device on the MHI bus.
pub struct MhiDevice {
    name: String,
    /// Channel name used for matching; the device name for controllers
    chan_name: String,
    kind: DeviceKind,
    ctrl: Weak<Controller>,
    wakeup: AtomicBool,
    /// Wake references held on behalf of this device
    dev_wake: AtomicU32,
    bound: Mutex<Option<(Arc<MhiDriver>, String)>>,
}

impl MhiDevice {
    pub(crate) fn new(
        name: String,
        chan_name: String,
        kind: DeviceKind,
        ctrl: Weak<Controller>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            chan_name,
            kind,
            ctrl,
            wakeup: AtomicBool::new(false),
            dev_wake: AtomicU32::new(0),
            bound: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn chan_name(&self) -> &str {
        &self.chan_name
    }
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
    pub fn is_controller(&self) -> bool {
        self.kind == DeviceKind::Controller
    }
    pub fn ul_chan(&self) -> Option<u32> {
        match self.kind {
            DeviceKind::Xfer { ul_chan, .. } => ul_chan,
            DeviceKind::Controller => None,
        }
    }
    pub fn dl_chan(&self) -> Option<u32> {
        match self.kind {
            DeviceKind::Xfer { dl_chan, .. } => dl_chan,
            DeviceKind::Controller => None,
        }
    }

    pub fn modalias(&self) -> String {
        format!("{MHI_BUS_NAME}:{}", self.chan_name)
    }

    pub fn controller(&self) -> Option<Arc<Controller>> {
        self.ctrl.upgrade()
    }

    pub fn set_wakeup(&self, wakeup: bool) {
        self.wakeup.store(wakeup, Ordering::Release);
    }
    pub fn is_wakeup(&self) -> bool {
        self.wakeup.load(Ordering::Acquire)
    }

    /// Wake references currently held for this device.
    pub fn wake_refs(&self) -> u32 {
        self.dev_wake.load(Ordering::Acquire)
    }
    pub(crate) fn wake_ref_inc(&self) {
        self.dev_wake.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn wake_ref_dec(&self) -> bool {
        self.dev_wake
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                v.checked_sub(1)
            })
            .is_ok()
    }

    /// The driver bound to this device and the identifier it matched on.
    pub fn driver(&self) -> Option<(Arc<MhiDriver>, String)> {
        self.bound.lock().unwrap().clone()
    }

    /// Deliver a status notification to the bound driver, if it takes them.
    pub fn notify(&self, cb: Callback) {
        let drv = self.bound.lock().unwrap().as_ref().map(|(d, _)| d.clone());
        if let Some(status_cb) = drv.and_then(|d| d.status_cb.clone()) {
            status_cb(self, cb);
        }
    }
}

impl std::fmt::Debug for MhiDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MhiDevice")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Probe and remove entry points of a client driver.
pub trait ClientDriver: Send + Sync + 'static {
    /// Bind to `dev`, which matched on identifier `id`.
    fn probe(&self, dev: &Arc<MhiDevice>, id: &str) -> Result<()>;

    fn remove(&self, dev: &Arc<MhiDevice>);
}

/// A client driver registration.
pub struct MhiDriver {
    pub name: String,
    /// Channel names this driver binds to
    pub id_table: Vec<String>,
    pub ul_xfer_cb: Option<XferCb>,
    pub dl_xfer_cb: Option<XferCb>,
    pub status_cb: Option<StatusCb>,
    pub client: Arc<dyn ClientDriver>,
}

impl MhiDriver {
    pub fn new(
        name: &str,
        id_table: &[&str],
        client: Arc<dyn ClientDriver>,
    ) -> Self {
        Self {
            name: name.to_string(),
            id_table: id_table.iter().map(|s| s.to_string()).collect(),
            ul_xfer_cb: None,
            dl_xfer_cb: None,
            status_cb: None,
            client,
        }
    }

    pub fn with_ul_xfer_cb(
        mut self,
        cb: impl Fn(&MhiDevice, &mut XferResult) + Send + Sync + 'static,
    ) -> Self {
        self.ul_xfer_cb = Some(Arc::new(cb));
        self
    }

    pub fn with_dl_xfer_cb(
        mut self,
        cb: impl Fn(&MhiDevice, &mut XferResult) + Send + Sync + 'static,
    ) -> Self {
        self.dl_xfer_cb = Some(Arc::new(cb));
        self
    }

    pub fn with_status_cb(
        mut self,
        cb: impl Fn(&MhiDevice, Callback) + Send + Sync + 'static,
    ) -> Self {
        self.status_cb = Some(Arc::new(cb));
        self
    }

    /// The identifier in this driver's table matching `dev`, if any.
    ///
    /// Controller devices never match.
    pub fn matches(&self, dev: &MhiDevice) -> Option<&str> {
        if dev.is_controller() {
            return None;
        }
        self.id_table
            .iter()
            .find(|id| id.as_str() == dev.chan_name())
            .map(String::as_str)
    }

    fn xfer_cb(&self, dir: DmaDir) -> Option<XferCb> {
        match dir {
            DmaDir::ToDevice => self.ul_xfer_cb.clone(),
            _ => self.dl_xfer_cb.clone(),
        }
    }
}

#[derive(Default)]
struct BusInner {
    devices: Vec<Arc<MhiDevice>>,
    drivers: Vec<Arc<MhiDriver>>,
}

/// The MHI bus.
///
/// Owns the controller identifier pool, the published devices, and the
/// registered drivers.  Probe and remove always run without the bus lock
/// held.
#[derive(Default)]
pub struct MhiBus {
    ids: IdAllocator,
    inner: Mutex<BusInner>,
}

lazy_static::lazy_static! {
    static ref MHI_BUS: Arc<MhiBus> = Arc::new(MhiBus::new());
}

impl MhiBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus instance.
    pub fn global() -> Arc<MhiBus> {
        MHI_BUS.clone()
    }

    pub fn name(&self) -> &'static str {
        MHI_BUS_NAME
    }

    pub(crate) fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn devices(&self) -> Vec<Arc<MhiDevice>> {
        self.inner.lock().unwrap().devices.clone()
    }

    pub fn find_device(&self, name: &str) -> Option<Arc<MhiDevice>> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Publish `dev` on the bus, probing the first matching driver.
    ///
    /// A failed probe leaves the device published but unbound.
    pub fn device_add(&self, dev: Arc<MhiDevice>) -> Result<()> {
        let candidate = {
            let mut inner = self.inner.lock().unwrap();
            if inner.devices.iter().any(|d| d.name() == dev.name()) {
                return Err(Error::invalid(format!(
                    "device {} already on bus",
                    dev.name()
                )));
            }
            inner.devices.push(dev.clone());
            inner.drivers.iter().find_map(|drv| {
                drv.matches(&dev).map(|id| (drv.clone(), id.to_string()))
            })
        };
        if let Some((drv, id)) = candidate {
            bind(&dev, drv, &id);
        }
        Ok(())
    }

    /// Remove `dev` from the bus, unbinding its driver first.
    pub fn device_del(&self, dev: &Arc<MhiDevice>) {
        unbind(dev);
        self.inner.lock().unwrap().devices.retain(|d| !Arc::ptr_eq(d, dev));
    }

    /// Register `drv`, probing every unbound device it matches.
    pub fn driver_register(&self, drv: Arc<MhiDriver>) -> Result<()> {
        let candidates: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.drivers.iter().any(|d| d.name == drv.name) {
                return Err(Error::invalid(format!(
                    "driver {} already registered",
                    drv.name
                )));
            }
            inner.drivers.push(drv.clone());
            inner
                .devices
                .iter()
                .filter(|d| d.driver().is_none())
                .filter_map(|d| {
                    drv.matches(d).map(|id| (d.clone(), id.to_string()))
                })
                .collect()
        };
        for (dev, id) in candidates {
            bind(&dev, drv.clone(), &id);
        }
        Ok(())
    }

    /// Unregister `drv`, removing it from every device it is bound to.
    pub fn driver_unregister(&self, drv: &Arc<MhiDriver>) {
        let bound: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drivers.retain(|d| !Arc::ptr_eq(d, drv));
            inner
                .devices
                .iter()
                .filter(|d| {
                    d.driver().is_some_and(|(b, _)| Arc::ptr_eq(&b, drv))
                })
                .cloned()
                .collect()
        };
        for dev in bound {
            unbind(&dev);
        }
    }
}

/// Probe `drv` against `dev`. A failed probe leaves `dev` on the bus
/// unbound; it never fails the add or the registration that triggered it.
fn bind(dev: &Arc<MhiDevice>, drv: Arc<MhiDriver>, id: &str) {
    match driver_probe(dev, &drv, id) {
        Ok(()) => {
            *dev.bound.lock().unwrap() = Some((drv, id.to_string()));
        }
        Err(e) => {
            if let Some(ctrl) = dev.controller() {
                warn!(ctrl.log, "probe failed";
                    "mhi_dev" => dev.name(), "driver" => &drv.name,
                    "error" => %e);
            }
        }
    }
}

fn unbind(dev: &Arc<MhiDevice>) {
    let bound = dev.bound.lock().unwrap().take();
    if let Some((drv, _)) = bound {
        driver_remove(dev, &drv);
    }
}

/// Probe contract: validate the driver's callbacks against the device's
/// channels, install them, and call the driver's probe.
fn driver_probe(dev: &Arc<MhiDevice>, drv: &MhiDriver, id: &str) -> Result<()> {
    let ctrl = dev
        .controller()
        .ok_or(Error::NotReady("controller is gone"))?;
    let ctrl_dev = ctrl.device();

    // Bring the device out of suspend for the duration of probe
    ctrl.device_get_sync(&ctrl_dev)?;

    let res = probe_channels(&ctrl, dev, drv)
        .and_then(|()| drv.client.probe(dev, id));
    if let Err(e) = &res {
        error!(ctrl.log, "driver probe failed";
            "mhi_dev" => dev.name(), "error" => %e);
        ctrl.unprepare_from_transfer(dev);
    }
    ctrl.device_put(&ctrl_dev);
    res
}

fn probe_channels(
    ctrl: &Controller,
    dev: &MhiDevice,
    drv: &MhiDriver,
) -> Result<()> {
    let dirs = [
        (DmaDir::ToDevice, dev.ul_chan()),
        (DmaDir::FromDevice, dev.dl_chan()),
    ];
    for (dir, chan) in dirs {
        let Some(chan) = chan else { continue };
        let ch = ctrl.channel(chan)?;

        if ch.lpm_notify && drv.status_cb.is_none() {
            return Err(Error::invalid(format!(
                "channel {} requires a status callback for LPM",
                ch.name
            )));
        }
        let cb = drv.xfer_cb(dir);
        if !ch.offload && cb.is_none() {
            return Err(Error::invalid(format!(
                "driver {} missing {} transfer callback for {}",
                drv.name,
                if dir == DmaDir::ToDevice { "ul" } else { "dl" },
                ch.name
            )));
        }
        if dir == DmaDir::FromDevice {
            let client_managed = ctrl
                .events
                .get(ch.er_index as usize)
                .is_some_and(|ev| ev.client_managed);
            if client_managed && drv.status_cb.is_none() {
                return Err(Error::invalid(format!(
                    "channel {} uses a client-managed event ring but \
                    driver {} has no status callback",
                    ch.name, drv.name
                )));
            }
        }
        ch.set_xfer_cb(cb);
    }
    Ok(())
}

/// Remove contract: cancel waiters, quiesce and reset the channels, call the
/// driver's remove, then tear down channel contexts and wake references.
fn driver_remove(dev: &Arc<MhiDevice>, drv: &MhiDriver) {
    if dev.is_controller() {
        return;
    }
    let Some(ctrl) = dev.controller() else {
        drv.client.remove(dev);
        return;
    };

    let chans: Vec<u32> =
        [dev.ul_chan(), dev.dl_chan()].into_iter().flatten().collect();
    let mut prior = Vec::with_capacity(chans.len());

    for &chan in chans.iter() {
        let Ok(ch) = ctrl.channel(chan) else { continue };

        // Release everyone waiting on a command completion
        {
            let mut state = ch.state.write().unwrap();
            state.ccs = CompletionCode::Invalid;
            ch.completion.complete_all();
        }

        let mut rings = ch.rings.lock().unwrap();
        let old = {
            let mut state = ch.state.write().unwrap();
            std::mem::replace(&mut state.ch_state, ChState::Suspended)
        };
        prior.push((chan, old));
        if !ch.offload {
            ctrl.reset_chan(ch, &mut rings);
        }
    }

    drv.client.remove(dev);

    for (chan, old) in prior {
        let Ok(ch) = ctrl.channel(chan) else { continue };
        let mut rings = ch.rings.lock().unwrap();
        if matches!(old, ChState::Enabled | ChState::Stop) && !ch.offload {
            ctrl.deinit_chan_ctxt(ch, &mut rings);
        }
        ch.state.write().unwrap().ch_state = ChState::Disabled;
        ch.set_xfer_cb(None);
    }

    while dev.wake_refs() > 0 {
        ctrl.device_put(dev);
    }
    info!(ctrl.log, "driver removed";
        "mhi_dev" => dev.name(), "driver" => &drv.name);
}

#[cfg(test)]
mod test {
    use super::*;

    use std::thread;
    use std::time::Duration;

    use crate::bits::ChanCtxt;
    use crate::pm::PmState;
    use crate::test_util::{Scaffold, TestClient};

    #[test]
    fn match_by_channel_name() {
        let client = TestClient::new();
        let drv = MhiDriver::new("loop", &["LOOPBACK", "DIAG"], client);
        let dev = MhiDevice::new(
            "mhi0_DIAG".into(),
            "DIAG".into(),
            DeviceKind::Xfer { ul_chan: Some(0), dl_chan: Some(1) },
            Weak::new(),
        );
        assert_eq!(drv.matches(&dev), Some("DIAG"));
        assert_eq!(dev.modalias(), "mhi:DIAG");

        // Case-sensitive
        let dev = MhiDevice::new(
            "mhi0_diag".into(),
            "diag".into(),
            DeviceKind::Xfer { ul_chan: Some(0), dl_chan: None },
            Weak::new(),
        );
        assert_eq!(drv.matches(&dev), None);
    }

    #[test]
    fn controller_never_matches() {
        let drv = MhiDriver::new("any", &["mhi0"], TestClient::new());
        let dev = MhiDevice::new(
            "mhi0".into(),
            "mhi0".into(),
            DeviceKind::Controller,
            Weak::new(),
        );
        assert_eq!(drv.matches(&dev), None);
    }

    #[test]
    fn probe_and_remove_loopback() {
        let scaffold = Scaffold::loopback();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);
        ctrl.create_devices();

        let dev = scaffold.bus.find_device("mhi0_LOOPBACK").unwrap();
        assert_eq!(
            dev.kind(),
            DeviceKind::Xfer { ul_chan: Some(0), dl_chan: Some(1) }
        );

        let client = TestClient::new();
        let drv = Arc::new(
            MhiDriver::new("loop", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {})
                .with_dl_xfer_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv.clone()).unwrap();
        assert_eq!(client.probed(), vec!["mhi0_LOOPBACK".to_string()]);
        assert!(dev.driver().is_some());
        assert_eq!(ctrl.channel_state(0).unwrap(), ChState::Enabled);
        assert_eq!(ctrl.channel_state(1).unwrap(), ChState::Enabled);
        assert_eq!(ctrl.device().wake_refs(), 0);

        scaffold.bus.driver_unregister(&drv);
        assert_eq!(client.removed(), vec!["mhi0_LOOPBACK".to_string()]);
        assert!(dev.driver().is_none());
        for chan in [0, 1] {
            assert_eq!(ctrl.channel_state(chan).unwrap(), ChState::Disabled);
            let ctxt = ctrl.chan_ctxt(chan).unwrap();
            assert_eq!(ctxt.rbase.get(), 0);
        }
        assert_eq!(dev.wake_refs(), 0);
    }

    #[test]
    fn probe_without_dl_callback() {
        let scaffold = Scaffold::loopback();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);
        ctrl.create_devices();

        let client = TestClient::new();
        let drv = Arc::new(
            MhiDriver::new("loop", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv).unwrap();

        // Probe failed before reaching the driver
        assert!(client.probed().is_empty());
        let dev = scaffold.bus.find_device("mhi0_LOOPBACK").unwrap();
        assert!(dev.driver().is_none());

        // Wake reference released, channels untouched
        assert_eq!(ctrl.device().wake_refs(), 0);
        assert_eq!(ctrl.wake_count(), 0);
        assert_eq!(ctrl.channel_state(1).unwrap(), ChState::Disabled);
        assert_eq!(ctrl.chan_ctxt(1).unwrap().rbase.get(), 0);
    }

    #[test]
    fn probe_direct_errors() {
        let scaffold = Scaffold::loopback();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);
        ctrl.create_devices();
        let dev = scaffold.bus.find_device("mhi0_LOOPBACK").unwrap();

        let drv = MhiDriver::new("loop", &["LOOPBACK"], TestClient::new())
            .with_ul_xfer_cb(|_, _| {});
        let err = driver_probe(&dev, &drv, "LOOPBACK").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(err.errno(), -22);
    }

    #[test]
    fn probe_requires_m0() {
        let scaffold = Scaffold::loopback().with_timeout(50);
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        ctrl.set_exec_env(crate::pm::ExecEnv::Amss);
        ctrl.create_devices();

        let client = TestClient::new();
        let drv = Arc::new(
            MhiDriver::new("loop", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {})
                .with_dl_xfer_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv).unwrap();
        assert!(client.probed().is_empty());
        assert_eq!(ctrl.pm_state(), PmState::DISABLE);
        assert_eq!(ctrl.wake_count(), 0);
    }

    #[test]
    fn lpm_channel_requires_status_cb() {
        let mut scaffold = Scaffold::loopback();
        scaffold.config.channels[0].lpm_notify = true;
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);
        ctrl.create_devices();

        let client = TestClient::new();
        let drv = Arc::new(
            MhiDriver::new("loop", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {})
                .with_dl_xfer_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv.clone()).unwrap();
        assert!(client.probed().is_empty());
        scaffold.bus.driver_unregister(&drv);

        let drv = Arc::new(
            MhiDriver::new("loop-lpm", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {})
                .with_dl_xfer_cb(|_, _| {})
                .with_status_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv).unwrap();
        assert_eq!(client.probed().len(), 1);
    }

    #[test]
    fn remove_quiesces_waiters() {
        let scaffold = Scaffold::loopback();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);
        ctrl.create_devices();

        let client = TestClient::new();
        let drv = Arc::new(
            MhiDriver::new("loop", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {})
                .with_dl_xfer_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv.clone()).unwrap();
        assert_eq!(ctrl.channel_state(1).unwrap(), ChState::Enabled);

        // The device stops answering, leaving a STOP command outstanding
        scaffold.responder.set_silent(true);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let waiter = {
            let ctrl = ctrl.clone();
            thread::spawn(move || {
                let res = ctrl.update_channel_state(
                    1,
                    crate::channel::ChanTransition::Stop,
                );
                let ccs = ctrl.channel_ccs(1).unwrap();
                tx.send(()).unwrap();
                (res, ccs)
            })
        };
        scaffold.responder.wait_for_commands(3, Duration::from_secs(5));
        assert!(rx.try_recv().is_err());

        scaffold.bus.driver_unregister(&drv);

        let (res, ccs) = waiter.join().unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(ccs, CompletionCode::Invalid);

        assert_eq!(ctrl.channel_state(1).unwrap(), ChState::Disabled);
        let ctxt: ChanCtxt = ctrl.chan_ctxt(1).unwrap();
        assert_eq!(ctxt.rbase.get(), 0);
        assert_eq!(ctxt.chstate(), Some(ChState::Disabled));
    }

    #[test]
    fn failed_probe_still_adds_device() {
        let scaffold = Scaffold::loopback();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);

        // No downlink callback for a device with a downlink channel
        let client = TestClient::new();
        let drv = Arc::new(
            MhiDriver::new("loop", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv).unwrap();

        ctrl.create_devices();
        let dev = scaffold.bus.find_device("mhi0_LOOPBACK").unwrap();
        assert!(dev.driver().is_none());
        assert!(client.probed().is_empty());
        assert_eq!(ctrl.device().wake_refs(), 0);
    }

    #[test]
    fn late_driver_binds_existing_device() {
        let scaffold = Scaffold::loopback();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);

        let client = TestClient::new();
        let drv = Arc::new(
            MhiDriver::new("loop", &["LOOPBACK"], client.clone())
                .with_ul_xfer_cb(|_, _| {})
                .with_dl_xfer_cb(|_, _| {}),
        );
        scaffold.bus.driver_register(drv.clone()).unwrap();
        assert!(scaffold.bus.driver_register(drv).is_err());

        // Device creation probes the already-registered driver
        ctrl.create_devices();
        assert_eq!(client.probed(), vec!["mhi0_LOOPBACK".to_string()]);
    }
}
