// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host power-management state, wake references, and state names.

use std::time::Duration;

use slog::{debug, error};

use crate::bits::MhiState;
use crate::bus::MhiDevice;
use crate::controller::Controller;
use crate::error::{Error, Result};

bitflags! {
    /// Host-side power-management state.  Exactly one bit is set at a time;
    /// the bit set form lets state predicates be expressed as masks.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PmState: u32 {
        const DISABLE = 1 << 0;
        const POR = 1 << 1;
        const M0 = 1 << 2;
        const M2 = 1 << 3;
        const M3_ENTER = 1 << 4;
        const M3 = 1 << 5;
        const M3_EXIT = 1 << 6;
        const FW_DL_ERR = 1 << 7;
        const SYS_ERR_DETECT = 1 << 8;
        const SYS_ERR_PROCESS = 1 << 9;
        const SYS_ERR_FAIL = 1 << 10;
        const SHUTDOWN_PROCESS = 1 << 11;
        const LD_ERR_FATAL_DETECT = 1 << 12;
    }
}

const PM_STATE_NAMES: [&str; 13] = [
    "DISABLE",
    "POR",
    "M0",
    "M2",
    "M?->M3",
    "M3",
    "M3->M0",
    "FW DL Error",
    "SYS ERROR Detect",
    "SYS ERROR Process",
    "SYS ERROR Failure",
    "SHUTDOWN Process",
    "LD or Error Fatal Detect",
];

/// Printable name of a PM state.
///
/// Zero, or a state whose highest set bit lies beyond the known states, is
/// reported as "Invalid State".
pub fn pm_state_str(state: PmState) -> &'static str {
    let bits = state.bits();
    if bits == 0 {
        return "Invalid State";
    }
    let index = (u32::BITS - 1 - bits.leading_zeros()) as usize;
    PM_STATE_NAMES.get(index).copied().unwrap_or("Invalid State")
}

/// Allowed PM transitions, indexed by the bit position of the source state.
const PM_TRANSITIONS: [(PmState, PmState); 13] = [
    (PmState::DISABLE, PmState::POR),
    (
        PmState::POR,
        PmState::POR
            .union(PmState::DISABLE)
            .union(PmState::M0)
            .union(PmState::SYS_ERR_DETECT)
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT)
            .union(PmState::FW_DL_ERR),
    ),
    (
        PmState::M0,
        PmState::M0
            .union(PmState::M2)
            .union(PmState::M3_ENTER)
            .union(PmState::SYS_ERR_DETECT)
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT)
            .union(PmState::FW_DL_ERR),
    ),
    (
        PmState::M2,
        PmState::M0
            .union(PmState::SYS_ERR_DETECT)
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::M3_ENTER,
        PmState::M3
            .union(PmState::SYS_ERR_DETECT)
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::M3,
        PmState::M3_EXIT
            .union(PmState::SYS_ERR_DETECT)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::M3_EXIT,
        PmState::M0
            .union(PmState::SYS_ERR_DETECT)
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::FW_DL_ERR,
        PmState::FW_DL_ERR
            .union(PmState::SYS_ERR_DETECT)
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::SYS_ERR_DETECT,
        PmState::SYS_ERR_PROCESS
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::SYS_ERR_PROCESS,
        PmState::POR
            .union(PmState::SYS_ERR_FAIL)
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::SYS_ERR_FAIL,
        PmState::POR
            .union(PmState::SHUTDOWN_PROCESS)
            .union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::SHUTDOWN_PROCESS,
        PmState::DISABLE.union(PmState::LD_ERR_FATAL_DETECT),
    ),
    (
        PmState::LD_ERR_FATAL_DETECT,
        PmState::LD_ERR_FATAL_DETECT.union(PmState::DISABLE),
    ),
];

impl PmState {
    /// Apply the transition table, returning the resulting state.  An
    /// illegal transition leaves `self` unchanged.
    pub fn try_transition(&mut self, to: PmState) -> PmState {
        let bits = self.bits();
        if bits != 0 {
            let index = (u32::BITS - 1 - bits.leading_zeros()) as usize;
            if let Some((from, allowed)) = PM_TRANSITIONS.get(index) {
                if *from == *self && allowed.contains(to) && to.bits() != 0 {
                    *self = to;
                }
            }
        }
        *self
    }

    pub fn reg_access_valid(self) -> bool {
        self.intersects(
            PmState::DISABLE
                | PmState::POR
                | PmState::M0
                | PmState::M2
                | PmState::M3_ENTER
                | PmState::M3_EXIT
                | PmState::SYS_ERR_DETECT
                | PmState::SYS_ERR_PROCESS
                | PmState::SYS_ERR_FAIL
                | PmState::SHUTDOWN_PROCESS
                | PmState::FW_DL_ERR,
        )
    }

    pub fn in_error_state(self) -> bool {
        self.bits() >= PmState::FW_DL_ERR.bits()
    }

    pub fn in_suspend_state(self) -> bool {
        self.intersects(PmState::M3_ENTER | PmState::M3)
    }

    pub fn in_fatal_state(self) -> bool {
        self == PmState::LD_ERR_FATAL_DETECT
    }

    pub fn wake_db_set_valid(self) -> bool {
        self.intersects(PmState::M2)
    }

    pub fn wake_db_clear_valid(self) -> bool {
        self.intersects(PmState::M0 | PmState::M2 | PmState::M3_EXIT)
    }

    pub fn wake_db_force_set_valid(self) -> bool {
        self.wake_db_clear_valid()
    }
}

/// Execution environment reported by the device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::FromRepr)]
#[repr(u32)]
pub enum ExecEnv {
    Pbl = 0x0,
    Sbl = 0x1,
    Amss = 0x2,
    Rddm = 0x3,
    Wfw = 0x4,
    Pthru = 0x5,
    Edl = 0x6,
    Fp = 0x7,
    #[default]
    DisableTransition = 0x8,
    NotAvail = 0x9,
}

impl ExecEnv {
    /// Bit representing this EE in a channel's EE mask.
    pub fn mask(self) -> u32 {
        1 << (self as u32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecEnv::Pbl => "PRIMARY BOOTLOADER",
            ExecEnv::Sbl => "SECONDARY BOOTLOADER",
            ExecEnv::Amss => "MISSION MODE",
            ExecEnv::Rddm => "RAMDUMP DOWNLOAD MODE",
            ExecEnv::Wfw => "WLAN FIRMWARE",
            ExecEnv::Pthru => "PASS THROUGH",
            ExecEnv::Edl => "EMERGENCY DOWNLOAD",
            ExecEnv::Fp => "FLASH PROGRAMMER",
            ExecEnv::DisableTransition => "DISABLE",
            ExecEnv::NotAvail => "NOT AVAILABLE",
        }
    }
}

/// Pending host state transitions, consumed by the state worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateTransition {
    Pbl,
    Ready,
    Sbl,
    MissionMode,
    SysErr,
    Disable,
}

impl StateTransition {
    pub fn as_str(self) -> &'static str {
        match self {
            StateTransition::Pbl => "PBL",
            StateTransition::Ready => "READY",
            StateTransition::Sbl => "SBL",
            StateTransition::MissionMode => "MISSION MODE",
            StateTransition::SysErr => "SYS ERROR",
            StateTransition::Disable => "DISABLE",
        }
    }
}

/// Reasons the core notifies the integrator or a client driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Callback {
    Idle,
    PendingData,
    LpmEnter,
    LpmExit,
    EeRddm,
    SysError,
    FatalError,
    BwReq,
    EeMissionMode,
}

/// PM-related state guarded by the controller's PM reader/writer lock.
#[derive(Debug)]
pub struct PmStatus {
    pub state: PmState,
    pub dev_state: MhiState,
    pub ee: ExecEnv,
}

impl Default for PmStatus {
    fn default() -> Self {
        Self {
            state: PmState::DISABLE,
            dev_state: MhiState::Reset,
            ee: ExecEnv::DisableTransition,
        }
    }
}

impl PmStatus {
    /// Device is in one of the M0..M3 states.
    pub fn is_active(&self) -> bool {
        matches!(
            self.dev_state,
            MhiState::M0
                | MhiState::M1
                | MhiState::M2
                | MhiState::M3
                | MhiState::M3Fast
        )
    }
}

/// Wake doorbell bookkeeping, guarded by the controller's wake lock.
#[derive(Debug, Default)]
pub struct WakeState {
    /// Outstanding wake references
    pub count: u32,
    /// Whether the wake doorbell is currently asserted
    pub set: bool,
    /// Register offset of the wake doorbell, once MMIO is initialised
    pub db: Option<usize>,
}

impl Controller {
    /// Take a wake reference, asserting the device wake doorbell if needed.
    ///
    /// Called with the PM lock held for read; `pm` is the state under it.
    pub(crate) fn wake_get(&self, pm: PmState, force: bool) {
        let mut wake = self.wake.lock().unwrap();
        wake.count += 1;
        let may_set = if force {
            pm.wake_db_force_set_valid()
        } else {
            wake.count == 1 && pm.wake_db_set_valid()
        };
        if may_set && !wake.set {
            if let Some(db) = wake.db {
                self.write_db(db, 1);
            }
            wake.set = true;
        }
    }

    /// Drop a wake reference, de-asserting the doorbell on the last one
    /// unless `override_db` is set.
    pub(crate) fn wake_put(&self, pm: PmState, override_db: bool) {
        let mut wake = self.wake.lock().unwrap();
        if wake.count == 0 {
            error!(self.log, "wake reference underflow");
            return;
        }
        wake.count -= 1;
        if wake.count == 0
            && pm.wake_db_clear_valid()
            && !override_db
            && wake.set
        {
            if let Some(db) = wake.db {
                self.write_db(db, 0);
            }
            wake.set = false;
        }
    }

    /// Outstanding wake references on the controller.
    pub fn wake_count(&self) -> u32 {
        self.wake.lock().unwrap().count
    }

    fn trigger_resume(&self) {
        if self.ops.runtime_get().is_ok() {
            self.ops.runtime_put();
        }
    }

    fn device_get_sync_inner(&self) -> Result<()> {
        {
            let pm = self.pm.read().unwrap();
            if !pm.state.reg_access_valid() {
                return Err(Error::NotReady("register access not valid"));
            }
            self.wake_get(pm.state, true);
            if pm.state.in_suspend_state() {
                self.trigger_resume();
            }
        }

        let timeout = Duration::from_millis(self.timeout_ms.into());
        let reached = self.state_event.wait_until(timeout, || {
            let state = self.pm.read().unwrap().state;
            state == PmState::M0 || state.in_error_state()
        });

        let pm = self.pm.read().unwrap();
        if !reached || pm.state.in_error_state() {
            debug!(self.log, "device did not reach M0";
                "pm_state" => pm_state_str(pm.state));
            self.wake_put(pm.state, false);
            return Err(Error::NotReady("device did not reach M0"));
        }
        Ok(())
    }

    /// Bring the device out of low power on behalf of `dev`, waiting for M0.
    pub fn device_get_sync(&self, dev: &MhiDevice) -> Result<()> {
        self.device_get_sync_inner()?;
        dev.wake_ref_inc();
        Ok(())
    }

    /// Take a wake reference on behalf of `dev` without waiting.
    pub fn device_get(&self, dev: &MhiDevice) {
        dev.wake_ref_inc();
        let pm = self.pm.read().unwrap();
        if pm.state.in_suspend_state() {
            self.trigger_resume();
        }
        self.wake_get(pm.state, true);
    }

    /// Release a wake reference held by `dev`.
    pub fn device_put(&self, dev: &MhiDevice) {
        if !dev.wake_ref_dec() {
            error!(self.log, "device wake reference underflow";
                "mhi_dev" => dev.name());
            return;
        }
        let pm = self.pm.read().unwrap();
        if pm.state.in_suspend_state() {
            self.trigger_resume();
        }
        self.wake_put(pm.state, false);
    }

    /// Current host PM state.
    pub fn pm_state(&self) -> PmState {
        self.pm.read().unwrap().state
    }

    /// Attempt a PM state transition, returning the resulting state.
    ///
    /// Waiters on the state-change queue are woken in every case.
    pub fn try_set_pm_state(&self, to: PmState) -> PmState {
        let cur = self.pm.write().unwrap().state.try_transition(to);
        if cur != to {
            debug!(self.log, "PM state transition refused";
                "cur" => pm_state_str(cur), "to" => pm_state_str(to));
        }
        self.state_event.wake_all();
        cur
    }

    /// Current execution environment.
    pub fn exec_env(&self) -> ExecEnv {
        self.pm.read().unwrap().ee
    }

    pub fn set_exec_env(&self, ee: ExecEnv) {
        self.pm.write().unwrap().ee = ee;
        self.state_event.wake_all();
    }

    /// Last device state observed by the control interrupt.
    pub fn dev_state(&self) -> MhiState {
        self.pm.read().unwrap().dev_state
    }

    pub fn set_dev_state(&self, state: MhiState) {
        self.pm.write().unwrap().dev_state = state;
        self.state_event.wake_all();
    }

    /// Whether doorbell writes are currently permitted.
    pub(crate) fn db_access_valid(&self, pm: PmState) -> bool {
        pm.intersects(self.db_access)
    }
}
