// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt wiring: the threaded control ("bhi") interrupt and one "mhi"
//! interrupt per host-serviced event ring.

use std::sync::{Arc, Weak};

use slog::{debug, error};

use crate::bits::{bhi, regs, MhiState, MhiStatus};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::pm::{Callback, ExecEnv, PmState, StateTransition};

bitflags! {
    /// Flags passed when requesting an interrupt line.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        const SHARED = 1 << 0;
        const NO_SUSPEND = 1 << 1;
        const ONESHOT = 1 << 2;
        const NO_AUTOEN = 1 << 3;
    }
}

impl IrqFlags {
    pub const MHI_DEFAULT: IrqFlags =
        IrqFlags::SHARED.union(IrqFlags::NO_SUSPEND);
}

/// Result of an interrupt handler invocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqReturn {
    None,
    Handled,
    /// Run the threaded half
    WakeThread,
}

/// An installed interrupt handler.
pub trait IrqHandler: Send + Sync + 'static {
    /// Hard interrupt context.
    fn handle(&self) -> IrqReturn;

    /// Threaded half, run when [`IrqHandler::handle`] returns
    /// [`IrqReturn::WakeThread`].
    fn thread(&self) -> IrqReturn {
        IrqReturn::None
    }
}

/// Identifies one handler on a (possibly shared) interrupt line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct IrqCookie(pub u64);

/// Interrupt controller services provided by the bus transport.
pub trait IrqChip: Send + Sync + 'static {
    fn request_irq(
        &self,
        irq: u32,
        handler: Arc<dyn IrqHandler>,
        threaded: bool,
        flags: IrqFlags,
        name: &str,
    ) -> Result<IrqCookie>;
    fn free_irq(&self, irq: u32, cookie: IrqCookie);
    fn enable_irq(&self, irq: u32);
    fn disable_irq(&self, irq: u32);
}

/// An interrupt this controller holds: line number and handler cookie.
#[derive(Copy, Clone, Debug)]
pub(crate) struct InstalledIrq {
    pub irq: u32,
    pub cookie: IrqCookie,
}

/// Handlers for the control interrupt.
struct IntvecHandler {
    ctrl: Weak<Controller>,
}

impl IrqHandler for IntvecHandler {
    fn handle(&self) -> IrqReturn {
        if let Some(ctrl) = self.ctrl.upgrade() {
            ctrl.state_event.wake_all();
        }
        IrqReturn::WakeThread
    }

    fn thread(&self) -> IrqReturn {
        if let Some(ctrl) = self.ctrl.upgrade() {
            intvec_threaded(&ctrl);
        }
        IrqReturn::Handled
    }
}

fn intvec_threaded(ctrl: &Arc<Controller>) {
    let (ee, detected) = {
        let mut pm = ctrl.pm.write().unwrap();
        if !pm.state.reg_access_valid() {
            drop(pm);
            ctrl.state_event.wake_all();
            return;
        }
        let state = ctrl.get_mhi_state();
        let ee = ctrl.get_exec_env();
        debug!(ctrl.log, "control interrupt";
            "dev_state" => state.map_or("INVALID", MhiState::as_str),
            "ee" => ee.map_or("INVALID", ExecEnv::as_str));

        if let Some(state) = state {
            pm.dev_state = state;
        }
        let mut detected = false;
        if state == Some(MhiState::SysErr) {
            detected = pm.state.try_transition(PmState::SYS_ERR_DETECT)
                == PmState::SYS_ERR_DETECT;
        }
        (ee, detected)
    };

    if detected {
        match ee {
            Some(ExecEnv::Rddm) => {
                let active = ctrl.pm.read().unwrap().is_active();
                if ctrl.has_rddm_image() && active {
                    ctrl.ops.status_cb(Callback::EeRddm);
                    ctrl.pm.write().unwrap().ee = ExecEnv::Rddm;
                }
            }
            Some(ee @ (ExecEnv::Pbl | ExecEnv::Edl | ExecEnv::Pthru)) => {
                ctrl.ops.status_cb(Callback::FatalError);
                ctrl.pm.write().unwrap().ee = ee;
                ctrl.queue_transition(StateTransition::SysErr);
            }
            _ => ctrl.queue_transition(StateTransition::SysErr),
        }
    }
    ctrl.state_event.wake_all();
}

/// Handler for a host-serviced event ring.
struct EventHandler {
    ctrl: Weak<Controller>,
    er: u32,
}

impl IrqHandler for EventHandler {
    fn handle(&self) -> IrqReturn {
        if let Some(ctrl) = self.ctrl.upgrade() {
            ctrl.event_irq(self.er);
        }
        IrqReturn::Handled
    }
}

impl Controller {
    /// Read the device's MHI state, `None` if the read fails or the value is
    /// not a known state.
    pub(crate) fn get_mhi_state(&self) -> Option<MhiState> {
        let status = self.read_reg(regs::MHISTATUS).ok()?;
        MhiState::from_repr(MhiStatus(status).mhistate())
    }

    /// Read the device's execution environment from the BHI block.
    pub(crate) fn get_exec_env(&self) -> Option<ExecEnv> {
        let bhi_off = self.boot.lock().unwrap().bhi?;
        let ee = self.read_reg(bhi_off + bhi::BHI_EXECENV).ok()?;
        ExecEnv::from_repr(ee)
    }

    /// Request the control interrupt and one interrupt per host-serviced
    /// event ring, leaving each disabled once installed.
    pub(crate) fn init_irq_setup(self: &Arc<Self>) -> Result<()> {
        let flags = self.res.irq_flags.unwrap_or(IrqFlags::MHI_DEFAULT);
        let nr_irqs = self.res.irqs.len() as u32;
        let chip = &self.irq_chip;

        let ctrl_irq = self.res.irqs[0];
        let handler = Arc::new(IntvecHandler { ctrl: Arc::downgrade(self) });
        let cookie = chip.request_irq(ctrl_irq, handler, true, flags, "bhi")?;
        chip.disable_irq(ctrl_irq);

        let mut installed: Vec<InstalledIrq> = Vec::new();
        let mut result = Ok(());
        for ev in self.events.iter().filter(|ev| !ev.offload) {
            if ev.irq >= nr_irqs {
                error!(self.log, "irq not available for event ring";
                    "er" => ev.index, "irq" => ev.irq, "nr_irqs" => nr_irqs);
                result = Err(Error::invalid(format!(
                    "event ring {} irq {} exceeds {nr_irqs} irqs",
                    ev.index, ev.irq
                )));
                break;
            }
            let irq = self.res.irqs[ev.irq as usize];
            let handler = Arc::new(EventHandler {
                ctrl: Arc::downgrade(self),
                er: ev.index,
            });
            match chip.request_irq(irq, handler, false, flags, "mhi") {
                Ok(cookie) => {
                    chip.disable_irq(irq);
                    installed.push(InstalledIrq { irq, cookie });
                }
                Err(e) => {
                    error!(self.log, "error requesting irq";
                        "irq" => irq, "er" => ev.index, "error" => %e);
                    result = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = result {
            for inst in installed.iter().rev() {
                chip.free_irq(inst.irq, inst.cookie);
            }
            chip.free_irq(ctrl_irq, cookie);
            return Err(e);
        }

        let mut irqs = self.irqs.lock().unwrap();
        irqs.control = Some(InstalledIrq { irq: ctrl_irq, cookie });
        irqs.events = installed;
        Ok(())
    }

    /// Free every interrupt installed by [`Controller::init_irq_setup`].
    pub(crate) fn deinit_free_irq(&self) {
        let mut irqs = self.irqs.lock().unwrap();
        for inst in irqs.events.drain(..) {
            self.irq_chip.free_irq(inst.irq, inst.cookie);
        }
        if let Some(inst) = irqs.control.take() {
            self.irq_chip.free_irq(inst.irq, inst.cookie);
        }
    }

    /// Enable every installed interrupt.  Part of the power-up sequence.
    pub fn enable_irqs(&self) {
        let irqs = self.irqs.lock().unwrap();
        for inst in irqs.control.iter().chain(irqs.events.iter()) {
            self.irq_chip.enable_irq(inst.irq);
        }
    }

    /// Disable every installed interrupt.
    pub fn disable_irqs(&self) {
        let irqs = self.irqs.lock().unwrap();
        for inst in irqs.control.iter().chain(irqs.events.iter()) {
            self.irq_chip.disable_irq(inst.irq);
        }
    }
}

/// Interrupts held by a controller.
#[derive(Default)]
pub(crate) struct IrqState {
    pub control: Option<InstalledIrq>,
    pub events: Vec<InstalledIrq>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::Scaffold;

    #[test]
    fn installed_and_disabled() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        let chip = &scaffold.sim.irq_chip;

        assert_eq!(chip.handlers(0), vec!["bhi".to_string()]);
        assert_eq!(chip.handlers(1), vec!["mhi".to_string()]);
        assert!(!chip.is_enabled(0));
        assert!(!chip.is_enabled(1));
        let flags = chip.flags(1);
        assert!(flags.contains(IrqFlags::SHARED | IrqFlags::NO_SUSPEND));
        assert_eq!(chip.fired(), 0);

        ctrl.enable_irqs();
        assert!(chip.is_enabled(0) && chip.is_enabled(1));
        ctrl.unregister();
        assert!(chip.handlers(0).is_empty());
        assert!(chip.handlers(1).is_empty());
    }

    #[test]
    fn irq_out_of_range() {
        let mut scaffold = Scaffold::minimal();
        scaffold.config.events[0].irq = 2;
        assert!(matches!(
            scaffold.register(),
            Err(Error::InvalidArgument(_))
        ));
        // The control interrupt was rolled back as well
        assert!(scaffold.sim.irq_chip.handlers(0).is_empty());
    }

    #[test]
    fn request_failure_rolls_back() {
        let mut scaffold = Scaffold::minimal();
        scaffold.res.irqs = vec![10, 11, 12];
        scaffold.config.events.push(scaffold.config.events[0].clone());
        scaffold.config.events[1].irq = 2;
        scaffold.sim.irq_chip.fail_line(12);

        assert!(scaffold.register().is_err());
        let chip = &scaffold.sim.irq_chip;
        assert!(chip.handlers(10).is_empty());
        assert!(chip.handlers(11).is_empty());
        assert!(chip.handlers(12).is_empty());
    }

    #[test]
    fn flag_override() {
        let mut scaffold = Scaffold::minimal();
        scaffold.res.irq_flags = Some(IrqFlags::ONESHOT);
        let _ctrl = scaffold.register().unwrap();
        assert_eq!(scaffold.sim.irq_chip.flags(0), IrqFlags::ONESHOT);
    }

    #[test]
    fn control_irq_detects_syserr() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);

        scaffold.sim.set_mhi_state(MhiState::SysErr);
        scaffold.sim.set_exec_env(ExecEnv::Amss);
        scaffold.sim.irq_chip.fire(0);

        assert_eq!(ctrl.dev_state(), MhiState::SysErr);
        scaffold.flush(&ctrl);
        assert_eq!(ctrl.pm_state(), PmState::SYS_ERR_PROCESS);
        assert!(scaffold.ops.callbacks().contains(&Callback::SysError));
    }
}
