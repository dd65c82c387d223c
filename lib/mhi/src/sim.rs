// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated MHI device.
//!
//! [`SimDevice`] models just enough of a device for the core to be driven
//! without hardware: a register file, an interrupt controller, heap-backed
//! DMA, and a command processor which completes channel commands as they
//! are rung.  Transfer rings are left untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use slog::{debug, info, Logger};
use zerocopy::byteorder::little_endian::U64;

use crate::bits::{
    bhi, regs, CmdCtxt, CompletionCode, EventCtxt, MhiState, MhiStatus,
    RingElement,
};
use crate::common::{DEV_WAKE_DB, RING_ELEMENT_SIZE};
use crate::controller::{Controller, ControllerOps, OpsCaps};
use crate::dma::HeapDma;
use crate::error::{Error, Result};
use crate::irq::{IrqChip, IrqCookie, IrqFlags, IrqHandler, IrqReturn};
use crate::pm::{Callback, ExecEnv};

pub const SIM_CHDBOFF: u32 = 0x400;
pub const SIM_ERDBOFF: u32 = 0x800;
pub const SIM_BHIOFF: u32 = 0x900;
pub const SIM_BHIEOFF: u32 = 0xA00;
pub const SIM_SERIAL_NUMBER: u32 = 0x5eed_0001;

/// Event ring doorbells counted by [`SimDevice::doorbell_writes`].
const SIM_MAX_EV_DB: usize = 32;

#[derive(Default)]
struct SimRegs {
    vals: BTreeMap<usize, u32>,
    writes: Vec<(usize, u32)>,
    fail_reads: BTreeSet<usize>,
    doorbells: usize,
}

impl SimRegs {
    fn get(&self, off: usize) -> u32 {
        self.vals.get(&off).copied().unwrap_or(0)
    }

    fn is_doorbell(&self, off: usize) -> bool {
        let in_window = |base: usize, count: usize| {
            off >= base && off < base + 8 * count && (off - base) % 8 == 0
        };
        off == regs::CRDB_LOWER
            || in_window(self.get(regs::CHDBOFF) as usize, DEV_WAKE_DB + 1)
            || in_window(self.get(regs::ERDBOFF) as usize, SIM_MAX_EV_DB)
    }
}

/// A simulated device behind one controller.
pub struct SimDevice {
    regs: Mutex<SimRegs>,
    pub irq_chip: Arc<SimIrqChip>,
    pub dma: Arc<HeapDma>,
    responder: Arc<CmdResponder>,
    cmd_db: Sender<()>,
    log: Logger,
}

impl SimDevice {
    /// Create a device addressing `[iova_start, iova_stop)`, with its
    /// command processor running on a thread of its own.
    pub fn new(
        iova_start: u64,
        iova_stop: u64,
        log: &Logger,
    ) -> io::Result<Arc<Self>> {
        let (cmd_db, rx) = unbounded();
        let mut regs = SimRegs::default();
        regs.vals.insert(regs::CHDBOFF, SIM_CHDBOFF);
        regs.vals.insert(regs::ERDBOFF, SIM_ERDBOFF);
        regs.vals.insert(regs::BHIOFF, SIM_BHIOFF);
        regs.vals.insert(regs::BHIEOFF, SIM_BHIEOFF);
        let bhi_off = SIM_BHIOFF as usize;
        regs.vals.insert(bhi_off + bhi::BHI_SERIALNU, SIM_SERIAL_NUMBER);
        for i in 0..bhi::BHI_OEMPKHASH_SEG_COUNT {
            let val = 0xa5a5_0000 | i as u32;
            regs.vals.insert(bhi_off + bhi::oempkhash(i), val);
        }

        let sim = Arc::new(Self {
            regs: Mutex::new(regs),
            irq_chip: Arc::new(SimIrqChip::default()),
            dma: Arc::new(HeapDma::new(iova_start, iova_stop)),
            responder: Arc::new(CmdResponder::default()),
            cmd_db,
            log: log.new(slog::o!("component" => "mhi-sim")),
        });

        let weak = Arc::downgrade(&sim);
        thread::Builder::new()
            .name("mhi-sim-cmd".to_string())
            .spawn(move || run_cmd_processor(rx, weak))?;
        Ok(sim)
    }

    pub fn responder(&self) -> &Arc<CmdResponder> {
        &self.responder
    }

    /// Current value of the register at `off`.
    pub fn reg(&self, off: usize) -> u32 {
        self.regs.lock().unwrap().get(off)
    }

    /// Set a register without recording a host write.
    pub fn set_reg(&self, off: usize, val: u32) {
        self.regs.lock().unwrap().vals.insert(off, val);
    }

    /// Host writes since the last call, in order.
    pub fn take_writes(&self) -> Vec<(usize, u32)> {
        std::mem::take(&mut self.regs.lock().unwrap().writes)
    }

    /// Make host reads of `off` fail.
    pub fn fail_read(&self, off: usize) {
        self.regs.lock().unwrap().fail_reads.insert(off);
    }

    /// Number of doorbells rung by the host.
    pub fn doorbell_writes(&self) -> usize {
        self.regs.lock().unwrap().doorbells
    }

    pub fn set_mhi_state(&self, state: MhiState) {
        let status = MhiStatus(0).with_mhistate(state as u8);
        self.set_reg(regs::MHISTATUS, status.0);
    }

    pub fn set_exec_env(&self, ee: ExecEnv) {
        let bhi_off = self.reg(regs::BHIOFF) as usize;
        self.set_reg(bhi_off + bhi::BHI_EXECENV, ee as u32);
    }

    fn bus_pair(&self, lower: usize, higher: usize) -> u64 {
        let regs = self.regs.lock().unwrap();
        (regs.get(higher) as u64) << 32 | regs.get(lower) as u64
    }

    /// Advance the device's read pointer of event ring `er` to `addr`, as
    /// if it had posted events up to there.
    pub fn set_event_rp(&self, er: u32, addr: u64) {
        let base = self.bus_pair(regs::ECABAP_LOWER, regs::ECABAP_HIGHER);
        let off = er as usize * EventCtxt::SIZE + EventCtxt::RP;
        let slot = base + off as u64;
        if self.dma.write_bus(slot, U64::new(addr)).is_none() {
            debug!(self.log, "event context not mapped"; "er" => er);
        }
    }

    fn read(&self, off: usize) -> io::Result<u32> {
        let regs = self.regs.lock().unwrap();
        if regs.fail_reads.contains(&off) {
            return Err(io::Error::other(format!("read of {off:#x} failed")));
        }
        Ok(regs.get(off))
    }

    fn write(&self, off: usize, val: u32) {
        let mut regs = self.regs.lock().unwrap();
        regs.vals.insert(off, val);
        regs.writes.push((off, val));
        if regs.is_doorbell(off) {
            regs.doorbells += 1;
        }
        drop(regs);

        if off == regs::CRDB_LOWER {
            let _ = self.cmd_db.send(());
        }
    }

    /// Consume every command element between the device's read pointer and
    /// the host's published write pointer.
    fn process_commands(&self, rp: &mut Option<u64>) {
        let ctxt_addr = self.bus_pair(regs::CRCBAP_LOWER, regs::CRCBAP_HIGHER);
        let Some(ctxt) = self.dma.read_bus::<CmdCtxt>(ctxt_addr) else {
            debug!(self.log, "command context not mapped");
            return;
        };
        let (base, len) = (ctxt.rbase.get(), ctxt.rlen.get());
        let end = base + len;
        let wp = ctxt.wp.get();
        if !(base..end).contains(&wp) {
            return;
        }

        let mut cur = match *rp {
            Some(p) if (base..end).contains(&p) => p,
            _ => base,
        };
        while cur != wp {
            let Some(el) = self.dma.read_bus::<RingElement>(cur) else {
                break;
            };
            if let Some(code) = self.responder.record(el) {
                if let Some(ctrl) = self.responder.controller() {
                    let _ = ctrl.process_cmd_completion(cur, code);
                }
            }
            cur += RING_ELEMENT_SIZE as u64;
            if cur >= end {
                cur = base;
            }
        }
        *rp = Some(cur);
    }
}

fn run_cmd_processor(rx: Receiver<()>, sim: Weak<SimDevice>) {
    let mut rp = None;
    while rx.recv().is_ok() {
        let Some(sim) = sim.upgrade() else {
            break;
        };
        sim.process_commands(&mut rp);
    }
}

#[derive(Default)]
struct ResponderState {
    commands: Vec<RingElement>,
    silent: bool,
    code: Option<CompletionCode>,
    failures: BTreeMap<usize, CompletionCode>,
}

/// Records commands the device receives and decides how each completes.
#[derive(Default)]
pub struct CmdResponder {
    ctrl: Mutex<Weak<Controller>>,
    state: Mutex<ResponderState>,
    cv: Condvar,
}

impl CmdResponder {
    /// Deliver completions to `ctrl`.
    pub fn attach(&self, ctrl: &Arc<Controller>) {
        *self.ctrl.lock().unwrap() = Arc::downgrade(ctrl);
    }

    fn controller(&self) -> Option<Arc<Controller>> {
        self.ctrl.lock().unwrap().upgrade()
    }

    /// Every command element received so far.
    pub fn commands(&self) -> Vec<RingElement> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Stop completing commands (they are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Complete subsequent commands with `code`.
    pub fn set_code(&self, code: CompletionCode) {
        self.state.lock().unwrap().code = Some(code);
    }

    /// Complete the `n`th command received (counting from zero) with
    /// `code`.
    pub fn fail_nth(&self, n: usize, code: CompletionCode) {
        self.state.lock().unwrap().failures.insert(n, code);
    }

    /// Wait until at least `n` commands arrived, returning them.
    pub fn wait_for_commands(
        &self,
        n: usize,
        timeout: Duration,
    ) -> Vec<RingElement> {
        let guard = self.state.lock().unwrap();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| s.commands.len() < n)
            .unwrap();
        guard.commands.clone()
    }

    fn record(&self, el: RingElement) -> Option<CompletionCode> {
        let mut state = self.state.lock().unwrap();
        let index = state.commands.len();
        state.commands.push(el);
        self.cv.notify_all();
        if state.silent {
            return None;
        }
        let code = state.failures.get(&index).copied();
        Some(code.or(state.code).unwrap_or(CompletionCode::Success))
    }
}

struct SimHandler {
    cookie: IrqCookie,
    handler: Arc<dyn IrqHandler>,
    threaded: bool,
    flags: IrqFlags,
    name: String,
}

#[derive(Default)]
struct SimLine {
    enabled: bool,
    handlers: Vec<SimHandler>,
}

/// Interrupt controller of the simulated device.  Handlers run on the
/// thread calling [`SimIrqChip::fire`].
#[derive(Default)]
pub struct SimIrqChip {
    lines: Mutex<BTreeMap<u32, SimLine>>,
    failing: Mutex<BTreeSet<u32>>,
    next_cookie: AtomicU64,
    fired: AtomicUsize,
}

impl SimIrqChip {
    /// Names of the handlers installed on `line`.
    pub fn handlers(&self, line: u32) -> Vec<String> {
        let lines = self.lines.lock().unwrap();
        lines.get(&line).map_or_else(Vec::new, |l| {
            l.handlers.iter().map(|h| h.name.clone()).collect()
        })
    }

    pub fn is_enabled(&self, line: u32) -> bool {
        let lines = self.lines.lock().unwrap();
        lines.get(&line).is_some_and(|l| l.enabled)
    }

    /// Flags of the first handler on `line`.
    pub fn flags(&self, line: u32) -> IrqFlags {
        let lines = self.lines.lock().unwrap();
        lines
            .get(&line)
            .and_then(|l| l.handlers.first())
            .map_or(IrqFlags::empty(), |h| h.flags)
    }

    /// Number of interrupts delivered.
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::Relaxed)
    }

    /// Refuse handler requests for `line`.
    pub fn fail_line(&self, line: u32) {
        self.failing.lock().unwrap().insert(line);
    }

    /// Raise `line`.  Nothing happens while it is disabled.
    pub fn fire(&self, line: u32) {
        let handlers: Vec<(Arc<dyn IrqHandler>, bool)> = {
            let lines = self.lines.lock().unwrap();
            match lines.get(&line) {
                Some(l) if l.enabled => l
                    .handlers
                    .iter()
                    .map(|h| (h.handler.clone(), h.threaded))
                    .collect(),
                _ => return,
            }
        };
        self.fired.fetch_add(1, Ordering::Relaxed);
        for (handler, threaded) in handlers {
            if handler.handle() == IrqReturn::WakeThread && threaded {
                handler.thread();
            }
        }
    }
}

impl IrqChip for SimIrqChip {
    fn request_irq(
        &self,
        irq: u32,
        handler: Arc<dyn IrqHandler>,
        threaded: bool,
        flags: IrqFlags,
        name: &str,
    ) -> Result<IrqCookie> {
        if self.failing.lock().unwrap().contains(&irq) {
            return Err(Error::Io(io::Error::other(format!(
                "irq {irq} unavailable"
            ))));
        }
        let cookie =
            IrqCookie(self.next_cookie.fetch_add(1, Ordering::Relaxed));
        let mut lines = self.lines.lock().unwrap();
        let line = lines.entry(irq).or_default();
        if line.handlers.is_empty() {
            line.enabled = !flags.contains(IrqFlags::NO_AUTOEN);
        }
        line.handlers.push(SimHandler {
            cookie,
            handler,
            threaded,
            flags,
            name: name.to_string(),
        });
        Ok(cookie)
    }

    fn free_irq(&self, irq: u32, cookie: IrqCookie) {
        let mut lines = self.lines.lock().unwrap();
        if let Some(line) = lines.get_mut(&irq) {
            line.handlers.retain(|h| h.cookie != cookie);
            if line.handlers.is_empty() {
                lines.remove(&irq);
            }
        }
    }

    fn enable_irq(&self, irq: u32) {
        if let Some(line) = self.lines.lock().unwrap().get_mut(&irq) {
            line.enabled = true;
        }
    }

    fn disable_irq(&self, irq: u32) {
        if let Some(line) = self.lines.lock().unwrap().get_mut(&irq) {
            line.enabled = false;
        }
    }
}

/// [`ControllerOps`] over a [`SimDevice`], recording what the core asks of
/// the integrator.
pub struct SimOps {
    sim: Arc<SimDevice>,
    caps: Mutex<OpsCaps>,
    callbacks: Mutex<Vec<Callback>>,
    debugfs: Mutex<Vec<String>>,
    resets: AtomicUsize,
    edl_triggers: AtomicUsize,
    log: Logger,
}

impl SimOps {
    pub fn new(sim: Arc<SimDevice>, log: &Logger) -> Self {
        Self {
            sim,
            caps: Mutex::new(OpsCaps::empty()),
            callbacks: Mutex::new(Vec::new()),
            debugfs: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            edl_triggers: AtomicUsize::new(0),
            log: log.new(slog::o!("component" => "mhi-sim-ops")),
        }
    }

    pub fn set_caps(&self, caps: OpsCaps) {
        *self.caps.lock().unwrap() = caps;
    }

    pub fn callbacks(&self) -> Vec<Callback> {
        self.callbacks.lock().unwrap().clone()
    }

    /// Debug directories currently present.
    pub fn debugfs(&self) -> Vec<String> {
        self.debugfs.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn edl_triggers(&self) -> usize {
        self.edl_triggers.load(Ordering::Relaxed)
    }
}

impl ControllerOps for SimOps {
    fn read_reg(&self, offset: usize) -> io::Result<u32> {
        self.sim.read(offset)
    }

    fn write_reg(&self, offset: usize, val: u32) {
        self.sim.write(offset, val);
    }

    fn runtime_get(&self) -> io::Result<()> {
        Ok(())
    }

    fn runtime_put(&self) {}

    fn status_cb(&self, cb: Callback) {
        debug!(self.log, "status callback"; "cb" => ?cb);
        self.callbacks.lock().unwrap().push(cb);
    }

    fn capabilities(&self) -> OpsCaps {
        *self.caps.lock().unwrap()
    }

    fn edl_trigger(&self) -> io::Result<()> {
        info!(self.log, "EDL triggered");
        self.edl_triggers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reset(&self) {
        info!(self.log, "SoC reset");
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    fn create_debugfs(&self, name: &str) {
        self.debugfs.lock().unwrap().push(name.to_string());
    }

    fn destroy_debugfs(&self, name: &str) {
        self.debugfs.lock().unwrap().retain(|n| n != name);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_util::test_logger;

    struct Counting(AtomicUsize);

    impl IrqHandler for Counting {
        fn handle(&self) -> IrqReturn {
            self.0.fetch_add(1, Ordering::Relaxed);
            IrqReturn::WakeThread
        }
        fn thread(&self) -> IrqReturn {
            self.0.fetch_add(10, Ordering::Relaxed);
            IrqReturn::Handled
        }
    }

    #[test]
    fn disabled_lines_do_not_fire() {
        let chip = SimIrqChip::default();
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let cookie = chip
            .request_irq(3, handler.clone(), true, IrqFlags::SHARED, "t")
            .unwrap();
        chip.disable_irq(3);
        chip.fire(3);
        assert_eq!(chip.fired(), 0);

        chip.enable_irq(3);
        chip.fire(3);
        assert_eq!(handler.0.load(Ordering::Relaxed), 11);

        chip.free_irq(3, cookie);
        assert!(chip.handlers(3).is_empty());
        chip.fire(3);
        assert_eq!(chip.fired(), 1);
    }

    #[test]
    fn doorbells_counted_in_windows() {
        let sim = SimDevice::new(0x1000, 0x10_0000, &test_logger()).unwrap();
        let ops = SimOps::new(sim.clone(), &test_logger());
        ops.write_reg(SIM_CHDBOFF as usize + 8, 1);
        ops.write_reg(SIM_CHDBOFF as usize + 12, 0);
        ops.write_reg(SIM_ERDBOFF as usize, 1);
        ops.write_reg(regs::MHICFG, 0);
        assert_eq!(sim.doorbell_writes(), 2);
        assert_eq!(sim.take_writes().len(), 4);
        assert!(sim.take_writes().is_empty());
    }

    #[test]
    fn failed_reads() {
        let sim = SimDevice::new(0x1000, 0x10_0000, &test_logger()).unwrap();
        let ops = SimOps::new(sim.clone(), &test_logger());
        assert_eq!(ops.read_reg(regs::BHIOFF).unwrap(), SIM_BHIOFF);
        sim.fail_read(regs::BHIOFF);
        assert!(ops.read_reg(regs::BHIOFF).is_err());
    }
}
