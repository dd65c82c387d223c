// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command ring, carrying channel state-change commands to the device.

use std::sync::Mutex;

use slog::{debug, error};

use crate::bits::{CmdType, CompletionCode, RingElement};
use crate::common::{CMD_EL_PER_RING, PRIMARY_CMD_RING, RING_ELEMENT_SIZE};
use crate::controller::Controller;
use crate::error::{Error, Result};

#[usdt::provider(provider = "mhi")]
mod probes {
    fn mhi_cmd_send(chan: u32, cmd: u32, wp: u64) {}
    fn mhi_cmd_complete(chan: u32, code: u32) {}
}

pub struct CmdRing {
    pub(crate) ring: Mutex<crate::ring::Ring>,
}

impl CmdRing {
    pub(crate) fn new() -> Self {
        Self {
            ring: Mutex::new(crate::ring::Ring::new(
                RING_ELEMENT_SIZE,
                CMD_EL_PER_RING,
            )),
        }
    }

    /// Enqueue `cmd` for `chan`, publish the new write pointer, and ring the
    /// command doorbell if doorbell access is currently permitted.
    pub fn send(
        &self,
        ctrl: &Controller,
        chan: u32,
        cmd: CmdType,
    ) -> Result<()> {
        let mut ring = self.ring.lock().unwrap();
        if !ring.is_allocated() {
            return Err(Error::NotReady("command ring not allocated"));
        }
        if ring.is_full() {
            return Err(Error::OutOfMemory("command ring element"));
        }
        ring.push(RingElement::chan_cmd(cmd, chan))?;
        ring.publish_wp();
        let wp = ring.dev_wp();
        probes::mhi_cmd_send!(|| (chan, cmd as u32, wp.0));

        let pm = ctrl.pm.read().unwrap();
        let db = ring.db_addr.filter(|_| ctrl.db_access_valid(pm.state));
        if let Some(db) = db {
            ctrl.write_db(db, wp.0);
        }
        Ok(())
    }
}

impl Controller {
    pub(crate) fn send_cmd(&self, chan: u32, cmd: CmdType) -> Result<()> {
        self.cmd_rings[PRIMARY_CMD_RING].send(self, chan, cmd)
    }

    /// Complete the oldest outstanding command, which was issued for `chan`,
    /// with completion code `code`.
    pub fn chan_cmd_complete(&self, chan: u32, code: CompletionCode) {
        self.cmd_rings[PRIMARY_CMD_RING].ring.lock().unwrap().advance_rp();
        self.complete_chan(chan, code);
    }

    /// Handle a command completion event reporting the command element at
    /// bus address `ptr`.
    pub fn process_cmd_completion(
        &self,
        ptr: u64,
        code: CompletionCode,
    ) -> Result<()> {
        let chan = {
            let cmd_ring = &self.cmd_rings[PRIMARY_CMD_RING];
            let mut ring = cmd_ring.ring.lock().unwrap();
            let Some(off) = ring.dev_to_off(ptr) else {
                error!(self.log, "command completion outside command ring";
                    "ptr" => format!("{ptr:#x}"));
                return Err(Error::invalid(format!(
                    "command completion pointer {ptr:#x} not in ring"
                )));
            };
            let el: RingElement = ring.read_el(off);
            ring.advance_rp();
            el.cmd_chan()
        };
        self.complete_chan(chan, code);
        Ok(())
    }

    fn complete_chan(&self, chan: u32, code: CompletionCode) {
        probes::mhi_cmd_complete!(|| (chan, code as u32));
        let Ok(ch) = self.channel(chan) else {
            error!(self.log, "command completion for unknown channel";
                "chan" => chan);
            return;
        };
        let mut state = ch.state.write().unwrap();
        state.ccs = code;
        ch.completion.complete();
        debug!(ch.log, "command completed"; "code" => ?code);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::bits::{regs, CmdCtxt};
    use crate::test_util::Scaffold;

    #[test]
    fn command_published_and_rung() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        scaffold.power_on(&ctrl);
        scaffold.responder.set_silent(true);

        ctrl.send_cmd(0, CmdType::StartChan).unwrap();

        let ctxt: CmdCtxt = ctrl.cmd_ctxt().unwrap();
        assert_eq!(ctxt.wp.get(), ctxt.rbase.get() + 16);
        assert_eq!(ctxt.rp.get(), ctxt.rbase.get());
        let wp = ctxt.wp.get();
        assert_eq!(scaffold.sim.reg(regs::CRDB_LOWER), wp as u32);
        assert_eq!(scaffold.sim.reg(regs::CRDB_HIGHER), (wp >> 32) as u32);

        let cmds = scaffold
            .responder
            .wait_for_commands(1, std::time::Duration::from_secs(5));
        assert_eq!(cmds[0].cmd_type(), Some(CmdType::StartChan));
        assert_eq!(cmds[0].cmd_chan(), 0);
    }

    #[test]
    fn no_doorbell_outside_m0() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();

        // Still in DISABLE: element is queued but the device is not told
        ctrl.send_cmd(0, CmdType::StartChan).unwrap();
        assert_eq!(scaffold.sim.doorbell_writes(), 0);
    }

    #[test]
    fn full_ring() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();

        for _ in 0..CMD_EL_PER_RING - 1 {
            ctrl.send_cmd(0, CmdType::StopChan).unwrap();
        }
        assert!(matches!(
            ctrl.send_cmd(0, CmdType::StopChan),
            Err(Error::OutOfMemory(_))
        ));

        // Retiring one command makes room again
        ctrl.chan_cmd_complete(0, CompletionCode::Success);
        ctrl.send_cmd(0, CmdType::StopChan).unwrap();
    }

    #[test]
    fn completion_outside_ring_rejected() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        assert!(ctrl
            .process_cmd_completion(0x10, CompletionCode::Success)
            .is_err());
        assert_eq!(ctrl.channel_ccs(0).unwrap(), CompletionCode::Invalid);
    }

    #[test]
    fn requires_device_context() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        assert!(matches!(
            ctrl.send_cmd(0, CmdType::StartChan),
            Err(Error::NotReady(_))
        ));
    }
}
