// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register access and MMIO programming of a powered-up device.

use slog::{debug, error};

use crate::bits::{regs, MhiCfg};
use crate::common::{lower_32_bits, upper_32_bits, DEV_WAKE_DB};
use crate::controller::Controller;
use crate::error::{Error, Result};

#[usdt::provider(provider = "mhi")]
mod probes {
    fn mhi_doorbell(off: u64, val: u64) {}
    fn mhi_reg_write(off: u64, val: u32) {}
}

/// Stride between doorbell registers.
const DB_STRIDE: usize = 8;

impl Controller {
    pub(crate) fn read_reg(&self, off: usize) -> Result<u32> {
        self.ops.read_reg(off).map_err(|e| {
            debug!(self.log, "register read failed";
                "off" => format!("{off:#x}"), "error" => %e);
            Error::RegRead(off)
        })
    }

    pub(crate) fn write_reg(&self, off: usize, val: u32) {
        probes::mhi_reg_write!(|| (off as u64, val));
        self.ops.write_reg(off, val);
    }

    /// Ring the doorbell at register offset `db` with `val`: upper half
    /// first, then the lower half which triggers the device.
    pub(crate) fn write_db(&self, db: usize, val: u64) {
        probes::mhi_doorbell!(|| (db as u64, val));
        self.ops.write_reg(db + 4, upper_32_bits(val));
        self.ops.write_reg(db, lower_32_bits(val));
    }

    /// Read a capability offset register and check that `span` bytes past
    /// the offset still fit in the register window.
    fn read_db_offset(
        &self,
        reg: usize,
        span: usize,
        what: &'static str,
    ) -> Result<usize> {
        let off = self.read_reg(reg)? as usize;
        let reg_len = self.res.reg_len;
        match reg_len.checked_sub(span) {
            Some(limit) if off < limit => Ok(off),
            _ => {
                error!(self.log, "doorbell offset out of range";
                    "what" => what, "off" => format!("{off:#x}"),
                    "reg_len" => format!("{reg_len:#x}"));
                Err(Error::OutOfRange { what, offset: off, limit: reg_len })
            }
        }
    }

    /// Program a device in READY state: discover doorbells, then publish the
    /// context arrays and the addressable window.
    pub fn init_mmio(&self) -> Result<()> {
        let (chan_addr, er_addr, cmd_addr) = {
            let ctxt = self.dev_ctxt.lock().unwrap();
            let ctxt = ctxt
                .as_ref()
                .ok_or(Error::NotReady("device context not initialised"))?;
            (ctxt.chan_ctxt_addr(), ctxt.er_ctxt_addr(), ctxt.cmd_ctxt_addr())
        };

        let chdb = self.read_db_offset(
            regs::CHDBOFF,
            DB_STRIDE * DEV_WAKE_DB,
            "channel doorbell",
        )?;
        {
            let mut wake = self.wake.lock().unwrap();
            wake.db = Some(chdb + DB_STRIDE * DEV_WAKE_DB);
            wake.set = false;
        }
        for (i, ch) in self.channels.iter().enumerate() {
            ch.rings.lock().unwrap().tre.db_addr = Some(chdb + DB_STRIDE * i);
        }

        let total_ev = self.events.len();
        let erdb = self.read_db_offset(
            regs::ERDBOFF,
            DB_STRIDE * total_ev,
            "event ring doorbell",
        )?;
        for (i, ev) in self.events.iter().enumerate() {
            if !ev.offload {
                ev.ring.lock().unwrap().db_addr = Some(erdb + DB_STRIDE * i);
            }
        }

        for cmd in self.cmd_rings.iter() {
            cmd.ring.lock().unwrap().db_addr = Some(regs::CRDB_LOWER);
        }

        let (start, stop) = (self.res.iova_start, self.res.iova_stop);
        let writes = [
            (regs::CCABAP_HIGHER, chan_addr.upper_32()),
            (regs::CCABAP_LOWER, chan_addr.lower_32()),
            (regs::ECABAP_HIGHER, er_addr.upper_32()),
            (regs::ECABAP_LOWER, er_addr.lower_32()),
            (regs::CRCBAP_HIGHER, cmd_addr.upper_32()),
            (regs::CRCBAP_LOWER, cmd_addr.lower_32()),
            (regs::MHICTRLBASE_HIGHER, upper_32_bits(start)),
            (regs::MHICTRLBASE_LOWER, lower_32_bits(start)),
            (regs::MHIDATABASE_HIGHER, upper_32_bits(start)),
            (regs::MHIDATABASE_LOWER, lower_32_bits(start)),
            (regs::MHICTRLLIMIT_HIGHER, upper_32_bits(stop)),
            (regs::MHICTRLLIMIT_LOWER, lower_32_bits(stop)),
            (regs::MHIDATALIMIT_HIGHER, upper_32_bits(stop)),
            (regs::MHIDATALIMIT_LOWER, lower_32_bits(stop)),
        ];
        for (off, val) in writes {
            self.write_reg(off, val);
        }

        let cfg = MhiCfg(self.read_reg(regs::MHICFG)?)
            .with_ner(self.events.len() as u8);
        self.write_reg(regs::MHICFG, cfg.0);
        let cfg = MhiCfg(self.read_reg(regs::MHICFG)?)
            .with_nhwer(self.hw_ev_rings as u8);
        self.write_reg(regs::MHICFG, cfg.0);

        debug!(self.log, "MMIO programmed";
            "chdb" => format!("{chdb:#x}"), "erdb" => format!("{erdb:#x}"));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_util::Scaffold;

    fn prepared(scaffold: &Scaffold) -> std::sync::Arc<Controller> {
        let ctrl = scaffold.register().unwrap();
        ctrl.prepare_for_power_up().unwrap();
        ctrl
    }

    #[test]
    fn register_write_order() {
        let scaffold = Scaffold::minimal();
        let ctrl = prepared(&scaffold);
        scaffold.sim.set_reg(regs::MHICFG, 0x0000_2010);
        scaffold.sim.take_writes();

        ctrl.init_mmio().unwrap();

        let (chan, er, cmd) = {
            let ctxt = ctrl.dev_ctxt.lock().unwrap();
            let ctxt = ctxt.as_ref().unwrap();
            (ctxt.chan_ctxt_addr(), ctxt.er_ctxt_addr(), ctxt.cmd_ctxt_addr())
        };
        let (start, stop) = (scaffold.res.iova_start, scaffold.res.iova_stop);
        let expected = vec![
            (regs::CCABAP_HIGHER, chan.upper_32()),
            (regs::CCABAP_LOWER, chan.lower_32()),
            (regs::ECABAP_HIGHER, er.upper_32()),
            (regs::ECABAP_LOWER, er.lower_32()),
            (regs::CRCBAP_HIGHER, cmd.upper_32()),
            (regs::CRCBAP_LOWER, cmd.lower_32()),
            (regs::MHICTRLBASE_HIGHER, upper_32_bits(start)),
            (regs::MHICTRLBASE_LOWER, lower_32_bits(start)),
            (regs::MHIDATABASE_HIGHER, upper_32_bits(start)),
            (regs::MHIDATABASE_LOWER, lower_32_bits(start)),
            (regs::MHICTRLLIMIT_HIGHER, upper_32_bits(stop)),
            (regs::MHICTRLLIMIT_LOWER, lower_32_bits(stop)),
            (regs::MHIDATALIMIT_HIGHER, upper_32_bits(stop)),
            (regs::MHIDATALIMIT_LOWER, lower_32_bits(stop)),
            (regs::MHICFG, 0x0001_2010),
            (regs::MHICFG, 0x0001_2010),
        ];
        assert_eq!(scaffold.sim.take_writes(), expected);
    }

    #[test]
    fn hw_event_ring_count() {
        let mut scaffold = Scaffold::minimal();
        scaffold.config.events[0].hardware_event = true;
        let ctrl = prepared(&scaffold);
        ctrl.init_mmio().unwrap();
        let cfg = MhiCfg(scaffold.sim.reg(regs::MHICFG));
        assert_eq!((cfg.ner(), cfg.nhwer()), (1, 1));
    }

    #[test]
    fn doorbell_addresses() {
        let scaffold = Scaffold::loopback();
        let ctrl = prepared(&scaffold);
        scaffold.sim.set_reg(regs::CHDBOFF, 0x400);
        scaffold.sim.set_reg(regs::ERDBOFF, 0x800);
        ctrl.init_mmio().unwrap();

        assert_eq!(ctrl.wake.lock().unwrap().db, Some(0x400 + 8 * 127));
        for chan in [0u32, 1] {
            let ch = ctrl.channel(chan).unwrap();
            let db = ch.rings.lock().unwrap().tre.db_addr;
            assert_eq!(db, Some(0x400 + 8 * chan as usize));
        }
        assert_eq!(ctrl.events[0].ring.lock().unwrap().db_addr, Some(0x800));
        assert_eq!(
            ctrl.cmd_rings[0].ring.lock().unwrap().db_addr,
            Some(regs::CRDB_LOWER)
        );
    }

    #[test]
    fn channel_doorbell_window_overrun() {
        let scaffold = Scaffold::minimal();
        assert_eq!(scaffold.res.reg_len, 0x1000);
        let ctrl = prepared(&scaffold);

        scaffold.sim.set_reg(regs::CHDBOFF, 0xFF8);
        let err = ctrl.init_mmio().unwrap_err();
        assert!(matches!(err, Error::OutOfRange { offset: 0xFF8, .. }));
        assert_eq!(err.errno(), -34);

        // reg_len - 8 * DEV_WAKE_DB is the first rejected offset
        scaffold.sim.set_reg(regs::CHDBOFF, 0x1000 - 8 * 127);
        assert!(matches!(ctrl.init_mmio(), Err(Error::OutOfRange { .. })));
        scaffold.sim.set_reg(regs::CHDBOFF, 0x1000 - 8 * 127 - 1);
        assert!(ctrl.init_mmio().is_ok());
    }

    #[test]
    fn event_doorbell_window_overrun() {
        let scaffold = Scaffold::minimal();
        let ctrl = prepared(&scaffold);
        scaffold.sim.set_reg(regs::ERDBOFF, 0x1000 - 8);
        assert!(matches!(
            ctrl.init_mmio(),
            Err(Error::OutOfRange { what: "event ring doorbell", .. })
        ));
        scaffold.sim.set_reg(regs::ERDBOFF, 0x1000 - 9);
        assert!(ctrl.init_mmio().is_ok());
    }

    #[test]
    fn read_failure() {
        let scaffold = Scaffold::minimal();
        let ctrl = prepared(&scaffold);
        scaffold.sim.fail_read(regs::CHDBOFF);
        let err = ctrl.init_mmio().unwrap_err();
        assert!(matches!(err, Error::RegRead(regs::CHDBOFF)));
        assert_eq!(err.errno(), -5);
    }

    #[test]
    fn doorbell_halves_order() {
        let scaffold = Scaffold::minimal();
        let ctrl = prepared(&scaffold);
        scaffold.sim.take_writes();
        ctrl.write_db(0x400, 0x1122_3344_5566_7788);
        assert_eq!(
            scaffold.sim.take_writes(),
            vec![(0x404, 0x1122_3344), (0x400, 0x5566_7788)]
        );
    }

    #[test]
    fn needs_device_context() {
        let scaffold = Scaffold::minimal();
        let ctrl = scaffold.register().unwrap();
        assert!(matches!(ctrl.init_mmio(), Err(Error::NotReady(_))));
    }
}
