// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute files published on MHI bus devices.

use std::str::FromStr;
use std::sync::Arc;

use slog::info;

use crate::bits::{bhi, regs};
use crate::bus::MhiDevice;
use crate::controller::{Controller, OpsCaps};
use crate::error::{Error, Result};

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Attr {
    /// Read-only
    SerialNumber,
    /// Read-only
    OemPkHash,
    /// Write-only
    SocReset,
    /// Write-only, controller device only
    TriggerEdl,
}

impl Attr {
    const COMMON: [Attr; 3] =
        [Attr::SerialNumber, Attr::OemPkHash, Attr::SocReset];

    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Attr::from_str(name).ok()
    }
}

impl MhiDevice {
    fn attr_ctrl(&self) -> Result<Arc<Controller>> {
        self.controller().ok_or(Error::NotReady("controller is gone"))
    }

    /// Attributes present on this device.
    pub fn attrs(&self) -> Vec<Attr> {
        let mut attrs = Attr::COMMON.to_vec();
        if self.is_controller()
            && self.controller().is_some_and(|c| c.has_edl_attr())
        {
            attrs.push(Attr::TriggerEdl);
        }
        attrs
    }

    pub fn attr_show(&self, attr: Attr) -> Result<String> {
        let ctrl = self.attr_ctrl()?;
        match attr {
            Attr::SerialNumber => {
                Ok(format!("Serial Number: {}\n", ctrl.serial_number()))
            }
            Attr::OemPkHash => {
                let bhi_off = ctrl
                    .boot
                    .lock()
                    .unwrap()
                    .bhi
                    .ok_or(Error::NotReady("BHI offset unknown"))?;
                let mut out = String::new();
                for i in 0..bhi::BHI_OEMPKHASH_SEG_COUNT {
                    let val = ctrl.read_reg(bhi_off + bhi::oempkhash(i))?;
                    out.push_str(&format!("OEMPKHASH[{i}]: 0x{val:x}\n"));
                }
                Ok(out)
            }
            Attr::SocReset | Attr::TriggerEdl => Err(Error::invalid(format!(
                "{} is write-only",
                attr.name()
            ))),
        }
    }

    /// Write `buf` to `attr`, returning the number of bytes consumed.
    pub fn attr_store(&self, attr: Attr, buf: &str) -> Result<usize> {
        let ctrl = self.attr_ctrl()?;
        match attr {
            Attr::SocReset => {
                ctrl.soc_reset();
                Ok(buf.len())
            }
            Attr::TriggerEdl if self.attrs().contains(&attr) => {
                let val: u64 = buf.trim().parse().map_err(|_| {
                    Error::invalid(format!("bad trigger_edl value {buf:?}"))
                })?;
                if val == 0 {
                    return Err(Error::invalid(
                        "trigger_edl value must be non-zero",
                    ));
                }
                info!(ctrl.log, "triggering EDL");
                ctrl.ops.edl_trigger()?;
                Ok(buf.len())
            }
            _ => Err(Error::invalid(format!(
                "{} not writable on {}",
                attr.name(),
                self.name()
            ))),
        }
    }
}

impl Controller {
    /// Serial number read from the BHI block at power-up preparation.
    pub fn serial_number(&self) -> u32 {
        self.boot.lock().unwrap().serial_number
    }

    /// Reset the SoC, through the integrator when it can, else by register.
    pub fn soc_reset(&self) {
        if self.ops.capabilities().contains(OpsCaps::SOC_RESET) {
            self.ops.reset();
        } else {
            self.write_reg(
                regs::MHI_SOC_RESET_REQ_OFFSET,
                regs::MHI_SOC_RESET_REQ,
            );
        }
    }
}
