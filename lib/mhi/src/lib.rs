// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side controller core for the Modem Host Interface (MHI).

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod bits;
pub mod boot;
pub mod bus;
pub mod channel;
pub mod cmd;
pub mod common;
pub mod config;
pub mod context;
pub mod controller;
pub mod dma;
pub mod error;
pub mod event;
pub mod irq;
pub mod mmio;
pub mod pm;
pub mod ring;
pub mod sim;
pub mod sysfs;
pub mod tasks;
pub mod util;

#[cfg(test)]
mod test_util;

pub use controller::{
    Controller, ControllerOps, ControllerResources, Transport,
};
pub use error::{Error, Result};
