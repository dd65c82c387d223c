// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default timeout for channel commands and state waits.
pub const MHI_TIMEOUT_MS: u32 = 1000;

/// Default maximum transfer unit for a single buffer.
pub const MHI_MAX_MTU: usize = 0xffff;

/// Number of command rings the host maintains.
pub const NR_OF_CMD_RINGS: usize = 1;

/// Index of the command ring used for channel state changes.
pub const PRIMARY_CMD_RING: usize = 0;

/// Element count of each command ring.
pub const CMD_EL_PER_RING: usize = 128;

/// Channel doorbell slot reserved for the device wake doorbell.
pub const DEV_WAKE_DB: usize = 127;

/// Size of a transfer, event, or command ring element.
pub const RING_ELEMENT_SIZE: usize = 16;

/// Default BHIe segment length used for vector tables.
pub const DEFAULT_SEG_LEN: usize = 512 * 1024;

/// An address as seen by the device across the bus (an IOVA).
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BusAddr(pub u64);

impl BusAddr {
    pub const NULL: BusAddr = BusAddr(0);

    pub const fn offset(self, off: usize) -> Self {
        Self(self.0 + off as u64)
    }
    pub const fn upper_32(self) -> u32 {
        upper_32_bits(self.0)
    }
    pub const fn lower_32(self) -> u32 {
        lower_32_bits(self.0)
    }
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
    /// Round up to the next multiple of `align`, which must be a power of
    /// two.
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + (align - 1)) & !(align - 1))
    }
}

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddr({:#x})", self.0)
    }
}
impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub const fn upper_32_bits(v: u64) -> u32 {
    (v >> 32) as u32
}
pub const fn lower_32_bits(v: u64) -> u32 {
    v as u32
}

/// Transfer direction of a channel, numbered like the DMA API directions
/// the device expects in the channel type field.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    strum::FromRepr,
)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum DmaDir {
    Bidirectional = 0,
    /// Uplink, host to device.
    #[default]
    ToDevice = 1,
    /// Downlink, device to host.
    FromDevice = 2,
    None = 3,
}

impl DmaDir {
    /// Only offload channels may be bidirectional or directionless.
    pub fn requires_offload(self) -> bool {
        matches!(self, DmaDir::Bidirectional | DmaDir::None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bus_addr_halves() {
        let addr = BusAddr(0x1234_5678_9abc_def0);
        assert_eq!(addr.upper_32(), 0x1234_5678);
        assert_eq!(addr.lower_32(), 0x9abc_def0);
    }

    #[test]
    fn bus_addr_align_up() {
        assert_eq!(BusAddr(0x1040).align_up(0x1000), BusAddr(0x2000));
        assert_eq!(BusAddr(0x2000).align_up(0x1000), BusAddr(0x2000));
        assert_eq!(BusAddr(0x1).align_up(16), BusAddr(0x10));
    }
}
