// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register offsets, field layouts, and DMA-visible structures for MHI.

// Not every register or code is used by the core, but they are kept for
// completeness of the layout.
#![allow(dead_code)]

use std::mem::offset_of;

use bitstruct::bitstruct;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// MHI MMIO register offsets, relative to the start of the register window.
pub mod regs {
    pub const MHIREGLEN: usize = 0x00;
    pub const MHIVER: usize = 0x08;
    pub const MHICFG: usize = 0x10;
    pub const CHDBOFF: usize = 0x18;
    pub const ERDBOFF: usize = 0x20;
    pub const BHIOFF: usize = 0x28;
    pub const BHIEOFF: usize = 0x2C;
    pub const DEBUGOFF: usize = 0x30;
    pub const MHICTRL: usize = 0x38;
    pub const MHISTATUS: usize = 0x48;
    pub const CCABAP_LOWER: usize = 0x58;
    pub const CCABAP_HIGHER: usize = 0x5C;
    pub const ECABAP_LOWER: usize = 0x60;
    pub const ECABAP_HIGHER: usize = 0x64;
    pub const CRCBAP_LOWER: usize = 0x68;
    pub const CRCBAP_HIGHER: usize = 0x6C;
    pub const CRDB_LOWER: usize = 0x70;
    pub const CRDB_HIGHER: usize = 0x74;
    pub const MHICTRLBASE_LOWER: usize = 0x80;
    pub const MHICTRLBASE_HIGHER: usize = 0x84;
    pub const MHICTRLLIMIT_LOWER: usize = 0x88;
    pub const MHICTRLLIMIT_HIGHER: usize = 0x8C;
    pub const MHIDATABASE_LOWER: usize = 0x98;
    pub const MHIDATABASE_HIGHER: usize = 0x9C;
    pub const MHIDATALIMIT_LOWER: usize = 0xA0;
    pub const MHIDATALIMIT_HIGHER: usize = 0xA4;

    pub const MHI_SOC_RESET_REQ_OFFSET: usize = 0xB0;
    pub const MHI_SOC_RESET_REQ: u32 = 1 << 0;

    /// Mask over the whole doorbell offset capability registers.
    pub const CHDBOFF_MASK: u32 = 0xFFFF_FFFF;
    pub const ERDBOFF_MASK: u32 = 0xFFFF_FFFF;
}

/// BHI register offsets, relative to the BHI block.
pub mod bhi {
    pub const BHI_BHIVERSION_MINOR: usize = 0x00;
    pub const BHI_BHIVERSION_MAJOR: usize = 0x04;
    pub const BHI_IMGADDR_LOW: usize = 0x08;
    pub const BHI_IMGADDR_HIGH: usize = 0x0C;
    pub const BHI_IMGSIZE: usize = 0x10;
    pub const BHI_IMGTXDB: usize = 0x18;
    pub const BHI_INTVEC: usize = 0x20;
    pub const BHI_EXECENV: usize = 0x28;
    pub const BHI_STATUS: usize = 0x2C;
    pub const BHI_ERRCODE: usize = 0x30;
    pub const BHI_SERIALNU: usize = 0x40;
    pub const BHI_SBLANTIROLLVER: usize = 0x44;
    pub const BHI_NUMSEG: usize = 0x48;

    /// Number of OEM public key hash segments.
    pub const BHI_OEMPKHASH_SEG_COUNT: usize = 16;

    pub const fn msmhwid(n: usize) -> usize {
        0x4C + 0x4 * n
    }
    pub const fn oempkhash(n: usize) -> usize {
        0x64 + 0x4 * n
    }
}

/// BHIe register offsets, relative to the BHIe block.
pub mod bhie {
    pub const BHIE_MSMSOCID_OFFS: usize = 0x00;
    pub const BHIE_TXVECADDR_LOW_OFFS: usize = 0x2C;
    pub const BHIE_RXVECADDR_LOW_OFFS: usize = 0x60;
    pub const BHIE_RXVECADDR_HIGH_OFFS: usize = 0x64;
    pub const BHIE_RXVECSIZE_OFFS: usize = 0x68;
    pub const BHIE_RXVECDB_OFFS: usize = 0x70;
    pub const BHIE_RXVECSTATUS_OFFS: usize = 0x78;

    pub const BHIE_RXVECDB_SEQNUM_BMSK: u32 = (1 << 30) - 1;
}

bitstruct! {
    /// Channel context configuration word (`chcfg`).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ChCfg(pub u32) {
        /// Channel state, see [`ChState`]
        pub chstate: u8 = 0..8;

        /// Doorbell burst mode, see [`BrstMode`]
        pub brstmode: u8 = 8..10;

        /// Doorbell poll configuration
        pub pollcfg: u8 = 10..16;

        reserved: u16 = 16..32;
    }
}

bitstruct! {
    /// Event ring interrupt moderation word (`intmod`).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct IntMod(pub u32) {
        /// Moderation count
        pub modc: u16 = 0..16;

        /// Moderation time, in milliseconds
        pub modt: u16 = 16..32;
    }
}

bitstruct! {
    /// MHI configuration register (`MHICFG`).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MhiCfg(pub u32) {
        /// Number of channels
        pub nch: u8 = 0..8;

        /// Number of hardware channels
        pub nhwch: u8 = 8..16;

        /// Number of event rings
        pub ner: u8 = 16..24;

        /// Number of hardware event rings
        pub nhwer: u8 = 24..32;
    }
}

bitstruct! {
    /// MHI status register (`MHISTATUS`).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MhiStatus(pub u32) {
        pub ready: bool = 0;
        reserved1: bool = 1;
        pub syserr: bool = 2;
        reserved2: u8 = 3..8;
        pub mhistate: u8 = 8..16;
        reserved3: u16 = 16..32;
    }
}

/// Channel state as encoded in the channel context.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::FromRepr)]
#[repr(u8)]
pub enum ChState {
    Disabled = 0,
    Enabled = 1,
    Running = 2,
    Suspended = 3,
    Stop = 4,
    Error = 5,
}

impl ChState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChState::Disabled => "DISABLE",
            ChState::Enabled => "ENABLE",
            ChState::Running => "RUNNING",
            ChState::Suspended => "SUSPEND",
            ChState::Stop => "STOP",
            ChState::Error => "ERROR",
        }
    }
}

/// Doorbell burst mode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::FromRepr)]
#[repr(u32)]
pub enum BrstMode {
    #[default]
    Disable = 0x2,
    Enable = 0x3,
}

/// Channel type, published in the channel context (`chtype`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::FromRepr)]
#[repr(u32)]
pub enum ChType {
    Invalid = 0,
    Outbound = 1,
    Inbound = 2,
    InboundCoalesced = 3,
}

/// Event ring data type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::FromRepr)]
#[repr(u32)]
pub enum EvType {
    Data = 0,
    Ctrl = 1,
}

/// Event ring context type (`ertype`).
pub const MHI_ER_TYPE_INVALID: u32 = 0x0;
pub const MHI_ER_TYPE_VALID: u32 = 0x1;

/// Completion codes reported by the device in command and transfer events.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::FromRepr)]
#[repr(u32)]
pub enum CompletionCode {
    #[default]
    Invalid = 0x0,
    Success = 0x1,
    Eot = 0x2,
    Overflow = 0x3,
    Eob = 0x4,
    Oob = 0x5,
    DbMode = 0x6,
    UndefinedErr = 0x10,
    BadTre = 0x11,
}

/// Packet type of a transfer ring element.
pub const MHI_PKT_TYPE_TRANSFER: u32 = 0x2;

/// Command ring element types.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::FromRepr)]
#[repr(u32)]
pub enum CmdType {
    Nop = 1,
    ResetChan = 16,
    StopChan = 17,
    StartChan = 18,
}

/// Device-reported MHI state (`MHISTATUS.MHISTATE`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::FromRepr)]
#[repr(u8)]
pub enum MhiState {
    Reset = 0x0,
    Ready = 0x1,
    M0 = 0x2,
    M1 = 0x3,
    M2 = 0x4,
    M3 = 0x5,
    M3Fast = 0x6,
    Bhi = 0x7,
    SysErr = 0xFF,
}

impl MhiState {
    pub fn as_str(self) -> &'static str {
        match self {
            MhiState::Reset => "RESET",
            MhiState::Ready => "READY",
            MhiState::M0 => "M0",
            MhiState::M1 => "M1",
            MhiState::M2 => "M2",
            MhiState::M3 => "M3",
            MhiState::M3Fast => "M3 FAST",
            MhiState::Bhi => "BHI",
            MhiState::SysErr => "SYS ERROR",
        }
    }
}

/// Channel context entry as laid out in the channel context array.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct ChanCtxt {
    pub chcfg: U32,
    pub chtype: U32,
    pub erindex: U32,
    pub rbase: U64,
    pub rlen: U64,
    pub rp: U64,
    pub wp: U64,
}

impl ChanCtxt {
    pub const SIZE: usize = std::mem::size_of::<Self>();
    pub const CHCFG: usize = offset_of!(ChanCtxt, chcfg);
    pub const CHTYPE: usize = offset_of!(ChanCtxt, chtype);
    pub const ERINDEX: usize = offset_of!(ChanCtxt, erindex);
    pub const RBASE: usize = offset_of!(ChanCtxt, rbase);
    pub const RLEN: usize = offset_of!(ChanCtxt, rlen);
    pub const RP: usize = offset_of!(ChanCtxt, rp);
    pub const WP: usize = offset_of!(ChanCtxt, wp);

    pub fn chcfg(&self) -> ChCfg {
        ChCfg(self.chcfg.get())
    }
    pub fn chstate(&self) -> Option<ChState> {
        ChState::from_repr(self.chcfg().chstate())
    }
}

/// Event ring context entry as laid out in the event ring context array.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct EventCtxt {
    pub intmod: U32,
    pub ertype: U32,
    pub msivec: U32,
    pub rbase: U64,
    pub rlen: U64,
    pub rp: U64,
    pub wp: U64,
}

impl EventCtxt {
    pub const SIZE: usize = std::mem::size_of::<Self>();
    pub const INTMOD: usize = offset_of!(EventCtxt, intmod);
    pub const ERTYPE: usize = offset_of!(EventCtxt, ertype);
    pub const MSIVEC: usize = offset_of!(EventCtxt, msivec);
    pub const RBASE: usize = offset_of!(EventCtxt, rbase);
    pub const RLEN: usize = offset_of!(EventCtxt, rlen);
    pub const RP: usize = offset_of!(EventCtxt, rp);
    pub const WP: usize = offset_of!(EventCtxt, wp);

    pub fn intmod(&self) -> IntMod {
        IntMod(self.intmod.get())
    }
}

/// Command ring context entry as laid out in the command ring context array.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct CmdCtxt {
    pub reserved: [U32; 3],
    pub rbase: U64,
    pub rlen: U64,
    pub rp: U64,
    pub wp: U64,
}

impl CmdCtxt {
    pub const SIZE: usize = std::mem::size_of::<Self>();
    pub const RBASE: usize = offset_of!(CmdCtxt, rbase);
    pub const RLEN: usize = offset_of!(CmdCtxt, rlen);
    pub const RP: usize = offset_of!(CmdCtxt, rp);
    pub const WP: usize = offset_of!(CmdCtxt, wp);
}

/// A generic 16-byte ring element.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct RingElement {
    pub ptr: U64,
    pub dword: [U32; 2],
}

impl RingElement {
    /// Build a channel state-change command element.
    pub fn chan_cmd(cmd: CmdType, chan: u32) -> Self {
        Self {
            ptr: U64::new(0),
            dword: [U32::new(0), U32::new((chan << 24) | ((cmd as u32) << 16))],
        }
    }

    /// Build a transfer element for a buffer of `len` bytes at `addr`.
    pub fn transfer(addr: u64, len: usize, bei: bool, eot: bool) -> Self {
        let dword1 = (MHI_PKT_TYPE_TRANSFER << 16)
            | ((bei as u32) << 10)
            | ((eot as u32) << 9);
        Self {
            ptr: U64::new(addr),
            dword: [U32::new(len as u32 & 0xffff), U32::new(dword1)],
        }
    }

    pub fn cmd_type(&self) -> Option<CmdType> {
        CmdType::from_repr((self.dword[1].get() >> 16) & 0xFF)
    }
    pub fn cmd_chan(&self) -> u32 {
        self.dword[1].get() >> 24
    }
}

/// One entry of a BHIe vector table.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct BhiVecEntry {
    pub dma_addr: U64,
    pub size: U64,
}

impl BhiVecEntry {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn context_layouts() {
        assert_eq!(ChanCtxt::SIZE, 44);
        assert_eq!(EventCtxt::SIZE, 44);
        assert_eq!(CmdCtxt::SIZE, 44);
        assert_eq!(std::mem::size_of::<RingElement>(), 16);

        assert_eq!(ChanCtxt::RBASE, 12);
        assert_eq!(ChanCtxt::RLEN, 20);
        assert_eq!(ChanCtxt::RP, 28);
        assert_eq!(ChanCtxt::WP, 36);
        assert_eq!(EventCtxt::MSIVEC, 8);
        assert_eq!(CmdCtxt::RBASE, 12);
    }

    #[test]
    fn chcfg_fields() {
        let cfg = ChCfg(0)
            .with_chstate(ChState::Enabled as u8)
            .with_brstmode(BrstMode::Enable as u8)
            .with_pollcfg(0x3f);
        assert_eq!(cfg.0, 0x1 | (0x3 << 8) | (0x3f << 10));

        // A state change leaves the neighbouring fields alone
        let cfg = cfg.with_chstate(ChState::Disabled as u8);
        assert_eq!(cfg.brstmode(), 0x3);
        assert_eq!(cfg.pollcfg(), 0x3f);
    }

    #[test]
    fn intmod_fields() {
        let im = IntMod(0xffff_ffff).with_modc(0).with_modt(5);
        assert_eq!(im.0, 5 << 16);
    }

    #[test]
    fn transfer_element() {
        let el = RingElement::transfer(0x1000, 0x1_0010, true, true);
        assert_eq!(el.ptr.get(), 0x1000);
        // Length is truncated to the 16-bit field
        assert_eq!(el.dword[0].get(), 0x10);
        assert_eq!(el.dword[1].get(), (2 << 16) | (1 << 10) | (1 << 9));
    }

    #[test]
    fn chan_cmd_element() {
        let el = RingElement::chan_cmd(CmdType::StartChan, 7);
        assert_eq!(el.dword[1].get(), (7 << 24) | (18 << 16));
        assert_eq!(el.cmd_type(), Some(CmdType::StartChan));
        assert_eq!(el.cmd_chan(), 7);
    }
}
