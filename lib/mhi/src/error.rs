// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::bits::CompletionCode;

/// Errors raised by the MHI core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed controller, configuration, or request
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A coherent or host allocation failed
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// The integrator's register read callback reported a failure
    #[error("failed to read register at offset {0:#x}")]
    RegRead(usize),

    /// Other I/O failure from an external collaborator
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device could not be brought to a state permitting access
    #[error("device not accessible: {0}")]
    NotReady(&'static str),

    /// A channel command completed with a failure code
    #[error("channel {chan} command failed with {code:?}")]
    CommandFailed { chan: u32, code: CompletionCode },

    /// A capability offset lies beyond the register window
    #[error("{what} offset {offset:#x} out of range of {limit:#x}")]
    OutOfRange { what: &'static str, offset: usize, limit: usize },

    /// A completion was not signalled in time
    #[error("timed out after {0} ms")]
    TimedOut(u32),

    /// The wait was cancelled by driver removal
    #[error("operation cancelled")]
    Cancelled,

    /// Channel not usable in the current execution environment
    #[error("channel {0} not available in current execution environment")]
    NotConnected(u32),

    /// No free element on a transfer ring
    #[error("ring is full")]
    Busy,
}

impl Error {
    /// The negative errno an integrator's recovery path expects for this
    /// error kind.
    pub fn errno(&self) -> i32 {
        const EIO: i32 = 5;
        const ENOMEM: i32 = 12;
        const EBUSY: i32 = 16;
        const EINVAL: i32 = 22;
        const ERANGE: i32 = 34;
        const ENOTCONN: i32 = 107;
        const ETIMEDOUT: i32 = 110;
        const ECANCELED: i32 = 125;

        -match self {
            Error::InvalidArgument(_) => EINVAL,
            Error::OutOfMemory(_) => ENOMEM,
            Error::RegRead(_)
            | Error::NotReady(_)
            | Error::CommandFailed { .. } => EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(EIO),
            Error::OutOfRange { .. } => ERANGE,
            Error::TimedOut(_) => ETIMEDOUT,
            Error::Cancelled => ECANCELED,
            Error::NotConnected(_) => ENOTCONN,
            Error::Busy => EBUSY,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::invalid("x").errno(), -22);
        assert_eq!(Error::OutOfMemory("ring").errno(), -12);
        assert_eq!(Error::RegRead(0x18).errno(), -5);
        assert_eq!(
            Error::OutOfRange { what: "CHDB", offset: 0xff8, limit: 0x1000 }
                .errno(),
            -34
        );
        assert_eq!(Error::TimedOut(1000).errno(), -110);
    }
}
