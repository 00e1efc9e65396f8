// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The daemon's error type: an on-wire errno plus human context.
//!
//! Handlers report failure by sending the request header back with
//! `card_errno` set, so every error that can reach a handler boundary must
//! project onto an [`Errno`].  The message only ever goes to the log.

use std::fmt;

use drv_smc_i2c::SmcError;
use systoolsd_api::Errno;

#[derive(Debug)]
pub struct Error {
    errno: Errno,
    msg: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(errno: Errno, msg: impl Into<String>) -> Self {
        Self {
            errno,
            msg: msg.into(),
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(Errno::IoError, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(Errno::InternalError, msg)
    }

    pub fn inval(msg: impl Into<String>) -> Self {
        Self::new(Errno::InvalArgument, msg)
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.errno, self.msg)
    }
}

impl std::error::Error for Error {}

impl From<SmcError> for Error {
    fn from(e: SmcError) -> Self {
        let errno = match &e {
            SmcError::NotReady => Errno::IoError,
            SmcError::DeviceBusy { .. } => Errno::DeviceBusy,
            SmcError::RestartInProgress => Errno::RestartInProgress,
            SmcError::Adapter(_) | SmcError::Transfer(_) => Errno::SmcError,
        };
        Self::new(errno, e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(Errno::IoError, e.to_string())
    }
}

impl From<smbios::Error> for Error {
    fn from(e: smbios::Error) -> Self {
        Self::new(Errno::InternalError, e.to_string())
    }
}
