// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The intel_pstate turbo knobs.  `no_turbo` stores the *inverse* of the
//! state clients think in, so the inversion lives here and nowhere else.

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::sources::read_sysfs_u32;

pub const DEFAULT_PSTATE_DIR: &str = "/sys/devices/system/cpu/intel_pstate";

pub struct TurboCtl {
    root: PathBuf,
}

impl TurboCtl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(read_sysfs_u32(&self.root.join("no_turbo"))? == 0)
    }

    pub fn turbo_pct(&self) -> Result<u8> {
        Ok(read_sysfs_u32(&self.root.join("turbo_pct"))? as u8)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let path = self.root.join("no_turbo");
        let value = if enabled { "0" } else { "1" };
        fs::write(&path, value).map_err(|e| Error::io(format!("write {}: {e}", path.display())))
    }
}

impl Default for TurboCtl {
    fn default() -> Self {
        Self::new(DEFAULT_PSTATE_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testutil::Scratch;

    #[test]
    fn no_turbo_is_inverted() {
        let scratch = Scratch::new("turbo");
        scratch.write("no_turbo", "0\n");
        scratch.write("turbo_pct", "33\n");
        let turbo = TurboCtl::new(scratch.path());

        assert!(turbo.is_enabled().unwrap());
        assert_eq!(turbo.turbo_pct().unwrap(), 33);

        turbo.set_enabled(false).unwrap();
        assert_eq!(
            fs::read_to_string(scratch.path().join("no_turbo")).unwrap(),
            "1"
        );
        assert!(!turbo.is_enabled().unwrap());

        turbo.set_enabled(true).unwrap();
        assert!(turbo.is_enabled().unwrap());
    }

    #[test]
    fn missing_sysfs_is_an_io_error() {
        let scratch = Scratch::new("turbo-missing");
        let turbo = TurboCtl::new(scratch.path());
        assert!(turbo.is_enabled().is_err());
    }
}
