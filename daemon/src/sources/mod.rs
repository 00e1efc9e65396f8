// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adapters over the card's information and control surfaces: kernel
//! counters in `/proc`, the RAPL power-cap zone and intel_pstate knobs in
//! sysfs, and the `syscfg` BIOS-settings utility.
//!
//! Each adapter takes its filesystem root as a constructor argument so the
//! tests can point it at a scratch tree.

pub mod kernel;
pub mod power;
pub mod syscfg;
pub mod turbo;

pub use kernel::KernelStats;
pub use power::{PowerThresholds, PowerWindow};
pub use syscfg::{Syscfg, SyscfgCli};
pub use turbo::TurboCtl;

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Reads a sysfs-style file holding one decimal integer.
pub(crate) fn read_sysfs_u32(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("read {}: {e}", path.display())))?;
    text.trim()
        .parse()
        .map_err(|e| Error::io(format!("parse {}: {e}", path.display())))
}

/// First run of digits in a line, as a number; how the `/proc` text tables
/// get scraped.
pub(crate) fn leading_number(line: &str) -> Option<u64> {
    let start = line.find(|c: char| c.is_ascii_digit())?;
    let digits: String = line[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
