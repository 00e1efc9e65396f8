// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RAPL power-cap zone: read-out for the pthresh data group and the
//! two constraint windows the set-pthresh handshake writes.

use std::fs;
use std::path::PathBuf;

use systoolsd_api::PowerWindowInfo;
use zerocopy::byteorder::little_endian::U32;

use crate::error::{Error, Result};
use crate::sources::read_sysfs_u32;

pub const DEFAULT_RAPL_ZONE: &str = "/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0";

pub struct PowerThresholds {
    zone: PathBuf,
}

impl PowerThresholds {
    pub fn new(zone: impl Into<PathBuf>) -> Self {
        Self { zone: zone.into() }
    }

    /// Not reported by this hardware.
    pub fn max_phys_power(&self) -> u32 {
        0
    }

    pub fn low_threshold(&self) -> Result<u32> {
        read_sysfs_u32(&self.zone.join("constraint_0_power_limit_uw"))
    }

    pub fn high_threshold(&self) -> Result<u32> {
        read_sysfs_u32(&self.zone.join("constraint_1_power_limit_uw"))
    }

    /// One of the zone's two constraint windows.  Fails up front if the
    /// window's files are absent, so a set request is refused before it is
    /// acknowledged.
    pub fn window(&self, which: u8) -> Result<PowerWindow> {
        if which > 1 {
            return Err(Error::inval(format!("no power window {which}")));
        }
        let window = PowerWindow {
            limit: self.zone.join(format!("constraint_{which}_power_limit_uw")),
            time_window: self
                .zone
                .join(format!("constraint_{which}_time_window_us")),
        };
        if !window.limit.exists() || !window.time_window.exists() {
            return Err(Error::io(format!(
                "power window {which} not present under {}",
                self.zone.display()
            )));
        }
        Ok(window)
    }
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self::new(DEFAULT_RAPL_ZONE)
    }
}

pub struct PowerWindow {
    limit: PathBuf,
    time_window: PathBuf,
}

impl PowerWindow {
    pub fn info(&self) -> Result<PowerWindowInfo> {
        Ok(PowerWindowInfo {
            threshold: U32::new(read_sysfs_u32(&self.limit)?),
            time_window: U32::new(read_sysfs_u32(&self.time_window)?),
        })
    }

    pub fn set_threshold(&self, microwatts: u32) -> Result<()> {
        fs::write(&self.limit, microwatts.to_string())
            .map_err(|e| Error::io(format!("write {}: {e}", self.limit.display())))
    }

    pub fn set_time_window(&self, microseconds: u32) -> Result<()> {
        fs::write(&self.time_window, microseconds.to_string())
            .map_err(|e| Error::io(format!("write {}: {e}", self.time_window.display())))
    }
}
