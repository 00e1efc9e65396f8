// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bundle of long-lived services the data groups and handlers borrow:
//! the SMBus arbiter, the firmware-table snapshot, the power/turbo sysfs
//! adapters, the `syscfg` wrapper, and the kernel counters.

use std::sync::Arc;

use drv_smc_i2c::SmcBus;
use smbios::SmBiosTable;

use crate::sources::{KernelStats, PowerThresholds, Syscfg, TurboCtl};

#[derive(Clone)]
pub struct Services {
    pub i2c: Arc<SmcBus>,
    pub smbios: Arc<SmBiosTable>,
    pub pthresh: Arc<PowerThresholds>,
    pub turbo: Arc<TurboCtl>,
    pub syscfg: Arc<dyn Syscfg>,
    pub kernel: Arc<KernelStats>,
}
