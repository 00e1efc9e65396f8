// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SMBus-backed groups: per-register reads of the SMC's telemetry
//! banks.  A refresh issues all of its register reads back to back without
//! dropping the bus lock-step between them, so one refresh never observes
//! half of another's registers.
//!
//! Registers the SMC still decodes but the platform has retired are
//! reported as zero and must stay that way.

use std::sync::Arc;

use drv_smc_i2c::SmcBus;
use systoolsd_api::{
    DiagnosticsInfo, FwUpdateInfo, PowerUsageInfo, SmbaInfo, ThermalInfo, VoltageInfo,
    SMBA_RESTART_WAIT_MS,
};
use zerocopy::byteorder::little_endian::U32;

use crate::error::Result;
use crate::groups::Refresh;

mod reg {
    // Thermal bank
    pub const TEMP_CPU: u8 = 0x40;
    pub const TEMP_EXHAUST: u8 = 0x41;
    pub const TEMP_VCCP: u8 = 0x43;
    pub const TEMP_VCCCLR: u8 = 0x44;
    pub const TEMP_VCCMP: u8 = 0x45;
    pub const TEMP_WEST: u8 = 0x47;
    pub const TEMP_EAST: u8 = 0x48;
    pub const FAN_TACH: u8 = 0x49;
    pub const FAN_PWM: u8 = 0x4a;
    pub const FAN_PWM_ADDER: u8 = 0x4b;
    pub const TCRITICAL: u8 = 0x4c;
    pub const TCONTROL: u8 = 0x4d;

    // Power bank
    pub const PWR_PCIE: u8 = 0x28;
    pub const PWR_2X3: u8 = 0x29;
    pub const PWR_2X4: u8 = 0x2a;
    pub const FORCE_THROTTLE: u8 = 0x2b;
    pub const AVG_POWER_0: u8 = 0x35;
    pub const INST_POWER: u8 = 0x3a;
    pub const INST_POWER_MAX: u8 = 0x3b;
    pub const POWER_VCCP: u8 = 0x70;
    pub const POWER_VCCU: u8 = 0x71;
    pub const POWER_VCCCLR: u8 = 0x72;
    pub const POWER_VCCMLB: u8 = 0x73;
    pub const POWER_VCCMP: u8 = 0x76;
    pub const POWER_NTB1: u8 = 0x77;

    // Voltage bank
    pub const VOLTAGE_VCCP: u8 = 0x50;
    pub const VOLTAGE_VCCU: u8 = 0x51;
    pub const VOLTAGE_VCCCLR: u8 = 0x52;
    pub const VOLTAGE_VCCMLB: u8 = 0x53;
    pub const VOLTAGE_VCCMP: u8 = 0x56;
    pub const VOLTAGE_NTB1: u8 = 0x57;
    pub const VOLTAGE_VCCPIO: u8 = 0x58;
    pub const VOLTAGE_VCCSFR: u8 = 0x59;
    pub const VOLTAGE_PCH: u8 = 0x5a;
    pub const VOLTAGE_VCCMFUSE: u8 = 0x5b;
    pub const VOLTAGE_NTB2: u8 = 0x5c;
    pub const VOLTAGE_VPP: u8 = 0x5d;

    // Diagnostics / firmware update
    pub const LED_BLINK: u8 = 0x60;
    pub const FWU_STS: u8 = 0xe1;
    pub const FWU_CMD: u8 = 0xe2;
}

pub use reg::{FAN_PWM_ADDER as PWM_ADDER_REG, LED_BLINK as LED_BLINK_REG};

pub struct ThermalSource {
    i2c: Arc<SmcBus>,
}

impl ThermalSource {
    pub fn new(i2c: Arc<SmcBus>) -> Self {
        Self { i2c }
    }
}

impl Refresh for ThermalSource {
    type Payload = ThermalInfo;

    fn refresh(&self, data: &mut ThermalInfo) -> Result<()> {
        let txn = self.i2c.lock()?;
        let r = |cmd| -> Result<U32> { Ok(U32::new(txn.read_u32(cmd)?)) };
        data.temp_cpu = r(reg::TEMP_CPU)?;
        data.temp_exhaust = r(reg::TEMP_EXHAUST)?;
        data.temp_inlet = U32::ZERO; // Deprecated
        data.temp_vccp = r(reg::TEMP_VCCP)?;
        data.temp_vccclr = r(reg::TEMP_VCCCLR)?;
        data.temp_vccmp = r(reg::TEMP_VCCMP)?;
        data.temp_mid = U32::ZERO; // Deprecated
        data.temp_west = r(reg::TEMP_WEST)?;
        data.temp_east = r(reg::TEMP_EAST)?;
        data.fan_tach = r(reg::FAN_TACH)?;
        data.fan_pwm = r(reg::FAN_PWM)?;
        data.fan_pwm_adder = r(reg::FAN_PWM_ADDER)?;
        data.tcritical = r(reg::TCRITICAL)?;
        data.tcontrol = r(reg::TCONTROL)?;
        data.thermal_throttle_duration = U32::ZERO; // Deprecated
        data.thermal_throttle = U32::ZERO; // Deprecated
        Ok(())
    }
}

pub struct PowerUsageSource {
    i2c: Arc<SmcBus>,
}

impl PowerUsageSource {
    pub fn new(i2c: Arc<SmcBus>) -> Self {
        Self { i2c }
    }
}

impl Refresh for PowerUsageSource {
    type Payload = PowerUsageInfo;

    fn refresh(&self, data: &mut PowerUsageInfo) -> Result<()> {
        let txn = self.i2c.lock()?;
        let r = |cmd| -> Result<U32> { Ok(U32::new(txn.read_u32(cmd)?)) };
        data.pwr_pcie = r(reg::PWR_PCIE)?;
        data.pwr_2x3 = r(reg::PWR_2X3)?;
        data.pwr_2x4 = r(reg::PWR_2X4)?;
        data.force_throttle = r(reg::FORCE_THROTTLE)?;
        data.avg_power_0 = r(reg::AVG_POWER_0)?;
        data.inst_power = r(reg::INST_POWER)?;
        data.inst_power_max = r(reg::INST_POWER_MAX)?;
        data.power_vccp = r(reg::POWER_VCCP)?;
        data.power_vccu = r(reg::POWER_VCCU)?;
        data.power_vccclr = r(reg::POWER_VCCCLR)?;
        data.power_vccmlb = r(reg::POWER_VCCMLB)?;
        data.power_vccd012 = U32::ZERO; // Deprecated
        data.power_vccd345 = U32::ZERO; // Deprecated
        data.power_vccmp = r(reg::POWER_VCCMP)?;
        data.power_ntb1 = r(reg::POWER_NTB1)?;
        Ok(())
    }
}

pub struct VoltageSource {
    i2c: Arc<SmcBus>,
}

impl VoltageSource {
    pub fn new(i2c: Arc<SmcBus>) -> Self {
        Self { i2c }
    }
}

impl Refresh for VoltageSource {
    type Payload = VoltageInfo;

    fn refresh(&self, data: &mut VoltageInfo) -> Result<()> {
        let txn = self.i2c.lock()?;
        let r = |cmd| -> Result<U32> { Ok(U32::new(txn.read_u32(cmd)?)) };
        data.voltage_vccp = r(reg::VOLTAGE_VCCP)?;
        data.voltage_vccu = r(reg::VOLTAGE_VCCU)?;
        data.voltage_vccclr = r(reg::VOLTAGE_VCCCLR)?;
        data.voltage_vccmlb = r(reg::VOLTAGE_VCCMLB)?;
        data.voltage_vccp012 = U32::ZERO; // Deprecated
        data.voltage_vccp345 = U32::ZERO; // Deprecated
        data.voltage_vccmp = r(reg::VOLTAGE_VCCMP)?;
        data.voltage_ntb1 = r(reg::VOLTAGE_NTB1)?;
        data.voltage_vccpio = r(reg::VOLTAGE_VCCPIO)?;
        data.voltage_vccsfr = r(reg::VOLTAGE_VCCSFR)?;
        data.voltage_pch = r(reg::VOLTAGE_PCH)?;
        data.voltage_vccmfuse = r(reg::VOLTAGE_VCCMFUSE)?;
        data.voltage_ntb2 = r(reg::VOLTAGE_NTB2)?;
        data.voltage_vpp = r(reg::VOLTAGE_VPP)?;
        Ok(())
    }
}

pub struct DiagnosticsSource {
    i2c: Arc<SmcBus>,
}

impl DiagnosticsSource {
    pub fn new(i2c: Arc<SmcBus>) -> Self {
        Self { i2c }
    }
}

impl Refresh for DiagnosticsSource {
    type Payload = DiagnosticsInfo;

    fn refresh(&self, data: &mut DiagnosticsInfo) -> Result<()> {
        let blinking = self.i2c.read_u32(reg::LED_BLINK)? != 0;
        data.led_blink = U32::new(u32::from(blinking));
        Ok(())
    }
}

pub struct FwUpdateSource {
    i2c: Arc<SmcBus>,
}

impl FwUpdateSource {
    pub fn new(i2c: Arc<SmcBus>) -> Self {
        Self { i2c }
    }
}

impl Refresh for FwUpdateSource {
    type Payload = FwUpdateInfo;

    fn refresh(&self, data: &mut FwUpdateInfo) -> Result<()> {
        let txn = self.i2c.lock()?;
        data.fwu_sts = U32::new(txn.read_u32(reg::FWU_STS)?);
        data.fwu_cmd = U32::new(txn.read_u32(reg::FWU_CMD)?);
        Ok(())
    }
}

/// Reports the arbiter's own retraining window; no bus traffic involved.
pub struct SmbaSource {
    i2c: Arc<SmcBus>,
}

impl SmbaSource {
    pub fn new(i2c: Arc<SmcBus>) -> Self {
        Self { i2c }
    }
}

impl Refresh for SmbaSource {
    type Payload = SmbaInfo;

    fn refresh(&self, data: &mut SmbaInfo) -> Result<()> {
        let busy = self.i2c.is_device_busy();
        if busy.is_busy {
            data.is_busy = 1;
            data.ms_remaining = U32::new(busy.remaining_ms.min(SMBA_RESTART_WAIT_MS));
        } else {
            data.is_busy = 0;
            data.ms_remaining = U32::ZERO;
        }
        Ok(())
    }
}
