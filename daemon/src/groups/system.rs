// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Groups sourced from the firmware tables, `/proc`, sysfs, and the
//! `syscfg` utility, plus the core-usage group whose payload length is
//! fixed by the node's CPU topology at construction.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drv_smc_i2c::SmcBus;
use smbios::SmBiosTable;
use systoolsd_api::{
    CoreCounters, CoreUsageInfo, CoresInfo, DeviceInfo, MemoryInfo, MemoryUsageInfo,
    PowerThresholdsInfo, ProcessorInfo, SystoolsdInfo, TurboInfo, PROTOCOL_MAJOR, PROTOCOL_MINOR,
};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::groups::{DataGroup, Refresh};
use crate::sources::{leading_number, KernelStats, PowerThresholds, Syscfg, TurboCtl};

mod reg {
    pub const PCI_SMBA: u8 = 0x07;
    pub const FW_VERSION: u8 = 0x11;
    pub const EXE_DOMAIN: u8 = 0x12;
    pub const STS_SELFTEST: u8 = 0x13;
    pub const HW_REVISION: u8 = 0x14;
    pub const SERIALNO: u8 = 0x15;
    pub const BOOT_FW_VERSION: u8 = 0x16;
    pub const PART_NUMBER: u8 = 0x18;
    pub const MANUFACTURE_DATE: u8 = 0x19;
    pub const CPU_ID: u8 = 0x1c;
    pub const CARD_TDP: u8 = 0x1e;
    pub const FWU_CAP: u8 = 0xe0;
}

/// NUL-padded copy keeping at least one terminator byte.
fn copy_cstr(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let n = src.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

/// The compile-time protocol version group.
pub struct VersionSource;

impl Refresh for VersionSource {
    type Payload = SystoolsdInfo;

    fn refresh(&self, data: &mut SystoolsdInfo) -> Result<()> {
        data.major_ver = PROTOCOL_MAJOR;
        data.minor_ver = PROTOCOL_MINOR;
        Ok(())
    }
}

/// `/proc/meminfo`, accounted the way procps' `free` does it: `cached`
/// includes `Slab`, `used` is the remainder (or `total - free` if the
/// subtraction goes negative).
pub struct MemoryUsageSource {
    meminfo: PathBuf,
}

impl MemoryUsageSource {
    pub fn new(proc_root: impl AsRef<Path>) -> Self {
        Self {
            meminfo: proc_root.as_ref().join("meminfo"),
        }
    }
}

impl Refresh for MemoryUsageSource {
    type Payload = MemoryUsageInfo;

    fn refresh(&self, data: &mut MemoryUsageInfo) -> Result<()> {
        let file = File::open(&self.meminfo)
            .map_err(|e| Error::io(format!("open {}: {e}", self.meminfo.display())))?;

        let mut total = 0u64;
        let mut free = 0u64;
        let mut buffers = 0u64;
        let mut cached = 0u64;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::from)?;
            let value = || leading_number(&line).unwrap_or(0);
            if line.starts_with("MemTotal:") {
                total = value();
            } else if line.starts_with("MemFree:") {
                free = value();
            } else if line.starts_with("Buffers:") {
                buffers = value();
            } else if line.starts_with("Cached:") || line.starts_with("Slab:") {
                cached += value();
            }
        }

        let used = total
            .checked_sub(free + buffers + cached)
            .unwrap_or_else(|| total.saturating_sub(free));

        data.total = U32::new(total as u32);
        data.used = U32::new(used as u32);
        data.free = U32::new(free as u32);
        data.buffers = U32::new(buffers as u32);
        data.cached = U32::new(cached as u32);
        Ok(())
    }
}

pub struct CoresInfoSource {
    kernel: Arc<KernelStats>,
    smbios: Arc<SmBiosTable>,
}

impl CoresInfoSource {
    pub fn new(kernel: Arc<KernelStats>, smbios: Arc<SmBiosTable>) -> Self {
        Self { kernel, smbios }
    }
}

impl Refresh for CoresInfoSource {
    type Payload = CoresInfo;

    fn refresh(&self, data: &mut CoresInfo) -> Result<()> {
        let proc = self
            .smbios
            .processors
            .first()
            .ok_or_else(|| Error::internal("no processor record in firmware table"))?;
        data.num_cores = U32::new(self.kernel.physical_core_count());
        data.clocks_per_sec = U32::new(self.kernel.clocks_per_sec() as u32);
        data.threads_per_core = U32::new(u32::from(self.kernel.threads_per_core()));
        data.cores_voltage = proc.raw.voltage;
        data.cores_freq = U32::new(u32::from(proc.raw.current_speed.get()));
        Ok(())
    }
}

pub struct DeviceInfoSource {
    i2c: Arc<SmcBus>,
    smbios: Arc<SmBiosTable>,
}

impl DeviceInfoSource {
    pub fn new(i2c: Arc<SmcBus>, smbios: Arc<SmBiosTable>) -> Self {
        Self { i2c, smbios }
    }

    fn os_version() -> Result<String> {
        let output = Command::new("uname")
            .args(["-r", "-o"])
            .output()
            .map_err(|e| Error::io(format!("spawn uname: {e}")))?;
        if !output.status.success() {
            return Err(Error::io("uname failed"));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let text = text.trim_end_matches('\n');
        if text.is_empty() {
            return Err(Error::io("failed getting OS version"));
        }
        Ok(text.to_string())
    }
}

impl Refresh for DeviceInfoSource {
    type Payload = DeviceInfo;

    fn refresh(&self, data: &mut DeviceInfo) -> Result<()> {
        {
            let txn = self.i2c.lock()?;
            data.card_tdp = U32::new(txn.read_u32(reg::CARD_TDP)? & 0xffff);
            data.fwu_cap = U32::new(txn.read_u32(reg::FWU_CAP)?);
            data.cpu_id = U32::new(txn.read_u32(reg::CPU_ID)?);
            data.pci_smba = U32::new(txn.read_u32(reg::PCI_SMBA)?);
            data.fw_version = U32::new(txn.read_u32(reg::FW_VERSION)?);
            data.exe_domain = U32::new(txn.read_u32(reg::EXE_DOMAIN)?);
            data.sts_selftest = U32::new(txn.read_u32(reg::STS_SELFTEST)?);
            data.boot_fw_version = U32::new(txn.read_u32(reg::BOOT_FW_VERSION)?);
            data.hw_revision = U32::new(txn.read_u32(reg::HW_REVISION)?);
            txn.read_bytes(reg::MANUFACTURE_DATE, &mut data.manufacture_date)?;
            txn.read_bytes(reg::PART_NUMBER, &mut data.part_number)?;
            txn.read_bytes(reg::SERIALNO, &mut data.serialno)?;
        }

        let bios = self
            .smbios
            .bios
            .first()
            .ok_or_else(|| Error::internal("no BIOS record in firmware table"))?;
        let system = self
            .smbios
            .systems
            .first()
            .ok_or_else(|| Error::internal("no system record in firmware table"))?;
        copy_cstr(&mut data.bios_version, &bios.version);
        copy_cstr(&mut data.bios_release_date, &bios.release_date);
        // The UUID is raw bytes, not a string; no terminator on the wire.
        data.uuid = system.raw.uuid;

        copy_cstr(&mut data.os_version, &Self::os_version()?);
        Ok(())
    }
}

pub struct MemoryInfoSource {
    smbios: Arc<SmBiosTable>,
    syscfg: Arc<dyn Syscfg>,
}

impl MemoryInfoSource {
    pub fn new(smbios: Arc<SmBiosTable>, syscfg: Arc<dyn Syscfg>) -> Self {
        Self { smbios, syscfg }
    }
}

impl Refresh for MemoryInfoSource {
    type Payload = MemoryInfo;

    fn refresh(&self, data: &mut MemoryInfo) -> Result<()> {
        let total_mb: u64 = self
            .smbios
            .memory_devices
            .iter()
            .filter_map(smbios::MemoryDevice::size_mb)
            .sum();

        let device = self
            .smbios
            .memory_devices
            .iter()
            .find(|d| d.is_populated())
            .ok_or_else(|| Error::io("no memory devices detected"))?;

        data.total_size = U32::new(total_mb as u32);
        data.speed = U32::new(u32::from(device.raw.speed.get()));
        data.mem_type = U32::new(u32::from(device.raw.memory_type));
        data.frequency = U32::new(u32::from(device.raw.clock_speed.get()));
        data.ecc_enabled = u8::from(self.syscfg.ecc_enabled()?);
        copy_cstr(&mut data.manufacturer, &device.manufacturer);
        data.voltage = U16::ZERO; // Deprecated
        Ok(())
    }
}

pub struct ProcessorInfoSource {
    smbios: Arc<SmBiosTable>,
    kernel: Arc<KernelStats>,
}

impl ProcessorInfoSource {
    pub fn new(smbios: Arc<SmBiosTable>, kernel: Arc<KernelStats>) -> Self {
        Self { smbios, kernel }
    }
}

impl Refresh for ProcessorInfoSource {
    type Payload = ProcessorInfo;

    fn refresh(&self, data: &mut ProcessorInfo) -> Result<()> {
        let procs = &self.smbios.processors;
        let first = procs
            .first()
            .ok_or_else(|| Error::internal("no processor record in firmware table"))?;

        let (stepping_id, model) = self.kernel.stepping_and_model()?;
        data.stepping_id = U32::new(stepping_id);
        data.model = U16::new(model);
        data.family = U16::new(u16::from(first.raw.processor_family));
        data.proc_type = U16::new(u16::from(first.raw.processor_type));

        // The host-side SDK resolves the stepping string from its own
        // sysfs; the card reports a placeholder.
        copy_cstr(&mut data.stepping, "unknown");

        // The firmware reports cores and threads per socket; divide the
        // totals to get threads per core.
        let enabled: u16 = procs.iter().map(|p| u16::from(p.raw.core_enabled)).sum();
        let threads: u16 = procs.iter().map(|p| u16::from(p.raw.thread_count)).sum();
        if enabled == 0 {
            return Err(Error::internal("firmware reports zero enabled cores"));
        }
        data.threads_per_core = (threads / enabled) as u8;
        Ok(())
    }
}

pub struct PthreshSource {
    pthresh: Arc<PowerThresholds>,
}

impl PthreshSource {
    pub fn new(pthresh: Arc<PowerThresholds>) -> Self {
        Self { pthresh }
    }
}

impl Refresh for PthreshSource {
    type Payload = PowerThresholdsInfo;

    fn refresh(&self, data: &mut PowerThresholdsInfo) -> Result<()> {
        data.max_phys_power = U32::new(self.pthresh.max_phys_power());
        data.low_threshold = U32::new(self.pthresh.low_threshold()?);
        data.hi_threshold = U32::new(self.pthresh.high_threshold()?);
        data.w0 = self.pthresh.window(0)?.info()?;
        data.w1 = self.pthresh.window(1)?.info()?;
        Ok(())
    }
}

pub struct TurboSource {
    turbo: Arc<TurboCtl>,
}

impl TurboSource {
    pub fn new(turbo: Arc<TurboCtl>) -> Self {
        Self { turbo }
    }
}

impl Refresh for TurboSource {
    type Payload = TurboInfo;

    fn refresh(&self, data: &mut TurboInfo) -> Result<()> {
        data.enabled = u8::from(self.turbo.is_enabled()?);
        data.turbo_pct = self.turbo.turbo_pct()?;
        Ok(())
    }
}

/// The core-usage group.  Its payload is a [`CoreUsageInfo`] header
/// followed by one [`CoreCounters`] per logical CPU, so the length depends
/// on topology and is fixed when the group is built.
pub struct CoreUsageGroup {
    kernel: Arc<KernelStats>,
    ttl: Duration,
    size: usize,
    state: Mutex<CoreUsageState>,
}

struct CoreUsageState {
    buf: Vec<u8>,
    last_refresh: Option<Instant>,
}

impl CoreUsageGroup {
    pub fn new(kernel: Arc<KernelStats>) -> Self {
        let size = core::mem::size_of::<CoreUsageInfo>()
            + kernel.logical_core_count() as usize * core::mem::size_of::<CoreCounters>();
        Self {
            kernel,
            ttl: Duration::from_millis(900),
            size,
            state: Mutex::new(CoreUsageState {
                buf: vec![0; size],
                last_refresh: None,
            }),
        }
    }

    fn refresh_locked(&self, state: &mut CoreUsageState) -> Result<()> {
        let (aggregate, per_cpu) = self.kernel.logical_core_usage()?;

        let counters = |c: &crate::sources::kernel::Counters| CoreCounters {
            user: U64::new(c.user),
            nice: U64::new(c.nice),
            system: U64::new(c.system),
            idle: U64::new(c.idle),
            total: U64::new(c.total),
        };

        let header = CoreUsageInfo {
            clocks_per_sec: U64::new(self.kernel.clocks_per_sec()),
            ticks: U64::new(aggregate.total),
            num_cores: U32::new(self.kernel.physical_core_count()),
            threads_per_core: U16::new(self.kernel.threads_per_core()),
            frequency: U32::new(self.kernel.cpu_frequency_mhz()?),
            sum: counters(&aggregate),
        };

        state.buf.clear();
        state.buf.extend_from_slice(header.as_bytes());
        for cpu in &per_cpu {
            state.buf.extend_from_slice(counters(cpu).as_bytes());
        }
        state.buf.resize(self.size, 0);
        state.last_refresh = Some(Instant::now());
        Ok(())
    }
}

impl DataGroup for CoreUsageGroup {
    fn size(&self) -> usize {
        self.size
    }

    fn raw(&self, force: bool) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let stale = match state.last_refresh {
            None => true,
            Some(at) => at.elapsed() >= self.ttl,
        };
        if force || stale {
            self.refresh_locked(&mut state)?;
        }
        Ok(state.buf.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testutil::Scratch;
    use smbios::{MemoryDevice, ProcessorInfo as SmbProcessor, SmBiosTable};
    use zerocopy::FromBytes;

    fn fake_smbios() -> Arc<SmBiosTable> {
        let mut table = SmBiosTable::default();
        let mut proc = SmbProcessor::default();
        proc.raw.voltage = 0x8b;
        proc.raw.current_speed = U16::new(1300);
        proc.raw.processor_family = 0xb3;
        proc.raw.processor_type = 3;
        proc.raw.core_enabled = 64;
        proc.raw.thread_count = 255; // firmware caps the byte
        table.processors.push(proc);

        let mut dev = MemoryDevice::default();
        dev.raw.size = U16::new(0x2000); // 8 GB, MB units
        dev.raw.speed = U16::new(2400);
        dev.raw.memory_type = 0x1a;
        dev.raw.clock_speed = U16::new(2133);
        dev.manufacturer = "TestMem".to_string();
        table.memory_devices.push(dev);
        Arc::new(table)
    }

    struct FixedSyscfg;

    impl Syscfg for FixedSyscfg {
        fn cluster_mode(&self) -> Result<systoolsd_api::Cluster> {
            Ok(systoolsd_api::Cluster::All2All)
        }
        fn ecc(&self) -> Result<systoolsd_api::Ecc> {
            Ok(systoolsd_api::Ecc::Enabled)
        }
        fn apei_support(&self) -> Result<bool> {
            Ok(false)
        }
        fn apei_ffm(&self) -> Result<bool> {
            Ok(false)
        }
        fn apei_einj(&self) -> Result<bool> {
            Ok(false)
        }
        fn apei_einjtable(&self) -> Result<bool> {
            Ok(false)
        }
        fn fwlock(&self) -> Result<bool> {
            Ok(false)
        }
        fn set_cluster_mode(&self, _: systoolsd_api::Cluster, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_ecc(&self, _: systoolsd_api::Ecc, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_apei_support(&self, _: bool, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_apei_ffm(&self, _: bool, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_apei_einj(&self, _: bool, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_apei_einjtable(&self, _: bool, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_fwlock(&self, _: bool, _: &str) -> Result<()> {
            Ok(())
        }
        fn change_password(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn memory_utilization_accounting() {
        let scratch = Scratch::new("meminfo");
        scratch.write(
            "meminfo",
            "MemTotal:        1048576 kB\n\
             MemFree:          524288 kB\n\
             Buffers:               0 kB\n\
             Cached:                0 kB\n\
             Slab:                  0 kB\n",
        );
        let source = MemoryUsageSource::new(scratch.path());
        let mut data = MemoryUsageInfo::default();
        source.refresh(&mut data).unwrap();
        assert_eq!(data.total.get(), 1_048_576);
        assert_eq!(data.used.get(), 524_288);
        assert_eq!(data.free.get(), 524_288);
        assert_eq!(data.buffers.get(), 0);
        assert_eq!(data.cached.get(), 0);
    }

    #[test]
    fn memory_utilization_cached_includes_slab() {
        let scratch = Scratch::new("meminfo-slab");
        scratch.write(
            "meminfo",
            "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 200 kB\nSlab: 25 kB\n",
        );
        let source = MemoryUsageSource::new(scratch.path());
        let mut data = MemoryUsageInfo::default();
        source.refresh(&mut data).unwrap();
        assert_eq!(data.cached.get(), 225);
        assert_eq!(data.used.get(), 1000 - 100 - 50 - 225);
    }

    #[test]
    fn memory_info_from_firmware_and_syscfg() {
        let source = MemoryInfoSource::new(fake_smbios(), Arc::new(FixedSyscfg));
        let mut data = MemoryInfo::default();
        source.refresh(&mut data).unwrap();
        assert_eq!(data.total_size.get(), 0x2000);
        assert_eq!(data.speed.get(), 2400);
        assert_eq!(data.frequency.get(), 2133);
        assert_eq!(data.mem_type.get(), 0x1a);
        assert_eq!(data.ecc_enabled, 1);
        assert_eq!(&data.manufacturer[..8], b"TestMem\0");
        assert_eq!(data.voltage.get(), 0);
    }

    #[test]
    fn processor_info_merges_cpuinfo_and_firmware() {
        let scratch = Scratch::new("procinfo");
        scratch.write(
            "cpuinfo",
            "processor\t: 0\nmodel\t\t: 133\nmodel name\t: x\nstepping\t: 7\n",
        );
        scratch.write("stat", "cpu 1 0 0 1\ncpu0 1 0 0 1\n");
        let kernel = Arc::new(KernelStats::new(scratch.path()).unwrap());
        let source = ProcessorInfoSource::new(fake_smbios(), kernel);
        let mut data = ProcessorInfo::default();
        source.refresh(&mut data).unwrap();
        assert_eq!(data.stepping_id.get(), 7);
        assert_eq!(data.model.get(), 133);
        assert_eq!(data.family.get(), 0xb3);
        assert_eq!(data.proc_type.get(), 3);
        assert_eq!(data.threads_per_core, (255 / 64) as u8);
        assert_eq!(&data.stepping[..8], b"unknown\0");
    }

    #[test]
    fn core_usage_payload_layout() {
        let scratch = Scratch::new("coreusage");
        scratch.write(
            "cpuinfo",
            "processor\t: 0\nmodel\t: 1\nstepping\t: 1\ncpu MHz\t\t: 1000.0\n\
             physical id\t: 0\ncore id\t: 0\n\n\
             processor\t: 1\nmodel\t: 1\nstepping\t: 1\ncpu MHz\t\t: 1000.0\n\
             physical id\t: 0\ncore id\t: 0\n",
        );
        scratch.write(
            "stat",
            "cpu  10 2 4 80 1 0 1 0 0 0\ncpu0 5 1 2 40 1 0 0 0 0 0\ncpu1 5 1 2 40 0 0 1 0 0 0\n",
        );
        let kernel = Arc::new(KernelStats::new(scratch.path()).unwrap());
        let group = CoreUsageGroup::new(Arc::clone(&kernel));

        let expected = core::mem::size_of::<CoreUsageInfo>()
            + 2 * core::mem::size_of::<CoreCounters>();
        assert_eq!(group.size(), expected);

        let bytes = group.raw(false).unwrap();
        assert_eq!(bytes.len(), expected);

        let (header, rest) = CoreUsageInfo::read_from_prefix(&bytes).unwrap();
        assert_eq!(header.num_cores.get(), 1);
        assert_eq!(header.threads_per_core.get(), 2);
        assert_eq!(header.frequency.get(), 1000);
        assert_eq!(header.ticks.get(), 98);
        assert_eq!(header.sum.user.get(), 10);
        assert_eq!(header.sum.idle.get(), 80);

        let (cpu0, rest) = CoreCounters::read_from_prefix(rest).unwrap();
        assert_eq!(cpu0.user.get(), 5);
        let (cpu1, rest) = CoreCounters::read_from_prefix(rest).unwrap();
        assert_eq!(cpu1.total.get(), 49);
        assert!(rest.is_empty());
    }

    #[test]
    fn version_group_reports_protocol() {
        let mut data = SystoolsdInfo::default();
        VersionSource.refresh(&mut data).unwrap();
        assert_eq!((data.major_ver, data.minor_ver), (2, 7));
    }
}
