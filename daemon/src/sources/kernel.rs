// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel counters: core topology from `/proc/cpuinfo`, usage counters from
//! `/proc/stat`.
//!
//! The physical-to-logical core mapping is computed once at construction;
//! topology does not change while the daemon runs, and the cores-info and
//! core-usage groups size their payloads from it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::sources::leading_number;

/// One row of `/proc/stat`, reduced to the counters the wire carries.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    /// Sum of every column on the line, including iowait/irq/steal time.
    pub total: u64,
}

pub struct KernelStats {
    proc_root: PathBuf,
    /// Physical core index -> logical CPU numbers.
    mapping: Vec<Vec<u16>>,
    logical_cpus: u32,
}

impl KernelStats {
    pub fn new(proc_root: impl Into<PathBuf>) -> Result<Self> {
        let proc_root = proc_root.into();
        let (mapping, logical_cpus) = map_physical_cores(&proc_root)?;
        Ok(Self {
            proc_root,
            mapping,
            logical_cpus,
        })
    }

    pub fn proc_root(&self) -> &std::path::Path {
        &self.proc_root
    }

    pub fn logical_core_count(&self) -> u32 {
        self.logical_cpus
    }

    pub fn physical_core_count(&self) -> u32 {
        self.mapping.len() as u32
    }

    pub fn threads_per_core(&self) -> u16 {
        (self.logical_core_count() / self.physical_core_count().max(1)) as u16
    }

    /// Scheduler tick rate, for converting the `/proc/stat` counters.
    pub fn clocks_per_sec(&self) -> u64 {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            ticks as u64
        } else {
            100
        }
    }

    /// Average of the `cpu MHz` lines.
    pub fn cpu_frequency_mhz(&self) -> Result<u32> {
        let path = self.proc_root.join("cpuinfo");
        let file =
            File::open(&path).map_err(|e| Error::io(format!("open {}: {e}", path.display())))?;
        let mut sum = 0f64;
        let mut count = 0u32;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::from)?;
            if let Some(value) = line.strip_prefix("cpu MHz") {
                if let Some(mhz) = value
                    .split(':')
                    .nth(1)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                {
                    sum += mhz;
                    count += 1;
                }
            }
        }
        if count == 0 {
            return Err(Error::io(format!("no cpu MHz lines in {}", path.display())));
        }
        Ok((sum / f64::from(count)) as u32)
    }

    /// The `stepping` and `model` numbers from `/proc/cpuinfo`.
    pub fn stepping_and_model(&self) -> Result<(u32, u16)> {
        let path = self.proc_root.join("cpuinfo");
        let file =
            File::open(&path).map_err(|e| Error::io(format!("open {}: {e}", path.display())))?;
        let mut stepping = None;
        let mut model = None;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::from)?;
            if line.starts_with("stepping") {
                stepping = stepping.or_else(|| leading_number(&line).map(|v| v as u32));
            } else if line.starts_with("model name") {
                // not a number we want
            } else if line.starts_with("model") {
                model = model.or_else(|| leading_number(&line).map(|v| v as u16));
            }
        }
        match (stepping, model) {
            (Some(s), Some(m)) => Ok((s, m)),
            _ => Err(Error::internal("stepping/model missing from cpuinfo")),
        }
    }

    /// Parses `/proc/stat`: the system-wide aggregate line plus one entry
    /// per logical CPU, in CPU order.
    pub fn logical_core_usage(&self) -> Result<(Counters, Vec<Counters>)> {
        let path = self.proc_root.join("stat");
        let file =
            File::open(&path).map_err(|e| Error::io(format!("open {}: {e}", path.display())))?;
        let mut lines = BufReader::new(file).lines();

        let aggregate_line = lines
            .next()
            .ok_or_else(|| Error::io("empty /proc/stat"))?
            .map_err(Error::from)?;
        let aggregate = parse_stat_line(&aggregate_line)
            .ok_or_else(|| Error::internal("malformed cpu aggregate line"))?;

        let mut per_cpu = Vec::with_capacity(self.logical_cpus as usize);
        for line in lines {
            let line = line.map_err(Error::from)?;
            if !line.starts_with("cpu") {
                break;
            }
            if let Some(counters) = parse_stat_line(&line) {
                per_cpu.push(counters);
            }
            if per_cpu.len() == self.logical_cpus as usize {
                break;
            }
        }
        Ok((aggregate, per_cpu))
    }
}

fn parse_stat_line(line: &str) -> Option<Counters> {
    let mut fields = line.split_whitespace();
    let label = fields.next()?;
    if !label.starts_with("cpu") {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    Some(Counters {
        user: values[0],
        nice: values[1],
        system: values[2],
        idle: values[3],
        total: values.iter().sum(),
    })
}

/// Builds the physical-core mapping from the `(physical id, core id)` pairs
/// in `/proc/cpuinfo`, collecting the logical CPUs that share each pair.
fn map_physical_cores(proc_root: &std::path::Path) -> Result<(Vec<Vec<u16>>, u32)> {
    let path = proc_root.join("cpuinfo");
    let file = File::open(&path).map_err(|e| Error::io(format!("open {}: {e}", path.display())))?;

    let mut cores: BTreeMap<(u16, u16), Vec<u16>> = BTreeMap::new();
    let mut current_cpu: Option<u16> = None;
    let mut physical_id: Option<u16> = None;
    let mut logical_cpus = 0u32;

    for line in BufReader::new(file).lines() {
        let line = line.map_err(Error::from)?;
        if line.starts_with("processor") {
            current_cpu = leading_number(&line).map(|v| v as u16);
            physical_id = None;
            logical_cpus += 1;
        } else if line.starts_with("physical id") {
            physical_id = leading_number(&line).map(|v| v as u16);
        } else if line.starts_with("core id") {
            let (Some(cpu), Some(phys), Some(core)) =
                (current_cpu, physical_id, leading_number(&line).map(|v| v as u16))
            else {
                continue;
            };
            cores.entry((phys, core)).or_default().push(cpu);
        }
    }

    if logical_cpus == 0 {
        return Err(Error::internal("no processors found in cpuinfo"));
    }
    // Some minimal cpuinfo layouts (single-core VMs) omit the topology
    // lines; fall back to one physical core per logical CPU.
    if cores.is_empty() {
        let mapping = (0..logical_cpus).map(|c| vec![c as u16]).collect();
        return Ok((mapping, logical_cpus));
    }
    Ok((cores.into_values().collect(), logical_cpus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testutil::Scratch;

    const CPUINFO: &str = "\
processor\t: 0
model\t\t: 133
model name\t: Intel(R) Genuine Processor
stepping\t: 7
cpu MHz\t\t: 1000.000
physical id\t: 0
core id\t\t: 0

processor\t: 1
model\t\t: 133
model name\t: Intel(R) Genuine Processor
stepping\t: 7
cpu MHz\t\t: 1200.000
physical id\t: 0
core id\t\t: 0

processor\t: 2
model\t\t: 133
model name\t: Intel(R) Genuine Processor
stepping\t: 7
cpu MHz\t\t: 1100.000
physical id\t: 0
core id\t\t: 1

processor\t: 3
model\t\t: 133
model name\t: Intel(R) Genuine Processor
stepping\t: 7
cpu MHz\t\t: 1100.000
physical id\t: 0
core id\t\t: 1
";

    const STAT: &str = "\
cpu  8 1 4 100 2 0 1 0 0 0
cpu0 2 0 1 25 1 0 0 0 0 0
cpu1 2 0 1 25 0 0 0 0 0 0
cpu2 2 1 1 25 1 0 1 0 0 0
cpu3 2 0 1 25 0 0 0 0 0 0
intr 12345
ctxt 999
";

    fn stats() -> (Scratch, KernelStats) {
        let scratch = Scratch::new("kernel");
        scratch.write("cpuinfo", CPUINFO);
        scratch.write("stat", STAT);
        let stats = KernelStats::new(scratch.path()).unwrap();
        (scratch, stats)
    }

    #[test]
    fn topology() {
        let (_scratch, stats) = stats();
        assert_eq!(stats.logical_core_count(), 4);
        assert_eq!(stats.physical_core_count(), 2);
        assert_eq!(stats.threads_per_core(), 2);
    }

    #[test]
    fn frequency_is_averaged() {
        let (_scratch, stats) = stats();
        assert_eq!(stats.cpu_frequency_mhz().unwrap(), 1100);
    }

    #[test]
    fn stepping_and_model_skip_model_name() {
        let (_scratch, stats) = stats();
        assert_eq!(stats.stepping_and_model().unwrap(), (7, 133));
    }

    #[test]
    fn stat_parsing() {
        let (_scratch, stats) = stats();
        let (aggregate, per_cpu) = stats.logical_core_usage().unwrap();
        assert_eq!(aggregate.user, 8);
        assert_eq!(aggregate.nice, 1);
        assert_eq!(aggregate.system, 4);
        assert_eq!(aggregate.idle, 100);
        assert_eq!(aggregate.total, 116);
        assert_eq!(per_cpu.len(), 4);
        assert_eq!(per_cpu[2].nice, 1);
        assert_eq!(per_cpu[2].total, 31);
    }

    #[test]
    fn flat_cpuinfo_without_topology() {
        let scratch = Scratch::new("kernel-flat");
        scratch.write("cpuinfo", "processor\t: 0\nmodel\t: 1\nstepping\t: 2\n");
        scratch.write("stat", "cpu 1 0 0 1 0\ncpu0 1 0 0 1 0\n");
        let stats = KernelStats::new(scratch.path()).unwrap();
        assert_eq!(stats.logical_core_count(), 1);
        assert_eq!(stats.physical_core_count(), 1);
        assert_eq!(stats.threads_per_core(), 1);
    }
}
