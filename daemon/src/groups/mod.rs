// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data groups: typed, TTL-bounded caches keyed by request opcode.
//!
//! A group is *cold* until its first read, *fresh* while younger than its
//! TTL, and *stale* after; reading a cold or stale group refreshes it under
//! the group's mutex, so concurrent readers always observe a consistent
//! payload.  A TTL of zero means "static after first refresh".  Forced
//! refresh bypasses the age check but not the mutex.
//!
//! The concrete refreshers live in [`sensors`] (everything behind the SMBus
//! arbiter) and [`system`] (firmware tables, `/proc`, sysfs, `syscfg`).

pub mod sensors;
pub mod system;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use zerocopy::{Immutable, IntoBytes};

use systoolsd_api::Opcode;

use crate::error::Result;
use crate::services::Services;

/// The object-safe face of a group; what the dispatcher's generic read
/// handler works against.
pub trait DataGroup: Send + Sync {
    /// Payload length in bytes.  Fixed at construction, even for groups
    /// whose length depends on node configuration.
    fn size(&self) -> usize;

    /// The current payload bytes, refreshing first if the cache is cold or
    /// stale; `force` refreshes unconditionally.
    fn raw(&self, force: bool) -> Result<Vec<u8>>;

    fn force_refresh(&self) -> Result<()> {
        self.raw(true).map(|_| ())
    }

    /// Bounded copy; `size` carries the caller's capacity in and the
    /// payload's actual length out.
    fn copy_into(&self, buf: &mut [u8], size: &mut usize) -> Result<()> {
        let bytes = self.raw(false)?;
        let n = bytes.len().min(buf.len()).min(*size);
        buf[..n].copy_from_slice(&bytes[..n]);
        *size = bytes.len();
        Ok(())
    }
}

/// A source that knows how to fill in one payload struct.
pub trait Refresh: Send + Sync {
    type Payload: IntoBytes + Immutable + Default + Copy + Send;

    fn refresh(&self, payload: &mut Self::Payload) -> Result<()>;
}

struct CacheState<T> {
    payload: T,
    last_refresh: Option<Instant>,
}

/// TTL logic over any [`Refresh`] implementation.
pub struct Cached<R: Refresh> {
    ttl: Duration,
    refresher: R,
    state: Mutex<CacheState<R::Payload>>,
}

impl<R: Refresh> Cached<R> {
    pub fn new(ttl_ms: u64, refresher: R) -> Self {
        Self {
            ttl: Duration::from_millis(ttl_ms),
            refresher,
            state: Mutex::new(CacheState {
                payload: R::Payload::default(),
                last_refresh: None,
            }),
        }
    }

    /// A group that refreshes once and then never expires.
    pub fn static_group(refresher: R) -> Self {
        Self::new(0, refresher)
    }
}

impl<R: Refresh> DataGroup for Cached<R> {
    fn size(&self) -> usize {
        core::mem::size_of::<R::Payload>()
    }

    fn raw(&self, force: bool) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let stale = match state.last_refresh {
            None => true,
            Some(at) => !self.ttl.is_zero() && at.elapsed() >= self.ttl,
        };
        if force || stale {
            self.refresher.refresh(&mut state.payload)?;
            state.last_refresh = Some(Instant::now());
        }
        Ok(state.payload.as_bytes().to_vec())
    }
}

/// Group registry, keyed by the raw opcode the way requests arrive.
pub type GroupMap = HashMap<u16, Box<dyn DataGroup>>;

/// Builds every group the daemon serves, wired to the given services.
/// TTLs: sensor registers 300 ms, scheduler-derived counters 900 ms, the
/// arbiter's own busy state 100 ms, configuration-derived groups static.
pub fn build_groups(services: &Services) -> GroupMap {
    let mut groups: GroupMap = HashMap::new();
    let mut add = |op: Opcode, group: Box<dyn DataGroup>| {
        groups.insert(op as u16, group);
    };

    add(
        Opcode::GetSystoolsdInfo,
        Box::new(Cached::static_group(system::VersionSource)),
    );
    add(
        Opcode::GetMemoryUtilization,
        Box::new(Cached::new(
            900,
            system::MemoryUsageSource::new(services.kernel.proc_root()),
        )),
    );
    add(
        Opcode::GetCoresInfo,
        Box::new(Cached::static_group(system::CoresInfoSource::new(
            Arc::clone(&services.kernel),
            Arc::clone(&services.smbios),
        ))),
    );
    add(
        Opcode::GetCoreUsage,
        Box::new(system::CoreUsageGroup::new(Arc::clone(&services.kernel))),
    );
    add(
        Opcode::GetDeviceInfo,
        Box::new(Cached::static_group(system::DeviceInfoSource::new(
            Arc::clone(&services.i2c),
            Arc::clone(&services.smbios),
        ))),
    );
    add(
        Opcode::GetMemoryInfo,
        Box::new(Cached::static_group(system::MemoryInfoSource::new(
            Arc::clone(&services.smbios),
            Arc::clone(&services.syscfg),
        ))),
    );
    add(
        Opcode::GetProcessorInfo,
        Box::new(Cached::static_group(system::ProcessorInfoSource::new(
            Arc::clone(&services.smbios),
            Arc::clone(&services.kernel),
        ))),
    );
    add(
        Opcode::GetSmbaInfo,
        Box::new(Cached::new(
            100,
            sensors::SmbaSource::new(Arc::clone(&services.i2c)),
        )),
    );
    add(
        Opcode::GetPowerUsage,
        Box::new(Cached::new(
            300,
            sensors::PowerUsageSource::new(Arc::clone(&services.i2c)),
        )),
    );
    add(
        Opcode::GetThermalInfo,
        Box::new(Cached::new(
            300,
            sensors::ThermalSource::new(Arc::clone(&services.i2c)),
        )),
    );
    add(
        Opcode::GetVoltageInfo,
        Box::new(Cached::new(
            300,
            sensors::VoltageSource::new(Arc::clone(&services.i2c)),
        )),
    );
    add(
        Opcode::GetDiagnosticsInfo,
        Box::new(Cached::new(
            300,
            sensors::DiagnosticsSource::new(Arc::clone(&services.i2c)),
        )),
    );
    add(
        Opcode::GetFwUpdateInfo,
        Box::new(Cached::new(
            300,
            sensors::FwUpdateSource::new(Arc::clone(&services.i2c)),
        )),
    );
    add(
        Opcode::GetPthreshInfo,
        Box::new(Cached::new(
            300,
            system::PthreshSource::new(Arc::clone(&services.pthresh)),
        )),
    );
    add(
        Opcode::GetTurboInfo,
        Box::new(Cached::new(
            300,
            system::TurboSource::new(Arc::clone(&services.turbo)),
        )),
    );

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use systoolsd_api::TurboInfo;

    struct CountingSource {
        refreshes: Arc<AtomicUsize>,
    }

    impl Refresh for CountingSource {
        type Payload = TurboInfo;

        fn refresh(&self, payload: &mut TurboInfo) -> Result<()> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            payload.enabled = 1;
            payload.turbo_pct = n as u8;
            Ok(())
        }
    }

    fn counting_group(ttl_ms: u64) -> (Cached<CountingSource>, Arc<AtomicUsize>) {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let group = Cached::new(
            ttl_ms,
            CountingSource {
                refreshes: Arc::clone(&refreshes),
            },
        );
        (group, refreshes)
    }

    #[test]
    fn cold_then_fresh() {
        let (group, refreshes) = counting_group(10_000);
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
        let first = group.raw(false).unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        // Within the TTL, reads see identical bytes and no new refresh.
        for _ in 0..5 {
            assert_eq!(group.raw(false).unwrap(), first);
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_after_ttl() {
        let (group, refreshes) = counting_group(20);
        group.raw(false).unwrap();
        thread::sleep(Duration::from_millis(40));
        group.raw(false).unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn static_groups_never_expire() {
        let (group, refreshes) = counting_group(0);
        group.raw(false).unwrap();
        thread::sleep(Duration::from_millis(30));
        group.raw(false).unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_refresh_always_refreshes() {
        let (group, refreshes) = counting_group(0);
        group.raw(false).unwrap();
        group.force_refresh().unwrap();
        group.raw(true).unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn copy_into_reports_actual_size() {
        let (group, _) = counting_group(0);
        let mut buf = [0u8; 1];
        let mut size = buf.len();
        group.copy_into(&mut buf, &mut size).unwrap();
        assert_eq!(size, 2);
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn concurrent_readers_see_whole_payloads() {
        // Readers hammer a short-TTL group; every read must return a
        // payload whose two bytes are consistent (enabled always 1).
        let (group, _) = counting_group(1);
        let group = Arc::new(group);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let group = Arc::clone(&group);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let bytes = group.raw(false).unwrap();
                        assert_eq!(bytes.len(), 2);
                        assert_eq!(bytes[0], 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }
}
