// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixture: a daemon over the loopback transport with fake hardware
//! behind every service, plus a small wire-level client.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use drv_smc_i2c::{I2cIo, SmcBus, SMC_SLAVE_ADDR};
use smbios::{BiosInfo, MemoryDevice, ProcessorInfo as SmbProcessor, SmBiosTable, SystemInfo};
use systoolsd::daemon::{Daemon, DaemonConfig, DaemonControl};
use systoolsd::error::Result;
use systoolsd::services::Services;
use systoolsd::sources::{KernelStats, PowerThresholds, Syscfg, TurboCtl};
use systoolsd::transport::{Epd, LoopbackScif, PollEpd, PollEvents, PortId, ScifSocket};
use systoolsd_api::{Cluster, Ecc, Opcode, ReqHeader, REQ_HEADER_SIZE};
use zerocopy::{FromBytes, IntoBytes};

pub const TEST_PORT: u16 = 7777;

/// A fake SMC behind the arbiter: reads yield a pattern derived from the
/// register number, writes are recorded, and an optional per-transfer delay
/// keeps handlers in flight for the backpressure tests.
#[derive(Default)]
pub struct FakeSmc {
    pub writes: Mutex<Vec<(u8, Vec<u8>)>>,
    pub reads: AtomicUsize,
    pub delay: Option<Duration>,
}

impl FakeSmc {
    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

pub struct FakeSmcShim(pub Arc<FakeSmc>);

impl I2cIo for FakeSmcShim {
    fn open_adapter(&self, _adapter: u8) -> io::Result<i32> {
        Ok(3)
    }

    fn set_slave(&self, _fd: i32, addr: u8) -> io::Result<()> {
        assert_eq!(addr, SMC_SLAVE_ADDR);
        Ok(())
    }

    fn read_block(&self, _fd: i32, command: u8, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(delay) = self.0.delay {
            std::thread::sleep(delay);
        }
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = command.wrapping_add(i as u8);
        }
        Ok(buf.len())
    }

    fn write_block(&self, _fd: i32, command: u8, buf: &[u8]) -> io::Result<()> {
        if let Some(delay) = self.0.delay {
            std::thread::sleep(delay);
        }
        self.0.writes.lock().unwrap().push((command, buf.to_vec()));
        Ok(())
    }

    fn close_adapter(&self, _fd: i32) {}
}

/// Canned BIOS settings; set calls are recorded for assertions.
#[derive(Default)]
pub struct FakeSyscfg {
    pub sets: Mutex<Vec<String>>,
}

impl FakeSyscfg {
    fn record(&self, what: impl Into<String>) {
        self.sets.lock().unwrap().push(what.into());
    }

    pub fn recorded(&self) -> Vec<String> {
        self.sets.lock().unwrap().clone()
    }
}

impl Syscfg for FakeSyscfg {
    fn cluster_mode(&self) -> Result<Cluster> {
        Ok(Cluster::Quadrant)
    }
    fn ecc(&self) -> Result<Ecc> {
        Ok(Ecc::Enabled)
    }
    fn apei_support(&self) -> Result<bool> {
        Ok(true)
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
        Ok(true)
    }
    fn set_cluster_mode(&self, value: Cluster, pass: &str) -> Result<()> {
        self.record(format!("cluster={value:?} pass={pass}"));
        Ok(())
    }
    fn set_ecc(&self, value: Ecc, pass: &str) -> Result<()> {
        self.record(format!("ecc={value:?} pass={pass}"));
        Ok(())
    }
    fn set_apei_support(&self, on: bool, pass: &str) -> Result<()> {
        self.record(format!("apei_supp={on} pass={pass}"));
        Ok(())
    }
    fn set_apei_ffm(&self, on: bool, pass: &str) -> Result<()> {
        self.record(format!("apei_ffm={on} pass={pass}"));
        Ok(())
    }
    fn set_apei_einj(&self, on: bool, pass: &str) -> Result<()> {
        self.record(format!("apei_einj={on} pass={pass}"));
        Ok(())
    }
    fn set_apei_einjtable(&self, on: bool, pass: &str) -> Result<()> {
        self.record(format!("apei_einjtable={on} pass={pass}"));
        Ok(())
    }
    fn set_fwlock(&self, on: bool, pass: &str) -> Result<()> {
        self.record(format!("fwlock={on} pass={pass}"));
        Ok(())
    }
    fn change_password(&self, old: &str, new: &str) -> Result<()> {
        self.record(format!("passwd {old}->{new}"));
        Ok(())
    }
}

pub struct Scratch {
    pub root: PathBuf,
}

impl Scratch {
    pub fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "systoolsd-e2e-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel)).unwrap()
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn fake_smbios() -> SmBiosTable {
    let mut table = SmBiosTable::default();

    let mut bios = BiosInfo::default();
    bios.vendor = "TestVendor".to_string();
    bios.version = "GVPRCRB8.86B".to_string();
    bios.release_date = "01/02/2026".to_string();
    table.bios.push(bios);

    let mut system = SystemInfo::default();
    system.manufacturer = "Test Systems".to_string();
    system.raw.uuid = *b"0123456789abcdef";
    table.systems.push(system);

    let mut proc = SmbProcessor::default();
    proc.raw.voltage = 0x8b;
    proc.raw.current_speed = 1300.into();
    proc.raw.processor_family = 0xb3;
    proc.raw.processor_type = 3;
    proc.raw.core_enabled = 4;
    proc.raw.thread_count = 8;
    table.processors.push(proc);

    let mut dev = MemoryDevice::default();
    dev.raw.size = 0x2000.into();
    dev.raw.speed = 2400.into();
    dev.raw.memory_type = 0x1a;
    dev.raw.clock_speed = 2133.into();
    dev.manufacturer = "TestMem".to_string();
    table.memory_devices.push(dev);

    table
}

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
cpu MHz\t\t: 1000.000
physical id\t: 0
core id\t\t: 0
";

const STAT: &str = "\
cpu  8 1 4 100 2 0 1 0 0 0
cpu0 4 1 2 50 1 0 0 0 0 0
cpu1 4 0 2 50 1 0 1 0 0 0
";

/// The meminfo contents the memory-utilization assertions expect.
const MEMINFO: &str = "\
MemTotal:        1048576 kB
MemFree:          524288 kB
Buffers:               0 kB
Cached:                0 kB
Slab:                  0 kB
";

pub struct TestDaemon {
    pub scif: Arc<LoopbackScif>,
    pub control: DaemonControl,
    pub shutdown: Arc<AtomicBool>,
    pub smc: Arc<FakeSmc>,
    pub syscfg: Arc<FakeSyscfg>,
    pub proc: Scratch,
    pub rapl: Scratch,
    pub pstate: Scratch,
    thread: Option<JoinHandle<Result<()>>>,
}

impl TestDaemon {
    pub fn spawn() -> Self {
        Self::spawn_with(DaemonConfig {
            port: TEST_PORT,
            ..DaemonConfig::default()
        })
    }

    pub fn spawn_with(config: DaemonConfig) -> Self {
        Self::spawn_inner(config, None)
    }

    pub fn spawn_slow_smc(config: DaemonConfig, delay: Duration) -> Self {
        Self::spawn_inner(config, Some(delay))
    }

    fn spawn_inner(config: DaemonConfig, smc_delay: Option<Duration>) -> Self {
        let proc = Scratch::new("proc");
        proc.write("cpuinfo", CPUINFO);
        proc.write("stat", STAT);
        proc.write("meminfo", MEMINFO);

        let rapl = Scratch::new("rapl");
        rapl.write("max_power_range_uw", "258000000\n");
        rapl.write("constraint_0_power_limit_uw", "110000000\n");
        rapl.write("constraint_0_time_window_us", "976\n");
        rapl.write("constraint_1_power_limit_uw", "130000000\n");
        rapl.write("constraint_1_time_window_us", "1952\n");

        let pstate = Scratch::new("pstate");
        pstate.write("no_turbo", "0\n");
        pstate.write("turbo_pct", "33\n");

        let smc = Arc::new(FakeSmc {
            delay: smc_delay,
            ..FakeSmc::default()
        });
        let syscfg = Arc::new(FakeSyscfg::default());
        let syscfg_dyn: Arc<dyn Syscfg> = Arc::clone(&syscfg) as Arc<dyn Syscfg>;

        let services = Services {
            i2c: Arc::new(SmcBus::new(
                Box::new(FakeSmcShim(Arc::clone(&smc))),
                0,
            )),
            smbios: Arc::new(fake_smbios()),
            pthresh: Arc::new(PowerThresholds::new(rapl.path())),
            turbo: Arc::new(TurboCtl::new(pstate.path())),
            syscfg: syscfg_dyn,
            kernel: Arc::new(KernelStats::new(proc.path()).unwrap()),
        };

        let scif = Arc::new(LoopbackScif::new());
        let scif_dyn: Arc<dyn ScifSocket> = Arc::clone(&scif) as Arc<dyn ScifSocket>;
        let mut daemon = Daemon::new(scif_dyn, services, config).unwrap();
        daemon.start().unwrap();
        let control = daemon.control();
        let shutdown = daemon.shutdown_cell();
        let thread = std::thread::spawn(move || daemon.serve_forever());

        Self {
            scif,
            control,
            shutdown,
            smc,
            syscfg,
            proc,
            rapl,
            pstate,
            thread: Some(thread),
        }
    }

    /// True once `serve_forever` has returned on its own, within `timeout`.
    pub fn exited_within(&mut self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let finished = loop {
            let Some(thread) = self.thread.as_ref() else {
                break true;
            };
            if thread.is_finished() {
                break true;
            }
            if std::time::Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        if finished {
            if let Some(thread) = self.thread.take() {
                thread.join().unwrap().unwrap();
            }
        }
        finished
    }

    /// Stops the daemon and joins it, asserting a clean exit.
    pub fn shutdown(mut self) {
        self.control.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.control.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A wire-level client on the loopback transport.  The local port decides
/// the privilege the daemon grants: below 1024 is root.
pub struct Client {
    scif: Arc<LoopbackScif>,
    pub epd: Epd,
}

impl Client {
    pub fn connect(daemon: &TestDaemon, local_port: u16) -> Self {
        let scif = Arc::clone(&daemon.scif);
        let epd = scif.open().unwrap();
        scif.bind(epd, local_port).unwrap();
        scif.connect(epd, PortId::new(0, TEST_PORT)).unwrap();
        Self { scif, epd }
    }

    pub fn request(&self, op: Opcode) -> ReqHeader {
        ReqHeader::request(op)
    }

    pub fn send_header(&self, req: &ReqHeader) {
        self.send_bytes(req.as_bytes());
    }

    pub fn send_bytes(&self, bytes: &[u8]) {
        self.scif.send(self.epd, bytes).unwrap();
    }

    pub fn recv_header(&self) -> ReqHeader {
        let bytes = self.recv_exact(REQ_HEADER_SIZE);
        ReqHeader::read_from_bytes(&bytes).unwrap()
    }

    /// Blocking read of exactly `n` bytes; panics if the peer closes first.
    pub fn recv_exact(&self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        let got = self.scif.recv(self.epd, &mut buf, true).unwrap();
        assert_eq!(got, n, "peer closed mid-read");
        buf
    }

    /// One whole get round-trip: request, reply header, reply payload.
    pub fn get(&self, op: Opcode) -> (ReqHeader, Vec<u8>) {
        self.send_header(&self.request(op));
        let reply = self.recv_header();
        let payload = if reply.card_errno.get() == 0 {
            self.recv_exact(usize::from(reply.length.get()))
        } else {
            Vec::new()
        };
        (reply, payload)
    }

    /// True once the daemon has closed its side.
    pub fn saw_hangup(&self, wait: Duration) -> bool {
        let mut fds = [PollEpd::new(self.epd, PollEvents::IN)];
        self.scif.poll(&mut fds, Some(wait)).unwrap();
        fds[0].revents.contains(PollEvents::HUP) || fds[0].revents.contains(PollEvents::NVAL)
    }

    /// No unread reply bytes pending.
    pub fn idle(&self) -> bool {
        let mut fds = [PollEpd::new(self.epd, PollEvents::IN)];
        self.scif.poll(&mut fds, Some(Duration::from_millis(50))).unwrap();
        !fds[0].revents.contains(PollEvents::IN)
    }

    pub fn close(&self) {
        self.scif.close(self.epd);
    }
}
