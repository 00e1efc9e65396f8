// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialized access to the card's SMC over SMBus
//!
//! The SMC sits behind a single I2C adapter, and every sensor group as well
//! as the raw register handlers read it through this crate.  [`SmcBus`] is
//! the arbiter: it owns the bus mutex, the validity flag, and the
//! "retraining" busy window, and it is the only party that issues bus
//! transactions.
//!
//! The fd-level side channel is behind the [`I2cIo`] trait so tests can
//! substitute a fake device; [`LinuxI2c`] is the real thing, driving
//! `/dev/i2c-N` with the `I2C_SLAVE` and `I2C_SMBUS` ioctls.
//!
//! Every public read/write follows the same sequence: check validity, check
//! the busy window (clearing it lazily once it has elapsed), then perform
//! open-adapter / set-slave / block-transfer / close-adapter under the bus
//! mutex.  32-bit register reads assemble their value little-endian.

use std::io;
use std::sync::Mutex;
use std::time::Instant;

use log::{debug, info};

/// SMBus block transfers carry at most this many bytes.
pub const SMBUS_BLOCK_MAX: usize = 32;

/// Writing a slave address here kicks off SMBus retraining.
const SMBA_RESTART_REG: u8 = 0x17;

/// Default length of the busy window after a retraining request.
pub const DEFAULT_RESTART_WAIT_MS: u32 = 5000;

/// The SMC answers reads and writes at this slave address.
pub const SMC_SLAVE_ADDR: u8 = 0x28;

#[derive(Debug)]
pub enum SmcError {
    /// The arbiter was constructed without a working side channel; every
    /// access fails until the daemon is restarted with one.
    NotReady,
    /// Retraining is in progress; retry after the indicated time.
    DeviceBusy { remaining_ms: u32 },
    /// A second retraining was requested while one is pending.
    RestartInProgress,
    /// The adapter could not be opened or addressed.
    Adapter(io::Error),
    /// The device did not complete the transfer.
    Transfer(io::Error),
}

impl std::fmt::Display for SmcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmcError::NotReady => write!(f, "no i2c access"),
            SmcError::DeviceBusy { remaining_ms } => {
                write!(f, "device busy for another {remaining_ms} ms")
            }
            SmcError::RestartInProgress => write!(f, "restart in progress"),
            SmcError::Adapter(e) => write!(f, "adapter error: {e}"),
            SmcError::Transfer(e) => write!(f, "transfer error: {e}"),
        }
    }
}

impl std::error::Error for SmcError {}

pub type Result<T> = std::result::Result<T, SmcError>;

/// The raw adapter operations.  `open_adapter` yields a descriptor that the
/// remaining calls consume; implementations choose what the descriptor
/// means.
pub trait I2cIo: Send + Sync {
    fn open_adapter(&self, adapter: u8) -> io::Result<i32>;
    fn set_slave(&self, fd: i32, addr: u8) -> io::Result<()>;
    /// Reads `buf.len()` bytes of register `command`; returns bytes read.
    fn read_block(&self, fd: i32, command: u8, buf: &mut [u8]) -> io::Result<usize>;
    fn write_block(&self, fd: i32, command: u8, buf: &[u8]) -> io::Result<()>;
    fn close_adapter(&self, fd: i32);
}

/// `/dev/i2c-N` via the kernel's i2c-dev interface.
pub struct LinuxI2c;

// From <linux/i2c-dev.h> and <linux/i2c.h>.
const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_SMBUS: libc::c_ulong = 0x0720;
const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;

/// Block union member: one length byte plus the payload, padded the way the
/// kernel expects.
#[repr(C)]
struct I2cSmbusData {
    block: [u8; SMBUS_BLOCK_MAX + 2],
}

#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut I2cSmbusData,
}

impl I2cIo for LinuxI2c {
    fn open_adapter(&self, adapter: u8) -> io::Result<i32> {
        let path = format!("/dev/i2c-{adapter}\0");
        let fd = unsafe { libc::open(path.as_ptr().cast(), libc::O_RDWR) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn set_slave(&self, fd: i32, addr: u8) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(fd, I2C_SLAVE, libc::c_long::from(addr)) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_block(&self, fd: i32, command: u8, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(SMBUS_BLOCK_MAX);
        let mut data = I2cSmbusData {
            block: [0; SMBUS_BLOCK_MAX + 2],
        };
        data.block[0] = len as u8;
        let mut msg = I2cSmbusIoctlData {
            read_write: I2C_SMBUS_READ,
            command,
            size: I2C_SMBUS_I2C_BLOCK_DATA,
            data: &mut data,
        };
        let rc = unsafe { libc::ioctl(fd, I2C_SMBUS, &mut msg) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let got = usize::from(data.block[0]).min(len);
        buf[..got].copy_from_slice(&data.block[1..1 + got]);
        Ok(got)
    }

    fn write_block(&self, fd: i32, command: u8, buf: &[u8]) -> io::Result<()> {
        let len = buf.len().min(SMBUS_BLOCK_MAX);
        let mut data = I2cSmbusData {
            block: [0; SMBUS_BLOCK_MAX + 2],
        };
        data.block[0] = len as u8;
        data.block[1..1 + len].copy_from_slice(&buf[..len]);
        let mut msg = I2cSmbusIoctlData {
            read_write: I2C_SMBUS_WRITE,
            command,
            size: I2C_SMBUS_I2C_BLOCK_DATA,
            data: &mut data,
        };
        let rc = unsafe { libc::ioctl(fd, I2C_SMBUS, &mut msg) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close_adapter(&self, fd: i32) {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Result of a busy-window query.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BusyInfo {
    pub is_busy: bool,
    pub remaining_ms: u32,
}

impl BusyInfo {
    const IDLE: Self = Self {
        is_busy: false,
        remaining_ms: 0,
    };
}

struct BusyState {
    busy: bool,
    since: Instant,
}

/// The arbiter.  Clone an `Arc<SmcBus>` anywhere SMC access is needed.
pub struct SmcBus {
    io: Box<dyn I2cIo>,
    adapter: u8,
    slave: u8,
    valid: bool,
    wait_ms: u32,
    /// Held for the duration of one register transaction.
    bus: Mutex<()>,
    /// Held only to inspect or flip the busy window.
    busy: Mutex<BusyState>,
}

impl SmcBus {
    pub fn new(io: Box<dyn I2cIo>, adapter: u8) -> Self {
        Self {
            io,
            adapter,
            slave: SMC_SLAVE_ADDR,
            valid: true,
            wait_ms: DEFAULT_RESTART_WAIT_MS,
            bus: Mutex::new(()),
            busy: Mutex::new(BusyState {
                busy: false,
                since: Instant::now(),
            }),
        }
    }

    /// An arbiter with no side channel; every access reports
    /// [`SmcError::NotReady`].  Lets the daemon come up and serve the
    /// non-sensor groups on boards where the adapter is absent.
    pub fn invalid() -> Self {
        let mut bus = Self::new(Box::new(LinuxI2c), 0);
        bus.valid = false;
        bus
    }

    /// Overrides the retraining window length.
    pub fn with_wait_ms(mut self, wait_ms: u32) -> Self {
        self.wait_ms = wait_ms;
        self
    }

    /// Claims the bus for a run of back-to-back register operations.  The
    /// sensor groups use this so one refresh appears atomic to any other
    /// refresh; single-register callers can use the direct methods below.
    pub fn lock(&self) -> Result<BusTransaction<'_>> {
        self.check_available()?;
        Ok(BusTransaction {
            bus: self,
            _guard: self.bus.lock().unwrap(),
        })
    }

    pub fn read_bytes(&self, command: u8, buf: &mut [u8]) -> Result<usize> {
        self.lock()?.read_bytes(command, buf)
    }

    pub fn write_bytes(&self, command: u8, buf: &[u8]) -> Result<()> {
        self.lock()?.write_bytes(command, buf)
    }

    pub fn read_u32(&self, command: u8) -> Result<u32> {
        self.lock()?.read_u32(command)
    }

    pub fn write_u32(&self, command: u8, value: u32) -> Result<()> {
        self.lock()?.write_u32(command, value)
    }

    /// Kicks off SMBus retraining by writing the (opaque) slave address
    /// byte to the restart register, then opens the busy window.  Globally
    /// serialized: a second request while the window is open fails with
    /// [`SmcError::RestartInProgress`].
    pub fn restart_device(&self, addr: u8) -> Result<()> {
        if !self.valid {
            return Err(SmcError::NotReady);
        }
        let mut busy = self.busy.lock().unwrap();
        if Self::update_window(&mut busy, self.wait_ms).is_busy {
            return Err(SmcError::RestartInProgress);
        }
        {
            // busy-before-bus is the one place both locks are held; every
            // other path releases the busy lock before touching the bus.
            let _bus = self.bus.lock().unwrap();
            self.transact(|io, fd| io.write_block(fd, SMBA_RESTART_REG, &addr.to_le_bytes()))?;
        }
        busy.busy = true;
        busy.since = Instant::now();
        info!("SMBus retraining started, window {} ms", self.wait_ms);
        Ok(())
    }

    /// Queries the busy window, clearing it if it has elapsed.
    pub fn is_device_busy(&self) -> BusyInfo {
        let mut busy = self.busy.lock().unwrap();
        Self::update_window(&mut busy, self.wait_ms)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn update_window(state: &mut BusyState, wait_ms: u32) -> BusyInfo {
        if !state.busy {
            return BusyInfo::IDLE;
        }
        let elapsed = state.since.elapsed().as_millis();
        if elapsed >= u128::from(wait_ms) {
            debug!("SMBus retraining window elapsed");
            state.busy = false;
            return BusyInfo::IDLE;
        }
        BusyInfo {
            is_busy: true,
            remaining_ms: wait_ms - elapsed as u32,
        }
    }

    fn check_available(&self) -> Result<()> {
        if !self.valid {
            return Err(SmcError::NotReady);
        }
        let info = self.is_device_busy();
        if info.is_busy {
            return Err(SmcError::DeviceBusy {
                remaining_ms: info.remaining_ms,
            });
        }
        Ok(())
    }

    /// One open/set-slave/transfer/close cycle.  The caller holds the bus
    /// mutex.
    fn transact<T>(
        &self,
        op: impl FnOnce(&dyn I2cIo, i32) -> io::Result<T>,
    ) -> Result<T> {
        let fd = self
            .io
            .open_adapter(self.adapter)
            .map_err(SmcError::Adapter)?;
        let result = self
            .io
            .set_slave(fd, self.slave)
            .map_err(SmcError::Adapter)
            .and_then(|()| op(self.io.as_ref(), fd).map_err(SmcError::Transfer));
        self.io.close_adapter(fd);
        result
    }
}

/// Exclusive use of the bus for several register operations in a row.
pub struct BusTransaction<'a> {
    bus: &'a SmcBus,
    _guard: std::sync::MutexGuard<'a, ()>,
}

impl BusTransaction<'_> {
    pub fn read_bytes(&self, command: u8, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().min(SMBUS_BLOCK_MAX);
        self.bus
            .transact(|io, fd| io.read_block(fd, command, &mut buf[..len]))
    }

    pub fn write_bytes(&self, command: u8, buf: &[u8]) -> Result<()> {
        let len = buf.len().min(SMBUS_BLOCK_MAX);
        self.bus
            .transact(|io, fd| io.write_block(fd, command, &buf[..len]))
    }

    pub fn read_u32(&self, command: u8) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(command, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, command: u8, value: u32) -> Result<()> {
        self.write_bytes(command, &value.to_le_bytes())
    }
}
