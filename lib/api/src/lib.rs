// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol for the card telemetry daemon
//!
//! Everything a client and the daemon exchange is described here: the fixed
//! 28-byte request header, the opcode catalog, the error numbers carried in
//! `card_errno`, and the payload structure for every "get" group.
//!
//! All on-wire records are byte-exact and little-endian.  Multi-byte fields
//! use the `zerocopy` byteorder types, which have alignment 1; combined with
//! `repr(C)` this makes padding impossible, so the in-memory representation
//! *is* the wire representation.  Conversions to and from host integers
//! happen at field access, never at framing.

#![forbid(unsafe_code)]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

pub use num_traits::FromPrimitive;

/// Protocol version advertised in [`SystoolsdInfo`].
pub const PROTOCOL_MAJOR: u8 = 2;
pub const PROTOCOL_MINOR: u8 = 7;

/// Port the daemon listens on.
pub const SYSTOOLSD_PORT: u16 = SCIF_BT_PORT_0;
pub const SCIF_BT_PORT_0: u16 = 65000;

/// Peer ports below this value can only be bound by root on the host side;
/// the daemon treats them as carrying admin privilege.
pub const SCIF_ADMIN_PORT_END: u16 = 1024;

/// First port handed out for anonymous binds (`bind(0)`).
pub const SCIF_PORT_RSVD: u16 = 1088;

/// Inline payload capacity of the request header.
pub const REQUEST_MAX_DATA_LEN: usize = 16;

/// Milliseconds the SMBus stays unavailable after a retraining request.
pub const SMBA_RESTART_WAIT_MS: u32 = 5000;

/// High bit of `req_type` marks a "set" request.
pub const SET_REQUEST_MASK: u16 = 1 << 7;

/// The request opcodes.  Gets occupy `0x01..=0x11`; sets carry
/// [`SET_REQUEST_MASK`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    GetSystoolsdInfo = 0x01,
    GetMemoryUtilization = 0x02,
    GetDeviceInfo = 0x03,
    GetPowerUsage = 0x04,
    GetThermalInfo = 0x05,
    GetVoltageInfo = 0x06,
    GetDiagnosticsInfo = 0x07,
    GetFwUpdateInfo = 0x08,
    GetMemoryInfo = 0x09,
    GetProcessorInfo = 0x0a,
    GetCoresInfo = 0x0b,
    GetCoreUsage = 0x0c,
    GetPthreshInfo = 0x0d,
    GetSmbaInfo = 0x0e,
    GetTurboInfo = 0x0f,
    ReadSmcReg = 0x10,
    MicBios = 0x11,

    /// Deprecated; never serviced, kept so the value is not reused.
    SetForceThrottle = SET_REQUEST_MASK | 0x01,
    SetPwmAdder = SET_REQUEST_MASK | 0x02,
    SetLedBlink = SET_REQUEST_MASK | 0x03,
    SetPthreshW0 = SET_REQUEST_MASK | 0x04,
    SetPthreshW1 = SET_REQUEST_MASK | 0x05,
    SetTurbo = SET_REQUEST_MASK | 0x06,
    RestartSmba = SET_REQUEST_MASK | 0x07,
    WriteSmcReg = SET_REQUEST_MASK | 0x08,
}

impl Opcode {
    pub fn is_set(self) -> bool {
        (self as u16) & SET_REQUEST_MASK != 0
    }
}

/// Error numbers carried in the `card_errno` field of a reply header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum Errno {
    Unknown = 0x01,
    UnsupportedReq = 0x02,
    InvalStruct = 0x03,
    InvalArgument = 0x04,
    TooBusy = 0x05,
    InsufficientPrivileges = 0x06,
    DeviceBusy = 0x07,
    RestartInProgress = 0x08,
    SmcError = 0x09,
    IoError = 0x0a,
    InternalError = 0x0b,
    ScifError = 0x0c,
}

/// The fixed request/reply header.  Requests carry `card_errno == 0`;
/// replies echo `req_type` and report the outcome in `card_errno`.  `extra`
/// and `data` are opcode-specific.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct ReqHeader {
    pub req_type: U16,
    pub length: U16,
    pub card_errno: U16,
    pub extra: U32,
    pub data: [u8; REQUEST_MAX_DATA_LEN],
    pub reserved: U16,
}

pub const REQ_HEADER_SIZE: usize = core::mem::size_of::<ReqHeader>();
const_assert_eq!(REQ_HEADER_SIZE, 28);

impl ReqHeader {
    pub fn request(op: Opcode) -> Self {
        Self {
            req_type: U16::new(op as u16),
            length: U16::ZERO,
            card_errno: U16::ZERO,
            extra: U32::ZERO,
            data: [0; REQUEST_MAX_DATA_LEN],
            reserved: U16::ZERO,
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16(self.req_type.get())
    }

    pub fn is_set_request(&self) -> bool {
        self.req_type.get() & SET_REQUEST_MASK != 0
    }

    /// First four bytes of `data` as a host integer; the inline value every
    /// generic set request carries.
    pub fn data_u32(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }
}

//
// "Get" payloads.  Field order and width follow the published client ABI;
// fields marked deprecated are always zero and must not be repurposed.
//

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct SystoolsdInfo {
    pub major_ver: u8,
    pub minor_ver: u8,
}
const_assert_eq!(core::mem::size_of::<SystoolsdInfo>(), 2);

/// Accounting follows `free` from procps: `cached` includes `Slab`, and
/// `used` is what remains of `total` after free, buffers, and cached.
/// All values in kB.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct MemoryUsageInfo {
    pub total: U32,
    pub used: U32,
    pub free: U32,
    pub buffers: U32,
    pub cached: U32,
}
const_assert_eq!(core::mem::size_of::<MemoryUsageInfo>(), 20);

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct DeviceInfo {
    pub card_tdp: U32,
    pub fwu_cap: U32,
    pub cpu_id: U32,
    pub pci_smba: U32,
    pub fw_version: U32,
    pub exe_domain: U32,
    pub sts_selftest: U32,
    pub boot_fw_version: U32,
    pub hw_revision: U32,
    pub os_version: [u8; 64],
    pub bios_version: [u8; 64],
    pub bios_release_date: [u8; 64],
    pub uuid: [u8; 16],
    pub part_number: [u8; 16],
    pub manufacture_date: [u8; 6],
    pub serialno: [u8; 12],
}
const_assert_eq!(core::mem::size_of::<DeviceInfo>(), 278);

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct PowerUsageInfo {
    pub pwr_pcie: U32,
    pub pwr_2x3: U32,
    pub pwr_2x4: U32,
    pub force_throttle: U32,
    pub avg_power_0: U32,
    pub inst_power: U32,
    pub inst_power_max: U32,
    pub power_vccp: U32,
    pub power_vccu: U32,
    pub power_vccclr: U32,
    pub power_vccmlb: U32,
    /// Deprecated
    pub power_vccd012: U32,
    /// Deprecated
    pub power_vccd345: U32,
    pub power_vccmp: U32,
    pub power_ntb1: U32,
}
const_assert_eq!(core::mem::size_of::<PowerUsageInfo>(), 60);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ThermalInfo {
    pub temp_cpu: U32,
    pub temp_exhaust: U32,
    /// Deprecated
    pub temp_inlet: U32,
    pub temp_vccp: U32,
    pub temp_vccclr: U32,
    pub temp_vccmp: U32,
    /// Deprecated
    pub temp_mid: U32,
    pub temp_west: U32,
    pub temp_east: U32,
    pub fan_tach: U32,
    pub fan_pwm: U32,
    pub fan_pwm_adder: U32,
    pub tcritical: U32,
    pub tcontrol: U32,
    /// Deprecated
    pub thermal_throttle_duration: U32,
    /// Deprecated
    pub thermal_throttle: U32,
}
const_assert_eq!(core::mem::size_of::<ThermalInfo>(), 64);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct VoltageInfo {
    pub voltage_vccp: U32,
    pub voltage_vccu: U32,
    pub voltage_vccclr: U32,
    pub voltage_vccmlb: U32,
    /// Deprecated
    pub voltage_vccp012: U32,
    /// Deprecated
    pub voltage_vccp345: U32,
    pub voltage_vccmp: U32,
    pub voltage_ntb1: U32,
    pub voltage_vccpio: U32,
    pub voltage_vccsfr: U32,
    pub voltage_pch: U32,
    pub voltage_vccmfuse: U32,
    pub voltage_ntb2: U32,
    pub voltage_vpp: U32,
}
const_assert_eq!(core::mem::size_of::<VoltageInfo>(), 56);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct DiagnosticsInfo {
    pub led_blink: U32,
}
const_assert_eq!(core::mem::size_of::<DiagnosticsInfo>(), 4);

/// Raw firmware-update status and command registers; bit semantics belong to
/// the SMC and are passed through untouched.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct FwUpdateInfo {
    pub fwu_sts: U32,
    pub fwu_cmd: U32,
}
const_assert_eq!(core::mem::size_of::<FwUpdateInfo>(), 8);

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct MemoryInfo {
    pub total_size: U32,
    pub speed: U32,
    pub frequency: U32,
    pub mem_type: U32,
    pub ecc_enabled: u8,
    pub manufacturer: [u8; 64],
    /// Deprecated
    pub voltage: U16,
}
const_assert_eq!(core::mem::size_of::<MemoryInfo>(), 83);

impl Default for MemoryInfo {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ProcessorInfo {
    pub stepping_id: U32,
    pub model: U16,
    pub family: U16,
    pub proc_type: U16,
    pub threads_per_core: u8,
    pub stepping: [u8; 16],
}
const_assert_eq!(core::mem::size_of::<ProcessorInfo>(), 27);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct CoresInfo {
    pub num_cores: U32,
    pub cores_freq: U32,
    pub clocks_per_sec: U32,
    pub threads_per_core: U32,
    pub cores_voltage: u8,
}
const_assert_eq!(core::mem::size_of::<CoresInfo>(), 17);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct CoreCounters {
    pub user: U64,
    pub nice: U64,
    pub system: U64,
    pub idle: U64,
    pub total: U64,
}
const_assert_eq!(core::mem::size_of::<CoreCounters>(), 40);

/// Header of the core-usage payload; followed on the wire by one
/// [`CoreCounters`] per logical CPU.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct CoreUsageInfo {
    pub clocks_per_sec: U64,
    pub ticks: U64,
    pub num_cores: U32,
    pub threads_per_core: U16,
    pub frequency: U32,
    pub sum: CoreCounters,
}
const_assert_eq!(core::mem::size_of::<CoreUsageInfo>(), 66);

/// Body of the power-threshold set handshake.  A field holding `u32::MAX`
/// means "leave unchanged".
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct PowerWindowInfo {
    pub threshold: U32,
    pub time_window: U32,
}
const_assert_eq!(core::mem::size_of::<PowerWindowInfo>(), 8);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct PowerThresholdsInfo {
    pub max_phys_power: U32,
    pub low_threshold: U32,
    pub hi_threshold: U32,
    pub w0: PowerWindowInfo,
    pub w1: PowerWindowInfo,
}
const_assert_eq!(core::mem::size_of::<PowerThresholdsInfo>(), 28);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct SmbaInfo {
    pub is_busy: u8,
    pub ms_remaining: U32,
}
const_assert_eq!(core::mem::size_of::<SmbaInfo>(), 5);

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct TurboInfo {
    pub enabled: u8,
    pub turbo_pct: u8,
}
const_assert_eq!(core::mem::size_of::<TurboInfo>(), 2);

//
// BIOS settings sub-protocol (opcode 0x11).
//

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum MicBiosCmd {
    Read = 0,
    Write = 1,
    ChangePass = 2,
}

bitflags! {
    /// Property-select bits in `MicBiosRequest::prop`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MicBiosProp: u8 {
        const CLUSTER = 0x01;
        const ECC = 0x02;
        const APEI_SUPP = 0x04;
        const APEI_FFM = 0x08;
        const APEI_EINJ = 0x10;
        const APEI_EINJTABLE = 0x20;
        const FWLOCK = 0x40;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Cluster {
    All2All = 0,
    Snc2 = 1,
    Snc4 = 2,
    Hemisphere = 3,
    Quadrant = 4,
    Auto = 5,
}

impl Cluster {
    pub const MAX: u8 = 6;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Ecc {
    Disabled = 0,
    Enabled = 1,
    Auto = 2,
}

impl Ecc {
    pub const MAX: u8 = 3;
}

/// Two-state settings (APEI support/FFM/EInj/EInj-table, fwlock) all encode
/// 0 = disabled, 1 = enabled; their range limit is shared.
pub const TWO_STATE_MAX: u8 = 2;

/// The BIOS request body.  The C ABI declares the payload as a union of a
/// `u64` and a bitfield struct; the bit positions below reproduce the
/// original compiler's LSB-first allocation in byte-sized units.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct MicBiosRequest {
    pub cmd: u8,
    pub prop: u8,
    pub value: U64,
}
const_assert_eq!(core::mem::size_of::<MicBiosRequest>(), 10);

impl MicBiosRequest {
    pub fn settings(&self) -> MicBiosSettings {
        MicBiosSettings(self.value.get())
    }

    pub fn set_settings(&mut self, settings: MicBiosSettings) {
        self.value = U64::new(settings.0);
    }
}

/// Accessors over the settings bitfield: byte 0 holds cluster (4 bits) and
/// ecc (3 bits); byte 1 holds the four 2-bit APEI fields; byte 2 holds
/// fwlock (2 bits).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MicBiosSettings(pub u64);

macro_rules! settings_field {
    ($get:ident, $set:ident, $shift:expr, $width:expr) => {
        pub fn $get(&self) -> u8 {
            ((self.0 >> $shift) & ((1 << $width) - 1)) as u8
        }

        pub fn $set(&mut self, v: u8) {
            let mask = ((1u64 << $width) - 1) << $shift;
            self.0 = (self.0 & !mask) | ((u64::from(v) << $shift) & mask);
        }
    };
}

impl MicBiosSettings {
    settings_field!(cluster, set_cluster, 0, 4);
    settings_field!(ecc, set_ecc, 4, 3);
    settings_field!(apei_supp, set_apei_supp, 8, 2);
    settings_field!(apei_einj, set_apei_einj, 10, 2);
    settings_field!(apei_ffm, set_apei_ffm, 12, 2);
    settings_field!(apei_einjtable, set_apei_einjtable, 14, 2);
    settings_field!(fwlock, set_fwlock, 16, 2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn header_layout() {
        let mut hdr = ReqHeader::request(Opcode::GetSystoolsdInfo);
        hdr.length = U16::new(0x0201);
        hdr.card_errno = U16::new(0x0403);
        hdr.extra = U32::new(0x0807_0605);
        hdr.data[0] = 0xaa;
        hdr.data[15] = 0xbb;

        let bytes = hdr.as_bytes();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..2], &[0x01, 0x00]);
        assert_eq!(&bytes[2..4], &[0x01, 0x02]);
        assert_eq!(&bytes[4..6], &[0x03, 0x04]);
        assert_eq!(&bytes[6..10], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(bytes[10], 0xaa);
        assert_eq!(bytes[27], 0xbb);

        let (back, rest) = ReqHeader::read_from_prefix(bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(back, hdr);
    }

    #[test]
    fn payload_sizes_match_lengths_on_the_wire() {
        // These are the `length` values clients expect in reply headers.
        assert_eq!(core::mem::size_of::<SystoolsdInfo>(), 2);
        assert_eq!(core::mem::size_of::<MemoryUsageInfo>(), 20);
        assert_eq!(core::mem::size_of::<DeviceInfo>(), 278);
        assert_eq!(core::mem::size_of::<PowerUsageInfo>(), 60);
        assert_eq!(core::mem::size_of::<ThermalInfo>(), 64);
        assert_eq!(core::mem::size_of::<VoltageInfo>(), 56);
        assert_eq!(core::mem::size_of::<MemoryInfo>(), 83);
        assert_eq!(core::mem::size_of::<ProcessorInfo>(), 27);
        assert_eq!(core::mem::size_of::<CoresInfo>(), 17);
        assert_eq!(core::mem::size_of::<CoreUsageInfo>(), 66);
        assert_eq!(core::mem::size_of::<PowerThresholdsInfo>(), 28);
        assert_eq!(core::mem::size_of::<SmbaInfo>(), 5);
        assert_eq!(core::mem::size_of::<TurboInfo>(), 2);
        assert_eq!(core::mem::size_of::<MicBiosRequest>(), 10);
    }

    #[test]
    fn memory_usage_encoding() {
        let info = MemoryUsageInfo {
            total: U32::new(1_048_576),
            used: U32::new(524_288),
            free: U32::new(524_288),
            buffers: U32::ZERO,
            cached: U32::ZERO,
        };
        let bytes = info.as_bytes();
        assert_eq!(&bytes[0..4], &1_048_576u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &524_288u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &[0; 4]);
    }

    #[test]
    fn opcode_round_trip() {
        for raw in 0x01..=0x11u16 {
            let op = Opcode::from_u16(raw).unwrap();
            assert_eq!(op as u16, raw);
            assert!(!op.is_set());
        }
        for raw in 0x81..=0x88u16 {
            let op = Opcode::from_u16(raw).unwrap();
            assert_eq!(op as u16, raw);
            assert!(op.is_set());
        }
        assert_eq!(Opcode::from_u16(0x12), None);
        assert_eq!(Opcode::from_u16(0x89), None);
        assert_eq!(Opcode::from_u16(0), None);
    }

    #[test]
    fn errno_values() {
        assert_eq!(Errno::from_u16(0x05), Some(Errno::TooBusy));
        assert_eq!(Errno::from_u16(0x06), Some(Errno::InsufficientPrivileges));
        assert_eq!(Errno::from_u16(0x08), Some(Errno::RestartInProgress));
        assert_eq!(Errno::from_u16(0x0c), Some(Errno::ScifError));
        assert_eq!(Errno::from_u16(0x0d), None);
    }

    #[test]
    fn bios_settings_bit_positions() {
        let mut s = MicBiosSettings::default();
        s.set_cluster(0b1111);
        assert_eq!(s.0, 0x0f);
        s = MicBiosSettings::default();
        s.set_ecc(0b111);
        assert_eq!(s.0, 0x70);
        s = MicBiosSettings::default();
        s.set_apei_supp(0b11);
        assert_eq!(s.0, 0x300);
        s = MicBiosSettings::default();
        s.set_apei_einj(0b11);
        assert_eq!(s.0, 0xc00);
        s = MicBiosSettings::default();
        s.set_apei_ffm(0b11);
        assert_eq!(s.0, 0x3000);
        s = MicBiosSettings::default();
        s.set_apei_einjtable(0b11);
        assert_eq!(s.0, 0xc000);
        s = MicBiosSettings::default();
        s.set_fwlock(0b11);
        assert_eq!(s.0, 0x3_0000);

        // Setters mask to width and leave neighbors alone.
        let mut s = MicBiosSettings(u64::MAX);
        s.set_ecc(0);
        assert_eq!(s.cluster(), 0b1111);
        assert_eq!(s.ecc(), 0);
        assert_eq!(s.apei_supp(), 0b11);
    }

    #[test]
    fn bios_request_body_layout() {
        let mut req = MicBiosRequest {
            cmd: MicBiosCmd::Read as u8,
            prop: MicBiosProp::CLUSTER.bits() | MicBiosProp::ECC.bits(),
            value: U64::ZERO,
        };
        let mut settings = req.settings();
        settings.set_cluster(Cluster::Quadrant as u8);
        settings.set_ecc(Ecc::Enabled as u8);
        req.set_settings(settings);

        let bytes = req.as_bytes();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 0x03);
        // cluster=4 in bits 0..4, ecc=1 in bits 4..7 of the first value byte
        assert_eq!(bytes[2], 0x14);
    }
}
