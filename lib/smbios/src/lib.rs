// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SMBIOS firmware-table snapshot
//!
//! The platform firmware leaves a table of packed records in low physical
//! memory describing the BIOS, the system board, the processor sockets, and
//! the populated memory devices.  This crate discovers the table's entry
//! point (via the EFI system table when the kernel exposes it, or a
//! paragraph-aligned scan of the legacy F-segment otherwise), validates it,
//! walks the records, and returns an immutable [`SmBiosTable`] snapshot.
//!
//! Only the record types the daemon consumes are retained: BIOS (0),
//! System (1), Processor (4), and Memory Device (17).  Everything else is
//! skipped during the walk.

#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;

use log::{debug, warn};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Physical address of the legacy BIOS F-segment, where the entry point
/// lives on non-EFI systems.
const FSEG_BASE: u64 = 0xf0000;
const FSEG_LEN: usize = 0x10000;

/// Structure type that terminates the table.
const END_OF_TABLE: u8 = 127;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// No finder could produce an entry-point address.
    EntryPointNotFound,
    /// Anchor, checksum, or intermediate checksum validation failed.
    BadEntryPoint,
    /// A record's formatted area or string section ran off the table.
    Truncated,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::EntryPointNotFound => write!(f, "no SMBIOS entry point found"),
            Error::BadEntryPoint => write!(f, "invalid SMBIOS entry point structure"),
            Error::Truncated => write!(f, "truncated SMBIOS structure table"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Access to physical memory, normally `/dev/mem`.  A seam so the table can
/// be parsed from a buffer in tests.
pub trait PhysMem {
    fn read_at(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;
}

/// `/dev/mem` (or any seekable file standing in for it).
pub struct DevMem {
    path: PathBuf,
}

impl DevMem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DevMem {
    fn default() -> Self {
        Self::new("/dev/mem")
    }
}

impl PhysMem for DevMem {
    fn read_at(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Strategy for locating the entry point.  Returns the physical address of
/// the `_SM_` anchor.
pub trait EntryPointFinder {
    fn locate(&self, mem: &mut dyn PhysMem) -> Result<u64>;
}

/// Reads the `SMBIOS=0x...` line the kernel publishes in the EFI system
/// table dump (`/sys/firmware/efi/systab`, with the old `/proc` location as
/// a fallback).
pub struct EfiSystab {
    candidates: Vec<PathBuf>,
}

impl EfiSystab {
    pub fn new() -> Self {
        Self {
            candidates: vec![
                PathBuf::from("/sys/firmware/efi/systab"),
                PathBuf::from("/proc/efi/systab"),
            ],
        }
    }

    pub fn with_paths(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    fn parse_systab(reader: impl BufRead) -> Result<u64> {
        for line in reader.lines() {
            let line = line?;
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key != "SMBIOS" {
                continue;
            }
            let value = value.trim();
            let value = value.strip_prefix("0x").unwrap_or(value);
            if let Ok(addr) = u64::from_str_radix(value, 16) {
                return Ok(addr);
            }
            break;
        }
        Err(Error::EntryPointNotFound)
    }
}

impl Default for EfiSystab {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryPointFinder for EfiSystab {
    fn locate(&self, _mem: &mut dyn PhysMem) -> Result<u64> {
        for path in &self.candidates {
            match File::open(path) {
                Ok(file) => return Self::parse_systab(BufReader::new(file)),
                Err(e) => debug!("no EFI systab at {}: {e}", path.display()),
            }
        }
        Err(Error::EntryPointNotFound)
    }
}

/// Brute scan of the F-segment for the `_SM_` anchor on paragraph
/// boundaries.
pub struct MemoryScan;

impl EntryPointFinder for MemoryScan {
    fn locate(&self, mem: &mut dyn PhysMem) -> Result<u64> {
        let region = mem.read_at(FSEG_BASE, FSEG_LEN)?;
        for offset in (0..region.len().saturating_sub(16)).step_by(16) {
            if &region[offset..offset + 4] == b"_SM_" {
                return Ok(FSEG_BASE + offset as u64);
            }
        }
        Err(Error::EntryPointNotFound)
    }
}

/// The 32-bit entry point structure, as laid down by the firmware.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct EntryPoint {
    pub anchor: [u8; 4],
    pub checksum: u8,
    pub length: u8,
    pub major: u8,
    pub minor: u8,
    pub max_struct_size: U16,
    pub revision: u8,
    pub formatted_area: [u8; 5],
    pub inter_anchor: [u8; 5],
    pub inter_checksum: u8,
    pub table_length: U16,
    pub table_address: U32,
    pub struct_count: U16,
    pub bcd_revision: u8,
}

pub const ENTRY_POINT_LEN: usize = core::mem::size_of::<EntryPoint>();

/// Offset of `inter_anchor` within the entry point; the intermediate
/// checksum covers the 0x0f bytes starting there.
const INTER_REGION_OFFSET: usize = 0x10;
const INTER_REGION_LEN: usize = 0x0f;

fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
}

impl EntryPoint {
    /// Parses and validates an entry point from the bytes at the anchor.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (eps, _) = Self::read_from_prefix(buf).map_err(|_| Error::BadEntryPoint)?;
        if &eps.anchor != b"_SM_" || &eps.inter_anchor != b"_DMI_" {
            return Err(Error::BadEntryPoint);
        }
        let covered = usize::from(eps.length).min(buf.len());
        if covered < ENTRY_POINT_LEN || !checksum_ok(&buf[..covered]) {
            return Err(Error::BadEntryPoint);
        }
        if !checksum_ok(&buf[INTER_REGION_OFFSET..INTER_REGION_OFFSET + INTER_REGION_LEN]) {
            return Err(Error::BadEntryPoint);
        }
        Ok(eps)
    }
}

/// Common header of every table record.
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct StructHeader {
    pub struct_type: u8,
    pub length: u8,
    pub handle: U16,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BiosInfoRaw {
    pub hdr: [u8; 4],
    pub vendor: u8,
    pub bios_version: u8,
    pub starting_address_segment: U16,
    pub release_date: u8,
    pub rom_size: u8,
    pub characteristics: U64,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SystemInfoRaw {
    pub hdr: [u8; 4],
    pub manufacturer: u8,
    pub product_name: u8,
    pub version: u8,
    pub serial_number: u8,
    pub uuid: [u8; 16],
    pub wake_up_type: u8,
    pub sku_number: u8,
    pub family: u8,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ProcessorInfoRaw {
    pub hdr: [u8; 4],
    pub socket_designation: u8,
    pub processor_type: u8,
    pub processor_family: u8,
    pub processor_manufacturer: u8,
    pub processor_id: U64,
    pub processor_version: u8,
    pub voltage: u8,
    pub external_clock: U16,
    pub max_speed: U16,
    pub current_speed: U16,
    pub status: u8,
    pub processor_upgrade: u8,
    pub l1_cache_handle: U16,
    pub l2_cache_handle: U16,
    pub l3_cache_handle: U16,
    pub serial_number: u8,
    pub asset_tag: u8,
    pub part_number: u8,
    pub core_count: u8,
    pub core_enabled: u8,
    pub thread_count: u8,
    pub characteristics: U16,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MemoryDeviceRaw {
    pub hdr: [u8; 4],
    pub physical_array_handle: U16,
    pub error_info_handle: U16,
    pub total_width: U16,
    pub data_width: U16,
    pub size: U16,
    pub form_factor: u8,
    pub device_set: u8,
    pub device_locator: u8,
    pub bank_locator: u8,
    pub memory_type: u8,
    pub type_detail: U16,
    pub speed: U16,
    pub manufacturer: u8,
    pub serial_number: u8,
    pub asset_tag: u8,
    pub part_number: u8,
    pub attributes: u8,
    pub extended_size: U32,
    pub clock_speed: U16,
    pub min_voltage: U16,
    pub max_voltage: U16,
}

#[derive(Clone, Debug, Default)]
pub struct BiosInfo {
    pub raw: BiosInfoRaw,
    pub vendor: String,
    pub version: String,
    pub release_date: String,
}

#[derive(Clone, Debug, Default)]
pub struct SystemInfo {
    pub raw: SystemInfoRaw,
    pub manufacturer: String,
    pub product_name: String,
    pub serial_number: String,
}

#[derive(Clone, Debug, Default)]
pub struct ProcessorInfo {
    pub raw: ProcessorInfoRaw,
    pub socket_designation: String,
    pub version: String,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryDevice {
    pub raw: MemoryDeviceRaw,
    pub manufacturer: String,
    pub part_number: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemUnit {
    Kilo,
    Mega,
    Unknown,
}

impl MemoryDevice {
    pub fn is_populated(&self) -> bool {
        self.raw.size.get() != 0
    }

    /// Base of the size field, interpreted with [`MemoryDevice::size_unit`].
    pub fn size_base(&self) -> u64 {
        u64::from(self.raw.size.get() & 0x7fff)
    }

    pub fn size_unit(&self) -> MemUnit {
        let size = self.raw.size.get();
        if size == 0xffff {
            MemUnit::Unknown
        } else if size & 0x8000 != 0 {
            MemUnit::Kilo
        } else {
            MemUnit::Mega
        }
    }

    /// Size in megabytes, or `None` if unknown/unpopulated.
    pub fn size_mb(&self) -> Option<u64> {
        if !self.is_populated() {
            return None;
        }
        match self.size_unit() {
            MemUnit::Kilo => Some(self.size_base() / 1024),
            MemUnit::Mega => Some(self.size_base()),
            MemUnit::Unknown => None,
        }
    }
}

/// The parsed, immutable snapshot.
#[derive(Clone, Debug, Default)]
pub struct SmBiosTable {
    pub bios: Vec<BiosInfo>,
    pub systems: Vec<SystemInfo>,
    pub processors: Vec<ProcessorInfo>,
    pub memory_devices: Vec<MemoryDevice>,
}

impl SmBiosTable {
    /// Discovers, validates, and parses the table in one go.  Finders are
    /// tried in order; the first that yields an address wins.
    pub fn load(finders: &[&dyn EntryPointFinder], mem: &mut dyn PhysMem) -> Result<Self> {
        let mut addr = None;
        for finder in finders {
            match finder.locate(mem) {
                Ok(a) => {
                    addr = Some(a);
                    break;
                }
                Err(e) => debug!("entry point finder failed: {e}"),
            }
        }
        let addr = addr.ok_or(Error::EntryPointNotFound)?;

        let eps_bytes = mem.read_at(addr, ENTRY_POINT_LEN)?;
        let eps = EntryPoint::parse(&eps_bytes)?;
        debug!(
            "SMBIOS {}.{} table at {:#x}, {} bytes",
            eps.major,
            eps.minor,
            eps.table_address.get(),
            eps.table_length.get()
        );

        let table = mem.read_at(
            u64::from(eps.table_address.get()),
            usize::from(eps.table_length.get()),
        )?;
        Ok(Self::parse_table(&table))
    }

    /// Walks a structure table.  Unsupported and malformed records are
    /// skipped; the walk stops at the end-of-table record or when the next
    /// record would run off the buffer.
    pub fn parse_table(buf: &[u8]) -> Self {
        let mut table = Self::default();
        let mut offset = 0usize;

        while offset + core::mem::size_of::<StructHeader>() <= buf.len() {
            let Ok((hdr, _)) = StructHeader::read_from_prefix(&buf[offset..]) else {
                break;
            };
            if hdr.struct_type == END_OF_TABLE {
                break;
            }
            let Some(next) = next_struct_offset(&hdr, &buf[offset..]) else {
                break;
            };
            let record = &buf[offset..offset + next];
            table.add_record(&hdr, record);
            offset += next;
        }
        table
    }

    fn add_record(&mut self, hdr: &StructHeader, record: &[u8]) {
        let strings = record_strings(hdr, record);
        let string_at = |idx: u8| -> String {
            // SMBIOS string references are 1-based; 0 means "none".
            idx.checked_sub(1)
                .and_then(|i| strings.get(usize::from(i)).cloned())
                .unwrap_or_else(|| "Not specified".to_string())
        };

        match hdr.struct_type {
            0 => {
                let Ok((raw, _)) = BiosInfoRaw::read_from_prefix(record) else {
                    warn!("short BIOS information record");
                    return;
                };
                self.bios.push(BiosInfo {
                    vendor: string_at(raw.vendor),
                    version: string_at(raw.bios_version),
                    release_date: string_at(raw.release_date),
                    raw,
                });
            }
            1 => {
                let Ok((raw, _)) = SystemInfoRaw::read_from_prefix(record) else {
                    warn!("short system information record");
                    return;
                };
                self.systems.push(SystemInfo {
                    manufacturer: string_at(raw.manufacturer),
                    product_name: string_at(raw.product_name),
                    serial_number: string_at(raw.serial_number),
                    raw,
                });
            }
            4 => {
                let Ok((raw, _)) = ProcessorInfoRaw::read_from_prefix(record) else {
                    warn!("short processor information record");
                    return;
                };
                self.processors.push(ProcessorInfo {
                    socket_designation: string_at(raw.socket_designation),
                    version: string_at(raw.processor_version),
                    raw,
                });
            }
            17 => {
                let Ok((raw, _)) = MemoryDeviceRaw::read_from_prefix(record) else {
                    warn!("short memory device record");
                    return;
                };
                self.memory_devices.push(MemoryDevice {
                    manufacturer: string_at(raw.manufacturer),
                    part_number: string_at(raw.part_number),
                    raw,
                });
            }
            _ => {}
        }
    }
}

/// Distance from the start of a record to the start of the next one: the
/// formatted area plus the string section and its double-NUL terminator.
fn next_struct_offset(hdr: &StructHeader, buf: &[u8]) -> Option<usize> {
    let formatted = usize::from(hdr.length);
    if formatted < core::mem::size_of::<StructHeader>() || formatted > buf.len() {
        return None;
    }
    let mut offset = formatted;
    while offset + 1 < buf.len() {
        if buf[offset] == 0 && buf[offset + 1] == 0 {
            return Some(offset + 2);
        }
        offset += 1;
    }
    None
}

/// The NUL-separated strings following a record's formatted area.
fn record_strings(hdr: &StructHeader, record: &[u8]) -> Vec<String> {
    let mut strings = Vec::new();
    let Some(mut rest) = record.get(usize::from(hdr.length)..) else {
        return strings;
    };
    while let Some(end) = rest.iter().position(|&b| b == 0) {
        if end == 0 {
            break;
        }
        strings.push(String::from_utf8_lossy(&rest[..end]).into_owned());
        rest = &rest[end + 1..];
    }
    strings
}
