// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BIOS settings via the vendor `syscfg` utility.
//!
//! Reads go through `syscfg -d BIOSSETTINGS <param>` and scrape the
//! `Current Value` line; writes go through `syscfg -bcs <pass> <param>
//! <value>`.  The utility is always spawned with an argv array, so nothing
//! here passes through a shell, and the admin password is still whitelisted
//! before it gets anywhere near the command line.

use std::path::PathBuf;
use std::process::Command;

use systoolsd_api::{Cluster, Ecc, Errno, FromPrimitive};

use crate::error::{Error, Result};

/// `syscfg` exits with 7 when the BIOS admin password is wrong.
const SYSCFG_BAD_PASSWORD: i32 = 7;

/// Longest password `syscfg` accepts.
pub const PASSWORD_MAX_LEN: usize = 14;

const PASSWORD_SPECIALS: &[u8] = b"!@#$%^&*()_+=?-";

/// Extracts and validates a password from a request buffer: it must be
/// NUL-terminated within [`PASSWORD_MAX_LEN`] + 1 bytes and restricted to
/// alphanumerics plus `!@#$%^&*()_+=?-`.  The whitelist predates the move
/// to argv spawning and stays as defense in depth.
pub fn password_from(buf: &[u8]) -> Result<&str> {
    let terminator = buf.iter().take(PASSWORD_MAX_LEN + 1).position(|&b| b == 0);
    let pass = match terminator {
        Some(end) => &buf[..end],
        None if buf.len() <= PASSWORD_MAX_LEN => buf,
        None => return Err(Error::new(Errno::InvalArgument, "malformed password")),
    };
    if !pass
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || PASSWORD_SPECIALS.contains(b))
    {
        return Err(Error::new(Errno::InvalArgument, "malformed password"));
    }
    // The whitelist is pure ASCII, so this cannot fail.
    std::str::from_utf8(pass).map_err(|_| Error::new(Errno::InvalArgument, "malformed password"))
}

/// The BIOS-settings surface the handlers and the memory-info group use.
pub trait Syscfg: Send + Sync {
    fn cluster_mode(&self) -> Result<Cluster>;
    fn ecc(&self) -> Result<Ecc>;
    fn apei_support(&self) -> Result<bool>;
    fn apei_ffm(&self) -> Result<bool>;
    fn apei_einj(&self) -> Result<bool>;
    fn apei_einjtable(&self) -> Result<bool>;
    fn fwlock(&self) -> Result<bool>;

    fn set_cluster_mode(&self, value: Cluster, pass: &str) -> Result<()>;
    fn set_ecc(&self, value: Ecc, pass: &str) -> Result<()>;
    fn set_apei_support(&self, on: bool, pass: &str) -> Result<()>;
    fn set_apei_ffm(&self, on: bool, pass: &str) -> Result<()>;
    fn set_apei_einj(&self, on: bool, pass: &str) -> Result<()>;
    fn set_apei_einjtable(&self, on: bool, pass: &str) -> Result<()>;
    fn set_fwlock(&self, on: bool, pass: &str) -> Result<()>;
    fn change_password(&self, old: &str, new: &str) -> Result<()>;

    fn ecc_enabled(&self) -> Result<bool> {
        Ok(self.ecc()? != Ecc::Disabled)
    }
}

pub struct SyscfgCli {
    program: PathBuf,
}

impl SyscfgCli {
    pub fn new() -> Self {
        Self::with_program("syscfg")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<(i32, String)> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| Error::internal(format!("spawn {}: {e}", self.program.display())))?;
        let code = output.status.code().unwrap_or(-1);
        Ok((code, String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn get_param(&self, param: &str) -> Result<String> {
        let (code, out) = self.run(&["-d", "BIOSSETTINGS", param])?;
        if code != 0 {
            return Err(Error::internal(format!("syscfg failed: param: {param}")));
        }
        extract_current_value(&out)
            .ok_or_else(|| Error::internal(format!("error parsing syscfg output for {param}")))
    }

    fn set_param(&self, pass: &str, param: &str, value: &str) -> Result<()> {
        let (code, _) = self.run(&["-bcs", pass, param, value])?;
        match code {
            0 => Ok(()),
            SYSCFG_BAD_PASSWORD => Err(Error::new(
                Errno::InvalArgument,
                "syscfg failed: incorrect password",
            )),
            _ => Err(Error::internal(format!(
                "syscfg failed setting param {param} to '{value}'"
            ))),
        }
    }

    fn enabled_param(&self, param: &str) -> Result<bool> {
        parse_enabled(param, &self.get_param(param)?)
    }

    /// APEI sub-settings read as disabled while APEI support itself is off.
    fn apei_param(&self, param: &str) -> Result<bool> {
        if !self.apei_support()? {
            return Ok(false);
        }
        self.enabled_param(param)
    }
}

impl Default for SyscfgCli {
    fn default() -> Self {
        Self::new()
    }
}

impl Syscfg for SyscfgCli {
    fn cluster_mode(&self) -> Result<Cluster> {
        parse_cluster(&self.get_param("Cluster Mode")?)
    }

    fn ecc(&self) -> Result<Ecc> {
        parse_ecc(&self.get_param("ECC Support")?)
    }

    fn apei_support(&self) -> Result<bool> {
        self.enabled_param("APEI Support")
    }

    fn apei_ffm(&self) -> Result<bool> {
        self.apei_param("APEI FFM Logging")
    }

    fn apei_einj(&self) -> Result<bool> {
        self.apei_param("APEI PCIe Error Injection")
    }

    fn apei_einjtable(&self) -> Result<bool> {
        self.apei_param("APEI PCIe EInj Action Table")
    }

    fn fwlock(&self) -> Result<bool> {
        self.enabled_param("MICFW Update Flag")
    }

    fn set_cluster_mode(&self, value: Cluster, pass: &str) -> Result<()> {
        self.set_param(pass, "Cluster Mode", &format!("{:02}", value as u8))
    }

    fn set_ecc(&self, value: Ecc, pass: &str) -> Result<()> {
        self.set_param(pass, "ECC Support", &format!("{:02}", value as u8))
    }

    fn set_apei_support(&self, on: bool, pass: &str) -> Result<()> {
        self.set_param(pass, "APEI Support", if on { "01" } else { "00" })
    }

    fn set_apei_ffm(&self, on: bool, pass: &str) -> Result<()> {
        self.set_param(pass, "APEI FFM Logging", if on { "01" } else { "00" })
    }

    fn set_apei_einj(&self, on: bool, pass: &str) -> Result<()> {
        self.set_param(pass, "APEI PCIe Error Injection", if on { "01" } else { "00" })
    }

    fn set_apei_einjtable(&self, on: bool, pass: &str) -> Result<()> {
        self.set_param(
            pass,
            "APEI PCIe EInj Action Table",
            if on { "01" } else { "00" },
        )
    }

    fn set_fwlock(&self, on: bool, pass: &str) -> Result<()> {
        self.set_param(pass, "MICFW Update Flag", if on { "01" } else { "00" })
    }

    fn change_password(&self, old: &str, new: &str) -> Result<()> {
        let (code, _) = self.run(&["-bap", old, new])?;
        match code {
            0 => Ok(()),
            SYSCFG_BAD_PASSWORD => Err(Error::new(
                Errno::InvalArgument,
                "syscfg failed: incorrect password",
            )),
            _ => Err(Error::internal("syscfg failed setting password")),
        }
    }
}

/// Pulls `<v>` out of the `Current Value : <v>` line.
fn extract_current_value(output: &str) -> Option<String> {
    for line in output.lines() {
        if !line.contains("Current Value") {
            continue;
        }
        let (_, value) = line.split_once(':')?;
        return Some(value.trim().to_string());
    }
    None
}

fn parse_enabled(param: &str, value: &str) -> Result<bool> {
    if value.contains("Disable") {
        Ok(false)
    } else if value.contains("Enable") {
        Ok(true)
    } else {
        Err(Error::new(
            Errno::Unknown,
            format!("unknown {param} configuration: {value}"),
        ))
    }
}

fn parse_ecc(value: &str) -> Result<Ecc> {
    if value.contains("Disable") {
        Ok(Ecc::Disabled)
    } else if value.contains("Enable") {
        Ok(Ecc::Enabled)
    } else if value.contains("Auto") {
        Ok(Ecc::Auto)
    } else {
        Err(Error::new(
            Errno::Unknown,
            format!("unknown ECC configuration: {value}"),
        ))
    }
}

fn parse_cluster(value: &str) -> Result<Cluster> {
    const NAMES: [&str; 6] = ["All2All", "SNC-2", "SNC-4", "Hemisphere", "Quadrant", "Auto"];
    for (i, name) in NAMES.iter().enumerate() {
        if value.contains(name) {
            // Names are indexed by the wire encoding.
            return Ok(Cluster::from_u8(i as u8).unwrap());
        }
    }
    Err(Error::new(
        Errno::Unknown,
        format!("unknown Cluster Mode: {value}"),
    ))
}
