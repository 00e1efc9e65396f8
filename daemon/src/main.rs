// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! systoolsd: the card-resident telemetry and control daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use drv_smc_i2c::{LinuxI2c, SmcBus};
use smbios::{DevMem, EfiSystab, EntryPointFinder, MemoryScan, SmBiosTable};
use systoolsd::daemon::{Daemon, DaemonConfig};
use systoolsd::services::Services;
use systoolsd::sources::{KernelStats, PowerThresholds, SyscfgCli, TurboCtl};
use systoolsd::transport::UnixScif;

#[derive(Debug, Parser)]
#[command(about = "card telemetry and control daemon")]
struct Args {
    /// Stay in the foreground instead of daemonizing.
    #[arg(long)]
    foreground: bool,

    /// Directory the transport's sockets live in.
    #[arg(long, default_value = "/run/systoolsd")]
    socket_dir: PathBuf,

    /// Adapter number of the SMC's I2C side channel (/dev/i2c-N).
    #[arg(long, default_value_t = 0)]
    i2c_adapter: u8,
}

fn load_smbios() -> Result<SmBiosTable> {
    let mut mem = DevMem::default();
    let efi = EfiSystab::new();
    let finders: [&dyn EntryPointFinder; 2] = [&efi, &MemoryScan];
    SmBiosTable::load(&finders, &mut mem).context("parsing firmware tables")
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !args.foreground {
        // Detach before any threads exist.
        let rc = unsafe { libc::daemon(0, 0) };
        if rc != 0 {
            bail!("daemon(3) failed: {}", std::io::Error::last_os_error());
        }
    }

    std::fs::create_dir_all(&args.socket_dir)
        .with_context(|| format!("creating {}", args.socket_dir.display()))?;

    let services = Services {
        i2c: Arc::new(SmcBus::new(Box::new(LinuxI2c), args.i2c_adapter)),
        smbios: Arc::new(load_smbios()?),
        pthresh: Arc::new(PowerThresholds::default()),
        turbo: Arc::new(TurboCtl::default()),
        syscfg: Arc::new(SyscfgCli::new()),
        kernel: Arc::new(KernelStats::new("/proc").context("reading cpu topology")?),
    };

    let scif = Arc::new(UnixScif::new(&args.socket_dir));
    let mut daemon = Daemon::new(scif, services, DaemonConfig::default())
        .context("constructing daemon")?;

    let shutdown = daemon.shutdown_cell();
    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGQUIT,
        signal_hook::consts::SIGABRT,
        signal_hook::consts::SIGTERM,
    ] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("installing handler for signal {signal}"))?;
    }

    daemon.start().context("binding service port")?;
    info!(
        "started systoolsd, protocol version {}.{}",
        systoolsd_api::PROTOCOL_MAJOR,
        systoolsd_api::PROTOCOL_MINOR
    );

    if let Err(e) = daemon.serve_forever() {
        warn!("daemon exited with error: {e}");
        bail!("daemon exited with error: {e}");
    }
    info!("successfully stopped systoolsd");
    Ok(())
}
