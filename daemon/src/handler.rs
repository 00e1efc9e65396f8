// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request handlers: one short-lived servicer per inbound header.
//!
//! Creating a handler marks its session in-progress and pulls it out of the
//! dispatcher's poll set; a scoped guard restores both when the handler
//! finishes, however it finishes.  The run wrapper converts every error,
//! panics included, into a reply header with `card_errno` set, so a client
//! always hears back exactly once per request leg.
//!
//! Privilege: set-requests and the raw register surface require an admin
//! peer port.  Of the BIOS sub-commands, only write and change-password do;
//! reads are plain telemetry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use systoolsd_api::{
    Cluster, Ecc, Errno, FromPrimitive, MicBiosCmd, MicBiosProp, MicBiosRequest, Opcode,
    PowerWindowInfo, ReqHeader, REQUEST_MAX_DATA_LEN, TWO_STATE_MAX,
};

use crate::daemon::Shared;
use crate::error::{Error, Result};
use crate::groups::sensors::{LED_BLINK_REG, PWM_ADDER_REG};
use crate::session::Session;
use crate::sources::syscfg::password_from;

enum Kind {
    /// Serve a data group's payload.
    Get,
    /// Write an inline u32 to a fixed SMC register (LED blink, PWM adder).
    Set,
    /// Two-leg power-threshold handshake against RAPL window 0 or 1.
    PowerWindow(u8),
    Turbo,
    /// The retraining itself already ran (or failed) during `create`, on
    /// the dispatcher thread after the pool quiesced; only the reply is
    /// left to do.
    RestartSmba { errno: u16 },
    /// Raw SMC register read/write riding in the header's inline data.
    SmcRw,
    /// BIOS settings read/write/change-password via syscfg.
    MicBios,
}

pub struct Handler {
    req: ReqHeader,
    sess: Arc<Session>,
    shared: Arc<Shared>,
    kind: Kind,
}

/// Restores the session when the handler is done: clears the in-progress
/// flag and puts the session back into the dispatcher's poll set.
struct SessionRelease {
    sess: Arc<Session>,
    shared: Arc<Shared>,
}

impl Drop for SessionRelease {
    fn drop(&mut self) {
        self.sess.set_in_progress(false);
        self.shared.add_session(Arc::clone(&self.sess));
    }
}

impl Handler {
    /// Builds the right handler variant for a request header.  Runs on the
    /// dispatcher thread; the session leaves the poll set here.
    pub fn create(req: ReqHeader, sess: Arc<Session>, shared: Arc<Shared>) -> Handler {
        sess.set_in_progress(true);
        shared.remove_session(sess.epd());

        let raw = req.req_type.get();
        let kind = match Opcode::from_u16(raw) {
            Some(Opcode::ReadSmcReg) | Some(Opcode::WriteSmcReg) => Kind::SmcRw,
            Some(Opcode::SetPthreshW0) => Kind::PowerWindow(0),
            Some(Opcode::SetPthreshW1) => Kind::PowerWindow(1),
            Some(Opcode::SetTurbo) => Kind::Turbo,
            Some(Opcode::RestartSmba) => Kind::RestartSmba {
                errno: restart_smba_now(&req, &sess, &shared),
            },
            Some(Opcode::MicBios) => Kind::MicBios,
            _ if raw & systoolsd_api::SET_REQUEST_MASK != 0 => Kind::Set,
            _ => Kind::Get,
        };

        Handler {
            req,
            sess,
            shared,
            kind,
        }
    }

    /// Executes the handler on a worker.  Everything that can go wrong ends
    /// up in the reply header's `card_errno`.
    pub fn run(self) {
        let Handler {
            mut req,
            sess,
            shared,
            kind,
        } = self;
        let _release = SessionRelease {
            sess: Arc::clone(&sess),
            shared: Arc::clone(&shared),
        };

        if !shared.acquire_request() {
            warn!("too busy, refusing request type {:#04x}", req.req_type.get());
            reply_errno(&sess, &mut req, Errno::TooBusy as u16);
            return;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handle_request(&kind, &mut req, &sess, &shared)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("error in handler for type {:#04x}: {e}", req.req_type.get());
                reply_errno(&sess, &mut req, e.errno() as u16);
            }
            Err(_) => {
                error!("panic in handler for type {:#04x}", req.req_type.get());
                reply_errno(&sess, &mut req, Errno::Unknown as u16);
            }
        }

        shared.release_request();
    }
}

/// The SMBus-restart work itself.  Runs during handler construction so the
/// drained worker pool cannot pick anything up in between.
fn restart_smba_now(req: &ReqHeader, sess: &Session, shared: &Shared) -> u16 {
    if !sess.is_from_root() {
        info!("SMBus retraining denied");
        return Errno::InsufficientPrivileges as u16;
    }
    if shared.services.i2c.is_device_busy().is_busy {
        info!("restart is in progress");
        return Errno::RestartInProgress as u16;
    }
    // The slave byte is opaque to us; the SMC knows what it means.
    let addr = req.data[0];
    info!("resetting SMBus address to {addr:#04x}");
    match shared.services.i2c.restart_device(addr) {
        Ok(()) => 0,
        Err(e) => {
            warn!("SMBus retraining failed: {e}");
            Error::from(e).errno() as u16
        }
    }
}

fn handle_request(
    kind: &Kind,
    req: &mut ReqHeader,
    sess: &Session,
    shared: &Shared,
) -> Result<()> {
    match kind {
        Kind::Get => handle_get(req, sess, shared),
        Kind::Set => handle_set(req, sess, shared),
        Kind::PowerWindow(window) => handle_pthresh(*window, req, sess, shared),
        Kind::Turbo => handle_turbo(req, sess, shared),
        Kind::RestartSmba { errno } => {
            reply_errno(sess, req, *errno);
            Ok(())
        }
        Kind::SmcRw => handle_smc_rw(req, sess, shared),
        Kind::MicBios => handle_micbios(req, sess, shared),
    }
}

/// Sends the header with `card_errno` already set to `errno`.  A failed
/// send closes the endpoint; the dead session is culled by the dispatcher.
fn reply_errno(sess: &Session, req: &mut ReqHeader, errno: u16) {
    req.card_errno = errno.into();
    if let Err(e) = sess.client().send(req.as_bytes()) {
        warn!("failed replying error {errno} : {e}");
        sess.client().close();
    }
}

fn send_header(sess: &Session, req: &ReqHeader) -> Result<()> {
    sess.client()
        .send(req.as_bytes())
        .map_err(|e| Error::new(Errno::ScifError, e.to_string()))?;
    Ok(())
}

fn send_ack(sess: &Session, req: &mut ReqHeader) -> Result<()> {
    req.card_errno = 0.into();
    send_header(sess, req)
}

/// Generic read: look up the data group by opcode and ship its payload.
fn handle_get(req: &mut ReqHeader, sess: &Session, shared: &Shared) -> Result<()> {
    let group = shared
        .groups
        .get(&req.req_type.get())
        .ok_or_else(|| Error::new(Errno::UnsupportedReq, "unsupported 'get' request type"))?;

    let payload = group.raw(false)?;
    req.length = (payload.len() as u16).into();
    req.card_errno = 0.into();
    send_header(sess, req)?;
    sess.client()
        .send(&payload)
        .map_err(|e| Error::new(Errno::ScifError, e.to_string()))?;
    Ok(())
}

/// Generic write: the request's inline u32 goes to a fixed SMC register.
fn handle_set(req: &mut ReqHeader, sess: &Session, shared: &Shared) -> Result<()> {
    let smc_cmd = match Opcode::from_u16(req.req_type.get()) {
        Some(Opcode::SetPwmAdder) => PWM_ADDER_REG,
        Some(Opcode::SetLedBlink) => LED_BLINK_REG,
        _ => {
            return Err(Error::new(
                Errno::UnsupportedReq,
                "unsupported 'set' request type",
            ))
        }
    };
    if !sess.is_from_root() {
        return Err(Error::new(
            Errno::InsufficientPrivileges,
            "set request from non-admin port",
        ));
    }
    shared.services.i2c.write_u32(smc_cmd, req.data_u32())?;
    send_ack(sess, req)
}

/// Power-threshold set, a two-leg handshake: ack, then a
/// [`PowerWindowInfo`] body, then a final ack.  `u32::MAX` in a body field
/// means "leave unchanged".  A short body is a protocol violation and
/// closes the connection.
fn handle_pthresh(window: u8, req: &mut ReqHeader, sess: &Session, shared: &Shared) -> Result<()> {
    if !sess.is_from_root() {
        return Err(Error::new(
            Errno::InsufficientPrivileges,
            "pthresh set from non-admin port",
        ));
    }

    // Resolve the window before acknowledging, so a missing RAPL zone is
    // reported instead of ack'd.
    let window = shared.services.pthresh.window(window)?;
    send_ack(sess, req)?;

    let mut body = [0u8; core::mem::size_of::<PowerWindowInfo>()];
    let n = sess
        .client()
        .recv(&mut body, true)
        .map_err(|e| Error::new(Errno::ScifError, e.to_string()))?;
    if n != body.len() {
        warn!(
            "expecting {} bytes for PowerWindowInfo, received {n}; closing",
            body.len()
        );
        sess.client().close();
        return Ok(());
    }
    let info = PowerWindowInfo::read_from_bytes(&body).unwrap();

    if info.threshold.get() != u32::MAX {
        window.set_threshold(info.threshold.get())?;
    }
    if info.time_window.get() != u32::MAX {
        window.set_time_window(info.time_window.get())?;
    }

    force_refresh(shared, Opcode::GetPthreshInfo)?;
    send_ack(sess, req)
}

fn handle_turbo(req: &mut ReqHeader, sess: &Session, shared: &Shared) -> Result<()> {
    if !sess.is_from_root() {
        return Err(Error::new(
            Errno::InsufficientPrivileges,
            "turbo set from non-admin port",
        ));
    }
    let enable = req.data[0] != 0;
    shared.services.turbo.set_enabled(enable)?;
    send_ack(sess, req)?;

    // The client has its ack; a refresh hiccup here is log-only.
    if let Err(e) = force_refresh(shared, Opcode::GetTurboInfo) {
        warn!("turbo info refresh after set failed: {e}");
    }
    Ok(())
}

/// Raw SMC register access.  The register offset rides in `extra`, the
/// data in the header's inline bytes.
fn handle_smc_rw(req: &mut ReqHeader, sess: &Session, shared: &Shared) -> Result<()> {
    if !sess.is_from_root() {
        info!("arbitrary read/write SMC operation denied");
        return Err(Error::new(
            Errno::InsufficientPrivileges,
            "raw SMC access from non-admin port",
        ));
    }

    let len = usize::from(req.length.get());
    if len == 0 || len > REQUEST_MAX_DATA_LEN {
        return Err(Error::new(
            Errno::InvalStruct,
            "invalid length for raw SMC operation",
        ));
    }
    let smc_cmd = req.extra.get() as u8;

    match Opcode::from_u16(req.req_type.get()) {
        Some(Opcode::ReadSmcReg) => {
            req.data = [0; REQUEST_MAX_DATA_LEN];
            shared.services.i2c.read_bytes(smc_cmd, &mut req.data[..len])?;
        }
        Some(Opcode::WriteSmcReg) => {
            shared.services.i2c.write_bytes(smc_cmd, &req.data[..len])?;
        }
        _ => return Err(Error::internal("unknown raw SMC operation")),
    }
    send_ack(sess, req)
}

/// BIOS settings: ack, read a [`MicBiosRequest`] body, then serve its
/// sub-command.
fn handle_micbios(req: &mut ReqHeader, sess: &Session, shared: &Shared) -> Result<()> {
    send_ack(sess, req)?;

    let mut body = [0u8; core::mem::size_of::<MicBiosRequest>()];
    let n = sess
        .client()
        .recv(&mut body, true)
        .map_err(|e| Error::new(Errno::ScifError, e.to_string()))?;
    if n != body.len() {
        warn!(
            "expecting {} bytes for MicBiosRequest, received {n}; closing",
            body.len()
        );
        reply_errno(sess, req, Errno::InvalStruct as u16);
        sess.client().close();
        return Ok(());
    }
    let mut mbreq = MicBiosRequest::read_from_bytes(&body).unwrap();

    match MicBiosCmd::from_u8(mbreq.cmd) {
        Some(MicBiosCmd::Read) => micbios_read(req, &mut mbreq, sess, shared),
        Some(MicBiosCmd::Write) => {
            if !sess.is_from_root() {
                return Err(Error::new(
                    Errno::InsufficientPrivileges,
                    "BIOS write from non-admin port",
                ));
            }
            micbios_write(req, &mbreq, sess, shared)
        }
        Some(MicBiosCmd::ChangePass) => {
            if !sess.is_from_root() {
                return Err(Error::new(
                    Errno::InsufficientPrivileges,
                    "BIOS password change from non-admin port",
                ));
            }
            micbios_change_pass(req, sess, shared)
        }
        None => Err(Error::new(Errno::UnsupportedReq, "unknown micbios command")),
    }
}

fn micbios_read(
    req: &mut ReqHeader,
    mbreq: &mut MicBiosRequest,
    sess: &Session,
    shared: &Shared,
) -> Result<()> {
    let syscfg = &shared.services.syscfg;
    let prop = MicBiosProp::from_bits_truncate(mbreq.prop);
    let mut settings = mbreq.settings();

    if prop.contains(MicBiosProp::CLUSTER) {
        settings.set_cluster(syscfg.cluster_mode()? as u8);
    }
    if prop.contains(MicBiosProp::ECC) {
        settings.set_ecc(syscfg.ecc()? as u8);
    }
    if prop.contains(MicBiosProp::APEI_SUPP) {
        settings.set_apei_supp(u8::from(syscfg.apei_support()?));
    }
    if prop.contains(MicBiosProp::APEI_FFM) {
        settings.set_apei_ffm(u8::from(syscfg.apei_ffm()?));
    }
    if prop.contains(MicBiosProp::APEI_EINJ) {
        settings.set_apei_einj(u8::from(syscfg.apei_einj()?));
    }
    if prop.contains(MicBiosProp::APEI_EINJTABLE) {
        settings.set_apei_einjtable(u8::from(syscfg.apei_einjtable()?));
    }
    if prop.contains(MicBiosProp::FWLOCK) {
        settings.set_fwlock(u8::from(syscfg.fwlock()?));
    }
    mbreq.set_settings(settings);

    req.length = (core::mem::size_of::<MicBiosRequest>() as u16).into();
    req.card_errno = 0.into();
    send_header(sess, req)?;
    sess.client()
        .send(mbreq.as_bytes())
        .map_err(|e| Error::new(Errno::ScifError, e.to_string()))?;
    Ok(())
}

fn in_range(value: u8, max: u8) -> Result<u8> {
    if value >= max {
        return Err(Error::inval(format!(
            "value out of range: {value} max: {max}"
        )));
    }
    Ok(value)
}

fn micbios_write(
    req: &mut ReqHeader,
    mbreq: &MicBiosRequest,
    sess: &Session,
    shared: &Shared,
) -> Result<()> {
    let syscfg = &shared.services.syscfg;
    let pass = password_from(&req.data)?;
    let prop = MicBiosProp::from_bits_truncate(mbreq.prop);
    let settings = mbreq.settings();

    if prop.contains(MicBiosProp::CLUSTER) {
        let value = in_range(settings.cluster(), Cluster::MAX)?;
        syscfg.set_cluster_mode(Cluster::from_u8(value).unwrap(), pass)?;
    }
    if prop.contains(MicBiosProp::ECC) {
        let value = in_range(settings.ecc(), Ecc::MAX)?;
        syscfg.set_ecc(Ecc::from_u8(value).unwrap(), pass)?;
    }
    if prop.contains(MicBiosProp::APEI_SUPP) {
        let value = in_range(settings.apei_supp(), TWO_STATE_MAX)?;
        syscfg.set_apei_support(value == 1, pass)?;
    }
    if prop.contains(MicBiosProp::APEI_FFM) {
        let value = in_range(settings.apei_ffm(), TWO_STATE_MAX)?;
        syscfg.set_apei_ffm(value == 1, pass)?;
    }
    if prop.contains(MicBiosProp::APEI_EINJ) {
        let value = in_range(settings.apei_einj(), TWO_STATE_MAX)?;
        syscfg.set_apei_einj(value == 1, pass)?;
    }
    if prop.contains(MicBiosProp::APEI_EINJTABLE) {
        let value = in_range(settings.apei_einjtable(), TWO_STATE_MAX)?;
        syscfg.set_apei_einjtable(value == 1, pass)?;
    }
    if prop.contains(MicBiosProp::FWLOCK) {
        let value = in_range(settings.fwlock(), TWO_STATE_MAX)?;
        syscfg.set_fwlock(value == 1, pass)?;
    }

    send_ack(sess, req)
}

fn micbios_change_pass(req: &mut ReqHeader, sess: &Session, shared: &Shared) -> Result<()> {
    let old_pass = password_from(&req.data)?.to_string();
    let new_len = usize::from(req.length.get());
    if new_len > crate::sources::syscfg::PASSWORD_MAX_LEN {
        return Err(Error::inval("password longer than syscfg permits"));
    }

    // Tell the client to go ahead with the new password bytes.
    send_ack(sess, req)?;

    let mut new_buf = [0u8; crate::sources::syscfg::PASSWORD_MAX_LEN + 1];
    if new_len > 0 {
        let n = sess
            .client()
            .recv(&mut new_buf[..new_len], true)
            .map_err(|e| Error::new(Errno::ScifError, e.to_string()))?;
        if n != new_len {
            warn!("expecting {new_len} bytes for new password, received {n}");
            return Err(Error::new(Errno::InvalStruct, "short password payload"));
        }
    }
    let new_pass = password_from(&new_buf)?;

    shared.services.syscfg.change_password(&old_pass, new_pass)?;
    send_ack(sess, req)
}

fn force_refresh(shared: &Shared, op: Opcode) -> Result<()> {
    match shared.groups.get(&(op as u16)) {
        Some(group) => group.force_refresh(),
        None => Err(Error::internal("data group missing from registry")),
    }
}
