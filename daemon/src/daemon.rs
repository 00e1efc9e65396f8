// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Daemon lifecycle: the listener thread, the dispatcher loop, the worker
//! pool, and shutdown propagation.
//!
//! Threading model: the listener thread accepts connections and registers
//! sessions; the dispatcher (the thread that called [`Daemon::serve_forever`])
//! polls all live sessions, reads one request header per ready client, and
//! hands a handler to the pool; five pool workers execute handlers.  Every
//! blocking wait carries a one-second timeout at which the shutdown flag is
//! rechecked, so a signal stops the daemon within one timeout plus worker
//! drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use systoolsd_api::{Errno, Opcode, ReqHeader, SYSTOOLSD_PORT};

use crate::error::{Error, Result};
use crate::groups::{build_groups, GroupMap};
use crate::handler::Handler;
use crate::services::Services;
use crate::session::Session;
use crate::transport::{select_read, Endpoint, Epd, PollEvents, ScifSocket};
use workpool::WorkPool;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub port: u16,
    /// Listen backlog and session cap.
    pub max_connections: u32,
    pub workers: usize,
    /// Concurrent in-flight request cap; the next request is refused with
    /// `TooBusy`.
    pub max_inflight: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: SYSTOOLSD_PORT,
            max_connections: 32,
            workers: 5,
            max_inflight: 32,
        }
    }
}

struct Claims {
    inflight: u32,
    total: u64,
}

/// State shared between the daemon's threads and the handlers.
pub struct Shared {
    pub scif: Arc<dyn ScifSocket>,
    pub services: Services,
    pub groups: GroupMap,
    sessions: Mutex<HashMap<Epd, Arc<Session>>>,
    clients_ready: Mutex<bool>,
    clients_ready_cv: Condvar,
    claims: Mutex<Claims>,
    shutdown: Arc<AtomicBool>,
    max_inflight: u32,
}

impl Shared {
    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the dispatcher if it is parked waiting for clients.
        let mut ready = self.clients_ready.lock().unwrap();
        *ready = true;
        self.clients_ready_cv.notify_all();
    }

    pub fn add_session(&self, sess: Arc<Session>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(sess.epd(), sess);
        drop(sessions);
        let mut ready = self.clients_ready.lock().unwrap();
        *ready = true;
        self.clients_ready_cv.notify_one();
    }

    pub fn remove_session(&self, epd: Epd) {
        self.sessions.lock().unwrap().remove(&epd);
    }

    pub fn session(&self, epd: Epd) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&epd).cloned()
    }

    pub fn session_epds(&self) -> Vec<Epd> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Culls sessions whose endpoints report hangup or error; with an
    /// explicit descriptor, drops just that one.  When the table empties,
    /// the dispatcher goes back to sleep on the clients condvar.
    pub fn remove_invalid_sessions(&self, epd: Option<Epd>) {
        let mut sessions = self.sessions.lock().unwrap();

        if let Some(epd) = epd {
            sessions.remove(&epd);
            debug!("removed invalid session with epd {epd}");
        } else if !sessions.is_empty() {
            let mut fds: Vec<_> = sessions
                .keys()
                .map(|&epd| {
                    crate::transport::PollEpd::new(
                        epd,
                        PollEvents::HUP | PollEvents::ERR | PollEvents::NVAL,
                    )
                })
                .collect();
            if self.scif.poll(&mut fds, Some(Duration::ZERO)).is_ok() {
                for fd in &fds {
                    if fd.revents.has_error_bits() {
                        sessions.remove(&fd.epd);
                        debug!("removed invalid session with epd {}", fd.epd);
                    }
                }
            }
        }

        if sessions.is_empty() {
            *self.clients_ready.lock().unwrap() = false;
        }
    }

    /// Parks the dispatcher until a session exists (or shutdown).  Returns
    /// at the latest after one second so the shutdown flag gets rechecked.
    fn wait_for_clients(&self) {
        let mut ready = self.clients_ready.lock().unwrap();
        while !*ready && !self.shutting_down() {
            let (guard, timeout) = self
                .clients_ready_cv
                .wait_timeout(ready, Duration::from_secs(1))
                .unwrap();
            ready = guard;
            if timeout.timed_out() {
                break;
            }
        }
    }

    /// Claims one in-flight request slot; refused at the cap.
    pub fn acquire_request(&self) -> bool {
        let mut claims = self.claims.lock().unwrap();
        if claims.inflight >= self.max_inflight {
            return false;
        }
        claims.inflight += 1;
        claims.total += 1;
        true
    }

    pub fn release_request(&self) {
        let mut claims = self.claims.lock().unwrap();
        claims.inflight -= 1;
    }

    pub fn inflight_requests(&self) -> u32 {
        self.claims.lock().unwrap().inflight
    }

    pub fn total_requests(&self) -> u64 {
        self.claims.lock().unwrap().total
    }

    /// Replies to a protocol-level error that never reached a handler.
    pub fn notify_error(&self, sess: &Session, mut req: ReqHeader, errno: Errno) {
        req.card_errno = (errno as u16).into();
        if let Err(e) = sess.client().send(req.as_bytes()) {
            warn!("failed notifying error {errno:?} to peer: {e}");
        }
        self.remove_invalid_sessions(None);
    }
}

/// Cloneable handle for stopping a running daemon from another thread (the
/// tests use this; production shutdown goes through the signal flag).
#[derive(Clone)]
pub struct DaemonControl {
    shared: Arc<Shared>,
}

impl DaemonControl {
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn session_count(&self) -> usize {
        self.shared.session_count()
    }

    pub fn total_requests(&self) -> u64 {
        self.shared.total_requests()
    }
}

pub struct Daemon {
    shared: Arc<Shared>,
    pool: WorkPool,
    listener: Arc<Endpoint>,
    listen_thread: Option<JoinHandle<()>>,
    config: DaemonConfig,
}

impl Daemon {
    pub fn new(
        scif: Arc<dyn ScifSocket>,
        services: Services,
        config: DaemonConfig,
    ) -> Result<Self> {
        let groups = build_groups(&services);
        let listener = Arc::new(Endpoint::open(Arc::clone(&scif))?);
        let shared = Arc::new(Shared {
            scif,
            services,
            groups,
            sessions: Mutex::new(HashMap::new()),
            clients_ready: Mutex::new(false),
            clients_ready_cv: Condvar::new(),
            claims: Mutex::new(Claims {
                inflight: 0,
                total: 0,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            max_inflight: config.max_inflight,
        });
        Ok(Self {
            pool: WorkPool::new(config.workers),
            shared,
            listener,
            listen_thread: None,
            config,
        })
    }

    /// Binds and listens on the service port.
    pub fn start(&self) -> Result<()> {
        self.listener
            .bind(self.config.port)
            .map_err(|e| Error::new(Errno::ScifError, format!("could not bind, port busy: {e}")))?;
        self.listener
            .listen(self.config.max_connections)
            .map_err(|e| Error::new(Errno::ScifError, e.to_string()))?;
        info!(
            "listening on port {} with backlog of size {}",
            self.config.port, self.config.max_connections
        );
        Ok(())
    }

    pub fn control(&self) -> DaemonControl {
        DaemonControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The shutdown cell, for wiring up signal handlers.
    pub fn shutdown_cell(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.shutdown)
    }

    /// Accepts and serves clients until the shutdown flag is raised, then
    /// drains the worker pool and joins the listener.
    pub fn serve_forever(&mut self) -> Result<()> {
        if self.listener.port_id().port == 0 {
            return Err(Error::internal("daemon instance has not been started"));
        }

        let listener = Arc::clone(&self.listener);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        self.listen_thread = Some(
            std::thread::Builder::new()
                .name("listener".into())
                .spawn(move || listen_for_connections(&listener, &shared, &config))
                .expect("spawning listener thread"),
        );

        info!("ready...");
        while !self.shared.shutting_down() {
            self.shared.remove_invalid_sessions(None);
            self.shared.wait_for_clients();
            if self.shared.shutting_down() {
                break;
            }

            let epds = self.shared.session_epds();
            if epds.is_empty() {
                continue;
            }
            let ready = match select_read(
                &self.shared.scif,
                &epds,
                Some(Duration::from_secs(1)),
            ) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!("daemon is shutting down: {e}");
                    break;
                }
            };

            for epd in ready {
                self.dispatch_one(epd);
            }
        }

        debug!("waiting for worker threads...");
        self.pool.wait();
        debug!("waiting for sessions thread...");
        if let Some(handle) = self.listen_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Reads and dispatches one request header from a ready session.
    fn dispatch_one(&self, epd: Epd) {
        let Some(sess) = self.shared.session(epd) else {
            return;
        };
        if sess.is_in_progress() {
            return;
        }

        let mut buf = [0u8; systoolsd_api::REQ_HEADER_SIZE];
        let n = match sess.client().recv(&mut buf, true) {
            Ok(n) => n,
            Err(e) => {
                warn!("recv failed on epd {epd}: {e}");
                self.shared.remove_invalid_sessions(Some(epd));
                return;
            }
        };
        if n == 0 {
            // Peer closed between the poll and the read.
            self.shared.remove_invalid_sessions(Some(epd));
            return;
        }

        // No pipelining: a client with bytes beyond one header loses its
        // connection.  There is no per-session receive buffer to park the
        // excess in.
        if self.flush_client(&sess) {
            return;
        }

        let req = ReqHeader::read_from_bytes(&buf).unwrap();
        if n != buf.len() {
            debug!("inval struct: {n} byte header from epd {epd}");
            self.shared.notify_error(&sess, req, Errno::InvalStruct);
            return;
        }

        // SMBus retraining must not race in-flight sensor traffic; quiesce
        // the pool before the handler (whose constructor does the work).
        if req.req_type.get() == Opcode::RestartSmba as u16 {
            info!("waiting for thread pool to become empty to start SMBus retraining...");
            self.pool.wait();
            info!("thread pool empty");
        }

        let handler = Handler::create(req, sess, Arc::clone(&self.shared));
        debug!("queueing request handler (type {:#04x})", req.req_type.get());
        self.pool.execute(move || handler.run());
    }

    /// True if the peer had data queued beyond the header; the connection
    /// is closed in that case.
    fn flush_client(&self, sess: &Session) -> bool {
        let mut byte = [0u8; 1];
        match sess.client().recv(&mut byte, false) {
            Ok(n) if n > 0 => {
                debug!(
                    "removing client with epd {}: protocol mismatch",
                    sess.epd()
                );
                sess.client().close();
                true
            }
            _ => false,
        }
    }
}

fn listen_for_connections(listener: &Endpoint, shared: &Shared, config: &DaemonConfig) {
    while !shared.shutting_down() {
        let revents = match listener.poll(PollEvents::IN, Some(Duration::from_secs(1))) {
            Ok(revents) => revents,
            Err(e) => {
                // The transport died under us; reset and keep listening.
                warn!("listener poll failed ({e}), resetting transport");
                if let Err(e) = reset_listener(listener, config) {
                    warn!("listener reset failed: {e}");
                }
                continue;
            }
        };
        if revents.is_empty() {
            continue;
        }
        if revents.has_error_bits() {
            warn!("listener endpoint error ({revents:?}), resetting transport");
            if let Err(e) = reset_listener(listener, config) {
                warn!("listener reset failed: {e}");
            }
            continue;
        }

        match listener.accept(true) {
            Ok(client) => {
                let id = client.port_id();
                let epd = client.epd();
                shared.add_session(Arc::new(Session::new(client)));
                shared.remove_invalid_sessions(None);
                info!("accepted client {}:{} with epd {}", id.node, id.port, epd);
            }
            Err(e) => {
                warn!("failed accepting: {e}");
                shared.remove_invalid_sessions(None);
            }
        }
    }
    info!("listener thread exiting...");
}

fn reset_listener(listener: &Endpoint, config: &DaemonConfig) -> std::io::Result<()> {
    listener.reset()?;
    listener.bind(config.port)?;
    listener.listen(config.max_connections)
}
