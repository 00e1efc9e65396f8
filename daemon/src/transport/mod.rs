// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The point-to-point transport seam.
//!
//! The daemon talks to the socket primitive exclusively through
//! [`ScifSocket`]; the kernel-module-backed transport is a collaborator that
//! lives outside this repository.  Two implementations ship here:
//! [`UnixScif`] maps ports onto Unix-domain sockets for bring-up on plain
//! Linux, and [`LoopbackScif`] is a fully in-memory transport used by the
//! test suites.
//!
//! [`Endpoint`] is the thin object wrapper the rest of the daemon holds: it
//! owns one endpoint descriptor, closes it exactly once, and reads back a
//! `(0, 0)` port id afterwards.

mod loopback;
mod unix;

pub use loopback::LoopbackScif;
pub use unix::UnixScif;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;

/// Endpoint descriptor.  Small, non-negative, transport-scoped.
pub type Epd = i32;

bitflags! {
    /// Poll event bits, numerically identical to the `poll(2)` constants.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct PollEvents: i16 {
        const IN = 0x001;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
        const NVAL = 0x020;
    }
}

impl PollEvents {
    pub fn has_error_bits(self) -> bool {
        self.intersects(PollEvents::ERR | PollEvents::HUP | PollEvents::NVAL)
    }
}

/// A `(node, port)` pair identifying one side of a connection.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PortId {
    pub node: u16,
    pub port: u16,
}

impl PortId {
    pub fn new(node: u16, port: u16) -> Self {
        Self { node, port }
    }
}

/// One entry of a multiplexed poll.
#[derive(Copy, Clone, Debug)]
pub struct PollEpd {
    pub epd: Epd,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollEpd {
    pub fn new(epd: Epd, events: PollEvents) -> Self {
        Self {
            epd,
            events,
            revents: PollEvents::empty(),
        }
    }
}

/// The socket primitive.  Mirrors the kernel transport's C surface:
/// descriptors in, descriptors out, no objects.
pub trait ScifSocket: Send + Sync {
    /// Returns a new, unbound endpoint descriptor.
    fn open(&self) -> io::Result<Epd>;

    /// Binds `epd` to `port`; 0 requests any port at or above the reserved
    /// range.  Returns the port actually bound.
    fn bind(&self, epd: Epd, port: u16) -> io::Result<u16>;

    fn listen(&self, epd: Epd, backlog: u32) -> io::Result<()>;

    /// Accepts a pending connection, yielding the new endpoint descriptor
    /// and the peer's port id.
    fn accept(&self, epd: Epd, blocking: bool) -> io::Result<(Epd, PortId)>;

    /// Connects to a listening endpoint; returns the local port id.
    fn connect(&self, epd: Epd, dest: PortId) -> io::Result<PortId>;

    /// Blocking: reads until `buf` is full or the peer goes away, returning
    /// the byte count either way.  Non-blocking: returns only what is
    /// already pending, possibly 0.
    fn recv(&self, epd: Epd, buf: &mut [u8], blocking: bool) -> io::Result<usize>;

    /// Blocking send of the whole buffer.  Sends to a peer that has already
    /// vanished are discarded by the transport.
    fn send(&self, epd: Epd, buf: &[u8]) -> io::Result<usize>;

    /// Multiplexed poll over endpoint descriptors; `None` blocks forever.
    /// Returns the number of entries with non-empty `revents`.
    fn poll(&self, fds: &mut [PollEpd], timeout: Option<Duration>) -> io::Result<usize>;

    /// Closes `epd`.  Unknown descriptors are ignored.
    fn close(&self, epd: Epd);

    /// The node id this side of the transport lives on.
    fn local_node(&self) -> u16;
}

/// Owning wrapper for one endpoint descriptor.
pub struct Endpoint {
    scif: Arc<dyn ScifSocket>,
    state: Mutex<EndpointState>,
}

struct EndpointState {
    epd: Epd,
    id: PortId,
    closed: bool,
}

impl Endpoint {
    /// Opens a fresh, unbound endpoint.
    pub fn open(scif: Arc<dyn ScifSocket>) -> io::Result<Self> {
        let epd = scif.open()?;
        let node = scif.local_node();
        Ok(Self {
            scif,
            state: Mutex::new(EndpointState {
                epd,
                id: PortId::new(node, 0),
                closed: false,
            }),
        })
    }

    fn accepted(scif: Arc<dyn ScifSocket>, epd: Epd, peer: PortId) -> Self {
        Self {
            scif,
            state: Mutex::new(EndpointState {
                epd,
                id: peer,
                closed: false,
            }),
        }
    }

    pub fn bind(&self, port: u16) -> io::Result<u16> {
        let mut state = self.state.lock().unwrap();
        let bound = self.scif.bind(state.epd, port)?;
        state.id.port = bound;
        Ok(bound)
    }

    pub fn listen(&self, backlog: u32) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        self.scif.listen(state.epd, backlog)
    }

    /// Accepts one connection.  The returned endpoint's port id is the
    /// *peer's* id, which is what the privilege check wants.
    pub fn accept(&self, blocking: bool) -> io::Result<Endpoint> {
        let epd = self.state.lock().unwrap().epd;
        let (new_epd, peer) = self.scif.accept(epd, blocking)?;
        Ok(Endpoint::accepted(Arc::clone(&self.scif), new_epd, peer))
    }

    pub fn connect(&self, dest: PortId) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let local = self.scif.connect(state.epd, dest)?;
        state.id = local;
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8], blocking: bool) -> io::Result<usize> {
        let epd = self.state.lock().unwrap().epd;
        self.scif.recv(epd, buf, blocking)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let epd = self.state.lock().unwrap().epd;
        self.scif.send(epd, buf)
    }

    /// Polls just this endpoint.
    pub fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<PollEvents> {
        let epd = self.state.lock().unwrap().epd;
        let mut fds = [PollEpd::new(epd, events)];
        self.scif.poll(&mut fds, timeout)?;
        Ok(fds[0].revents)
    }

    pub fn epd(&self) -> Epd {
        self.state.lock().unwrap().epd
    }

    /// The endpoint's port id; `(0, 0)` once closed.
    pub fn port_id(&self) -> PortId {
        let state = self.state.lock().unwrap();
        if state.closed {
            PortId::default()
        } else {
            state.id
        }
    }

    /// Idempotent close.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            self.scif.close(state.epd);
            state.closed = true;
            state.id = PortId::default();
        }
    }

    /// Closes the endpoint and opens a fresh descriptor in its place; used
    /// by the listener when the transport reports an error.
    pub fn reset(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            self.scif.close(state.epd);
        }
        state.epd = self.scif.open()?;
        state.id = PortId::new(self.scif.local_node(), 0);
        state.closed = false;
        Ok(())
    }

    pub fn scif(&self) -> &Arc<dyn ScifSocket> {
        &self.scif
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Endpoint")
            .field("epd", &state.epd)
            .field("id", &state.id)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Waits until at least one of `epds` has data to read or the timeout
/// elapses.  Endpoints reporting HUP/ERR/NVAL are excluded from the result;
/// callers learn about those through a separate error-poll pass.
pub fn select_read(
    scif: &Arc<dyn ScifSocket>,
    epds: &[Epd],
    timeout: Option<Duration>,
) -> io::Result<Vec<Epd>> {
    let mut fds: Vec<PollEpd> = epds
        .iter()
        .map(|&epd| PollEpd::new(epd, PollEvents::IN))
        .collect();
    scif.poll(&mut fds, timeout)?;
    Ok(fds
        .iter()
        .filter(|fd| fd.revents.contains(PollEvents::IN) && !fd.revents.has_error_bits())
        .map(|fd| fd.epd)
        .collect())
}
