// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory transport.
//!
//! Implements the full [`ScifSocket`] contract (poll semantics, hangup
//! reporting, discard-on-dead-peer sends) against nothing but a mutex and a
//! condvar.  The test suites run the entire daemon against this,
//! and unlike the Unix transport it lets a test client *choose* its port, so
//! both sides of the admin-port privilege check are reachable.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{Epd, PollEpd, PollEvents, PortId, ScifSocket};
use systoolsd_api::SCIF_PORT_RSVD;

pub struct LoopbackScif {
    state: Mutex<State>,
    cv: Condvar,
    node: u16,
}

struct State {
    next_epd: Epd,
    next_auto_port: u16,
    eps: HashMap<Epd, Ep>,
    listeners: HashMap<u16, Epd>,
}

enum Ep {
    Fresh { bound: Option<u16> },
    Listener { port: u16, pending: VecDeque<Epd> },
    Stream(Stream),
}

struct Stream {
    /// Peer id for accepted endpoints, local id for connecting ones.
    id: PortId,
    peer: Option<Epd>,
    rx: VecDeque<u8>,
    hup: bool,
}

impl LoopbackScif {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_epd: 3,
                next_auto_port: SCIF_PORT_RSVD,
                eps: HashMap::new(),
                listeners: HashMap::new(),
            }),
            cv: Condvar::new(),
            node: 0,
        }
    }
}

impl Default for LoopbackScif {
    fn default() -> Self {
        Self::new()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "endpoint not connected")
}

impl ScifSocket for LoopbackScif {
    fn open(&self) -> io::Result<Epd> {
        let mut state = self.state.lock().unwrap();
        let epd = state.next_epd;
        state.next_epd += 1;
        state.eps.insert(epd, Ep::Fresh { bound: None });
        Ok(epd)
    }

    fn bind(&self, epd: Epd, port: u16) -> io::Result<u16> {
        let mut state = self.state.lock().unwrap();
        if port != 0 && state.listeners.contains_key(&port) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "port in use"));
        }
        let assigned = if port == 0 {
            let p = state.next_auto_port;
            state.next_auto_port += 1;
            p
        } else {
            port
        };
        match state.eps.get_mut(&epd) {
            Some(Ep::Fresh { bound }) => {
                *bound = Some(assigned);
                Ok(assigned)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "bind on non-fresh endpoint",
            )),
        }
    }

    fn listen(&self, epd: Epd, _backlog: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let port = match state.eps.get(&epd) {
            Some(Ep::Fresh { bound: Some(port) }) => *port,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "listen before bind",
                ))
            }
        };
        state.eps.insert(
            epd,
            Ep::Listener {
                port,
                pending: VecDeque::new(),
            },
        );
        state.listeners.insert(port, epd);
        Ok(())
    }

    fn accept(&self, epd: Epd, blocking: bool) -> io::Result<(Epd, PortId)> {
        let mut state = self.state.lock().unwrap();
        loop {
            let accepted = match state.eps.get_mut(&epd) {
                Some(Ep::Listener { pending, .. }) => pending.pop_front(),
                _ => return Err(not_connected()),
            };
            if let Some(new_epd) = accepted {
                let peer = match state.eps.get(&new_epd) {
                    Some(Ep::Stream(s)) => s.id,
                    _ => return Err(not_connected()),
                };
                return Ok((new_epd, peer));
            }
            if !blocking {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "no pending connection",
                ));
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    fn connect(&self, epd: Epd, dest: PortId) -> io::Result<PortId> {
        let mut state = self.state.lock().unwrap();
        let local_port = match state.eps.get(&epd) {
            Some(Ep::Fresh { bound: Some(p) }) => *p,
            Some(Ep::Fresh { bound: None }) => {
                let p = state.next_auto_port;
                state.next_auto_port += 1;
                p
            }
            _ => return Err(not_connected()),
        };
        let listener = *state.listeners.get(&dest.port).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no listener on port")
        })?;

        let local_id = PortId::new(self.node, local_port);
        let server_epd = state.next_epd;
        state.next_epd += 1;
        state.eps.insert(
            server_epd,
            Ep::Stream(Stream {
                id: local_id,
                peer: Some(epd),
                rx: VecDeque::new(),
                hup: false,
            }),
        );
        state.eps.insert(
            epd,
            Ep::Stream(Stream {
                id: local_id,
                peer: Some(server_epd),
                rx: VecDeque::new(),
                hup: false,
            }),
        );
        match state.eps.get_mut(&listener) {
            Some(Ep::Listener { pending, .. }) => pending.push_back(server_epd),
            _ => return Err(not_connected()),
        }
        drop(state);
        self.cv.notify_all();
        Ok(local_id)
    }

    fn recv(&self, epd: Epd, buf: &mut [u8], blocking: bool) -> io::Result<usize> {
        let mut collected = 0;
        let mut state = self.state.lock().unwrap();
        loop {
            let stream = match state.eps.get_mut(&epd) {
                Some(Ep::Stream(s)) => s,
                _ => return Err(not_connected()),
            };
            while collected < buf.len() {
                match stream.rx.pop_front() {
                    Some(b) => {
                        buf[collected] = b;
                        collected += 1;
                    }
                    None => break,
                }
            }
            if collected == buf.len() || !blocking || stream.hup {
                return Ok(collected);
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    fn send(&self, epd: Epd, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let peer = match state.eps.get(&epd) {
            Some(Ep::Stream(s)) => s.peer,
            _ => return Err(not_connected()),
        };
        // The transport quietly discards traffic to a departed peer.
        if let Some(peer) = peer {
            if let Some(Ep::Stream(s)) = state.eps.get_mut(&peer) {
                s.rx.extend(buf.iter().copied());
            }
        }
        drop(state);
        self.cv.notify_all();
        Ok(buf.len())
    }

    fn poll(&self, fds: &mut [PollEpd], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            let mut ready = 0;
            for fd in fds.iter_mut() {
                fd.revents = PollEvents::empty();
                match state.eps.get(&fd.epd) {
                    None => fd.revents |= PollEvents::NVAL,
                    Some(Ep::Fresh { .. }) => {}
                    Some(Ep::Listener { pending, .. }) => {
                        if !pending.is_empty() && fd.events.contains(PollEvents::IN) {
                            fd.revents |= PollEvents::IN;
                        }
                    }
                    Some(Ep::Stream(s)) => {
                        if !s.rx.is_empty() && fd.events.contains(PollEvents::IN) {
                            fd.revents |= PollEvents::IN;
                        }
                        // Hangup is reported whether or not it was asked
                        // for, same as poll(2).
                        if s.hup {
                            fd.revents |= PollEvents::HUP;
                        }
                    }
                }
                if !fd.revents.is_empty() {
                    ready += 1;
                }
            }
            if ready > 0 {
                return Ok(ready);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    let (s, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
                    state = s;
                }
                None => state = self.cv.wait(state).unwrap(),
            }
        }
    }

    fn close(&self, epd: Epd) {
        let mut state = self.state.lock().unwrap();
        match state.eps.remove(&epd) {
            Some(Ep::Stream(s)) => {
                if let Some(peer) = s.peer {
                    if let Some(Ep::Stream(p)) = state.eps.get_mut(&peer) {
                        p.hup = true;
                        p.peer = None;
                    }
                }
            }
            Some(Ep::Listener { port, .. }) => {
                state.listeners.remove(&port);
            }
            _ => {}
        }
        drop(state);
        self.cv.notify_all();
    }

    fn local_node(&self) -> u16 {
        self.node
    }
}
