// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Unix-domain-socket transport.
//!
//! On hardware, the point-to-point endpoint comes from the ring-buffer
//! kernel module.  On a plain Linux card image (and on developer machines)
//! this implementation stands in for it: port N is a stream socket at
//! `<base>/scif-N.sock`, and the peer "port" that the privilege check keys
//! on is synthesized from `SO_PEERCRED` at accept time: uid 0 peers are
//! handed ports below the admin threshold, everyone else gets a port above
//! the reserved range.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use systoolsd_api::{SCIF_ADMIN_PORT_END, SCIF_PORT_RSVD};

use super::{Epd, PollEpd, PollEvents, PortId, ScifSocket};

/// First synthesized port for non-root peers.
const USER_PORT_BASE: u16 = 5000;

pub struct UnixScif {
    base: PathBuf,
    state: Mutex<State>,
    node: u16,
}

struct State {
    next_epd: Epd,
    next_admin_port: u16,
    next_user_port: u16,
    next_auto_port: u16,
    eps: HashMap<Epd, UnixEp>,
}

enum UnixEp {
    Fresh {
        bound: Option<u16>,
    },
    Listener {
        listener: UnixListener,
        path: PathBuf,
    },
    Stream {
        stream: UnixStream,
        id: PortId,
    },
}

impl UnixScif {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            state: Mutex::new(State {
                next_epd: 3,
                next_admin_port: 1,
                next_user_port: USER_PORT_BASE,
                next_auto_port: SCIF_PORT_RSVD,
                eps: HashMap::new(),
            }),
            node: 0,
        }
    }

    fn socket_path(&self, port: u16) -> PathBuf {
        self.base.join(format!("scif-{port}.sock"))
    }

    fn synth_peer_port(state: &mut State, stream: &UnixStream) -> u16 {
        let uid = peer_uid(stream.as_raw_fd());
        if uid == Some(0) {
            let p = state.next_admin_port;
            state.next_admin_port = if p + 1 >= SCIF_ADMIN_PORT_END { 1 } else { p + 1 };
            p
        } else {
            let p = state.next_user_port;
            state.next_user_port = state.next_user_port.wrapping_add(1).max(USER_PORT_BASE);
            p
        }
    }
}

fn peer_uid(fd: RawFd) -> Option<u32> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: u32::MAX,
        gid: u32::MAX,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast(),
            &mut len,
        )
    };
    if rc == 0 {
        Some(cred.uid)
    } else {
        debug!("SO_PEERCRED failed: {}", io::Error::last_os_error());
        None
    }
}

impl ScifSocket for UnixScif {
    fn open(&self) -> io::Result<Epd> {
        let mut state = self.state.lock().unwrap();
        let epd = state.next_epd;
        state.next_epd += 1;
        state.eps.insert(epd, UnixEp::Fresh { bound: None });
        Ok(epd)
    }

    fn bind(&self, epd: Epd, port: u16) -> io::Result<u16> {
        let mut state = self.state.lock().unwrap();
        let assigned = if port == 0 {
            let p = state.next_auto_port;
            state.next_auto_port += 1;
            p
        } else {
            port
        };
        match state.eps.get_mut(&epd) {
            Some(UnixEp::Fresh { bound }) => {
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
            Some(UnixEp::Fresh { bound: Some(port) }) => *port,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "listen before bind",
                ))
            }
        };
        let path = self.socket_path(port);
        // A stale socket file from a previous run would fail the bind.
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        state.eps.insert(epd, UnixEp::Listener { listener, path });
        Ok(())
    }

    fn accept(&self, epd: Epd, blocking: bool) -> io::Result<(Epd, PortId)> {
        // Accept without the state lock held: a blocking accept must not
        // starve the rest of the transport.
        let listener = {
            let state = self.state.lock().unwrap();
            match state.eps.get(&epd) {
                Some(UnixEp::Listener { listener, .. }) => listener.try_clone()?,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "accept on non-listener",
                    ))
                }
            }
        };
        listener.set_nonblocking(!blocking)?;
        let (stream, _) = listener.accept()?;

        let mut state = self.state.lock().unwrap();
        let port = Self::synth_peer_port(&mut state, &stream);
        let id = PortId::new(self.node, port);
        let new_epd = state.next_epd;
        state.next_epd += 1;
        state.eps.insert(new_epd, UnixEp::Stream { stream, id });
        Ok((new_epd, id))
    }

    fn connect(&self, epd: Epd, dest: PortId) -> io::Result<PortId> {
        let path = self.socket_path(dest.port);
        let stream = UnixStream::connect(path)?;

        let mut state = self.state.lock().unwrap();
        let local_port = match state.eps.get(&epd) {
            Some(UnixEp::Fresh { bound: Some(p) }) => *p,
            Some(UnixEp::Fresh { bound: None }) => {
                let p = state.next_auto_port;
                state.next_auto_port += 1;
                p
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connect on non-fresh endpoint",
                ))
            }
        };
        let id = PortId::new(self.node, local_port);
        state.eps.insert(epd, UnixEp::Stream { stream, id });
        Ok(id)
    }

    fn recv(&self, epd: Epd, buf: &mut [u8], blocking: bool) -> io::Result<usize> {
        let mut stream = {
            let state = self.state.lock().unwrap();
            match state.eps.get(&epd) {
                Some(UnixEp::Stream { stream, .. }) => stream.try_clone()?,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "recv on non-stream endpoint",
                    ))
                }
            }
        };
        stream.set_nonblocking(!blocking)?;

        let mut collected = 0;
        while collected < buf.len() {
            match stream.read(&mut buf[collected..]) {
                Ok(0) => break,
                Ok(n) => collected += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(collected)
    }

    fn send(&self, epd: Epd, buf: &[u8]) -> io::Result<usize> {
        let mut stream = {
            let state = self.state.lock().unwrap();
            match state.eps.get(&epd) {
                Some(UnixEp::Stream { stream, .. }) => stream.try_clone()?,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "send on non-stream endpoint",
                    ))
                }
            }
        };
        stream.set_nonblocking(false)?;
        match stream.write_all(buf) {
            Ok(()) => Ok(buf.len()),
            // The peer is gone; its reply is discarded at the transport.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(buf.len()),
            Err(e) => Err(e),
        }
    }

    fn poll(&self, fds: &mut [PollEpd], timeout: Option<Duration>) -> io::Result<usize> {
        let mut raw = Vec::with_capacity(fds.len());
        let mut raw_index = Vec::with_capacity(fds.len());
        let mut ready = 0;
        {
            let state = self.state.lock().unwrap();
            for (i, fd) in fds.iter_mut().enumerate() {
                fd.revents = PollEvents::empty();
                let os_fd = match state.eps.get(&fd.epd) {
                    Some(UnixEp::Listener { listener, .. }) => Some(listener.as_raw_fd()),
                    Some(UnixEp::Stream { stream, .. }) => Some(stream.as_raw_fd()),
                    Some(UnixEp::Fresh { .. }) => None,
                    None => {
                        fd.revents = PollEvents::NVAL;
                        ready += 1;
                        None
                    }
                };
                if let Some(os_fd) = os_fd {
                    raw.push(libc::pollfd {
                        fd: os_fd,
                        events: fd.events.bits(),
                        revents: 0,
                    });
                    raw_index.push(i);
                }
            }
        }

        // Invalid descriptors count as immediately ready, so don't block.
        let timeout_ms: libc::c_int = if ready > 0 {
            0
        } else {
            match timeout {
                Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
                None => -1,
            }
        };

        if !raw.is_empty() {
            let rc = unsafe { libc::poll(raw.as_mut_ptr(), raw.len() as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            for (entry, &i) in raw.iter().zip(&raw_index) {
                let revents = PollEvents::from_bits_truncate(entry.revents);
                if !revents.is_empty() {
                    fds[i].revents = revents;
                    ready += 1;
                }
            }
        } else if ready == 0 {
            if let Some(t) = timeout {
                std::thread::sleep(t);
            }
        }
        Ok(ready)
    }

    fn close(&self, epd: Epd) {
        let mut state = self.state.lock().unwrap();
        if let Some(UnixEp::Listener { path, .. }) = state.eps.remove(&epd) {
            let _ = fs::remove_file(path);
        }
    }

    fn local_node(&self) -> u16 {
        self.node
    }
}
