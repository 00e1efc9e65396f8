// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Card-resident telemetry and control daemon.
//!
//! Host-side clients connect over the point-to-point transport and issue
//! 28-byte binary requests against a catalog of in-card information sources:
//! SMC sensor registers behind the SMBus arbiter, firmware tables parsed at
//! startup, kernel counters, and the power/turbo control surfaces in sysfs.
//! A narrow set of privileged set-requests drives the control side.
//!
//! Module map:
//!
//! - [`transport`]: the endpoint wrapper over the socket primitive, plus the
//!   Unix-socket and in-memory implementations of that primitive.
//! - [`session`]: one live client connection.
//! - [`daemon`]: listener, dispatcher, worker pool, lifecycle.
//! - [`handler`]: the per-request servicers and their wire sub-protocols.
//! - [`groups`]: the TTL-bounded data-group caches, keyed by opcode.
//! - [`sources`]: adapters over `/proc`, sysfs, `syscfg`, and the kernel.

pub mod daemon;
pub mod error;
pub mod groups;
pub mod handler;
pub mod services;
pub mod session;
pub mod sources;
pub mod transport;

pub use daemon::{Daemon, DaemonConfig};
pub use error::{Error, Result};
pub use services::Services;
