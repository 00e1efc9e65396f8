// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One live client connection.
//!
//! A session pairs the accepted endpoint with an in-progress flag.  At most
//! one request per session is ever in flight: while a handler holds the
//! session, the flag is set and the dispatcher additionally removes the
//! session from its poll set, so no second header read can start.

use std::sync::atomic::{AtomicBool, Ordering};

use systoolsd_api::SCIF_ADMIN_PORT_END;

use crate::transport::{Endpoint, Epd};

pub struct Session {
    client: Endpoint,
    in_progress: AtomicBool,
}

impl Session {
    pub fn new(client: Endpoint) -> Self {
        Self {
            client,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Endpoint {
        &self.client
    }

    pub fn epd(&self) -> Epd {
        self.client.epd()
    }

    pub fn set_in_progress(&self, value: bool) {
        self.in_progress.store(value, Ordering::SeqCst);
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Peers bound below the admin port threshold hold root on the host.
    pub fn is_from_root(&self) -> bool {
        self.client.port_id().port < SCIF_ADMIN_PORT_END
    }
}
