//! Round-robin rotation over a shuffled server list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::transport::ServerAddress;

/// Hands out servers in round-robin order from a uniformly permuted list.
///
/// The position counter uses relaxed atomics on purpose: two racing
/// callers may observe the same server, which is fine. The goal is
/// distribution of load, not an exact rotation, and that is not worth a
/// lock on every checkout.
pub(crate) struct ServerRotor {
    servers: Mutex<Arc<[ServerAddress]>>,
    position: AtomicUsize,
}

impl ServerRotor {
    pub(crate) fn new() -> ServerRotor {
        ServerRotor {
            servers: Mutex::new(Arc::from(Vec::new())),
            position: AtomicUsize::new(0),
        }
    }

    /// Installs a new server list, shuffling it uniformly and resetting
    /// the rotation. Returns the permuted list for event reporting.
    pub(crate) fn install(&self, mut servers: Vec<ServerAddress>) -> Result<Arc<[ServerAddress]>> {
        if servers.is_empty() {
            return Err(Error::InvalidRequest("server list must not be empty".into()));
        }
        servers.shuffle(&mut rand::rng());
        let servers: Arc<[ServerAddress]> = Arc::from(servers);
        *self.servers.lock().unwrap() = servers.clone();
        self.position.store(0, Ordering::Relaxed);
        Ok(servers)
    }

    /// Returns the next server and advances the rotation.
    pub(crate) fn next(&self) -> ServerAddress {
        let servers = self.servers.lock().unwrap().clone();
        let position = self.position.fetch_add(1, Ordering::Relaxed);
        servers[position % servers.len()].clone()
    }

    /// The currently installed (permuted) list.
    pub(crate) fn snapshot(&self) -> Arc<[ServerAddress]> {
        self.servers.lock().unwrap().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}
