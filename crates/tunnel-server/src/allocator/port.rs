//! Port leasing from a fixed inclusive range.
//!
//! Leases are by uniform random choice from the free subset of the range,
//! reserved atomically with insertion into the used-port set to prevent
//! double-lease under concurrent gateway creation.

use rand::seq::SliceRandom;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tunnel_core::{TunnelError, TunnelResult};

#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Lease a port by uniform random choice from the free subset of
    /// `[min, max]`. Port `0` requests are handled by the gateway itself
    /// (ephemeral OS-assigned port) and are not leased here.
    ///
    /// Fails with [`TunnelError::NoFreePort`] if the range is saturated.
    pub async fn lease(&self) -> TunnelResult<u16> {
        let mut used = self.used.lock().await;
        let free: Vec<u16> = (self.min..=self.max)
            .filter(|p| !used.contains(p))
            .collect();
        let chosen = *free
            .choose(&mut rand::thread_rng())
            .ok_or(TunnelError::NoFreePort(self.min, self.max))?;
        used.insert(chosen);
        Ok(chosen)
    }

    /// Release a previously leased port back into the free set.
    pub async fn release(&self, port: u16) {
        self.used.lock().await.remove(&port);
    }

    /// Snapshot of currently leased ports, for diagnostics and tests.
    pub async fn used_ports(&self) -> Vec<u16> {
        self.used.lock().await.iter().copied().collect()
    }
}
