//! Admission control for accepted connections.
//!
//! Three caps apply to inbound connections: total concurrent connections,
//! connections per remote IP (checked before the handshake) and connections
//! per remote identity (checked after it). Every successful admission
//! returns a permit; dropping the permit releases the slot, so counters heal
//! themselves when connections close.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::identity::NodeIdentity;

/// Limits applied by a [`ConnectionLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Maximum concurrent accepted connections.
    pub total: usize,
    /// Maximum concurrent connections from one IP.
    pub per_origin: usize,
    /// Maximum concurrent connections from one identity.
    pub per_identity: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    by_origin: HashMap<IpAddr, usize>,
    by_identity: HashMap<NodeIdentity, usize>,
}

fn decrement<K: std::hash::Hash + Eq>(map: &mut HashMap<K, usize>, key: &K) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// Tracks accepted connections by origin and identity.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    limits: AdmissionLimits,
    counters: Arc<Mutex<Counters>>,
}

impl ConnectionLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Admits a new raw connection from `ip`, or returns `None` if the total
    /// or per-origin cap is reached.
    pub fn admit_origin(&self, ip: IpAddr) -> Option<OriginPermit> {
        let mut counters = self.counters.lock();
        let from_ip = counters.by_origin.get(&ip).copied().unwrap_or(0);
        if counters.total >= self.limits.total {
            debug!(ip = %ip, total = counters.total, "Total connection limit reached");
            return None;
        }
        if from_ip >= self.limits.per_origin {
            debug!(ip = %ip, count = from_ip, "Origin connection limit reached");
            return None;
        }
        counters.total += 1;
        *counters.by_origin.entry(ip).or_insert(0) += 1;
        Some(OriginPermit {
            ip,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Admits an authenticated identity, or returns `None` if it already
    /// holds the maximum number of connections.
    pub fn admit_identity(&self, identity: NodeIdentity) -> Option<IdentityPermit> {
        let mut counters = self.counters.lock();
        let count = counters.by_identity.entry(identity).or_insert(0);
        if *count >= self.limits.per_identity {
            debug!(peer = %identity.short(), count = *count, "Identity connection limit reached");
            return None;
        }
        *count += 1;
        Some(IdentityPermit {
            identity,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Current number of admitted connections.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counters.lock().total
    }

    /// Current number of connections from `ip`.
    #[must_use]
    pub fn origin_count(&self, ip: &IpAddr) -> usize {
        self.counters.lock().by_origin.get(ip).copied().unwrap_or(0)
    }

    /// Current number of connections from `identity`.
    #[must_use]
    pub fn identity_count(&self, identity: &NodeIdentity) -> usize {
        self.counters
            .lock()
            .by_identity
            .get(identity)
            .copied()
            .unwrap_or(0)
    }
}

/// Slot held by a connection admitted by origin.
#[derive(Debug)]
pub struct OriginPermit {
    ip: IpAddr,
    counters: Arc<Mutex<Counters>>,
}

impl Drop for OriginPermit {
    fn drop(&mut self) {
        let mut counters = self.counters.lock();
        counters.total = counters.total.saturating_sub(1);
        decrement(&mut counters.by_origin, &self.ip);
    }
}

/// Slot held by a connection admitted by identity.
#[derive(Debug)]
pub struct IdentityPermit {
    identity: NodeIdentity,
    counters: Arc<Mutex<Counters>>,
}

impl Drop for IdentityPermit {
    fn drop(&mut self) {
        decrement(&mut self.counters.lock().by_identity, &self.identity);
    }
}
