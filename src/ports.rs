//! ryuldn_bridge/src/ports.rs
//! Ephemeral port pool (sec. 4.3), grounded on `ldn_proxy.hpp`'s per-protocol
//! port allocator. One instance exists per transport protocol (TCP/UDP) in
//! the router; allocation scans for the lowest free port rather than
//! round-robining, matching the reference's deterministic-lowest-first
//! behavior that the sec. 8 tests rely on.

use std::sync::Mutex;

pub const EPHEMERAL_BASE: u16 = 49152;
pub const EPHEMERAL_END: u16 = 65535;

pub struct EphemeralPortPool {
    used: Mutex<Vec<bool>>,
}

impl EphemeralPortPool {
    pub fn new() -> Self {
        let span = (EPHEMERAL_END - EPHEMERAL_BASE) as usize + 1;
        EphemeralPortPool { used: Mutex::new(vec![false; span]) }
    }

    /// Scans `used` from the base upward and claims the first free port.
    /// O(n) in the pool size, matching the reference's linear scan rather
    /// than a free-list, since the pool is rarely more than a few hundred
    /// entries wide for a single LDN session.
    pub fn allocate(&self) -> Option<u16> {
        let mut used = self.used.lock().unwrap();
        let idx = used.iter().position(|&taken| !taken)?;
        used[idx] = true;
        Some(EPHEMERAL_BASE + idx as u16)
    }

    /// Idempotent: releasing a port that is not currently allocated (double
    /// release, or a port outside the pool's range) is logged and ignored.
    pub fn release(&self, port: u16) {
        if port < EPHEMERAL_BASE || port > EPHEMERAL_END {
            tracing::warn!("EphemeralPortPool: release of out-of-range port {}", port);
            return;
        }
        let idx = (port - EPHEMERAL_BASE) as usize;
        let mut used = self.used.lock().unwrap();
        if !used[idx] {
            tracing::warn!("EphemeralPortPool: double release of port {}, ignoring", port);
            return;
        }
        used[idx] = false;
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        if port < EPHEMERAL_BASE || port > EPHEMERAL_END {
            return false;
        }
        self.used.lock().unwrap()[(port - EPHEMERAL_BASE) as usize]
    }
}

impl Default for EphemeralPortPool {
    fn default() -> Self {
        EphemeralPortPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port_first() {
        let pool = EphemeralPortPool::new();
        assert_eq!(pool.allocate(), Some(EPHEMERAL_BASE));
        assert_eq!(pool.allocate(), Some(EPHEMERAL_BASE + 1));
    }

    #[test]
    fn released_port_is_reused_before_advancing() {
        let pool = EphemeralPortPool::new();
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.release(a);
        assert_eq!(pool.allocate(), Some(a));
    }

    #[test]
    fn double_release_is_ignored_not_corrupting() {
        let pool = EphemeralPortPool::new();
        let a = pool.allocate().unwrap();
        pool.release(a);
        pool.release(a); // should log + no-op, not panic or double free a slot
        assert!(!pool.is_allocated(a));
        let b = pool.allocate().unwrap();
        assert_eq!(b, a);
    }
}
