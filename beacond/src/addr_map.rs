//! Registry of joined gateways.
//!
//! A flat fixed-size table behind one mutex. N is small enough that a
//! linear scan beats any hashing. Entries are created on first join,
//! refreshed on every subsequent contact and released by the periodic
//! expiry sweep.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info};

/// Capacity of the registry.
pub const MAX_NUMBER_NODES: usize = 4096;

/// Outcome of a join request, carried verbatim in the join-response status
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Ack = 0,
    Deny = 1,
}

impl JoinStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone)]
struct Entry {
    addr: SocketAddr,
    api_version: f32,
    last_reported: Instant,
}

pub struct AddressMap {
    entries: Mutex<Box<[Option<Entry>]>>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::with_capacity(MAX_NUMBER_NODES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let entries = vec![None; capacity].into_boxed_slice();
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Register `addr`, refreshing it if already present. Uniqueness across
    /// slots is guaranteed because the scan for an existing entry runs
    /// before any insert, under the same lock.
    pub fn join(&self, addr: SocketAddr, api_version: f32) -> JoinStatus {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        if let Some(entry) = entries.iter_mut().flatten().find(|e| e.addr == addr) {
            entry.last_reported = now;
            entry.api_version = api_version;
            debug!("gateway {addr} re-joined");
            return JoinStatus::Ack;
        }

        match entries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(Entry {
                    addr,
                    api_version,
                    last_reported: now,
                });
                info!("gateway {addr} joined");
                JoinStatus::Ack
            }
            None => {
                info!("gateway {addr} denied: address map full");
                JoinStatus::Deny
            }
        }
    }

    /// Refresh the last-reported timestamp of a known gateway. Returns
    /// whether the address was known.
    pub fn refresh(&self, addr: SocketAddr) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().flatten().find(|e| e.addr == addr) {
            Some(entry) => {
                entry.last_reported = Instant::now();
                true
            }
            None => false,
        }
    }

    /// API version the gateway last joined with; used to pick the payload
    /// dialect when talking back to it.
    pub fn api_version(&self, addr: SocketAddr) -> Option<f32> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|e| e.addr == addr)
            .map(|e| e.api_version)
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|e| e.addr == addr)
    }

    /// Release every entry whose last report is older than `tolerance`.
    /// Returns the released addresses.
    pub fn sweep(&self, tolerance: Duration) -> Vec<SocketAddr> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let mut released = Vec::new();

        for slot in entries.iter_mut() {
            if let Some(entry) = slot {
                if now.duration_since(entry.last_reported) > tolerance {
                    info!("gateway {} expired", entry.addr);
                    released.push(entry.addr);
                    *slot = None;
                }
            }
        }
        released
    }

    /// Addresses of every registered gateway, for broadcast fanout.
    pub fn registered(&self) -> Vec<SocketAddr> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|e| e.addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:4000").parse().unwrap()
    }

    #[test]
    fn join_is_idempotent() {
        let map = AddressMap::with_capacity(4);
        assert_eq!(map.join(addr(1), 2.1), JoinStatus::Ack);
        assert_eq!(map.join(addr(1), 2.2), JoinStatus::Ack);
        assert_eq!(map.len(), 1);
        // A re-join also refreshes the recorded dialect.
        assert_eq!(map.api_version(addr(1)), Some(2.2));
        assert_eq!(map.api_version(addr(9)), None);
    }

    #[test]
    fn entries_stay_unique() {
        let map = AddressMap::with_capacity(8);
        for _ in 0..3 {
            map.join(addr(1), 2.2);
            map.join(addr(2), 2.2);
        }
        let mut registered = map.registered();
        registered.sort();
        assert_eq!(registered, vec![addr(1), addr(2)]);
    }

    #[test]
    fn full_map_denies_join() {
        let map = AddressMap::with_capacity(2);
        assert_eq!(map.join(addr(1), 2.2), JoinStatus::Ack);
        assert_eq!(map.join(addr(2), 2.2), JoinStatus::Ack);
        assert_eq!(map.join(addr(3), 2.2), JoinStatus::Deny);
        // An existing member still re-joins.
        assert_eq!(map.join(addr(1), 2.2), JoinStatus::Ack);
    }

    #[test]
    fn sweep_releases_only_silent_entries() {
        let map = AddressMap::with_capacity(4);
        map.join(addr(1), 2.2);
        map.join(addr(2), 2.2);

        thread::sleep(Duration::from_millis(30));
        map.refresh(addr(2));

        let released = map.sweep(Duration::from_millis(20));
        assert_eq!(released, vec![addr(1)]);
        assert!(!map.contains(addr(1)));
        assert!(map.contains(addr(2)));

        // A released slot is reusable.
        assert_eq!(map.join(addr(3), 2.2), JoinStatus::Ack);
    }

    #[test]
    fn refresh_unknown_address_reports_false() {
        let map = AddressMap::with_capacity(2);
        assert!(!map.refresh(addr(9)));
    }
}
