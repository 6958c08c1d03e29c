// Pacmesh - Cooperative LAN package cache daemon, redirecting misses to clustermates found over multicast
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// One outstanding lookup.
///
/// The HTTP side parks on the ticket while datagram dispatch completes the
/// registry side. Every field mutation happens under the registry lock.
struct Waiter {
    id: u64,

    pkgname: String,

    /// Live clustermates at creation time. Shrinks on every matching
    /// notfound; emptying it completes the waiter without an address.
    expected: HashSet<IpAddr>,

    /// First peer that claimed the file, if any.
    resolved: Option<IpAddr>,

    /// Taken when the completion fires, so the signal fires at most once.
    tx: Option<oneshot::Sender<Option<IpAddr>>>,
}

pub struct WaiterRegistry {
    waiters: Mutex<Vec<Waiter>>,

    next_id: AtomicU64,
}

/// Handle to one registered lookup, held by the search side.
pub struct LookupTicket {
    id: u64,

    rx: oneshot::Receiver<Option<IpAddr>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a lookup for `pkgname`, seeded with the current live peers.
    pub fn create(&self, pkgname: &str, expected: HashSet<IpAddr>) -> LookupTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        debug!(
            "New request (pkg = {}) (expected = {})",
            pkgname,
            expected.len()
        );

        self.waiters.lock().push(Waiter {
            id,
            pkgname: pkgname.to_string(),
            expected,
            resolved: None,
            tx: Some(tx),
        });

        LookupTicket { id, rx }
    }

    /// A clustermate claims to hold `pkgname`.
    ///
    /// Every matching unresolved waiter resolves to `addr`; the first answer
    /// accepted under the lock wins and later ones change nothing. A waiter
    /// whose signal already fired is left untouched, so an answer arriving
    /// after a notfound exhaustion cannot rewrite the outcome. The claim is
    /// honored even from a peer missing from the expected set, since
    /// membership is a liveness hint rather than a gate.
    pub fn found(&self, pkgname: &str, addr: IpAddr) {
        let mut waiters = self.waiters.lock();

        for w in waiters.iter_mut() {
            if w.pkgname != pkgname || w.resolved.is_some() || w.tx.is_none() {
                continue;
            }

            w.resolved = Some(addr);

            if let Some(tx) = w.tx.take() {
                let _ = tx.send(Some(addr));
            }
        }
    }

    /// A clustermate declined `pkgname`.
    ///
    /// Once every expected peer has declined, the waiter completes early
    /// without an address instead of running out the deadline.
    pub fn notfound(&self, pkgname: &str, addr: IpAddr) {
        let mut waiters = self.waiters.lock();

        for w in waiters.iter_mut() {
            if w.pkgname != pkgname {
                continue;
            }

            w.expected.remove(&addr);

            if w.expected.is_empty() && w.resolved.is_none() {
                if let Some(tx) = w.tx.take() {
                    let _ = tx.send(None);
                }
            }
        }
    }

    /// Drop the ticket's waiter. Safe to call after completion or timeout.
    pub fn remove(&self, ticket: &LookupTicket) {
        self.waiters.lock().retain(|w| w.id != ticket.id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl LookupTicket {
    /// Wait for the completion signal, bounded by `deadline`.
    ///
    /// Returns the resolved peer address, or `None` when every peer declined
    /// or the deadline elapsed.
    pub async fn wait(&mut self, deadline: Duration) -> Option<IpAddr> {
        match timeout(deadline, &mut self.rx).await {
            Ok(Ok(address)) => address,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    const PKG: &str = "bar-2-1-x86_64.pkg.tar.xz";

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn set(addrs: &[IpAddr]) -> HashSet<IpAddr> {
        addrs.iter().copied().collect()
    }

    #[tokio::test]
    async fn found_completes_with_the_address() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1)]));

        registry.found(PKG, ip(1));

        assert_eq!(ticket.wait(Duration::from_secs(1)).await, Some(ip(1)));

        registry.remove(&ticket);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn first_found_wins() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1), ip(2)]));

        registry.found(PKG, ip(1));
        registry.found(PKG, ip(2));

        assert_eq!(ticket.wait(Duration::from_secs(1)).await, Some(ip(1)));
    }

    #[tokio::test]
    async fn found_beats_notfound_from_the_remaining_peer() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1), ip(2)]));

        registry.notfound(PKG, ip(1));
        registry.found(PKG, ip(2));

        assert_eq!(ticket.wait(Duration::from_secs(1)).await, Some(ip(2)));
    }

    #[tokio::test]
    async fn found_after_exhaustion_does_not_rewrite_the_outcome() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1)]));

        registry.notfound(PKG, ip(1));
        registry.found(PKG, ip(2));

        assert_eq!(ticket.wait(Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn unanimous_decline_completes_early() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1), ip(2)]));

        registry.notfound(PKG, ip(1));
        registry.notfound(PKG, ip(2));

        let start = Instant::now();

        assert_eq!(ticket.wait(Duration::from_secs(5)).await, None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn partial_decline_runs_out_the_deadline() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1), ip(2)]));

        registry.notfound(PKG, ip(1));

        let start = Instant::now();

        assert_eq!(ticket.wait(Duration::from_millis(100)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn empty_snapshot_runs_out_the_deadline() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, HashSet::new());

        let start = Instant::now();

        assert_eq!(ticket.wait(Duration::from_millis(100)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn found_from_an_unexpected_peer_completes() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1)]));

        registry.found(PKG, ip(9));

        assert_eq!(ticket.wait(Duration::from_secs(1)).await, Some(ip(9)));
    }

    #[tokio::test]
    async fn answers_for_other_packages_are_ignored() {
        let registry = WaiterRegistry::new();

        let mut ticket = registry.create(PKG, set(&[ip(1)]));

        registry.found("other-1-1-x86_64.pkg.tar.zst", ip(1));
        registry.notfound("other-1-1-x86_64.pkg.tar.zst", ip(1));

        assert_eq!(ticket.wait(Duration::from_millis(100)).await, None);
    }

    #[tokio::test]
    async fn concurrent_waiters_for_one_package_each_complete() {
        let registry = WaiterRegistry::new();

        let mut first = registry.create(PKG, set(&[ip(1)]));
        let mut second = registry.create(PKG, set(&[ip(1)]));

        registry.found(PKG, ip(1));

        assert_eq!(first.wait(Duration::from_secs(1)).await, Some(ip(1)));
        assert_eq!(second.wait(Duration::from_secs(1)).await, Some(ip(1)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = WaiterRegistry::new();

        let ticket = registry.create(PKG, set(&[ip(1)]));

        registry.remove(&ticket);
        registry.remove(&ticket);

        assert_eq!(registry.len(), 0);
    }
}
