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

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Cache of clustermates we know about *and* have heard from inside the
/// liveness window. Inbound traffic keeps the list fresh without polling.
pub struct Membership {
    peers: Mutex<HashMap<IpAddr, Instant>>,

    /// Silence tolerated before an entry stops counting as live.
    ttl: Duration,
}

impl Membership {
    pub fn new(ttl: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record traffic from `addr`, creating the entry if absent.
    pub fn touch(&self, addr: IpAddr) {
        let mut peers = self.peers.lock();

        if peers.insert(addr, Instant::now()).is_none() {
            debug!("Tracking new clustermate (addr = {})", addr);
        }
    }

    pub fn remove(&self, addr: IpAddr) {
        let mut peers = self.peers.lock();

        if peers.remove(&addr).is_some() {
            debug!("Clustermate left (addr = {})", addr);
        }
    }

    /// Addresses heard from within the liveness window.
    ///
    /// Performs the lazy sweep of expired entries, and returns a copy
    /// detached from the map so callers can hold it without the lock.
    pub fn snapshot(&self) -> HashSet<IpAddr> {
        let mut peers = self.peers.lock();

        let ttl = self.ttl;
        peers.retain(|_, last| last.elapsed() <= ttl);

        peers.keys().copied().collect()
    }

    /// Number of live clustermates, sweeping like `snapshot`.
    pub fn len(&self) -> usize {
        let mut peers = self.peers.lock();

        let ttl = self.ttl;
        peers.retain(|_, last| last.elapsed() <= ttl);

        peers.len()
    }
}
