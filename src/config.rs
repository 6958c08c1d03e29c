// Pacmesh - Cooperative LAN package cache daemon, redirecting misses to clustermates found over multicast
// Copyright (C) 2021  rumblefrog

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::PacmeshResult;

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(rename(deserialize = "General"), default)]
    pub general: General,
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct General {
    /// Multicast group shared by every clustermate.
    pub multicast_group: Ipv4Addr,

    /// UDP port the group traffic runs on.
    pub multicast_port: u16,

    /// HTTP listen port.
    /// Defaults to the multicast port, the convention redirects are built
    /// around; a deployment that splits the two must do so on every mate.
    pub http_port: Option<u16>,

    /// Ordered package cache roots. The first directory holding a requested
    /// file wins.
    pub cache_dirs: Vec<PathBuf>,

    /// Seconds without traffic before a clustermate is considered dead.
    pub peer_ttl_seconds: u64,

    /// Milliseconds a search waits for group answers before giving up.
    pub lookup_deadline_ms: u64,

    /// Seconds between unsolicited pong beacons.
    pub pong_interval_seconds: u64,

    /// Hop limit for outbound multicast packets.
    pub multicast_ttl: u32,
}

impl Default for General {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(239, 0, 0, 156),
            multicast_port: 8954,
            http_port: None,
            cache_dirs: vec![
                PathBuf::from("/var/cache/pacman/pkg"),
                PathBuf::from("/var/cache/makepkg/pkg"),
            ],
            peer_ttl_seconds: 60,
            lookup_deadline_ms: 500,
            pong_interval_seconds: 50,
            multicast_ttl: 2,
        }
    }
}

impl Config {
    /// Read configuration from `path`.
    ///
    /// A missing file yields the defaults; an unreadable or malformed file
    /// is a startup error.
    pub fn load(path: &str) -> PacmeshResult<Self> {
        match std::fs::read(path) {
            Ok(raw) => Ok(toml::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_general_section() {
        let c: Config = toml::from_str("").unwrap();

        assert_eq!(c.general.multicast_group, Ipv4Addr::new(239, 0, 0, 156));
        assert_eq!(c.general.multicast_port, 8954);
        assert_eq!(c.general.http_port, None);
        assert_eq!(c.general.lookup_deadline_ms, 500);
    }

    #[test]
    fn partial_general_section_keeps_remaining_defaults() {
        let c: Config = toml::from_str(
            "[General]\nmulticast_port = 9000\nhttp_port = 8080\ncache_dirs = [\"/srv/pkg\"]\n",
        )
        .unwrap();

        assert_eq!(c.general.multicast_port, 9000);
        assert_eq!(c.general.http_port, Some(8080));
        assert_eq!(c.general.cache_dirs, vec![PathBuf::from("/srv/pkg")]);
        assert_eq!(c.general.peer_ttl_seconds, 60);
        assert_eq!(c.general.pong_interval_seconds, 50);
    }
}
