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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacmeshError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Mismatching protocol version, expected {expected}, received {received}")]
    VersionMismatch { expected: u8, received: u8 },

    #[error("Invalid message variant {0}")]
    InvalidMessageVariant(u8),

    #[error("Not a multicast group address {0}")]
    NotMulticast(std::net::Ipv4Addr),

    #[error("Malformed configuration {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("Http shutdown watch channel error {0}")]
    ShutdownWatchError(#[from] tokio::sync::watch::error::SendError<bool>),
}

pub type PacmeshResult<T> = std::result::Result<T, PacmeshError>;
