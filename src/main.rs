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

#[macro_use]
extern crate log;

use std::env::var;

mod config;
mod error;
mod http;
mod membership;
mod pacmesh;
mod protocol;
mod store;
mod waiters;

use config::Config;
use pacmesh::Pacmesh;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("PACMESH_CONFIG").unwrap_or("pacmesh.toml".into());

    let config = Config::load(&config_loc)?;

    let mut pacmesh = Pacmesh::new(config).await?;

    pacmesh.up().await?;

    Ok(())
}
