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
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::error::{PacmeshError, PacmeshResult};
use crate::http;
use crate::membership::Membership;
use crate::protocol::{Message, Variant};
use crate::store::PackageStore;
use crate::waiters::WaiterRegistry;

pub struct Pacmesh {
    /// Multicast endpoint. The event loop owns the receive side; the send
    /// side is shared with the HTTP handlers.
    socket: Arc<UdpSocket>,

    /// Listener for the HTTP surface, bound up-front so a taken port is a
    /// startup failure rather than a background one.
    listener: Option<TcpListener>,

    /// State shared with the HTTP handlers and timer tasks.
    shared: Arc<Shared>,

    /// Main event loop receiver, fed by the beacon timer.
    rx: mpsc::UnboundedReceiver<Tick>,

    /// Tells the HTTP task to stop accepting and drain.
    tx_shutdown: watch::Sender<bool>,
    rx_shutdown: watch::Receiver<bool>,

    http_task: Option<JoinHandle<()>>,

    /// Cadence of the unsolicited liveness beacon.
    pong_interval: Duration,
}

/// Timer events delivered into the main event loop.
pub(crate) enum Tick {
    /// Upon repeating timer of `pong_interval_seconds`.
    Pong,
}

/// Data shared between the event loop, the timers, and the HTTP handlers.
pub struct Shared {
    store: PackageStore,

    membership: Membership,

    waiters: WaiterRegistry,

    /// Send half of the multicast endpoint.
    socket: Arc<UdpSocket>,

    /// Group address all peer traffic is sent to.
    group: SocketAddrV4,

    /// Group host rendered once for the informational dest field.
    group_host: String,

    /// Port clustermates serve their cache route on, used for redirects.
    http_port: u16,

    /// Hard bound on a lookup's wait for group answers.
    lookup_deadline: Duration,

    /// Addresses of local interfaces. A datagram sourced from one of these
    /// is our own multicast echo and must never reach the dispatch table.
    local_addrs: HashSet<IpAddr>,

    /// Main event loop sender, cloned into timer tasks.
    tx: mpsc::UnboundedSender<Tick>,
}

/// Outcome of one `/search` lookup.
pub enum Lookup {
    /// Present in the local package cache.
    Local(PathBuf),

    /// A clustermate holds the file.
    Remote(IpAddr),

    /// Nobody has it, nobody answered in time, or the name is unshareable.
    Miss,
}

impl Pacmesh {
    pub async fn new(config: Config) -> PacmeshResult<Self> {
        let general = config.general;

        if !general.multicast_group.is_multicast() {
            return Err(PacmeshError::NotMulticast(general.multicast_group));
        }

        let group = SocketAddrV4::new(general.multicast_group, general.multicast_port);
        let socket = Arc::new(bind_multicast(&group, general.multicast_ttl)?);

        let http_port = general.http_port.unwrap_or(general.multicast_port);
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, http_port)).await?;

        let local_addrs = if_addrs::get_if_addrs()?
            .into_iter()
            .map(|interface| interface.addr.ip())
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let (tx_shutdown, rx_shutdown) = watch::channel(false);

        let shared = Arc::new(Shared::new(
            PackageStore::new(general.cache_dirs),
            Membership::new(Duration::from_secs(general.peer_ttl_seconds)),
            WaiterRegistry::new(),
            socket.clone(),
            group,
            http_port,
            Duration::from_millis(general.lookup_deadline_ms),
            local_addrs,
            tx,
        ));

        Ok(Self {
            socket,
            listener: Some(listener),
            shared,
            rx,
            tx_shutdown,
            rx_shutdown,
            http_task: None,
            pong_interval: Duration::from_secs(general.pong_interval_seconds),
        })
    }

    /// Start the main event loop.
    ///
    /// Announces our presence, brings up the HTTP surface, then processes
    /// datagrams and beacon ticks until interrupted.
    pub async fn up(&mut self) -> PacmeshResult<()> {
        self.start_timers();
        self.spawn_http();

        self.shared
            .broadcast(&Message::ping(&self.shared.group_host))
            .await;

        info!(
            "Joined group, processing datagrams (group = {})",
            self.shared.group
        );

        let mut buf = [0u8; 4096];

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    self.shared
                        .broadcast(&Message::gone(&self.shared.group_host))
                        .await;

                    return self.drain().await;
                }
                Ok((len, addr)) = self.socket.recv_from(&mut buf) => {
                    self.shared.dispatch(addr, &buf[..len]).await;
                }
                Some(tick) = self.rx.recv() => {
                    match tick {
                        Tick::Pong => {
                            debug!(
                                "Emitting liveness beacon (live peers = {})",
                                self.shared.membership.len()
                            );

                            self.shared
                                .broadcast(&Message::pong(&self.shared.group_host))
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Stop accepting HTTP requests and let in-flight lookups run out their
    /// deadline before the socket goes away.
    async fn drain(&mut self) -> PacmeshResult<()> {
        self.tx_shutdown.send(true)?;

        if let Some(task) = self.http_task.take() {
            let _ = task.await;
        }

        Ok(())
    }

    fn spawn_http(&mut self) {
        if let Some(listener) = self.listener.take() {
            let app = http::router(self.shared.clone());
            let mut rx_shutdown = self.rx_shutdown.clone();

            self.http_task = Some(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = rx_shutdown.changed().await;
                };

                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!("Http surface failed: {}", e);
                }
            }));
        }
    }

    /// Starts background timers.
    ///
    /// The pong beacon timer will initialize here.
    fn start_timers(&mut self) {
        let shared = self.shared.clone();
        let pong_interval = self.pong_interval;

        tokio::spawn(async move {
            loop {
                sleep(pong_interval).await;

                if let Err(e) = shared.tx.send(Tick::Pong) {
                    error!("Unable to send pong tick: {0}", e);
                }
            }
        });
    }
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: PackageStore,
        membership: Membership,
        waiters: WaiterRegistry,
        socket: Arc<UdpSocket>,
        group: SocketAddrV4,
        http_port: u16,
        lookup_deadline: Duration,
        local_addrs: HashSet<IpAddr>,
        tx: mpsc::UnboundedSender<Tick>,
    ) -> Self {
        Self {
            store,
            membership,
            waiters,
            socket,
            group_host: group.ip().to_string(),
            group,
            http_port,
            lookup_deadline,
            local_addrs,
            tx,
        }
    }

    /// Transmit `message` to the multicast group.
    ///
    /// A failed send degrades to a warning; an unanswered search simply
    /// times out on the waiting side.
    async fn broadcast(&self, message: &Message<'_>) {
        if let Err(e) = self.socket.send_to(&message.to_bytes(), self.group).await {
            warn!("Unable to send {} to group: {}", message.variant, e);
        }
    }

    /// The important stuff happens here: act on one inbound datagram.
    ///
    /// Any well-formed message refreshes the sender's membership entry, so a
    /// mate busy answering searches is not expired between beacons.
    pub(crate) async fn dispatch(&self, addr: SocketAddr, datagram: &[u8]) {
        let source = addr.ip();

        // Loopback delivery is disabled on the socket; drop our own
        // datagrams even if the transport hands them over anyway.
        if self.local_addrs.contains(&source) {
            return;
        }

        let message = match Message::parse(datagram) {
            Ok((_, message)) => message,
            Err(_) => {
                debug!("Discarding malformed datagram (addr = {})", addr);

                return;
            }
        };

        debug!("Received {} (addr = {})", message.variant, addr);

        match message.variant {
            Variant::Search => {
                self.membership.touch(source);

                if let Some(pkg) = message.pkg {
                    let reply = match self.store.find_package(pkg) {
                        Some(_) => Message::found(pkg, &self.group_host),
                        None => Message::notfound(pkg, &self.group_host),
                    };

                    self.broadcast(&reply).await;
                }
            }
            Variant::Found => {
                self.membership.touch(source);

                if let Some(pkg) = message.pkg {
                    self.waiters.found(pkg, source);
                }
            }
            Variant::NotFound => {
                self.membership.touch(source);

                if let Some(pkg) = message.pkg {
                    self.waiters.notfound(pkg, source);
                }
            }
            Variant::Ping => {
                self.membership.touch(source);

                self.broadcast(&Message::pong(&self.group_host)).await;
            }
            Variant::Pong => {
                self.membership.touch(source);
            }
            Variant::Gone => {
                self.membership.remove(source);
            }
        }
    }

    /// Resolve one `/search` request: local cache first, then a bounded
    /// multicast search against the current clustermates.
    pub async fn lookup(&self, pkgname: &str) -> Lookup {
        if !PackageStore::is_allowed(pkgname) {
            debug!("Refusing to search unshareable name (pkg = {})", pkgname);

            return Lookup::Miss;
        }

        if let Some(path) = self.store.find_package(pkgname) {
            return Lookup::Local(path);
        }

        let snapshot = self.membership.snapshot();
        let mut ticket = self.waiters.create(pkgname, snapshot);

        info!("Multicast search (pkg = {})", pkgname);

        self.broadcast(&Message::search(pkgname, &self.group_host))
            .await;

        let address = ticket.wait(self.lookup_deadline).await;

        self.waiters.remove(&ticket);

        debug!(
            "Request done waiting (pkg = {}) (address = {:?})",
            pkgname, address
        );

        match address {
            Some(address) => Lookup::Remote(address),
            None => Lookup::Miss,
        }
    }

    /// Where a client should fetch `pkgname` from on `peer`.
    pub fn redirect_url(&self, peer: IpAddr, pkgname: &str) -> String {
        format!("http://{}:{}/cache/{}", peer, self.http_port, pkgname)
    }

    pub fn find_package(&self, pkgname: &str) -> Option<PathBuf> {
        self.store.find_package(pkgname)
    }
}

/// Bind the shared multicast endpoint.
///
/// SO_REUSEADDR (and SO_REUSEPORT where available) are set before the bind
/// so several mates can coexist on one machine during development, then the
/// group is joined with loopback delivery disabled.
fn bind_multicast(group: &SocketAddrV4, multicast_ttl: u32) -> PacmeshResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()));
    socket.bind(&bind_addr.into())?;

    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_multicast_ttl_v4(multicast_ttl)?;

    Ok(UdpSocket::from_std(socket.into())?)
}
