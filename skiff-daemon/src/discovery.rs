//! LAN discovery: UDP multicast announcements, reply handshake, peer
//! timeout sweep. Feeds the address book and surfaces discovered/lost peers.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use skiff_core::{DeviceId, PeerId, PublicKey};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::transport::{PeerEntry, TcpTransport, TransportEvent, PROTOCOL_VERSION};

const MULTICAST_GROUP: &str = "239.255.71.71";
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// Discovery datagrams. A beacon goes to the multicast group; a reply goes
/// straight back to the beacon's sender so both sides learn each other.
#[derive(Debug, Serialize, Deserialize)]
enum Announce {
    Beacon {
        protocol_version: u8,
        device_id: DeviceId,
        display_name: String,
        public_key: PublicKey,
        transport_port: u16,
    },
    Reply {
        protocol_version: u8,
        device_id: DeviceId,
        display_name: String,
        public_key: PublicKey,
        transport_port: u16,
    },
}

pub async fn run_discovery(
    transport: TcpTransport,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let socket = std::sync::Arc::new(make_multicast_socket(discovery_port).await?);

    let beacon_socket = socket.clone();
    let beacon_transport = transport.clone();
    let beacon_task = tokio::spawn(async move {
        announce_loop(beacon_socket, beacon_transport, discovery_port, transport_port).await
    });
    let recv_socket = socket.clone();
    let recv_transport = transport.clone();
    let recv_task =
        tokio::spawn(async move { recv_loop(recv_socket, recv_transport, transport_port).await });
    let sweep_task = tokio::spawn(async move { sweep_loop(transport).await });

    let _ = tokio::try_join!(beacon_task, recv_task, sweep_task);
    Ok(())
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let multicast: std::net::Ipv4Addr =
        MULTICAST_GROUP
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            })?;
    std_sock.join_multicast_v4(&multicast, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn announce_loop(
    socket: std::sync::Arc<UdpSocket>,
    transport: TcpTransport,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let beacon = Announce::Beacon {
        protocol_version: PROTOCOL_VERSION,
        device_id: transport.keypair.device_id(),
        display_name: transport.display_name.clone(),
        public_key: transport.keypair.public_key().clone(),
        transport_port,
    };
    let datagram = bincode::serialize(&beacon)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest: SocketAddr = format!("{MULTICAST_GROUP}:{discovery_port}")
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    loop {
        if transport.advertising.load(Ordering::SeqCst) {
            let _ = socket.send_to(&datagram, dest).await;
        }
        tokio::time::sleep(ANNOUNCE_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: std::sync::Arc<UdpSocket>,
    transport: TcpTransport,
    transport_port: u16,
) -> std::io::Result<()> {
    let my_id = transport.keypair.device_id();
    let reply = Announce::Reply {
        protocol_version: PROTOCOL_VERSION,
        device_id: my_id,
        display_name: transport.display_name.clone(),
        public_key: transport.keypair.public_key().clone(),
        transport_port,
    };
    let reply_datagram = bincode::serialize(&reply)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => return Err(e),
        };
        if !transport.browsing.load(Ordering::SeqCst) {
            continue;
        }
        let announce: Announce = match bincode::deserialize(&buf[..n]) {
            Ok(a) => a,
            Err(_) => {
                debug!(%from, "ignoring undecodable discovery datagram");
                continue;
            }
        };
        let (version, device_id, display_name, public_key, port, is_beacon) = match announce {
            Announce::Beacon {
                protocol_version,
                device_id,
                display_name,
                public_key,
                transport_port,
            } => (protocol_version, device_id, display_name, public_key, transport_port, true),
            Announce::Reply {
                protocol_version,
                device_id,
                display_name,
                public_key,
                transport_port,
            } => (protocol_version, device_id, display_name, public_key, transport_port, false),
        };
        if version != PROTOCOL_VERSION || device_id == my_id {
            continue;
        }
        if DeviceId::from_public_key(public_key.as_bytes()) != device_id {
            warn!(%from, "discovery datagram with mismatched identity");
            continue;
        }

        let addr = SocketAddr::new(from.ip(), port);
        let is_new = {
            let mut book = transport.addr_book.lock().await;
            let is_new = !book.contains_key(&device_id);
            book.insert(
                device_id,
                PeerEntry {
                    addr,
                    public_key,
                    display_name: display_name.clone(),
                    last_seen: Instant::now(),
                },
            );
            is_new
        };
        if is_new {
            let peer = PeerId::new(device_id, display_name);
            debug!(%peer, %addr, "peer discovered");
            let _ = transport
                .events_tx
                .send(TransportEvent::Discovered { peer });
        }
        if is_beacon {
            let _ = socket.send_to(&reply_datagram, from).await;
        }
    }
}

async fn sweep_loop(transport: TcpTransport) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        let now = Instant::now();
        let expired: Vec<(DeviceId, String)> = {
            let mut book = transport.addr_book.lock().await;
            let expired: Vec<(DeviceId, String)> = book
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_seen) >= PEER_TIMEOUT)
                .map(|(id, e)| (*id, e.display_name.clone()))
                .collect();
            for (id, _) in &expired {
                book.remove(id);
            }
            expired
        };
        for (device_id, display_name) in expired {
            let peer = PeerId::new(device_id, display_name);
            debug!(%peer, "peer lost");
            let _ = transport.events_tx.send(TransportEvent::Lost { peer });
        }
    }
}
