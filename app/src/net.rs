//! Address resolution and local address discovery.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
    })
}

/// Local IP the OS routes through to reach `peer`, or loopback when that
/// cannot be determined. Connecting a UDP socket sends no packets.
pub fn outbound_ip(peer: SocketAddr) -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let any: IpAddr = if peer.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let sock = UdpSocket::bind((any, 0))?;
        sock.connect(peer)?;
        Ok(sock.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => Ipv4Addr::LOCALHOST.into(),
        Err(e) => {
            log::warn!("local address discovery towards {peer} failed: {e}");
            Ipv4Addr::LOCALHOST.into()
        }
    }
}

/// Host and port to put in Via/Contact for a socket bound at `local`.
pub fn advertised(local: SocketAddr, peer: SocketAddr) -> (String, Option<u16>) {
    let ip = if local.ip().is_unspecified() {
        outbound_ip(peer)
    } else {
        local.ip()
    };
    (ip.to_string(), Some(local.port()))
}
