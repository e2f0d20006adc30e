use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use sip_core::{Transport, TransportError, TransportKind};

use super::{connect_error, is_timeout, read_timeout, MAX_MESSAGE};
use crate::net;

/// Connected UDP socket. One datagram is one message.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
    rx_buf: Vec<u8>,
}

impl UdpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let peer = net::resolve(host, port).map_err(connect_error(host, port))?;
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).map_err(connect_error(host, port))?;
        socket.connect(peer).map_err(connect_error(host, port))?;
        let local = socket.local_addr().map_err(connect_error(host, port))?;
        log::info!("UDP socket {local} -> {peer}");
        Ok(Self {
            socket,
            local,
            peer,
            rx_buf: vec![0; MAX_MESSAGE],
        })
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_endpoint(&self) -> (String, Option<u16>) {
        net::advertised(self.local, self.peer)
    }

    fn send(&mut self, message: &str) -> Result<(), TransportError> {
        self.socket
            .send(message.as_bytes())
            .map_err(TransportError::Send)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        self.socket
            .set_read_timeout(read_timeout(timeout))
            .map_err(TransportError::Receive)?;
        match self.socket.recv(&mut self.rx_buf) {
            Ok(len) => Ok(Some(
                String::from_utf8_lossy(&self.rx_buf[..len]).into_owned(),
            )),
            Err(ref e) if is_timeout(e) => Ok(None),
            Err(e) => Err(TransportError::Receive(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = UdpTransport::connect("127.0.0.1", addr.port()).unwrap();
        assert_eq!(client.kind(), TransportKind::Udp);
        let (host, port) = client.local_endpoint();
        assert_eq!(host, "127.0.0.1");
        assert!(port.is_some());

        client.send("OPTIONS sip:a SIP/2.0\r\n\r\n").unwrap();
        let mut buf = [0u8; 1500];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"OPTIONS sip:a SIP/2.0\r\n\r\n");

        server.send_to(b"SIP/2.0 200 OK\r\n\r\n", from).unwrap();
        let reply = client.receive(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.as_deref(), Some("SIP/2.0 200 OK\r\n\r\n"));
    }

    #[test]
    fn silence_is_a_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = UdpTransport::connect("127.0.0.1", port).unwrap();
        assert_eq!(client.receive(Duration::from_millis(50)).unwrap(), None);
    }
}
