use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use sip_core::{Transport, TransportError, TransportKind};

use super::{connect_error, is_timeout, read_timeout, MAX_MESSAGE};
use crate::net;

/// TCP stream to the registrar. Each read is taken as one whole message.
pub struct TcpTransport {
    stream: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    rx_buf: Vec<u8>,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let peer = net::resolve(host, port).map_err(connect_error(host, port))?;
        let stream = TcpStream::connect(peer).map_err(connect_error(host, port))?;
        stream.set_nodelay(true).map_err(connect_error(host, port))?;
        let local = stream.local_addr().map_err(connect_error(host, port))?;
        log::info!("TCP connection {local} -> {peer}");
        Ok(Self {
            stream,
            local,
            peer,
            rx_buf: vec![0; MAX_MESSAGE],
        })
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn local_endpoint(&self) -> (String, Option<u16>) {
        net::advertised(self.local, self.peer)
    }

    fn send(&mut self, message: &str) -> Result<(), TransportError> {
        self.stream
            .write_all(message.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(TransportError::Send)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        self.stream
            .set_read_timeout(read_timeout(timeout))
            .map_err(TransportError::Receive)?;
        match self.stream.read(&mut self.rx_buf) {
            Ok(0) => Err(TransportError::Closed),
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
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn stream_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1500];
            let len = conn.read(&mut buf).unwrap();
            conn.write_all(&buf[..len]).unwrap();
        });

        let mut client = TcpTransport::connect("127.0.0.1", port).unwrap();
        assert_eq!(client.kind(), TransportKind::Tcp);
        client.send("REGISTER sip:a SIP/2.0\r\n\r\n").unwrap();
        let echoed = client.receive(Duration::from_secs(2)).unwrap();
        assert_eq!(echoed.as_deref(), Some("REGISTER sip:a SIP/2.0\r\n\r\n"));
        server.join().unwrap();

        assert!(matches!(
            client.receive(Duration::from_secs(2)),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn silence_is_a_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = TcpTransport::connect("127.0.0.1", port).unwrap();
        let _conn = listener.accept().unwrap();
        assert_eq!(client.receive(Duration::from_millis(50)).unwrap(), None);
    }

    #[test]
    fn refused_connection_names_target() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        match TcpTransport::connect("127.0.0.1", port) {
            Err(TransportError::Connect { target, .. }) => {
                assert_eq!(target, format!("127.0.0.1:{port}"));
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
