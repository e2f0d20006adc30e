use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use sip_core::{Transport, TransportError, TransportKind};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::{Error as WsError, Message as WsMessage, WebSocket};

use super::{connect_error, is_timeout, read_timeout};
use crate::net;

const SUBPROTOCOL: &str = "sip";

/// SIP over WebSocket, one message per text frame.
pub struct WsTransport {
    socket: WebSocket<TcpStream>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl WsTransport {
    /// Connects to a `ws://` URL and negotiates the `sip` subprotocol.
    pub fn connect(url: &str) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::WebSocket(format!("bad URL {url}: {e}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );

        let host = request
            .uri()
            .host()
            .ok_or_else(|| TransportError::WebSocket(format!("no host in {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = request.uri().port_u16().unwrap_or(80);
        let peer = net::resolve(&host, port).map_err(connect_error(&host, port))?;
        let stream = TcpStream::connect(peer).map_err(connect_error(&host, port))?;
        let local = stream.local_addr().map_err(connect_error(&host, port))?;

        let (socket, _response) = tungstenite::client(request, stream)
            .map_err(|e| TransportError::WebSocket(format!("handshake with {url} failed: {e}")))?;
        log::info!("WebSocket {local} -> {url}");
        Ok(Self {
            socket,
            local,
            peer,
        })
    }
}

fn map_ws_error(err: WsError, io_kind: fn(io::Error) -> TransportError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => io_kind(e),
        other => TransportError::WebSocket(other.to_string()),
    }
}

impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ws
    }

    fn local_endpoint(&self) -> (String, Option<u16>) {
        net::advertised(self.local, self.peer)
    }

    fn send(&mut self, message: &str) -> Result<(), TransportError> {
        self.socket
            .send(WsMessage::Text(message.to_string()))
            .map_err(|e| map_ws_error(e, TransportError::Send))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        self.socket
            .get_ref()
            .set_read_timeout(read_timeout(timeout))
            .map_err(TransportError::Receive)?;
        loop {
            match self.socket.read() {
                Ok(WsMessage::Text(text)) => return Ok(Some(text)),
                Ok(WsMessage::Binary(data)) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()))
                }
                Ok(WsMessage::Close(frame)) => {
                    log::info!("WebSocket closed by peer: {frame:?}");
                    return Err(TransportError::Closed);
                }
                // Ping/pong; tungstenite queues the pong itself.
                Ok(_) => continue,
                Err(WsError::Io(ref e)) if is_timeout(e) => return Ok(None),
                Err(e) => return Err(map_ws_error(e, TransportError::Receive)),
            }
        }
    }
}
