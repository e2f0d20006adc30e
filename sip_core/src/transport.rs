use core::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Which binding carries the signalling. Fixes the Via transport token and
/// the `transport=` URI parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ws,
    Tcp,
    Udp,
}

impl TransportKind {
    pub fn via_token(self) -> &'static str {
        match self {
            TransportKind::Ws => "WS",
            TransportKind::Tcp => "TCP",
            TransportKind::Udp => "UDP",
        }
    }

    /// Value for a `transport=` URI param. UDP is the SIP default and is
    /// left implicit.
    pub fn uri_param(self) -> Option<&'static str> {
        match self {
            TransportKind::Ws => Some("transport=ws"),
            TransportKind::Tcp => Some("transport=tcp"),
            TransportKind::Udp => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.via_token())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Message-oriented signalling channel.
///
/// Each `receive` yields exactly one SIP message. Stream and datagram
/// bindings treat one read as one message; they do not reassemble
/// fragmented or split coalesced messages.
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Host and port to advertise in Via and Contact.
    fn local_endpoint(&self) -> (String, Option<u16>);

    fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next message. `Ok(None)` means the wait
    /// expired with nothing received.
    fn receive(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn local_endpoint(&self) -> (String, Option<u16>) {
        (**self).local_endpoint()
    }

    fn send(&mut self, message: &str) -> Result<(), TransportError> {
        (**self).send(message)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        (**self).receive(timeout)
    }
}
