//! Socket bindings for [`sip_core::Transport`].

use std::io;
use std::time::Duration;

use sip_core::{Transport, TransportError, TransportKind};

use crate::settings::Settings;

mod tcp;
mod udp;
mod ws;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;
pub use ws::WsTransport;

const MAX_MESSAGE: usize = 65_535;

pub type BoxedTransport = Box<dyn Transport + Send>;

/// Opens the binding selected in `settings` towards the registrar.
pub fn connect(settings: &Settings) -> Result<BoxedTransport, TransportError> {
    let host = settings.registrar_host.as_str();
    let port = settings.registrar_port_or_default();
    Ok(match settings.transport {
        TransportKind::Ws => Box::new(WsTransport::connect(&settings.ws_url())?),
        TransportKind::Tcp => Box::new(TcpTransport::connect(host, port)?),
        TransportKind::Udp => Box::new(UdpTransport::connect(host, port)?),
    })
}

// A zero read timeout means "block forever" to std sockets.
fn read_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn connect_error(host: &str, port: u16) -> impl FnOnce(io::Error) -> TransportError {
    let target = format!("{host}:{port}");
    move |source| TransportError::Connect { target, source }
}
