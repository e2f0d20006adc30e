use log::info;
use sip_core::{CallController, CallError, CallOutcome, LocalIdentity, Transport, TransportError};
use thiserror::Error;

pub mod net;
pub mod settings;
pub mod transport;

use crate::settings::{Settings, SettingsError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] SettingsError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("call failed: {0}")]
    Call(#[from] CallError),
}

/// Connects, registers and runs one call as described by `settings`.
pub fn run(settings: &Settings) -> Result<CallOutcome, AppError> {
    info!(
        "starting SIP agent {} at {} over {}",
        settings.username, settings.registrar_host, settings.transport
    );

    let transport = transport::connect(settings)?;
    let (discovered, local_port) = transport.local_endpoint();
    let local_host = match settings.local_ip {
        Some(ip) => ip.to_string(),
        None => discovered,
    };
    info!("advertising {local_host} for signalling and media");

    let identity = LocalIdentity {
        user: settings.username.clone(),
        registrar_host: settings.registrar_host.clone(),
        registrar_port: settings.registrar_port,
        local_host: local_host.clone(),
        local_port,
        transport: transport.kind(),
    };
    let config = settings.call_config(&local_host);

    let mut controller = CallController::new(transport, identity, config);
    Ok(controller.run()?)
}
