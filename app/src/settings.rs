//! Runtime configuration: an optional TOML file, overridden by flags.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use sip_core::{CallConfig, Header, Mode, TransportKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no registrar configured")]
    MissingRegistrar,
    #[error("invalid registrar {0:?}, expected host[:port]")]
    InvalidRegistrar(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    Ws,
    Tcp,
    Udp,
}

impl From<TransportChoice> for TransportKind {
    fn from(choice: TransportChoice) -> Self {
        match choice {
            TransportChoice::Ws => TransportKind::Ws,
            TransportChoice::Tcp => TransportKind::Tcp,
            TransportChoice::Udp => TransportKind::Udp,
        }
    }
}

/// Register with a SIP registrar, then place or wait for a single call.
#[derive(Debug, Parser)]
#[command(name = "sip-agent", version, about)]
pub struct Cli {
    /// TOML file with default settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Local user / extension number
    #[arg(short, long)]
    pub username: Option<String>,
    /// Registrar as host[:port]
    #[arg(short, long)]
    pub registrar: Option<String>,
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportChoice>,
    /// Call this number instead of waiting for an incoming call
    #[arg(long, conflicts_with = "wait")]
    pub call: Option<String>,
    /// Wait for an incoming call even if the config file names a callee
    #[arg(long)]
    pub wait: bool,
    /// Leave hanging up to the peer
    #[arg(long)]
    pub no_bye: bool,
    /// Answer with 100 Trying before ringing
    #[arg(long)]
    pub trying: bool,
    #[arg(long)]
    pub expires: Option<u32>,
    /// Receive timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Seconds to stay connected before hanging up
    #[arg(long)]
    pub settle: Option<u64>,
    #[arg(long)]
    pub media_port: Option<u16>,
    /// Address to advertise instead of the discovered one
    #[arg(long)]
    pub local_ip: Option<IpAddr>,
    /// Request path for the WebSocket upgrade
    #[arg(long)]
    pub ws_path: Option<String>,
    /// Replaces header value for the INVITE
    #[arg(long, conflicts_with = "join")]
    pub replaces: Option<String>,
    /// Join header value for the INVITE
    #[arg(long)]
    pub join: Option<String>,
}

/// Contents of the config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub username: Option<String>,
    pub registrar: Option<String>,
    pub transport: Option<TransportChoice>,
    pub ws_path: Option<String>,
    pub callee: Option<String>,
    pub send_bye: Option<bool>,
    pub send_trying: Option<bool>,
    pub expires: Option<u32>,
    pub receive_timeout_secs: Option<u64>,
    pub settle_secs: Option<u64>,
    pub media_port: Option<u16>,
    pub local_ip: Option<IpAddr>,
    pub replaces: Option<String>,
    pub join: Option<String>,
}

impl FileSettings {
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub username: String,
    pub registrar_host: String,
    pub registrar_port: Option<u16>,
    pub transport: TransportKind,
    pub ws_path: String,
    pub callee: Option<String>,
    pub send_bye: bool,
    pub send_trying: bool,
    pub expires: u32,
    pub receive_timeout: Duration,
    pub settle: Duration,
    pub media_port: u16,
    pub local_ip: Option<IpAddr>,
    pub invite_headers: Vec<Header>,
}

impl Settings {
    pub fn load(cli: Cli) -> Result<Self, SettingsError> {
        let file = match &cli.config {
            Some(path) => FileSettings::from_path(path)?,
            None => FileSettings::default(),
        };
        Self::merge(file, cli)
    }

    /// Flags win over the file, the file over built-in defaults.
    pub fn merge(file: FileSettings, cli: Cli) -> Result<Self, SettingsError> {
        let registrar = cli
            .registrar
            .or(file.registrar)
            .ok_or(SettingsError::MissingRegistrar)?;
        let (registrar_host, registrar_port) = split_host_port(&registrar)?;

        let callee = if cli.wait { None } else { cli.call.or(file.callee) };

        let mut invite_headers = Vec::new();
        if let Some(replaces) = cli.replaces.or(file.replaces) {
            invite_headers.push(Header::new("Replaces", replaces));
        } else if let Some(join) = cli.join.or(file.join) {
            invite_headers.push(Header::new("Join", join));
        }

        Ok(Self {
            username: cli.username.or(file.username).unwrap_or_else(|| "1100".into()),
            registrar_host,
            registrar_port,
            transport: cli
                .transport
                .or(file.transport)
                .unwrap_or(TransportChoice::Ws)
                .into(),
            ws_path: cli.ws_path.or(file.ws_path).unwrap_or_else(|| "/".into()),
            callee,
            send_bye: !cli.no_bye && file.send_bye.unwrap_or(true),
            send_trying: cli.trying || file.send_trying.unwrap_or(false),
            expires: cli.expires.or(file.expires).unwrap_or(3600),
            receive_timeout: Duration::from_secs(
                cli.timeout.or(file.receive_timeout_secs).unwrap_or(30),
            ),
            settle: Duration::from_secs(cli.settle.or(file.settle_secs).unwrap_or(3)),
            media_port: cli
                .media_port
                .or(file.media_port)
                .unwrap_or(sdp::DEFAULT_MEDIA_PORT),
            local_ip: cli.local_ip.or(file.local_ip),
            invite_headers,
        })
    }

    /// Registrar port, or the usual one for the transport.
    pub fn registrar_port_or_default(&self) -> u16 {
        self.registrar_port.unwrap_or(match self.transport {
            TransportKind::Ws => 80,
            TransportKind::Tcp | TransportKind::Udp => 5060,
        })
    }

    pub fn ws_url(&self) -> String {
        let path = if self.ws_path.starts_with('/') {
            self.ws_path.clone()
        } else {
            format!("/{}", self.ws_path)
        };
        format!(
            "ws://{}:{}{}",
            sip_core::bracket_host(&self.registrar_host),
            self.registrar_port_or_default(),
            path
        )
    }

    pub fn mode(&self) -> Mode {
        match &self.callee {
            Some(callee) => Mode::Invite {
                callee: callee.clone(),
            },
            None => Mode::Wait,
        }
    }

    pub fn call_config(&self, media_ip: &str) -> CallConfig {
        CallConfig {
            mode: self.mode(),
            send_bye: self.send_bye,
            send_trying: self.send_trying,
            expires: self.expires,
            receive_timeout: self.receive_timeout,
            settle: self.settle,
            media: sdp::MediaEndpoint {
                ip: media_ip.to_string(),
                port: self.media_port,
            },
            invite_headers: self.invite_headers.clone(),
        }
    }
}

fn split_host_port(value: &str) -> Result<(String, Option<u16>), SettingsError> {
    let value = value.trim();
    let invalid = || SettingsError::InvalidRegistrar(value.to_string());
    let (host, port) = sip_core::split_host_port(value).ok_or_else(invalid)?;
    if host.is_empty() || host.contains('/') {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sip-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_with_registrar_only() {
        let settings = Settings::merge(FileSettings::default(), cli(&["-r", "pbx.local"])).unwrap();
        assert_eq!(settings.username, "1100");
        assert_eq!(settings.registrar_host, "pbx.local");
        assert_eq!(settings.registrar_port, None);
        assert_eq!(settings.transport, TransportKind::Ws);
        assert_eq!(settings.mode(), Mode::Wait);
        assert!(settings.send_bye);
        assert!(!settings.send_trying);
        assert_eq!(settings.expires, 3600);
        assert_eq!(settings.receive_timeout, Duration::from_secs(30));
        assert_eq!(settings.settle, Duration::from_secs(3));
        assert_eq!(settings.media_port, 49170);
        assert_eq!(settings.ws_url(), "ws://pbx.local:80/");
    }

    #[test]
    fn flags_override_file() {
        let file: FileSettings = toml::from_str(
            r#"
            username = "2000"
            registrar = "10.0.0.1:5080"
            transport = "udp"
            callee = "1200"
            send_bye = false
            settle_secs = 10
            "#,
        )
        .unwrap();
        let settings =
            Settings::merge(file, cli(&["-u", "2001", "-t", "tcp", "--settle", "1"])).unwrap();
        assert_eq!(settings.username, "2001");
        assert_eq!(settings.registrar_host, "10.0.0.1");
        assert_eq!(settings.registrar_port, Some(5080));
        assert_eq!(settings.transport, TransportKind::Tcp);
        assert_eq!(
            settings.mode(),
            Mode::Invite {
                callee: "1200".into()
            }
        );
        assert!(!settings.send_bye);
        assert_eq!(settings.settle, Duration::from_secs(1));
    }

    #[test]
    fn wait_flag_beats_file_callee() {
        let file: FileSettings = toml::from_str("registrar = \"pbx\"\ncallee = \"1200\"").unwrap();
        let settings = Settings::merge(file, cli(&["--wait"])).unwrap();
        assert_eq!(settings.mode(), Mode::Wait);
    }

    #[test]
    fn invite_extension_headers() {
        let settings = Settings::merge(
            FileSettings::default(),
            cli(&["-r", "pbx", "--call", "1200", "--replaces", "abc;to-tag=1;from-tag=2"]),
        )
        .unwrap();
        assert_eq!(
            settings.invite_headers,
            vec![Header::new("Replaces", "abc;to-tag=1;from-tag=2")]
        );
        let config = settings.call_config("192.0.2.10");
        assert_eq!(config.media.ip, "192.0.2.10");
        assert_eq!(config.invite_headers.len(), 1);

        assert!(Cli::try_parse_from(["sip-agent", "--replaces", "a", "--join", "b"]).is_err());
    }

    #[test]
    fn registrar_errors() {
        assert!(matches!(
            Settings::merge(FileSettings::default(), cli(&[])),
            Err(SettingsError::MissingRegistrar)
        ));
        assert!(matches!(
            Settings::merge(FileSettings::default(), cli(&["-r", "pbx:http"])),
            Err(SettingsError::InvalidRegistrar(_))
        ));
        assert!(toml::from_str::<FileSettings>("colour = \"blue\"").is_err());
    }

    #[test]
    fn default_ports_follow_transport() {
        let settings =
            Settings::merge(FileSettings::default(), cli(&["-r", "pbx", "-t", "udp"])).unwrap();
        assert_eq!(settings.registrar_port_or_default(), 5060);
        let settings = Settings::merge(
            FileSettings::default(),
            cli(&["-r", "pbx:8088", "--ws-path", "ws"]),
        )
        .unwrap();
        assert_eq!(settings.ws_url(), "ws://pbx:8088/ws");
    }

    #[test]
    fn ipv6_registrar() {
        let settings = Settings::merge(
            FileSettings::default(),
            cli(&["-r", "[2001:db8::1]:5080", "-t", "udp"]),
        )
        .unwrap();
        assert_eq!(settings.registrar_host, "2001:db8::1");
        assert_eq!(settings.registrar_port, Some(5080));

        let bare = Settings::merge(FileSettings::default(), cli(&["-r", "2001:db8::1"])).unwrap();
        assert_eq!(bare.registrar_host, "2001:db8::1");
        assert_eq!(bare.registrar_port, None);
        assert_eq!(bare.ws_url(), "ws://[2001:db8::1]:80/");

        assert!(matches!(
            Settings::merge(FileSettings::default(), cli(&["-r", "[2001:db8::1"])),
            Err(SettingsError::InvalidRegistrar(_))
        ));
    }
}
