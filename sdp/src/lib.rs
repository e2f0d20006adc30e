//! Minimal SDP handling: an audio offer template, extraction of the
//! connection address and audio port, and an answer that echoes them.

use core::fmt::Write;

use thiserror::Error;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_MEDIA_PORT: u16 = 49170;
const DEFAULT_SESSION_ID: u64 = 13_760_799_956_958_020;
const PCMU: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoint {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: u64,
    pub session_version: u64,
    pub connection_address: String,
    pub media_port: u16,
    pub payload_type: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("invalid SDP: {0}")]
    Invalid(String),
}

impl SessionDescription {
    /// PCMU audio offer for `endpoint`.
    pub fn offer(endpoint: &MediaEndpoint) -> Self {
        Self {
            session_id: DEFAULT_SESSION_ID,
            session_version: DEFAULT_SESSION_ID,
            connection_address: endpoint.ip.clone(),
            media_port: endpoint.port,
            payload_type: PCMU,
        }
    }

    /// Answer echoing the offer's address and port, same session id, origin
    /// version bumped by one.
    pub fn answer_to(offer: &SessionDescription) -> Self {
        Self {
            session_id: offer.session_id,
            session_version: offer.session_version.wrapping_add(1),
            connection_address: offer.connection_address.clone(),
            media_port: offer.media_port,
            payload_type: offer.payload_type,
        }
    }

    pub fn endpoint(&self) -> MediaEndpoint {
        MediaEndpoint {
            ip: self.connection_address.clone(),
            port: self.media_port,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "v=0\r\n\
             o=- {} {} IN IP4 {}\r\n\
             s=-\r\n\
             c=IN IP4 {}\r\n\
             t=0 0\r\n\
             m=audio {} RTP/AVP {}\r\n",
            self.session_id,
            self.session_version,
            self.connection_address,
            self.connection_address,
            self.media_port,
            self.payload_type,
        );
        if let Some(map) = rtpmap(self.payload_type) {
            let _ = write!(out, "a=rtpmap:{} {}\r\n", self.payload_type, map);
        }
        out.push_str("a=sendrecv\r\n");
        out
    }
}

fn rtpmap(payload_type: u8) -> Option<&'static str> {
    match payload_type {
        0 => Some("PCMU/8000"),
        8 => Some("PCMA/8000"),
        _ => None,
    }
}

/// Parses the fields we care about. Missing `c=`/`m=` lines fall back to
/// [`DEFAULT_ADDRESS`] and [`DEFAULT_MEDIA_PORT`].
pub fn parse(input: &str) -> Result<SessionDescription, SdpError> {
    let mut lines = input.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("v=0") => {}
        Some(other) => return Err(SdpError::Invalid(format!("unexpected first line {other:?}"))),
        None => return Err(SdpError::Invalid("empty body".into())),
    }

    let mut sdp = SessionDescription {
        session_id: DEFAULT_SESSION_ID,
        session_version: DEFAULT_SESSION_ID,
        connection_address: DEFAULT_ADDRESS.to_string(),
        media_port: DEFAULT_MEDIA_PORT,
        payload_type: PCMU,
    };
    let mut seen_media = false;

    for line in lines {
        if let Some(origin) = line.strip_prefix("o=") {
            let fields: Vec<&str> = origin.split_whitespace().collect();
            if let [_, id, version, ..] = fields.as_slice() {
                sdp.session_id = id.parse().unwrap_or(sdp.session_id);
                sdp.session_version = version.parse().unwrap_or(sdp.session_version);
            }
        } else if let Some(conn) = line.strip_prefix("c=IN IP4 ") {
            // Session-level c= applies unless the audio section overrides it.
            if let Some(addr) = conn.split('/').next() {
                sdp.connection_address = addr.trim().to_string();
            }
        } else if let Some(media) = line.strip_prefix("m=audio ") {
            if seen_media {
                continue;
            }
            seen_media = true;
            let mut parts = media.split_whitespace();
            sdp.media_port = parts
                .next()
                .and_then(|p| p.split('/').next())
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| SdpError::Invalid(format!("bad media line {line:?}")))?;
            sdp.payload_type = parts
                .nth(1)
                .and_then(|pt| pt.parse().ok())
                .unwrap_or(PCMU);
        }
    }

    Ok(sdp)
}

/// Renders the answer for an offer body.
pub fn answer(offer: &str) -> Result<String, SdpError> {
    let offer = parse(offer)?;
    Ok(SessionDescription::answer_to(&offer).render())
}
