//! Field extraction from parsed inbound messages.
//!
//! Mandatory fields fail with [`SipError::MissingHeader`]; optional ones come
//! back as `None` or an empty list.

use crate::message::{CSeq, Message, Uri};
use crate::{Result, SipError};

/// Splits a name-addr (`"Name" <uri>;params` or `uri;params`) into the URI
/// text and the header parameter tail.
fn split_name_addr(value: &str) -> (&str, &str) {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return (&value[start + 1..end], &value[end + 1..]);
        }
    }
    // Without angle brackets every ';' belongs to the header, not the URI.
    match value.find(';') {
        Some(idx) => (value[..idx].trim(), &value[idx..]),
        None => (value.trim(), ""),
    }
}

fn header_param<'a>(params: &'a str, name: &str) -> Option<&'a str> {
    params.split(';').find_map(|p| {
        let (key, value) = p.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
            .filter(|v| !v.is_empty())
    })
}

/// Tag parameter of a From or To header.
pub fn extract_tag(message: &Message, header: &str) -> Option<String> {
    let value = message.headers().get(header)?;
    let (_, params) = split_name_addr(value);
    header_param(params, "tag").map(str::to_string)
}

/// URI of a From/To-style header.
pub fn extract_identity(message: &Message, header: &str) -> Option<Uri> {
    let value = message.headers().get(header)?;
    split_name_addr(value).0.parse().ok()
}

pub fn extract_call_id(message: &Message) -> Result<String> {
    message
        .headers()
        .get("Call-ID")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(SipError::MissingHeader("Call-ID"))
}

pub fn extract_cseq(message: &Message) -> Result<CSeq> {
    message
        .headers()
        .get("CSeq")
        .ok_or(SipError::MissingHeader("CSeq"))?
        .parse()
}

pub fn extract_contact(message: &Message) -> Option<Uri> {
    let value = message.headers().get("Contact")?;
    let first = value.split(',').next()?;
    split_name_addr(first).0.parse().ok()
}

/// The `expires` parameter of the first Contact, if any.
pub fn extract_contact_expires(message: &Message) -> Option<u32> {
    let value = message.headers().get("Contact")?;
    let (_, params) = split_name_addr(value.split(',').next()?);
    header_param(params, "expires")?.parse().ok()
}

/// Record-Route URIs in receipt order, across repeated headers and
/// comma-joined values.
pub fn extract_record_route(message: &Message) -> Vec<Uri> {
    message
        .headers()
        .get_all("Record-Route")
        .flat_map(|value| value.split(','))
        .filter_map(|entry| split_name_addr(entry).0.parse().ok())
        .collect()
}

pub fn extract_request_target(message: &Message) -> Result<Uri> {
    let req = message
        .as_request()
        .ok_or_else(|| SipError::Malformed("expected a request".into()))?;
    req.uri.parse()
}

/// User part of the From URI, i.e. the calling number.
pub fn extract_caller_number(message: &Message) -> Result<String> {
    let from = extract_identity(message, "From").ok_or(SipError::MissingHeader("From"))?;
    from.user
        .ok_or_else(|| SipError::InvalidUri(format!("From without user part: {}", from.host)))
}

/// SDP body, when the message carries one.
pub fn extract_sdp(message: &Message) -> Option<&str> {
    let body = message.body();
    if body.trim().is_empty() {
        return None;
    }
    let is_sdp = message
        .headers()
        .get("Content-Type")
        .map(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/sdp"))
        })
        .unwrap_or_else(|| body.starts_with("v="));
    is_sdp.then_some(body)
}

/// Via values verbatim and in order, for echoing into responses.
pub fn extract_via_headers(message: &Message) -> Vec<String> {
    message
        .headers()
        .get_all("Via")
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{parse_message, Method};

    const INVITE: &str = "INVITE sip:1200@192.0.2.20:40000;transport=ws SIP/2.0\r\n\
        Via: SIP/2.0/WS 10.0.0.1;branch=z9hG4bKproxy\r\n\
        Via: SIP/2.0/WS 192.0.2.30;rport=5060;branch=z9hG4bKcaller\r\n\
        Record-Route: <sip:10.0.0.1;transport=ws;lr>\r\n\
        Record-Route: <sip:10.0.0.2;lr>, <sip:10.0.0.3;lr>\r\n\
        From: \"Alice\" <sip:1100@proxy>;tag=abc\r\n\
        To: <sip:1200@proxy>\r\n\
        Call-ID: 5f3c9a\r\n\
        CSeq: 4 INVITE\r\n\
        Contact: <sip:1100@192.0.2.30:5060;transport=ws;ob>;expires=60\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 6\r\n\r\n\
        v=0\r\n\x20";

    fn invite() -> Message {
        parse_message(INVITE).unwrap()
    }

    #[test]
    fn extracts_dialog_fields() {
        let msg = invite();
        assert_eq!(extract_tag(&msg, "From").as_deref(), Some("abc"));
        assert_eq!(extract_tag(&msg, "To"), None);
        assert_eq!(extract_call_id(&msg).unwrap(), "5f3c9a");
        let cseq = extract_cseq(&msg).unwrap();
        assert_eq!((cseq.seq, cseq.method), (4, Method::Invite));
        assert_eq!(extract_caller_number(&msg).unwrap(), "1100");
    }

    #[test]
    fn extracts_contact_and_target() {
        let msg = invite();
        let contact = extract_contact(&msg).unwrap();
        assert_eq!(contact.to_string(), "sip:1100@192.0.2.30:5060;transport=ws;ob");
        assert_eq!(extract_contact_expires(&msg), Some(60));
        let target = extract_request_target(&msg).unwrap();
        assert_eq!(target.user.as_deref(), Some("1200"));
        assert_eq!(target.port, Some(40000));
    }

    #[test]
    fn extracts_routes_and_vias_in_order() {
        let msg = invite();
        let hosts: Vec<_> = extract_record_route(&msg)
            .into_iter()
            .map(|u| u.host)
            .collect();
        assert_eq!(hosts, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(
            extract_via_headers(&msg),
            [
                "SIP/2.0/WS 10.0.0.1;branch=z9hG4bKproxy",
                "SIP/2.0/WS 192.0.2.30;rport=5060;branch=z9hG4bKcaller",
            ]
        );
    }

    #[test]
    fn extracts_sdp_body() {
        assert_eq!(extract_sdp(&invite()), Some("v=0\r\n "));
        let bare = parse_message("SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(extract_sdp(&bare), None);
    }

    #[test]
    fn sdp_content_type_with_parameters() {
        let body = "v=0\r\n";
        let with_charset = format!(
            "SIP/2.0 200 OK\r\nContent-Type: Application/SDP ; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let msg = parse_message(&with_charset).unwrap();
        assert_eq!(extract_sdp(&msg), Some(body));

        let other = format!(
            "SIP/2.0 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        assert_eq!(extract_sdp(&parse_message(&other).unwrap()), None);
    }

    #[test]
    fn missing_mandatory_headers_fail() {
        let msg = parse_message("SIP/2.0 200 OK\r\nTo: <sip:1@h>\r\n\r\n").unwrap();
        assert!(matches!(
            extract_call_id(&msg),
            Err(SipError::MissingHeader("Call-ID"))
        ));
        assert!(matches!(extract_cseq(&msg), Err(SipError::MissingHeader("CSeq"))));
        assert!(matches!(
            extract_caller_number(&msg),
            Err(SipError::MissingHeader("From"))
        ));
        assert_eq!(extract_contact(&msg), None);
        assert!(extract_record_route(&msg).is_empty());
        assert!(extract_request_target(&msg).is_err());
    }

    #[test]
    fn bare_contact_without_brackets() {
        let msg = parse_message(
            "SIP/2.0 200 OK\r\nm: sip:200@10.0.0.5:5060;expires=30\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            extract_contact(&msg).unwrap().to_string(),
            "sip:200@10.0.0.5:5060"
        );
        assert_eq!(extract_contact_expires(&msg), Some(30));
    }
}
