use core::fmt::{self, Write};
use core::str::FromStr;
use std::borrow::Cow;

use crate::{Result, SipError};

pub const SIP_VERSION: &str = "SIP/2.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Other(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = SipError;

    fn from_str(input: &str) -> Result<Self> {
        if input.is_empty() || !input.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(SipError::Malformed(format!("bad method token {input:?}")));
        }
        Ok(match input {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        })
    }
}

/// A SIP URI of the form `sip:[user@]host[:port][;params]`, or `sips:` when
/// `secure` is set.
///
/// `host` is stored without IPv6 brackets; they are added back on display.
/// `params` keeps the raw parameter tail (without the leading `;`) so that
/// peer-supplied flags like `transport=ws;ob` survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Option<String>,
}

impl Uri {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            secure: false,
            user: Some(user.into()),
            host: host.into(),
            port,
            params: None,
        }
    }

    /// Bare host URI, used as the REGISTER request target.
    pub fn host_only(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            secure: false,
            user: None,
            host: host.into(),
            port,
            params: None,
        }
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.params = Some(match self.params.take() {
            Some(existing) => format!("{existing};{param}"),
            None => param.to_string(),
        });
        self
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.as_deref().is_some_and(|params| {
            params.split(';').any(|p| {
                p.split('=')
                    .next()
                    .is_some_and(|key| key.trim().eq_ignore_ascii_case(name))
            })
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&bracket_host(&self.host))?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(params) = &self.params {
            write!(f, ";{params}")?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = SipError;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = || SipError::InvalidUri(input.to_string());
        let (secure, rest) = match input.strip_prefix("sips:") {
            Some(rest) => (true, rest),
            None => (false, input.strip_prefix("sip:").ok_or_else(invalid)?),
        };

        let (addr, params) = match rest.split_once(';') {
            Some((addr, params)) => (addr, Some(params.to_string())),
            None => (rest, None),
        };
        let (user, hostport) = match addr.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, addr),
        };
        let (host, port) = split_host_port(hostport).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Uri {
            secure,
            user,
            host: host.to_string(),
            port,
            params,
        })
    }
}

/// Wraps an IPv6 literal in brackets for use in a URI or Via.
pub fn bracket_host(host: &str) -> Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{host}]"))
    } else {
        Cow::Borrowed(host)
    }
}

/// Splits `host[:port]` or `[v6]:port`. The host comes back unbracketed.
/// `None` when the port is not a number or a bracket is unbalanced.
pub fn split_host_port(value: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail {
            "" => Some((host, None)),
            _ => Some((host, Some(tail.strip_prefix(':')?.parse().ok()?))),
        };
    }
    match value.split_once(':') {
        // More than one colon and no brackets: a bare IPv6 literal.
        Some((_, port)) if port.contains(':') => Some((value, None)),
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((value, None)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = SipError;

    fn from_str(input: &str) -> Result<Self> {
        let mut parts = input.split_whitespace();
        let seq = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| SipError::Malformed(format!("bad CSeq {input:?}")))?;
        let method = parts
            .next()
            .ok_or_else(|| SipError::Malformed(format!("CSeq without method {input:?}")))?
            .parse()?;
        Ok(CSeq { seq, method })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered header list. Repeated names (Via, Record-Route) are kept as
/// separate entries in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// First value for `name`, matched case-insensitively and through the
    /// compact form table.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| same_header(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| same_header(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

}

fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        other => other,
    }
}

fn same_header(a: &str, b: &str) -> bool {
    expand_compact(a).eq_ignore_ascii_case(expand_compact(b))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    pub fn set_body(&mut self, body: &str) {
        self.body.clear();
        self.body.push_str(body);
    }

    /// Renders the request, appending `Content-Length` from the body.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{} {} {}\r\n", self.method, self.uri, SIP_VERSION);
        render_tail(&mut out, &self.headers, &self.body);
        out
    }
}

impl Response {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    pub fn set_body(&mut self, body: &str) {
        self.body.clear();
        self.body.push_str(body);
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "{} {} {}\r\n",
            SIP_VERSION, self.status_code, self.reason
        );
        render_tail(&mut out, &self.headers, &self.body);
        out
    }
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(req) => &req.headers,
            Message::Response(resp) => &resp.headers,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Message::Request(req) => &req.body,
            Message::Response(resp) => &resp.body,
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(req) => Some(req),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(resp) => Some(resp),
            Message::Request(_) => None,
        }
    }

    /// Short `METHOD uri` / `code reason` summary for log lines.
    pub fn summary(&self) -> String {
        match self {
            Message::Request(req) => format!("{} {}", req.method, req.uri),
            Message::Response(resp) => format!("{} {}", resp.status_code, resp.reason),
        }
    }
}

fn render_tail(out: &mut String, headers: &Headers, body: &str) {
    for header in headers.iter() {
        let _ = write!(out, "{}: {}\r\n", header.name, header.value);
    }
    if !body.is_empty() {
        out.push_str("Content-Type: application/sdp\r\n");
    }
    let _ = write!(out, "Content-Length: {}\r\n\r\n{}", body.len(), body);
}

// Decide request vs response by the start line.
pub fn parse_message(input: &str) -> Result<Message> {
    let (head, body) = split_head_body(input);
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let first = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| SipError::Malformed("empty message".into()))?;

    let headers = parse_headers(lines)?;
    check_content_length(&headers, body)?;

    if first.starts_with("SIP/") {
        let (status_code, reason) = parse_status_line(first)?;
        Ok(Message::Response(Response {
            status_code,
            reason,
            headers,
            body: body.to_string(),
        }))
    } else {
        let (method, uri) = parse_request_line(first)?;
        Ok(Message::Request(Request {
            method,
            uri,
            headers,
            body: body.to_string(),
        }))
    }
}

fn split_head_body(input: &str) -> (&str, &str) {
    if let Some(idx) = input.find("\r\n\r\n") {
        (&input[..idx], &input[idx + 4..])
    } else if let Some(idx) = input.find("\n\n") {
        (&input[..idx], &input[idx + 2..])
    } else {
        (input.trim_end_matches(['\r', '\n']), "")
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String)> {
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| SipError::Malformed("missing method".into()))?
        .parse()?;
    let uri = parts
        .next()
        .ok_or_else(|| SipError::Malformed("missing request uri".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| SipError::Malformed("missing version".into()))?;
    if version != SIP_VERSION {
        return Err(SipError::Malformed(format!("unsupported version {version}")));
    }
    Ok((method, uri.to_string()))
}

fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if version != SIP_VERSION {
        return Err(SipError::Malformed(format!("unsupported version {version}")));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..700).contains(s))
        .ok_or_else(|| SipError::Malformed(format!("bad status line {line:?}")))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((status, reason))
}

fn parse_headers<'a, I>(lines: I) -> Result<Headers>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // Folded continuation line.
        if line.starts_with([' ', '\t']) {
            if let Some(last) = headers.0.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SipError::Malformed(format!("header without colon {line:?}")))?;
        headers.push(Header::new(name.trim(), value.trim()));
    }
    Ok(headers)
}

fn check_content_length(headers: &Headers, body: &str) -> Result<()> {
    let Some(raw) = headers.get("Content-Length") else {
        return Ok(());
    };
    let declared = raw
        .trim()
        .parse::<usize>()
        .map_err(|_| SipError::Malformed(format!("bad Content-Length {raw:?}")))?;
    if declared != body.len() {
        return Err(SipError::Malformed(format!(
            "Content-Length {declared} does not match body length {}",
            body.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_request_and_response() {
        let mut req = Request::new(Method::Invite, "sip:100@example.com");
        req.add_header("Via", "SIP/2.0/UDP 192.0.2.1");
        let rendered = req.render();
        assert!(rendered.starts_with("INVITE sip:100@example.com SIP/2.0\r\n"));
        assert!(rendered.ends_with("Content-Length: 0\r\n\r\n"));

        let mut resp = Response::new(200, "OK");
        resp.set_body("v=0\r\n");
        let rendered_resp = resp.render();
        assert!(rendered_resp.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(rendered_resp.contains("Content-Type: application/sdp\r\n"));
        assert!(rendered_resp.ends_with("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn parses_request() {
        let raw = "INVITE sip:100@example.com SIP/2.0\r\nVia: SIP/2.0/UDP host\r\n\r\n";
        let message = parse_message(raw).unwrap();
        match message {
            Message::Request(r) => {
                assert_eq!(r.method, Method::Invite);
                assert_eq!(r.uri, "sip:100@example.com");
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn keeps_repeated_headers_in_order() {
        let raw = "SIP/2.0 180 Ringing\r\n\
                   Via: SIP/2.0/WS a;branch=z9hG4bK1\r\n\
                   v: SIP/2.0/TCP b;branch=z9hG4bK2\r\n\
                   VIA: SIP/2.0/UDP c;branch=z9hG4bK3\r\n\
                   Content-Length: 0\r\n\r\n";
        let message = parse_message(raw).unwrap();
        let vias: Vec<_> = message.headers().get_all("Via").collect();
        assert_eq!(
            vias,
            [
                "SIP/2.0/WS a;branch=z9hG4bK1",
                "SIP/2.0/TCP b;branch=z9hG4bK2",
                "SIP/2.0/UDP c;branch=z9hG4bK3",
            ]
        );
    }

    #[test]
    fn rejects_body_length_mismatch() {
        let raw = "SIP/2.0 200 OK\r\nContent-Length: 10\r\n\r\nv=0\r\n";
        assert!(matches!(parse_message(raw), Err(SipError::Malformed(_))));
    }

    #[test]
    fn rejects_garbage_start_line() {
        assert!(parse_message("hello world\r\n\r\n").is_err());
        assert!(parse_message("SIP/2.0 abc OK\r\n\r\n").is_err());
        assert!(parse_message("").is_err());
    }

    #[test]
    fn parses_uri_with_params() {
        let uri: Uri = "sip:200@10.0.0.5:5060;transport=ws;ob".parse().unwrap();
        assert_eq!(uri.user.as_deref(), Some("200"));
        assert_eq!(uri.host, "10.0.0.5");
        assert_eq!(uri.port, Some(5060));
        assert!(uri.has_param("ob"));
        assert!(uri.has_param("transport"));
        assert_eq!(uri.to_string(), "sip:200@10.0.0.5:5060;transport=ws;ob");

        let proxy: Uri = "sip:proxy.example.com;lr".parse().unwrap();
        assert_eq!(proxy.user, None);
        assert_eq!(proxy.to_string(), "sip:proxy.example.com;lr");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let uri = Uri::new("1100", "2001:db8::10", Some(5070));
        assert_eq!(uri.to_string(), "sip:1100@[2001:db8::10]:5070");

        let parsed: Uri = "sip:1100@[2001:db8::10]:5070;ob".parse().unwrap();
        assert_eq!(parsed.host, "2001:db8::10");
        assert_eq!(parsed.port, Some(5070));
        assert!(parsed.has_param("ob"));
        assert_eq!(parsed.to_string(), "sip:1100@[2001:db8::10]:5070;ob");

        let registrar = Uri::host_only("2001:db8::1", None);
        assert_eq!(registrar.to_string(), "sip:[2001:db8::1]");
        assert!("sip:[2001:db8::1".parse::<Uri>().is_err());
        assert!("sip:[2001:db8::1]5060".parse::<Uri>().is_err());
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(split_host_port("pbx.lan"), Some(("pbx.lan", None)));
        assert_eq!(split_host_port("pbx.lan:5080"), Some(("pbx.lan", Some(5080))));
        assert_eq!(split_host_port("[::1]:5060"), Some(("::1", Some(5060))));
        assert_eq!(split_host_port("[::1]"), Some(("::1", None)));
        assert_eq!(split_host_port("2001:db8::1"), Some(("2001:db8::1", None)));
        assert_eq!(split_host_port("pbx.lan:port"), None);
    }

    #[test]
    fn sips_scheme_survives() {
        let uri: Uri = "sips:200@secure.example.com:5061".parse().unwrap();
        assert!(uri.secure);
        assert_eq!(uri.to_string(), "sips:200@secure.example.com:5061");

        let plain: Uri = "sip:200@example.com".parse().unwrap();
        assert!(!plain.secure);
        assert_eq!(plain.to_string(), "sip:200@example.com");
    }

    #[test]
    fn parses_cseq() {
        let cseq: CSeq = "4 INVITE".parse().unwrap();
        assert_eq!(cseq.seq, 4);
        assert_eq!(cseq.method, Method::Invite);
        assert!("INVITE".parse::<CSeq>().is_err());
    }
}
