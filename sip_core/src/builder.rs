//! Renders outgoing requests and responses from a [`DialogContext`].
//!
//! Builders read the context but never mutate it: the caller draws a new
//! branch or CSeq from the context first, then asks for the message.

use core::fmt::Write;

use crate::dialog::DialogContext;
use crate::message::{bracket_host, CSeq, Header, Method, Request, Response, Uri};
use crate::transport::TransportKind;

const MAX_FORWARDS: &str = "70";

/// `<uri>` or `<uri>;tag=...`
pub fn name_addr(uri: &Uri, tag: Option<&str>) -> String {
    let mut out = String::new();
    let _ = write!(out, "<{uri}>");
    if let Some(tag) = tag {
        let _ = write!(out, ";tag={tag}");
    }
    out
}

fn via(ctx: &DialogContext) -> String {
    let id = ctx.identity();
    let mut value = String::new();
    let _ = write!(
        value,
        "SIP/2.0/{} {}",
        id.transport.via_token(),
        bracket_host(&id.local_host)
    );
    if let Some(port) = id.local_port {
        let _ = write!(value, ":{port}");
    }
    let _ = write!(value, ";rport;branch={}", ctx.branch());
    value
}

fn request(ctx: &DialogContext, method: Method, target: &Uri, to: String, cseq: u32) -> Request {
    let mut req = Request::new(method.clone(), target.to_string());
    req.add_header("Via", via(ctx));
    req.add_header("Max-Forwards", MAX_FORWARDS);
    req.add_header("To", to);
    req.add_header(
        "From",
        name_addr(&ctx.identity().aor(), Some(ctx.local_tag())),
    );
    req.add_header("Call-ID", ctx.call_id());
    req.add_header("CSeq", CSeq { seq: cseq, method }.to_string());
    req
}

/// Peer name-addr for in-dialog requests. Falls back to the target when the
/// peer's AOR was never learned.
fn remote_to(ctx: &DialogContext, target: &Uri) -> String {
    let uri = ctx.remote_uri().unwrap_or(target);
    name_addr(uri, ctx.remote_tag())
}

fn add_routes(req: &mut Request, ctx: &DialogContext) {
    for route in ctx.routes_for_request() {
        req.add_header("Route", format!("<{route}>"));
    }
}

pub fn build_register(ctx: &DialogContext, expires: u32) -> String {
    let id = ctx.identity();
    let mut target = id.registrar();
    if let Some(param) = id.transport.uri_param() {
        target = target.with_param(param);
    }
    let aor = id.aor();

    let mut req = request(ctx, Method::Register, &target, name_addr(&aor, None), ctx.cseq());
    req.add_header("Contact", name_addr(&id.contact(), None));
    req.add_header("Expires", expires.to_string());
    req.render()
}

pub fn build_invite(ctx: &DialogContext, callee: &Uri, sdp_offer: &str) -> String {
    build_invite_with_headers(ctx, callee, sdp_offer, &[])
}

/// INVITE carrying additional headers, e.g. `Replaces` or `Join`.
pub fn build_invite_with_headers(
    ctx: &DialogContext,
    callee: &Uri,
    sdp_offer: &str,
    extra_headers: &[Header],
) -> String {
    let id = ctx.identity();
    let mut contact = id.contact();
    if id.transport == TransportKind::Ws {
        contact = contact.with_param("ob");
    }

    let mut req = request(ctx, Method::Invite, callee, name_addr(callee, None), ctx.cseq());
    req.add_header("Contact", name_addr(&contact, None));
    for header in extra_headers {
        req.headers.push(header.clone());
    }
    req.set_body(sdp_offer);
    req.render()
}

/// ACK for the current INVITE transaction; reuses the INVITE's CSeq number.
pub fn build_ack(ctx: &DialogContext, target: &Uri) -> String {
    let mut req = request(ctx, Method::Ack, target, remote_to(ctx, target), ctx.cseq());
    add_routes(&mut req, ctx);
    req.render()
}

pub fn build_bye(ctx: &DialogContext, target: &Uri) -> String {
    let mut req = request(ctx, Method::Bye, target, remote_to(ctx, target), ctx.cseq());
    add_routes(&mut req, ctx);
    req.render()
}

/// Response to a request received from the peer.
///
/// Via and Record-Route values are echoed verbatim in the order given. From
/// carries the peer's identity and tag, To ours.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    status_code: u16,
    reason: String,
    cseq: CSeq,
    vias: Vec<String>,
    record_routes: Vec<String>,
    headers: Vec<Header>,
    body: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16, reason: &str, cseq: CSeq) -> Self {
        Self {
            status_code,
            reason: reason.to_string(),
            cseq,
            vias: Vec::new(),
            record_routes: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn trying(cseq: CSeq) -> Self {
        Self::new(100, "Trying", cseq)
    }

    pub fn ringing(cseq: CSeq) -> Self {
        Self::new(180, "Ringing", cseq)
    }

    pub fn ok(cseq: CSeq) -> Self {
        Self::new(200, "OK", cseq)
    }

    pub fn vias<I, S>(mut self, vias: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vias.extend(vias.into_iter().map(Into::into));
        self
    }

    pub fn record_routes<'a, I>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = &'a Uri>,
    {
        self.record_routes
            .extend(routes.into_iter().map(|r| format!("<{r}>")));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn build(self, ctx: &DialogContext) -> String {
        let mut resp = Response::new(self.status_code, self.reason);
        for via in self.vias {
            resp.add_header("Via", via);
        }
        for route in self.record_routes {
            resp.add_header("Record-Route", route);
        }
        let aor = ctx.identity().aor();
        let remote = ctx.remote_uri().unwrap_or(&aor);
        resp.add_header("To", name_addr(&aor, Some(ctx.local_tag())));
        resp.add_header("From", name_addr(remote, ctx.remote_tag()));
        resp.add_header("Call-ID", ctx.call_id());
        resp.add_header("CSeq", self.cseq.to_string());
        for header in self.headers {
            resp.headers.push(header);
        }
        if let Some(body) = self.body {
            resp.set_body(&body);
        }
        resp.render()
    }
}
