use core::fmt::{self, Write};

use md5::{Digest, Md5};
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::message::Uri;
use crate::transport::TransportKind;

pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";
const TOKEN_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller, // we send the INVITE
    Callee, // remote sends the INVITE
}

/// Random opaque token for From/To tags.
pub fn generate_tag<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..TOKEN_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}

pub fn generate_branch<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut branch = String::from(BRANCH_MAGIC_COOKIE);
    branch.push_str(&generate_tag(rng));
    branch
}

/// MD5 hex digest of a random integer.
pub fn generate_call_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    let seed: u64 = rng.random();
    let digest = Md5::digest(seed.to_string().as_bytes());
    let mut out = String::with_capacity(32);
    for b in digest.iter() {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Who we are and where we register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user: String,
    pub registrar_host: String,
    pub registrar_port: Option<u16>,
    pub local_host: String,
    pub local_port: Option<u16>,
    pub transport: TransportKind,
}

impl LocalIdentity {
    /// Address-of-record, `sip:user@registrar`.
    pub fn aor(&self) -> Uri {
        Uri::new(&self.user, &self.registrar_host, None)
    }

    pub fn contact(&self) -> Uri {
        let uri = Uri::new(&self.user, &self.local_host, self.local_port);
        match self.transport.uri_param() {
            Some(param) => uri.with_param(param),
            None => uri,
        }
    }

    pub fn registrar(&self) -> Uri {
        Uri::host_only(&self.registrar_host, self.registrar_port)
    }

    /// URI for another user on the same registrar.
    pub fn peer(&self, user: &str) -> Uri {
        Uri::new(user, &self.registrar_host, None)
    }
}

/// Identifiers that must stay stable or evolve predictably across one call.
pub struct DialogContext {
    role: Role,
    identity: LocalIdentity,
    call_id: String,
    local_tag: String,
    remote_tag: Option<String>,
    remote_uri: Option<Uri>,
    adopted: bool,
    branch: String,
    cseq: u32,
    route_set: Vec<Uri>,
    peer_contact: Option<Uri>,
    rng: Box<dyn RngCore + Send>,
}

impl fmt::Debug for DialogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogContext")
            .field("role", &self.role)
            .field("call_id", &self.call_id)
            .field("local_tag", &self.local_tag)
            .field("remote_tag", &self.remote_tag)
            .field("branch", &self.branch)
            .field("cseq", &self.cseq)
            .field("route_set", &self.route_set)
            .field("peer_contact", &self.peer_contact)
            .finish_non_exhaustive()
    }
}

impl DialogContext {
    pub fn new<R>(role: Role, identity: LocalIdentity, mut rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        let call_id = generate_call_id(&mut rng);
        let local_tag = generate_tag(&mut rng);
        let branch = generate_branch(&mut rng);
        Self {
            role,
            identity,
            call_id,
            local_tag,
            remote_tag: None,
            remote_uri: None,
            adopted: false,
            branch,
            cseq: 0,
            route_set: Vec::new(),
            peer_contact: None,
            rng: Box::new(rng),
        }
    }

    /// Context seeded from the operating system.
    pub fn from_os_rng(role: Role, identity: LocalIdentity) -> Self {
        Self::new(role, identity, StdRng::from_os_rng())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn remote_uri(&self) -> Option<&Uri> {
        self.remote_uri.as_ref()
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn route_set(&self) -> &[Uri] {
        &self.route_set
    }

    pub fn peer_contact(&self) -> Option<&Uri> {
        self.peer_contact.as_ref()
    }

    /// Fresh branch for the next client transaction.
    pub fn new_branch(&mut self) -> &str {
        self.branch = generate_branch(&mut self.rng);
        &self.branch
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.cseq = self.cseq.wrapping_add(1);
        self.cseq
    }

    /// First writer wins; later tags are ignored.
    pub fn bind_remote_tag(&mut self, tag: &str) {
        match &self.remote_tag {
            None => self.remote_tag = Some(tag.to_string()),
            Some(existing) if existing != tag => {
                log::debug!("ignoring remote tag {tag}, dialog already bound to {existing}");
            }
            Some(_) => {}
        }
    }

    /// Replaces the captured Record-Route set with `routes` (receipt order).
    pub fn record_route(&mut self, routes: Vec<Uri>) {
        self.route_set = routes;
    }

    /// Route headers for an in-dialog request: reverse of capture order.
    pub fn routes_for_request(&self) -> impl Iterator<Item = &Uri> {
        self.route_set.iter().rev()
    }

    pub fn set_remote_uri(&mut self, uri: Uri) {
        self.remote_uri = Some(uri);
    }

    pub fn set_peer_contact(&mut self, contact: Uri) {
        self.peer_contact = Some(contact);
    }

    /// Starts the dialog created by an inbound INVITE: the peer's Call-ID
    /// replaces ours and its From tag becomes the remote tag. Happens at
    /// most once, and never after a remote tag is bound.
    pub fn accept_incoming(&mut self, call_id: &str, remote_uri: Uri, remote_tag: Option<&str>) -> bool {
        if self.adopted || self.remote_tag.is_some() {
            return false;
        }
        self.adopted = true;
        self.call_id = call_id.to_string();
        self.remote_uri = Some(remote_uri);
        if let Some(tag) = remote_tag {
            self.bind_remote_tag(tag);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            user: "1100".into(),
            registrar_host: "proxy.example.com".into(),
            registrar_port: Some(5060),
            local_host: "192.0.2.10".into(),
            local_port: Some(40000),
            transport: TransportKind::Ws,
        }
    }

    fn context(seed: u64) -> DialogContext {
        DialogContext::new(Role::Caller, identity(), StdRng::seed_from_u64(seed))
    }

    #[test]
    fn branches_are_unique_and_prefixed() {
        let mut ctx = context(7);
        let mut seen = HashSet::new();
        seen.insert(ctx.branch().to_string());
        for _ in 0..10_000 {
            let branch = ctx.new_branch().to_string();
            assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
            assert!(seen.insert(branch), "duplicate branch");
        }
    }

    #[test]
    fn same_seed_same_identifiers() {
        let a = context(42);
        let b = context(42);
        assert_eq!(a.call_id(), b.call_id());
        assert_eq!(a.local_tag(), b.local_tag());
        assert_eq!(a.call_id().len(), 32);
        assert!(a.call_id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.call_id(), context(43).call_id());
    }

    #[test]
    fn remote_tag_first_writer_wins() {
        let mut ctx = context(1);
        assert_eq!(ctx.remote_tag(), None);
        ctx.bind_remote_tag("abc");
        ctx.bind_remote_tag("xyz");
        assert_eq!(ctx.remote_tag(), Some("abc"));
    }

    #[test]
    fn cseq_increments() {
        let mut ctx = context(1);
        assert_eq!(ctx.next_cseq(), 1);
        assert_eq!(ctx.next_cseq(), 2);
        assert_eq!(ctx.cseq(), 2);
    }

    #[test]
    fn routes_reverse_capture_order() {
        let mut ctx = context(1);
        let routes: Vec<Uri> = ["sip:r1;lr", "sip:r2;lr", "sip:r3;lr"]
            .iter()
            .map(|r| r.parse().unwrap())
            .collect();
        ctx.record_route(routes);
        let hosts: Vec<_> = ctx.routes_for_request().map(|u| u.host.as_str()).collect();
        assert_eq!(hosts, ["r3", "r2", "r1"]);

        ctx.record_route(vec!["sip:r9;lr".parse().unwrap()]);
        assert_eq!(ctx.route_set().len(), 1);
    }

    #[test]
    fn accept_incoming_adopts_call_id_once() {
        let mut ctx = context(1);
        let tag = ctx.local_tag().to_string();
        assert!(ctx.accept_incoming("peer-call", identity().peer("200"), Some("abc")));
        assert_eq!(ctx.call_id(), "peer-call");
        assert_eq!(ctx.remote_tag(), Some("abc"));
        assert_eq!(ctx.local_tag(), tag);
        assert!(!ctx.accept_incoming("other-call", identity().peer("300"), Some("def")));
        assert_eq!(ctx.call_id(), "peer-call");
    }

    #[test]
    fn accept_incoming_without_from_tag_still_happens_once() {
        let mut ctx = context(2);
        assert!(ctx.accept_incoming("first-call", identity().peer("200"), None));
        assert_eq!(ctx.remote_tag(), None);
        assert!(!ctx.accept_incoming("second-call", identity().peer("300"), None));
        assert_eq!(ctx.call_id(), "first-call");
        assert_eq!(ctx.remote_uri(), Some(&identity().peer("200")));
    }

    #[test]
    fn identity_uris() {
        let id = identity();
        assert_eq!(id.aor().to_string(), "sip:1100@proxy.example.com");
        assert_eq!(id.registrar().to_string(), "sip:proxy.example.com:5060");
        assert_eq!(
            id.contact().to_string(),
            "sip:1100@192.0.2.10:40000;transport=ws"
        );
    }
}
