//! Call control: REGISTER, then either place or accept one call, hold it for
//! the settle interval and tear it down.
//!
//! The controller is strictly sequential. It owns its transport and dialog
//! context, sends one message at a time and blocks in
//! [`Transport::receive`] between steps. A receive timeout aborts the
//! current step; nothing is retransmitted.

use core::fmt;
use std::time::{Duration, Instant};

use rand::RngCore;
use sdp::{MediaEndpoint, SessionDescription};
use thiserror::Error;

use crate::builder::{build_ack, build_bye, build_invite_with_headers, name_addr, ResponseBuilder};
use crate::dialog::{DialogContext, LocalIdentity, Role};
use crate::extract::{
    extract_call_id, extract_caller_number, extract_contact, extract_cseq, extract_identity,
    extract_record_route, extract_request_target, extract_sdp, extract_tag, extract_via_headers,
};
use crate::message::{parse_message, CSeq, Header, Message, Method};
use crate::registration::{RegistrationResult, RegistrationTransaction};
use crate::transport::{Transport, TransportError};
use crate::SipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Registering,
    Registered,
    Inviting,
    Ringing,
    AwaitingInvite,
    OfferedRinging,
    Connected,
    Terminating,
    Terminated,
}

/// The wait that was in progress when a call attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Register,
    Invite,
    AwaitInvite,
    AwaitAck,
    Connected,
    Bye,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Register => "REGISTER confirmation",
            Stage::Invite => "INVITE answer",
            Stage::AwaitInvite => "incoming INVITE",
            Stage::AwaitAck => "ACK",
            Stage::Connected => "in-call message",
            Stage::Bye => "BYE confirmation",
        })
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no {0} within the receive timeout")]
    Timeout(Stage),
    #[error("bad message while waiting for {stage}: {source}")]
    Sip {
        stage: Stage,
        #[source]
        source: SipError,
    },
    #[error("registration rejected: {status} {reason}")]
    RegistrationRejected { status: u16, reason: String },
    #[error("INVITE rejected: {status} {reason}")]
    InviteRejected { status: u16, reason: String },
    #[error("BYE rejected: {status}")]
    ByeRejected { status: u16 },
}

impl CallError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            CallError::Transport(_) => None,
            CallError::Timeout(stage) | CallError::Sip { stage, .. } => Some(*stage),
            CallError::RegistrationRejected { .. } => Some(Stage::Register),
            CallError::InviteRejected { .. } => Some(Stage::Invite),
            CallError::ByeRejected { .. } => Some(Stage::Bye),
        }
    }
}

fn at(stage: Stage) -> impl Fn(SipError) -> CallError {
    move |source| CallError::Sip { stage, source }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Place a call to `callee` on the same registrar.
    Invite { callee: String },
    /// Wait for an incoming INVITE.
    Wait,
}

impl Mode {
    pub fn role(&self) -> Role {
        match self {
            Mode::Invite { .. } => Role::Caller,
            Mode::Wait => Role::Callee,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub mode: Mode,
    /// Hang up ourselves once the settle interval has passed.
    pub send_bye: bool,
    /// Send `100 Trying` before `180 Ringing` when answering.
    pub send_trying: bool,
    pub expires: u32,
    pub receive_timeout: Duration,
    pub settle: Duration,
    /// Advertised in our SDP offer, and in the answer when the INVITE has
    /// no usable offer.
    pub media: MediaEndpoint,
    /// Extra INVITE headers such as `Replaces` or `Join`.
    pub invite_headers: Vec<Header>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Wait,
            send_bye: true,
            send_trying: false,
            expires: 3600,
            receive_timeout: Duration::from_secs(30),
            settle: Duration::from_secs(3),
            media: MediaEndpoint {
                ip: sdp::DEFAULT_ADDRESS.to_string(),
                port: sdp::DEFAULT_MEDIA_PORT,
            },
            invite_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hangup {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub hangup: Hangup,
    pub call_id: String,
}

pub struct CallController<T: Transport> {
    transport: T,
    ctx: DialogContext,
    config: CallConfig,
    state: CallState,
    registration: RegistrationTransaction,
    // Kept to answer retransmissions: our ACK (caller) or final response
    // to the INVITE (callee).
    last_ack: Option<String>,
    last_final: Option<String>,
    invite_cseq: Option<CSeq>,
}

impl<T: Transport> CallController<T> {
    pub fn new(transport: T, identity: LocalIdentity, config: CallConfig) -> Self {
        let ctx = DialogContext::from_os_rng(config.mode.role(), identity);
        Self::with_context(transport, ctx, config)
    }

    /// Controller drawing tags, branches and Call-ID from `rng`.
    pub fn with_rng<R>(transport: T, identity: LocalIdentity, config: CallConfig, rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        let ctx = DialogContext::new(config.mode.role(), identity, rng);
        Self::with_context(transport, ctx, config)
    }

    fn with_context(transport: T, ctx: DialogContext, config: CallConfig) -> Self {
        Self {
            transport,
            ctx,
            config,
            state: CallState::Idle,
            registration: RegistrationTransaction::default(),
            last_ack: None,
            last_final: None,
            invite_cseq: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs the whole session. Any failure ends in `Terminated` with the
    /// failing stage reported through the error.
    pub fn run(&mut self) -> Result<CallOutcome, CallError> {
        let result = self.register().and_then(|()| match self.config.mode.clone() {
            Mode::Invite { callee } => self.run_caller(&callee),
            Mode::Wait => self.run_callee(),
        });
        match &result {
            Ok(outcome) => log::info!("call {} finished, {:?} hangup", outcome.call_id, outcome.hangup),
            Err(e) => log::warn!("call attempt aborted in {:?}: {e}", self.state),
        }
        self.set_state(CallState::Terminated);
        result
    }

    fn set_state(&mut self, next: CallState) {
        if self.state != next {
            log::info!("call state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn send(&mut self, text: &str) -> Result<(), CallError> {
        log::info!("sending {}", text.lines().next().unwrap_or_default());
        log::debug!("outgoing message:\n{text}");
        self.transport.send(text)?;
        Ok(())
    }

    /// End of a wait that starts now.
    fn deadline(&self) -> Instant {
        Instant::now() + self.config.receive_timeout
    }

    /// Next non-empty message arriving before `deadline`. Bare CRLF
    /// keep-alives are skipped.
    fn next_message(&mut self, stage: Stage, deadline: Instant) -> Result<Message, CallError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CallError::Timeout(stage));
            }
            let raw = self
                .transport
                .receive(remaining)?
                .ok_or(CallError::Timeout(stage))?;
            if let Some(msg) = self.parse_inbound(&raw, stage)? {
                return Ok(msg);
            }
        }
    }

    fn parse_inbound(&self, raw: &str, stage: Stage) -> Result<Option<Message>, CallError> {
        if raw.trim().is_empty() {
            log::trace!("keep-alive received");
            return Ok(None);
        }
        let msg = parse_message(raw).map_err(at(stage))?;
        log::info!("received {}", msg.summary());
        log::debug!("incoming message:\n{raw}");
        Ok(Some(msg))
    }

    fn in_dialog(&self, msg: &Message) -> bool {
        extract_call_id(msg).is_ok_and(|id| id == self.ctx.call_id())
    }

    /// Response in our dialog whose CSeq is `seq method`.
    fn answers(&self, msg: &Message, method: Method, seq: u32) -> bool {
        msg.as_response().is_some()
            && self.in_dialog(msg)
            && extract_cseq(msg).is_ok_and(|c| c.method == method && c.seq == seq)
    }

    fn register(&mut self) -> Result<(), CallError> {
        self.set_state(CallState::Registering);
        let raw = self
            .registration
            .build_register(&mut self.ctx, self.config.expires);
        self.send(&raw)?;

        let mut deadline = self.deadline();
        loop {
            let msg = self.next_message(Stage::Register, deadline)?;
            if !self.registration.matches(&msg) {
                log::warn!("ignoring {} while registering", msg.summary());
                continue;
            }
            let result = self.registration.handle_response(&msg);
            log::debug!("registration {:?} after {}", self.registration.state(), msg.summary());
            match result {
                RegistrationResult::Pending => deadline = self.deadline(),
                RegistrationResult::Registered(expires) => {
                    log::info!("registered as {} for {expires}s", self.ctx.identity().aor());
                    self.set_state(CallState::Registered);
                    return Ok(());
                }
                RegistrationResult::AuthRequired(status) => {
                    return Err(CallError::RegistrationRejected {
                        status,
                        reason: "authentication not supported".into(),
                    });
                }
                RegistrationResult::Failed(status, reason) => {
                    return Err(CallError::RegistrationRejected { status, reason });
                }
            }
        }
    }

    fn run_caller(&mut self, callee: &str) -> Result<CallOutcome, CallError> {
        let callee_uri = self.ctx.identity().peer(callee);
        self.ctx.set_remote_uri(callee_uri.clone());
        self.ctx.new_branch();
        let seq = self.ctx.next_cseq();

        let offer = SessionDescription::offer(&self.config.media).render();
        let invite =
            build_invite_with_headers(&self.ctx, &callee_uri, &offer, &self.config.invite_headers);
        self.set_state(CallState::Inviting);
        self.send(&invite)?;

        let mut deadline = self.deadline();
        loop {
            let msg = self.next_message(Stage::Invite, deadline)?;

            if self.answers(&msg, Method::Invite, seq) {
                let Message::Response(resp) = &msg else {
                    continue;
                };
                // Progress from the callee restarts the wait.
                if resp.is_provisional() {
                    deadline = self.deadline();
                }
                match resp.status_code {
                    100 => {}
                    101..=199 => self.set_state(CallState::Ringing),
                    200..=299 => {
                        self.complete_invite(&msg)?;
                        return self.hold_then_hang_up();
                    }
                    status => {
                        // Non-2xx ACK belongs to the INVITE transaction and
                        // keeps its branch.
                        if let Some(tag) = extract_tag(&msg, "To") {
                            self.ctx.bind_remote_tag(&tag);
                        }
                        let ack = build_ack(&self.ctx, &callee_uri);
                        self.send(&ack)?;
                        return Err(CallError::InviteRejected {
                            status,
                            reason: resp.reason.clone(),
                        });
                    }
                }
                continue;
            }

            if self.is_bye(&msg) {
                self.answer_bye(&msg, Stage::Invite)?;
                return Ok(self.outcome(Hangup::Remote));
            }
            log::warn!("ignoring {} while inviting", msg.summary());
        }
    }

    /// Binds the dialog from a 2xx to our INVITE and sends the ACK.
    fn complete_invite(&mut self, msg: &Message) -> Result<(), CallError> {
        let contact = extract_contact(msg)
            .ok_or(SipError::MissingHeader("Contact"))
            .map_err(at(Stage::Invite))?;
        if let Some(tag) = extract_tag(msg, "To") {
            self.ctx.bind_remote_tag(&tag);
        }
        self.ctx.record_route(extract_record_route(msg));
        self.ctx.set_peer_contact(contact.clone());

        self.ctx.new_branch();
        let ack = build_ack(&self.ctx, &contact);
        self.send(&ack)?;
        self.last_ack = Some(ack);
        self.set_state(CallState::Connected);
        Ok(())
    }

    fn run_callee(&mut self) -> Result<CallOutcome, CallError> {
        self.set_state(CallState::AwaitingInvite);
        let deadline = self.deadline();
        let invite = loop {
            let msg = self.next_message(Stage::AwaitInvite, deadline)?;
            match &msg {
                Message::Request(req) if req.method == Method::Invite => break msg,
                _ => log::warn!("ignoring {} while waiting for INVITE", msg.summary()),
            }
        };
        self.accept_invite(&invite)?;

        let deadline = self.deadline();
        loop {
            let msg = self.next_message(Stage::AwaitAck, deadline)?;
            match &msg {
                Message::Request(req) if req.method == Method::Ack && self.in_dialog(&msg) => {
                    self.set_state(CallState::Connected);
                    return self.hold_then_hang_up();
                }
                _ => {
                    if let Some(outcome) = self.handle_in_dialog(&msg, Stage::AwaitAck)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Adopts the INVITE's dialog and answers with 180 then 200 OK.
    fn accept_invite(&mut self, invite: &Message) -> Result<(), CallError> {
        let stage = Stage::AwaitInvite;
        let call_id = extract_call_id(invite).map_err(at(stage))?;
        let cseq = extract_cseq(invite).map_err(at(stage))?;
        let vias = extract_via_headers(invite);
        if vias.is_empty() {
            return Err(at(stage)(SipError::MissingHeader("Via")));
        }
        let caller = extract_identity(invite, "From")
            .ok_or(SipError::MissingHeader("From"))
            .map_err(at(stage))?;
        let target = extract_request_target(invite).map_err(at(stage))?;
        match extract_caller_number(invite) {
            Ok(number) => log::info!("incoming call from {number}"),
            Err(_) => log::info!("incoming call from {caller}"),
        }

        let remote_tag = extract_tag(invite, "From");
        if !self
            .ctx
            .accept_incoming(&call_id, caller, remote_tag.as_deref())
        {
            log::warn!("dialog already bound, keeping Call-ID {}", self.ctx.call_id());
        }
        let routes = extract_record_route(invite);
        self.ctx.record_route(routes.clone());
        if let Some(contact) = extract_contact(invite) {
            self.ctx.set_peer_contact(contact);
        }

        let contact = if target.has_param("ob") {
            name_addr(&target, None)
        } else {
            name_addr(&target.with_param("ob"), None)
        };
        let answer = self.answer_sdp(extract_sdp(invite));

        self.set_state(CallState::OfferedRinging);
        if self.config.send_trying {
            let trying = ResponseBuilder::trying(cseq.clone())
                .vias(&vias)
                .build(&self.ctx);
            self.send(&trying)?;
        }
        let ringing = ResponseBuilder::ringing(cseq.clone())
            .vias(&vias)
            .record_routes(&routes)
            .header("Contact", contact.clone())
            .build(&self.ctx);
        self.send(&ringing)?;

        let ok = ResponseBuilder::ok(cseq.clone())
            .vias(&vias)
            .record_routes(&routes)
            .header("Contact", contact)
            .body(answer)
            .build(&self.ctx);
        self.send(&ok)?;
        self.last_final = Some(ok);
        self.invite_cseq = Some(cseq);
        Ok(())
    }

    fn answer_sdp(&self, offer: Option<&str>) -> String {
        let local = || SessionDescription::offer(&self.config.media).render();
        match offer {
            Some(offer) => sdp::answer(offer).unwrap_or_else(|e| {
                log::warn!("unusable SDP offer ({e}), answering with local media");
                local()
            }),
            None => {
                log::warn!("INVITE without SDP offer, answering with local media");
                local()
            }
        }
    }

    /// Connected: wait out the settle interval, then hang up or keep
    /// waiting for the peer to do so.
    fn hold_then_hang_up(&mut self) -> Result<CallOutcome, CallError> {
        log::info!("call {} connected", self.ctx.call_id());
        let deadline = Instant::now() + self.config.settle;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(raw) = self.transport.receive(remaining)? else {
                break;
            };
            if let Some(msg) = self.parse_inbound(&raw, Stage::Connected)? {
                if let Some(outcome) = self.handle_in_dialog(&msg, Stage::Connected)? {
                    return Ok(outcome);
                }
            }
        }

        if self.config.send_bye {
            return self.send_bye();
        }
        let deadline = self.deadline();
        loop {
            let msg = self.next_message(Stage::Connected, deadline)?;
            if let Some(outcome) = self.handle_in_dialog(&msg, Stage::Connected)? {
                return Ok(outcome);
            }
        }
    }

    fn send_bye(&mut self) -> Result<CallOutcome, CallError> {
        let target = match (self.ctx.peer_contact(), self.ctx.remote_uri()) {
            (Some(contact), _) => contact.clone(),
            (None, Some(remote)) => remote.clone(),
            (None, None) => return Err(at(Stage::Bye)(SipError::MissingHeader("Contact"))),
        };
        self.set_state(CallState::Terminating);
        self.ctx.new_branch();
        let seq = self.ctx.next_cseq();
        let bye = build_bye(&self.ctx, &target);
        self.send(&bye)?;

        let mut deadline = self.deadline();
        loop {
            let msg = self.next_message(Stage::Bye, deadline)?;
            if self.answers(&msg, Method::Bye, seq) {
                let Message::Response(resp) = &msg else {
                    continue;
                };
                if resp.is_provisional() {
                    deadline = self.deadline();
                    continue;
                }
                if resp.is_success() {
                    return Ok(self.outcome(Hangup::Local));
                }
                return Err(CallError::ByeRejected {
                    status: resp.status_code,
                });
            }
            // Crossed BYEs: ours is already out, acknowledge theirs and stop.
            if self.is_bye(&msg) {
                self.answer_bye(&msg, Stage::Bye)?;
                return Ok(self.outcome(Hangup::Local));
            }
            self.handle_retransmission(&msg)?;
        }
    }

    /// In-dialog traffic while waiting. `Some` when the peer hung up.
    fn handle_in_dialog(
        &mut self,
        msg: &Message,
        stage: Stage,
    ) -> Result<Option<CallOutcome>, CallError> {
        if self.is_bye(msg) {
            self.answer_bye(msg, stage)?;
            return Ok(Some(self.outcome(Hangup::Remote)));
        }
        if !self.handle_retransmission(msg)? {
            log::debug!("ignoring {}", msg.summary());
        }
        Ok(None)
    }

    /// Replays our ACK for a repeated 2xx, or our final response for a
    /// repeated INVITE.
    fn handle_retransmission(&mut self, msg: &Message) -> Result<bool, CallError> {
        if !self.in_dialog(msg) {
            return Ok(false);
        }
        let Ok(cseq) = extract_cseq(msg) else {
            return Ok(false);
        };
        let replay = match (self.ctx.role(), msg) {
            (Role::Caller, Message::Response(resp))
                if resp.is_success() && cseq.method == Method::Invite =>
            {
                self.last_ack.clone()
            }
            (Role::Callee, Message::Request(req))
                if req.method == Method::Invite && self.invite_cseq.as_ref() == Some(&cseq) =>
            {
                self.last_final.clone()
            }
            _ => None,
        };
        match replay {
            Some(text) => {
                log::info!("retransmission of {}, replaying last message", msg.summary());
                self.send(&text)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn is_bye(&self, msg: &Message) -> bool {
        match msg.as_request() {
            Some(req) if req.method == Method::Bye => {
                if self.in_dialog(msg) {
                    true
                } else {
                    log::warn!("BYE for an unknown dialog ignored");
                    false
                }
            }
            _ => false,
        }
    }

    /// 200 OK to the peer's BYE, echoing its Via headers and CSeq.
    fn answer_bye(&mut self, bye: &Message, stage: Stage) -> Result<(), CallError> {
        let cseq = extract_cseq(bye).map_err(at(stage))?;
        let vias = extract_via_headers(bye);
        self.set_state(CallState::Terminating);
        let ok = ResponseBuilder::ok(cseq).vias(vias).build(&self.ctx);
        self.send(&ok)
    }

    fn outcome(&self, hangup: Hangup) -> CallOutcome {
        CallOutcome {
            hangup,
            call_id: self.ctx.call_id().to_string(),
        }
    }
}
