use crate::{
    builder::build_register,
    dialog::DialogContext,
    extract::extract_contact_expires,
    message::{Message, Method, Response},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResult {
    /// Provisional response, keep waiting.
    Pending,
    Registered(u32),
    /// 401/407. Digest authentication is not supported, so this is final.
    AuthRequired(u16),
    Failed(u16, String),
}

/// One REGISTER transaction. No refresh is scheduled after success.
#[derive(Debug, Default)]
pub struct RegistrationTransaction {
    state: RegistrationState,
    cseq: u32,
    requested_expires: u32,
}

impl RegistrationTransaction {
    /// Draws a new branch and CSeq from `ctx` and renders the REGISTER.
    pub fn build_register(&mut self, ctx: &mut DialogContext, expires: u32) -> String {
        ctx.new_branch();
        self.cseq = ctx.next_cseq();
        self.requested_expires = expires;
        self.state = RegistrationState::Registering;
        build_register(ctx, expires)
    }

    /// True when `message` is a response to the REGISTER we sent.
    pub fn matches(&self, message: &Message) -> bool {
        let Some(resp) = message.as_response() else {
            return false;
        };
        match resp.headers.get("CSeq").and_then(|v| v.parse::<crate::CSeq>().ok()) {
            Some(cseq) => cseq.method == Method::Register && cseq.seq == self.cseq,
            None => false,
        }
    }

    pub fn handle_response(&mut self, message: &Message) -> RegistrationResult {
        let Some(resp) = message.as_response() else {
            return RegistrationResult::Pending;
        };
        match resp.status_code {
            _ if resp.is_provisional() => RegistrationResult::Pending,
            200..=299 => {
                self.state = RegistrationState::Registered;
                RegistrationResult::Registered(self.granted_expires(message, resp))
            }
            code @ (401 | 407) => {
                self.state = RegistrationState::Error;
                RegistrationResult::AuthRequired(code)
            }
            code => {
                self.state = RegistrationState::Error;
                RegistrationResult::Failed(code, resp.reason.clone())
            }
        }
    }

    fn granted_expires(&self, message: &Message, resp: &Response) -> u32 {
        extract_contact_expires(message)
            .or_else(|| resp.headers.get("Expires").and_then(|v| v.trim().parse().ok()))
            .unwrap_or(self.requested_expires)
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }
}
