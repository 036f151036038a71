//! Authentication handshake tokens.
//!
//! A transport drives a token through a uniform step protocol during
//! connection setup: ask for the next status, send the frame it hands back,
//! repeat until the token reports a terminal status. Multi-step schemes and
//! the single-step cleartext variant below fit the same shape, so the
//! transport never learns handshake semantics.

use crate::headers::{write_request_header, ResponseHeader, Status};
use crate::request::{CacheRequest, CompletionSlot};
use std::sync::Arc;

const OP_SASL_AUTH: u8 = 0x21;
const PLAIN_MECHANISM: &[u8] = b"PLAIN";

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Handshake complete, the connection may carry user traffic.
    Ok,
    /// The accompanying request must be sent before stepping again.
    StepRequired,
    /// Terminal failure with the status the server answered.
    Failed(Status),
}

/// One in-progress handshake for one connection. Driven only from the owning
/// transport's setup path; not meant for concurrent callers.
pub trait AuthenticationToken: Send {
    fn step_authenticate(&mut self) -> (AuthStatus, Option<Arc<dyn CacheRequest>>);
}

/// Stateless per-connection token factory. Credentials are immutable
/// configuration; every connection gets a fresh token.
pub trait Authenticator: Send + Sync {
    fn create_token(&self) -> Box<dyn AuthenticationToken>;
}

/// SASL PLAIN cleartext authenticator.
#[derive(Debug, Clone)]
pub struct PlainTextAuthenticator {
    pub zone: String,
    pub user: String,
    pub password: String,
}

impl PlainTextAuthenticator {
    pub fn new(
        zone: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            zone: zone.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for PlainTextAuthenticator {
    fn create_token(&self) -> Box<dyn AuthenticationToken> {
        Box::new(PlainTextToken::new(self))
    }
}

/// Two-call token: the first step hands out the auth frame, the second
/// blocks until the receive loop resolves the completion slot and maps the
/// server's answer. The blocking call relies on the transport running its
/// receive loop on a separate thread from the setup path.
struct PlainTextToken {
    started: bool,
    request: Option<Arc<dyn CacheRequest>>,
    outcome: CompletionSlot<Status>,
}

impl PlainTextToken {
    fn new(authenticator: &PlainTextAuthenticator) -> Self {
        let outcome = CompletionSlot::new();
        let request = Arc::new(PlainAuthRequest {
            zone: authenticator.zone.clone(),
            user: authenticator.user.clone(),
            password: authenticator.password.clone(),
            outcome: outcome.clone(),
        });
        Self {
            started: false,
            request: Some(request),
            outcome,
        }
    }
}

impl AuthenticationToken for PlainTextToken {
    fn step_authenticate(&mut self) -> (AuthStatus, Option<Arc<dyn CacheRequest>>) {
        if !self.started {
            self.started = true;
            return (AuthStatus::StepRequired, self.request.take());
        }
        match self.outcome.wait() {
            Status::NoError => (AuthStatus::Ok, None),
            status => (AuthStatus::Failed(status), None),
        }
    }
}

struct PlainAuthRequest {
    zone: String,
    user: String,
    password: String,
    outcome: CompletionSlot<Status>,
}

impl CacheRequest for PlainAuthRequest {
    fn wire_bytes(&self) -> Vec<u8> {
        let body = format!("{}\0{}\0{}", self.zone, self.user, self.password).into_bytes();
        let total = (PLAIN_MECHANISM.len() + body.len()) as u32;
        let mut buf = Vec::with_capacity(24 + total as usize);
        write_request_header(&mut buf, OP_SASL_AUTH, PLAIN_MECHANISM.len() as u16, 0, total, 0);
        buf.extend_from_slice(PLAIN_MECHANISM);
        buf.extend_from_slice(&body);
        buf
    }

    fn handle_response(&self, header: &ResponseHeader, _extra: &[u8], _message: &[u8]) {
        self.outcome.set(header.status);
    }

    fn handle_failure(&self) {
        // Transport died mid-handshake; unblock the waiting step.
        self.outcome.set(Status::AuthError);
    }
}
