//! Per-target / per-proxy negotiation state.

use std::collections::VecDeque;
use std::fmt;

use crate::auth::{AuthScheme, Credentials};

/// Where a negotiation stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthProtocolState {
    #[default]
    Unchallenged,
    Challenged,
    Handshake,
    Success,
    Failure,
}

impl AuthProtocolState {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthProtocolState::Unchallenged => "unchallenged",
            AuthProtocolState::Challenged => "challenged",
            AuthProtocolState::Handshake => "handshake",
            AuthProtocolState::Success => "success",
            AuthProtocolState::Failure => "failure",
        }
    }
}

/// A scheme offered by the server paired with credentials that fit it.
pub struct AuthOption {
    pub scheme: Box<dyn AuthScheme>,
    pub credentials: Credentials,
}

impl fmt::Debug for AuthOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOption")
            .field("scheme", &self.scheme.name())
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// Negotiation state for one target or proxy within a request context.
#[derive(Default)]
pub struct AuthState {
    state: AuthProtocolState,
    scheme: Option<Box<dyn AuthScheme>>,
    credentials: Option<Credentials>,
    options: VecDeque<AuthOption>,
    attempts: usize,
    handshakes: usize,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("state", &self.state)
            .field("scheme", &self.scheme_name())
            .field("options", &self.options.len())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AuthProtocolState {
        self.state
    }

    pub fn set_state(&mut self, state: AuthProtocolState) {
        if self.state != state {
            tracing::trace!(from = self.state.as_str(), to = state.as_str(), "Auth state transition");
        }
        if state == AuthProtocolState::Handshake {
            self.handshakes += 1;
        }
        self.state = state;
    }

    /// Back to UNCHALLENGED with nothing selected.
    pub fn reset(&mut self) {
        self.set_state(AuthProtocolState::Unchallenged);
        self.scheme = None;
        self.credentials = None;
        self.options.clear();
        self.handshakes = 0;
    }

    /// Adopt a negotiated scheme and its credentials.
    pub fn update(&mut self, scheme: Box<dyn AuthScheme>, credentials: Credentials) {
        self.scheme = Some(scheme);
        self.credentials = Some(credentials);
        self.options.clear();
    }

    /// Replace the pending options; the selected scheme is dropped.
    pub fn update_options(&mut self, options: VecDeque<AuthOption>) {
        self.scheme = None;
        self.credentials = None;
        self.options = options;
    }

    pub fn pop_option(&mut self) -> Option<AuthOption> {
        self.options.pop_front()
    }

    pub fn has_options(&self) -> bool {
        !self.options.is_empty()
    }

    pub fn scheme(&self) -> Option<&dyn AuthScheme> {
        self.scheme.as_deref()
    }

    pub fn scheme_mut(&mut self) -> Option<&mut (dyn AuthScheme + 'static)> {
        self.scheme.as_deref_mut()
    }

    pub fn scheme_name(&self) -> Option<&'static str> {
        self.scheme.as_ref().map(|s| s.name())
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Scheme and credentials together, for header generation.
    pub(crate) fn selected_mut(&mut self) -> Option<(&mut (dyn AuthScheme + 'static), &Credentials)> {
        match (self.scheme.as_deref_mut(), self.credentials.as_ref()) {
            (Some(scheme), Some(credentials)) => Some((scheme, credentials)),
            _ => None,
        }
    }

    /// Header generations performed so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// HANDSHAKE transitions since the last reset.
    pub fn handshakes(&self) -> usize {
        self.handshakes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::basic::BasicScheme;

    #[test]
    fn test_reset_clears_selection() {
        let mut state = AuthState::new();
        state.set_state(AuthProtocolState::Success);
        state.update(Box::new(BasicScheme::new()), Credentials::basic("u", "p"));
        assert_eq!(state.scheme_name(), Some("basic"));

        state.reset();
        assert_eq!(state.state(), AuthProtocolState::Unchallenged);
        assert!(state.scheme().is_none());
        assert!(state.credentials().is_none());
    }

    #[test]
    fn test_options_are_fifo() {
        let mut state = AuthState::new();
        let mut options = VecDeque::new();
        options.push_back(AuthOption {
            scheme: Box::new(BasicScheme::new()),
            credentials: Credentials::basic("first", "p"),
        });
        options.push_back(AuthOption {
            scheme: Box::new(BasicScheme::new()),
            credentials: Credentials::basic("second", "p"),
        });
        state.update_options(options);
        assert_eq!(state.pop_option().unwrap().credentials.username(), Some("first"));
        assert!(state.has_options());
        assert_eq!(state.pop_option().unwrap().credentials.username(), Some("second"));
        assert!(state.pop_option().is_none());
    }
}
