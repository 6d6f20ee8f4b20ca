//! Drives an [`AuthState`] from challenges to credentials.
//!
//! # Responsibilities
//! - Decide whether a response calls for a retry with credentials
//! - Select scheme and credential options for a fresh challenge
//! - Produce the `Authorization` / `Proxy-Authorization` header for a request
//!
//! # State Transitions
//! ```text
//! UNCHALLENGED --401/407 with usable options--> CHALLENGED
//! CHALLENGED   --generate: options exhausted---> FAILURE
//! CHALLENGED   --challenged again, incomplete--> HANDSHAKE
//! CHALLENGED / HANDSHAKE --challenged again, complete--> FAILURE
//! CHALLENGED / HANDSHAKE --not challenged-----> SUCCESS
//! SUCCESS      --challenged again------------> reset, then as UNCHALLENGED
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};

use crate::auth::challenge::{self, AuthChallenge};
use crate::auth::{
    AuthOption, AuthProtocolState, AuthRequest, AuthSchemeRegistry, AuthScope, AuthState,
    ChallengeType, CredentialsProvider,
};
use crate::exchange::HttpHost;
use crate::observability::metrics;

/// Consecutive HANDSHAKE rounds tolerated before giving up.
pub const MAX_HANDSHAKES: usize = 5;

pub struct Authenticator {
    registry: AuthSchemeRegistry,
    credentials: Arc<dyn CredentialsProvider>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("registry", &self.registry)
            .finish()
    }
}

impl Authenticator {
    pub fn new(registry: AuthSchemeRegistry, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    /// Inspect a response. Returns true when the request must be retried
    /// with new credentials.
    pub fn needs_authentication(
        &self,
        host: &HttpHost,
        kind: ChallengeType,
        status: StatusCode,
        headers: &HeaderMap,
        state: &mut AuthState,
    ) -> bool {
        if status != kind.status() {
            if matches!(
                state.state(),
                AuthProtocolState::Challenged | AuthProtocolState::Handshake
            ) {
                let scheme = state.scheme_name().unwrap_or("none");
                tracing::debug!(target_host = %host, scheme, "Authentication succeeded");
                metrics::record_auth_attempt(scheme, "success");
                state.set_state(AuthProtocolState::Success);
            }
            return false;
        }

        let challenges = match challenge::challenges(headers, kind) {
            Ok(challenges) => challenges,
            Err(e) => {
                tracing::warn!(target_host = %host, error = %e, "Ignoring malformed challenge");
                state.reset();
                return false;
            }
        };
        if challenges.is_empty() {
            tracing::debug!(target_host = %host, status = %status, "Challenge status without challenges");
            return false;
        }

        match state.state() {
            AuthProtocolState::Failure => return false,
            AuthProtocolState::Success => state.reset(),
            AuthProtocolState::Challenged | AuthProtocolState::Handshake => {
                if let Some(retry) = self.continue_negotiation(host, &challenges, state) {
                    return retry;
                }
            }
            AuthProtocolState::Unchallenged => {}
        }

        self.select_options(host, &challenges, state)
    }

    /// Feed a repeated challenge to the selected scheme. `None` means the
    /// negotiation was abandoned and options should be selected afresh.
    fn continue_negotiation(
        &self,
        host: &HttpHost,
        challenges: &[AuthChallenge],
        state: &mut AuthState,
    ) -> Option<bool> {
        let current = state
            .scheme_name()
            .and_then(|name| challenges.iter().find(|c| c.scheme == name));
        let outcome = match (current, state.scheme_mut()) {
            (Some(challenge), Some(scheme)) => Some(
                scheme
                    .process_challenge(challenge)
                    .map(|()| (scheme.name(), scheme.is_complete())),
            ),
            _ => None,
        };

        match outcome {
            None => {
                state.reset();
                None
            }
            Some(Err(e)) => {
                tracing::warn!(target_host = %host, error = %e, "Malformed repeated challenge");
                state.reset();
                Some(false)
            }
            Some(Ok((scheme, true))) => {
                tracing::debug!(target_host = %host, scheme, "Authorization rejected");
                metrics::record_auth_attempt(scheme, "rejected");
                state.set_state(AuthProtocolState::Failure);
                Some(false)
            }
            Some(Ok((scheme, false))) => {
                if state.handshakes() >= MAX_HANDSHAKES {
                    tracing::warn!(target_host = %host, scheme, "Handshake did not converge");
                    state.set_state(AuthProtocolState::Failure);
                    return Some(false);
                }
                state.set_state(AuthProtocolState::Handshake);
                Some(true)
            }
        }
    }

    fn select_options(
        &self,
        host: &HttpHost,
        challenges: &[AuthChallenge],
        state: &mut AuthState,
    ) -> bool {
        let mut options = VecDeque::new();
        for name in self.registry.names() {
            let Some(challenge) = challenges.iter().find(|c| c.scheme == name) else {
                continue;
            };
            let Some(mut scheme) = self.registry.create(name) else {
                continue;
            };
            if let Err(e) = scheme.process_challenge(challenge) {
                tracing::debug!(target_host = %host, scheme = name, error = %e, "Skipping unusable challenge");
                continue;
            }
            let scope = AuthScope::for_host(host.host.clone(), Some(host.port))
                .with_realm(scheme.realm().map(str::to_string))
                .with_scheme(name);
            match self.credentials.credentials(&scope) {
                Some(credentials) => options.push_back(AuthOption {
                    scheme,
                    credentials,
                }),
                None => {
                    tracing::debug!(target_host = %host, scheme = name, realm = ?scope.realm, "No credentials for scope");
                }
            }
        }

        if options.is_empty() {
            return false;
        }
        tracing::debug!(target_host = %host, options = options.len(), "Challenged");
        state.update_options(options);
        state.set_state(AuthProtocolState::Challenged);
        true
    }

    /// Add credentials for the current state to an outgoing request.
    pub fn generate_response(
        &self,
        kind: ChallengeType,
        request: AuthRequest<'_>,
        headers: &mut HeaderMap,
        state: &mut AuthState,
    ) {
        match state.state() {
            AuthProtocolState::Failure | AuthProtocolState::Unchallenged => return,
            AuthProtocolState::Success => {
                if state.scheme().is_some_and(|s| s.is_connection_based()) {
                    return;
                }
            }
            AuthProtocolState::Challenged if state.has_options() => {
                while let Some(AuthOption {
                    mut scheme,
                    credentials,
                }) = state.pop_option()
                {
                    state.record_attempt();
                    match scheme.generate(&credentials, request) {
                        Ok(value) => {
                            headers.insert(kind.response_header(), value);
                            state.update(scheme, credentials);
                            return;
                        }
                        Err(e) => {
                            tracing::debug!(scheme = scheme.name(), error = %e, "Option failed, trying next");
                            metrics::record_auth_attempt(scheme.name(), "error");
                        }
                    }
                }
                tracing::debug!(attempts = state.attempts(), "All authentication options failed");
                state.set_state(AuthProtocolState::Failure);
                return;
            }
            AuthProtocolState::Challenged | AuthProtocolState::Handshake => {}
        }

        let Some((scheme, credentials)) = state.selected_mut() else {
            return;
        };
        let name = scheme.name();
        let result = scheme.generate(credentials, request);
        state.record_attempt();
        match result {
            Ok(value) => {
                headers.insert(kind.response_header(), value);
            }
            Err(e) => {
                tracing::warn!(scheme = name, error = %e, "Could not produce credentials");
                metrics::record_auth_attempt(name, "error");
                state.set_state(AuthProtocolState::Failure);
            }
        }
    }
}
