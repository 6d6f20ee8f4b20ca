//! Credentials and their lookup scope.

use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Secret material offered in response to a challenge.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    UsernamePassword { username: String, password: String },
    Token(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::UsernamePassword {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Credentials::Token(token.into())
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Credentials::UsernamePassword { username, .. } => Some(username),
            Credentials::Token(_) => None,
        }
    }
}

// Secrets never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

/// Where a set of credentials applies. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AuthScope {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub realm: Option<String>,
    pub scheme: Option<String>,
}

impl AuthScope {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_host(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: Some(host.into().to_ascii_lowercase()),
            port,
            ..Self::default()
        }
    }

    pub fn with_realm(mut self, realm: Option<impl Into<String>>) -> Self {
        self.realm = realm.map(Into::into);
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into().to_ascii_lowercase());
        self
    }

    /// How well `self` (a configured scope) matches `request`; `None` if
    /// it does not match at all. Higher is more specific.
    pub fn match_score(&self, request: &AuthScope) -> Option<u32> {
        let mut score = 0;
        if let Some(scheme) = &self.scheme {
            if request.scheme.as_deref().map(str::to_ascii_lowercase).as_ref() != Some(scheme) {
                return None;
            }
            score += 1;
        }
        if let Some(realm) = &self.realm {
            if request.realm.as_ref() != Some(realm) {
                return None;
            }
            score += 2;
        }
        if let Some(port) = self.port {
            if request.port != Some(port) {
                return None;
            }
            score += 4;
        }
        if let Some(host) = &self.host {
            if !request
                .host
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(host))
            {
                return None;
            }
            score += 8;
        }
        Some(score)
    }
}

/// Looks up credentials for a challenge scope.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self, scope: &AuthScope) -> Option<Credentials>;
}

/// Credentials held in memory, matched by the most specific scope.
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    entries: RwLock<Vec<(AuthScope, Credentials)>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set credentials for a scope, replacing any for the same scope.
    pub fn set(&self, scope: AuthScope, credentials: Credentials) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(s, _)| *s != scope);
        entries.push((scope, credentials));
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialsProvider for InMemoryCredentials {
    fn credentials(&self, scope: &AuthScope) -> Option<Credentials> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter_map(|(s, c)| s.match_score(scope).map(|score| (score, c)))
            .max_by_key(|(score, _)| *score)
            .map(|(_, c)| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_specific_scope_wins() {
        let store = InMemoryCredentials::new();
        store.set(AuthScope::any(), Credentials::basic("anyone", "x"));
        store.set(
            AuthScope::for_host("api.local", Some(80)).with_realm(Some("admin")),
            Credentials::basic("admin", "y"),
        );

        let scope = AuthScope::for_host("API.local", Some(80))
            .with_realm(Some("admin"))
            .with_scheme("basic");
        assert_eq!(store.credentials(&scope).unwrap().username(), Some("admin"));

        let other = AuthScope::for_host("api.local", Some(80)).with_realm(Some("users"));
        assert_eq!(store.credentials(&other).unwrap().username(), Some("anyone"));
    }

    #[test]
    fn test_scheme_restricted_scope() {
        let store = InMemoryCredentials::new();
        store.set(AuthScope::any().with_scheme("bearer"), Credentials::token("t"));
        assert!(store
            .credentials(&AuthScope::for_host("h", None).with_scheme("basic"))
            .is_none());
        assert!(store
            .credentials(&AuthScope::for_host("h", None).with_scheme("Bearer"))
            .is_some());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", Credentials::basic("u", "hunter2"));
        assert!(!rendered.contains("hunter2"));
        assert!(!format!("{:?}", Credentials::token("abc")).contains("abc"));
    }
}
