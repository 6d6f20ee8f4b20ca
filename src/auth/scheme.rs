//! Authentication scheme contract and registry.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderValue, Method, Uri};

use crate::auth::basic::BasicScheme;
use crate::auth::bearer::BearerScheme;
use crate::auth::digest::DigestScheme;
use crate::auth::{AuthChallenge, AuthError, Credentials};

/// The parts of a request a scheme may sign.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
}

impl AuthRequest<'_> {
    /// Request-target as it appears on the request line.
    pub fn request_target(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

/// One authentication scheme instance, bound to a single negotiation.
pub trait AuthScheme: Send + Sync {
    /// Lowercase scheme name as it appears in challenges.
    fn name(&self) -> &'static str;

    /// Absorb a challenge for this scheme.
    fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<(), AuthError>;

    /// True if the scheme authenticates the connection, not each request.
    fn is_connection_based(&self) -> bool {
        false
    }

    /// True once the scheme has nothing left to negotiate; a further
    /// challenge then means the credentials were rejected.
    fn is_complete(&self) -> bool;

    fn realm(&self) -> Option<&str>;

    /// Produce the credentials header value for a request.
    fn generate(
        &mut self,
        credentials: &Credentials,
        request: AuthRequest<'_>,
    ) -> Result<HeaderValue, AuthError>;
}

impl fmt::Debug for dyn AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthScheme")
            .field("name", &self.name())
            .field("realm", &self.realm())
            .field("complete", &self.is_complete())
            .finish()
    }
}

type SchemeFactory = Arc<dyn Fn() -> Box<dyn AuthScheme> + Send + Sync>;

/// Known schemes, in order of preference.
#[derive(Clone)]
pub struct AuthSchemeRegistry {
    factories: Vec<(String, SchemeFactory)>,
}

impl fmt::Debug for AuthSchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|(name, _)| name))
            .finish()
    }
}

impl Default for AuthSchemeRegistry {
    fn default() -> Self {
        Self::empty()
            .register("digest", || Box::new(DigestScheme::new()))
            .register("bearer", || Box::new(BearerScheme::new()))
            .register("basic", || Box::new(BasicScheme::new()))
    }
}

impl AuthSchemeRegistry {
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Add a scheme at the lowest preference, replacing one of the same name.
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn AuthScheme> + Send + Sync + 'static,
    {
        let name = name.to_ascii_lowercase();
        self.factories.retain(|(n, _)| *n != name);
        self.factories.push((name, Arc::new(factory)));
        self
    }

    /// Reorder by a preference list; unlisted schemes keep their relative
    /// order after the listed ones. Unknown names are ignored.
    pub fn with_preference(mut self, preference: &[String]) -> Self {
        let rank = |name: &str| {
            preference
                .iter()
                .position(|p| p.eq_ignore_ascii_case(name))
                .unwrap_or(usize::MAX)
        };
        self.factories.sort_by_key(|(name, _)| rank(name));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(n, _)| n.as_str())
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn AuthScheme>> {
        self.factories
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, factory)| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_preference_is_strongest_first() {
        let registry = AuthSchemeRegistry::default();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["digest", "bearer", "basic"]);
    }

    #[test]
    fn test_preference_reorders() {
        let registry =
            AuthSchemeRegistry::default().with_preference(&["basic".into(), "nonsense".into()]);
        assert_eq!(registry.names().next(), Some("basic"));
        assert!(registry.create("Digest").is_some());
        assert!(registry.create("ntlm").is_none());
    }
}
