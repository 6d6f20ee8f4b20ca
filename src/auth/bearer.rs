//! Bearer token authentication.

use axum::http::HeaderValue;

use crate::auth::{AuthChallenge, AuthError, AuthRequest, AuthScheme, Credentials};

#[derive(Debug, Default)]
pub struct BearerScheme {
    realm: Option<String>,
    complete: bool,
}

impl BearerScheme {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthScheme for BearerScheme {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<(), AuthError> {
        self.realm = challenge.realm().map(str::to_string);
        if let Some(error) = challenge.param("error") {
            tracing::debug!(error, "Bearer challenge reports token error");
        }
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    fn generate(
        &mut self,
        credentials: &Credentials,
        _request: AuthRequest<'_>,
    ) -> Result<HeaderValue, AuthError> {
        let Credentials::Token(token) = credentials else {
            return Err(AuthError::InvalidCredentials("bearer"));
        };
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| AuthError::InvalidCredentials("bearer"))?;
        value.set_sensitive(true);
        Ok(value)
    }
}
