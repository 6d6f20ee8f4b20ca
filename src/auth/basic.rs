//! Basic authentication.

use axum::http::HeaderValue;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::auth::{AuthChallenge, AuthError, AuthRequest, AuthScheme, Credentials};

#[derive(Debug, Default)]
pub struct BasicScheme {
    realm: Option<String>,
    complete: bool,
}

impl BasicScheme {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthScheme for BasicScheme {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<(), AuthError> {
        self.realm = challenge.realm().map(str::to_string);
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
        let Credentials::UsernamePassword { username, password } = credentials else {
            return Err(AuthError::InvalidCredentials("basic"));
        };
        let encoded = STANDARD.encode(format!("{}:{}", username, password));
        HeaderValue::from_str(&format!("Basic {}", encoded))
            .map_err(|_| AuthError::InvalidCredentials("basic"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::challenge::parse_challenges;
    use axum::http::{Method, Uri};

    #[test]
    fn test_rfc7617_example() {
        let mut scheme = BasicScheme::new();
        let challenge = &parse_challenges(r#"Basic realm="WallyWorld""#).unwrap()[0];
        scheme.process_challenge(challenge).unwrap();
        assert!(scheme.is_complete());
        assert_eq!(scheme.realm(), Some("WallyWorld"));

        let uri = Uri::from_static("/");
        let header = scheme
            .generate(
                &Credentials::basic("Aladdin", "open sesame"),
                AuthRequest { method: &Method::GET, uri: &uri },
            )
            .unwrap();
        assert_eq!(header, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn test_token_credentials_rejected() {
        let uri = Uri::from_static("/");
        let err = BasicScheme::new()
            .generate(&Credentials::token("t"), AuthRequest { method: &Method::GET, uri: &uri })
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials("basic"));
    }
}
