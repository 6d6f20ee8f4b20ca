//! Digest access authentication (RFC 2617 / RFC 7616, MD5 family).
//!
//! Supports `MD5` and `MD5-sess`, `qop=auth` (or the legacy no-qop form),
//! nonce counting across requests that reuse a nonce, `opaque` echo and
//! `stale=true` handshakes, where a rejected nonce keeps the scheme
//! incomplete so the request is retried with the same credentials.

use axum::http::HeaderValue;
use md5::{Digest, Md5};

use crate::auth::{AuthChallenge, AuthError, AuthRequest, AuthScheme, Credentials};
use crate::chain::validators::hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Md5Sess,
}

#[derive(Debug, Default)]
pub struct DigestScheme {
    realm: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    algorithm: Option<String>,
    qop_options: Option<String>,
    stale: bool,
    complete: bool,
    last_nonce: Option<String>,
    nonce_count: u32,
    fixed_cnonce: Option<String>,
}

fn md5_hex(data: &str) -> String {
    hex(&Md5::digest(data.as_bytes()))
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl DigestScheme {
    pub fn new() -> Self {
        Self::default()
    }

    fn algorithm(&self) -> Result<Algorithm, AuthError> {
        match self.algorithm.as_deref() {
            None => Ok(Algorithm::Md5),
            Some(a) if a.eq_ignore_ascii_case("MD5") => Ok(Algorithm::Md5),
            Some(a) if a.eq_ignore_ascii_case("MD5-sess") => Ok(Algorithm::Md5Sess),
            Some(other) => Err(AuthError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// `Some(true)` for qop=auth, `Some(false)` for the legacy form.
    fn use_qop(&self) -> Result<bool, AuthError> {
        let Some(options) = &self.qop_options else {
            return Ok(false);
        };
        if options
            .split(',')
            .any(|q| q.trim().eq_ignore_ascii_case("auth"))
        {
            Ok(true)
        } else {
            Err(AuthError::UnsupportedQop(options.clone()))
        }
    }

    fn cnonce(&self) -> String {
        self.fixed_cnonce
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }

    #[cfg(test)]
    fn with_cnonce(mut self, cnonce: &str) -> Self {
        self.fixed_cnonce = Some(cnonce.to_string());
        self
    }
}

impl AuthScheme for DigestScheme {
    fn name(&self) -> &'static str {
        "digest"
    }

    fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<(), AuthError> {
        let nonce = challenge
            .param("nonce")
            .ok_or(AuthError::MissingParameter("nonce"))?;
        self.realm = challenge.realm().map(str::to_string);
        self.nonce = Some(nonce.to_string());
        self.opaque = challenge.param("opaque").map(str::to_string);
        self.algorithm = challenge.param("algorithm").map(str::to_string);
        self.qop_options = challenge.param("qop").map(str::to_string);
        self.stale = challenge
            .param("stale")
            .is_some_and(|s| s.eq_ignore_ascii_case("true"));
        self.algorithm()?;
        self.complete = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        !self.stale && self.complete
    }

    fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    fn generate(
        &mut self,
        credentials: &Credentials,
        request: AuthRequest<'_>,
    ) -> Result<HeaderValue, AuthError> {
        let Credentials::UsernamePassword { username, password } = credentials else {
            return Err(AuthError::InvalidCredentials("digest"));
        };
        let realm = self.realm.clone().ok_or(AuthError::MissingParameter("realm"))?;
        let nonce = self.nonce.clone().ok_or(AuthError::NotChallenged)?;
        let algorithm = self.algorithm()?;
        let qop = self.use_qop()?;

        if self.last_nonce.as_deref() == Some(nonce.as_str()) {
            self.nonce_count += 1;
        } else {
            self.nonce_count = 1;
            self.last_nonce = Some(nonce.clone());
        }
        let nc = format!("{:08x}", self.nonce_count);
        let cnonce = self.cnonce();
        let uri = request.request_target();

        let mut ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
        if algorithm == Algorithm::Md5Sess {
            ha1 = md5_hex(&format!("{}:{}:{}", ha1, nonce, cnonce));
        }
        let ha2 = md5_hex(&format!("{}:{}", request.method.as_str(), uri));
        let response = if qop {
            md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
        };

        let mut parts = vec![
            format!("username={}", quote(username)),
            format!("realm={}", quote(&realm)),
            format!("nonce={}", quote(&nonce)),
            format!("uri={}", quote(uri)),
            format!("response=\"{}\"", response),
        ];
        if qop {
            parts.push("qop=auth".to_string());
            parts.push(format!("nc={}", nc));
            parts.push(format!("cnonce={}", quote(&cnonce)));
        }
        if let Some(algorithm) = &self.algorithm {
            parts.push(format!("algorithm={}", algorithm));
        }
        if let Some(opaque) = &self.opaque {
            parts.push(format!("opaque={}", quote(opaque)));
        }

        // A stale handshake is answered; the next challenge judges the credentials.
        self.stale = false;

        let mut value = HeaderValue::from_str(&format!("Digest {}", parts.join(", ")))
            .map_err(|_| AuthError::InvalidCredentials("digest"))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::challenge::parse_challenges;
    use axum::http::{Method, Uri};

    const RFC2617: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    fn challenged(header: &str) -> DigestScheme {
        let mut scheme = DigestScheme::new().with_cnonce("0a4f113b");
        scheme
            .process_challenge(&parse_challenges(header).unwrap()[0])
            .unwrap();
        scheme
    }

    #[test]
    fn test_rfc2617_example() {
        let mut scheme = challenged(RFC2617);
        let uri = Uri::from_static("/dir/index.html");
        let header = scheme
            .generate(
                &Credentials::basic("Mufasa", "Circle Of Life"),
                AuthRequest { method: &Method::GET, uri: &uri },
            )
            .unwrap();
        let rendered = header.to_str().unwrap();
        assert!(rendered.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(rendered.contains("nc=00000001"));
        assert!(rendered.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn test_nonce_count_increments_on_reuse() {
        let mut scheme = challenged(RFC2617);
        let uri = Uri::from_static("/");
        let creds = Credentials::basic("u", "p");
        scheme
            .generate(&creds, AuthRequest { method: &Method::GET, uri: &uri })
            .unwrap();
        let second = scheme
            .generate(&creds, AuthRequest { method: &Method::GET, uri: &uri })
            .unwrap();
        assert!(second.to_str().unwrap().contains("nc=00000002"));
    }

    #[test]
    fn test_stale_challenge_is_incomplete() {
        let scheme = challenged(r#"Digest realm="r", nonce="n2", stale=true"#);
        assert!(!scheme.is_complete());
        assert!(challenged(r#"Digest realm="r", nonce="n2""#).is_complete());
    }

    #[test]
    fn test_unsupported_parameters() {
        let mut scheme = DigestScheme::new();
        let err = scheme
            .process_challenge(&parse_challenges(r#"Digest realm="r", nonce="n", algorithm=SHA-512-256"#).unwrap()[0])
            .unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedAlgorithm(_)));

        let err = DigestScheme::new()
            .process_challenge(&parse_challenges(r#"Digest realm="r""#).unwrap()[0])
            .unwrap_err();
        assert_eq!(err, AuthError::MissingParameter("nonce"));

        let mut scheme = challenged(r#"Digest realm="r", nonce="n", qop="auth-int""#);
        let uri = Uri::from_static("/");
        let err = scheme
            .generate(&Credentials::basic("u", "p"), AuthRequest { method: &Method::POST, uri: &uri })
            .unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedQop(_)));
    }

    #[test]
    fn test_md5_sess_differs_from_md5() {
        let uri = Uri::from_static("/");
        let creds = Credentials::basic("u", "p");
        let mut plain = challenged(r#"Digest realm="r", nonce="n", qop=auth"#);
        let mut sess = challenged(r#"Digest realm="r", nonce="n", qop=auth, algorithm=MD5-sess"#);
        let a = plain.generate(&creds, AuthRequest { method: &Method::GET, uri: &uri }).unwrap();
        let b = sess.generate(&creds, AuthRequest { method: &Method::GET, uri: &uri }).unwrap();
        assert_ne!(a, b);
        assert!(b.to_str().unwrap().contains("algorithm=MD5-sess"));
    }
}
