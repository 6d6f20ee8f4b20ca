//! `WWW-Authenticate` / `Proxy-Authenticate` parsing.

use axum::http::{header, HeaderMap, HeaderName, StatusCode};

use crate::auth::AuthError;

/// Which side of the connection is authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    Target,
    Proxy,
}

impl ChallengeType {
    /// Status signalling a challenge.
    pub fn status(self) -> StatusCode {
        match self {
            ChallengeType::Target => StatusCode::UNAUTHORIZED,
            ChallengeType::Proxy => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        }
    }

    /// Response header carrying challenges.
    pub fn challenge_header(self) -> HeaderName {
        match self {
            ChallengeType::Target => header::WWW_AUTHENTICATE,
            ChallengeType::Proxy => header::PROXY_AUTHENTICATE,
        }
    }

    /// Request header carrying credentials.
    pub fn response_header(self) -> HeaderName {
        match self {
            ChallengeType::Target => header::AUTHORIZATION,
            ChallengeType::Proxy => header::PROXY_AUTHORIZATION,
        }
    }
}

/// One challenge: a scheme plus either a token68 or auth-params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Scheme name, lowercased.
    pub scheme: String,
    /// Parameters with lowercased names, in order.
    pub params: Vec<(String, String)>,
    pub token68: Option<String>,
}

impl AuthChallenge {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }
}

/// All challenges of the given type in a response.
pub fn challenges(
    headers: &HeaderMap,
    kind: ChallengeType,
) -> Result<Vec<AuthChallenge>, AuthError> {
    let mut out = Vec::new();
    for value in headers.get_all(kind.challenge_header()) {
        let value = value
            .to_str()
            .map_err(|_| AuthError::MalformedChallenge("non-ASCII challenge".into()))?;
        out.extend(parse_challenges(value)?);
    }
    Ok(out)
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

fn is_tchar(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

fn is_token68_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"-._~+/".contains(&c)
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn skip_ws_and_commas(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b',')) {
            self.pos += 1;
        }
    }

    fn token(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while self.peek().is_some_and(is_tchar) {
            self.pos += 1;
        }
        (self.pos > start).then(|| std::str::from_utf8(&self.src[start..self.pos]).unwrap_or(""))
    }

    fn quoted(&mut self) -> Result<String, AuthError> {
        // Opening quote already checked.
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(AuthError::MalformedChallenge("unterminated quoted string".into())),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                Some(b'\\') => {
                    self.pos += 1;
                    if let Some(c) = self.peek() {
                        out.push(c);
                        self.pos += 1;
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// True if the next item is `token =`, i.e. an auth-param, not a new scheme.
    fn at_param(&self) -> bool {
        let mut i = self.pos;
        while self.src.get(i).copied().is_some_and(is_tchar) {
            i += 1;
        }
        if i == self.pos {
            return false;
        }
        while matches!(self.src.get(i), Some(b' ' | b'\t')) {
            i += 1;
        }
        self.src.get(i) == Some(&b'=') && self.src.get(i + 1) != Some(&b'=')
    }
}

/// Parse a challenge list such as
/// `Basic realm="a", Digest realm="b", nonce="x", qop="auth"`.
pub fn parse_challenges(value: &str) -> Result<Vec<AuthChallenge>, AuthError> {
    let mut cur = Cursor {
        src: value.as_bytes(),
        pos: 0,
    };
    let mut out = Vec::new();

    loop {
        cur.skip_ws_and_commas();
        if cur.peek().is_none() {
            break;
        }
        let scheme = cur
            .token()
            .ok_or_else(|| AuthError::MalformedChallenge(format!("expected scheme at {}", cur.pos)))?
            .to_ascii_lowercase();
        let mut challenge = AuthChallenge {
            scheme,
            params: Vec::new(),
            token68: None,
        };
        cur.skip_ws();

        if !cur.at_param() {
            // token68 or nothing
            let start = cur.pos;
            while cur.peek().is_some_and(is_token68_char) {
                cur.pos += 1;
            }
            while cur.peek() == Some(b'=') {
                cur.pos += 1;
            }
            if cur.pos > start {
                challenge.token68 = Some(value[start..cur.pos].to_string());
            }
            cur.skip_ws();
            match cur.peek() {
                None | Some(b',') => {}
                Some(c) => {
                    return Err(AuthError::MalformedChallenge(format!(
                        "unexpected '{}' after token68",
                        c as char
                    )))
                }
            }
            out.push(challenge);
            continue;
        }

        loop {
            cur.skip_ws_and_commas();
            if !cur.at_param() {
                break;
            }
            let name = cur.token().unwrap_or_default().to_ascii_lowercase();
            cur.skip_ws();
            cur.pos += 1; // '='
            cur.skip_ws();
            let value = match cur.peek() {
                Some(b'"') => cur.quoted()?,
                _ => cur
                    .token()
                    .ok_or_else(|| AuthError::MalformedChallenge(format!("missing value for {}", name)))?
                    .to_string(),
            };
            challenge.params.push((name, value));
            cur.skip_ws();
            match cur.peek() {
                None | Some(b',') => {}
                Some(c) => {
                    return Err(AuthError::MalformedChallenge(format!(
                        "unexpected '{}' in parameters",
                        c as char
                    )))
                }
            }
        }
        out.push(challenge);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_challenges_in_one_header() {
        let parsed = parse_challenges(
            r#"Basic realm="simple", Digest realm="test@host", qop="auth,auth-int", nonce="abc", opaque=xyz"#,
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].scheme, "basic");
        assert_eq!(parsed[0].realm(), Some("simple"));
        assert_eq!(parsed[1].scheme, "digest");
        assert_eq!(parsed[1].param("qop"), Some("auth,auth-int"));
        assert_eq!(parsed[1].param("OPAQUE"), Some("xyz"));
    }

    #[test]
    fn test_token68_and_bare_scheme() {
        let parsed = parse_challenges("Negotiate abc+/==, Bearer").unwrap();
        assert_eq!(parsed[0].token68.as_deref(), Some("abc+/=="));
        assert_eq!(parsed[1].scheme, "bearer");
        assert!(parsed[1].params.is_empty());
    }

    #[test]
    fn test_escaped_quotes() {
        let parsed = parse_challenges(r#"Basic realm="a \"quoted\" realm""#).unwrap();
        assert_eq!(parsed[0].realm(), Some(r#"a "quoted" realm"#));
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(parse_challenges(r#"Basic realm="open"#).is_err());
        assert!(parse_challenges("Basic realm=\"x\" junk").is_err());
    }
}
