//! Authentication challenge engine.
//!
//! # Data Flow
//! ```text
//! response 401/407 + WWW-Authenticate / Proxy-Authenticate
//!     → challenge.rs (parse challenges)
//!     → authenticator.rs (needs_authentication: select scheme + credentials)
//!     → state.rs (AuthState: UNCHALLENGED → CHALLENGED → HANDSHAKE → SUCCESS | FAILURE)
//!
//! retried request
//!     → authenticator.rs (generate_response: pop options until one produces a header)
//!     → basic.rs / digest.rs / bearer.rs
//!     → Authorization / Proxy-Authorization
//! ```
//!
//! # Design Decisions
//! - One `AuthState` per target and per proxy, stored in the request context
//! - Malformed challenges reset the state and read as "no usable challenge"
//! - Retries are bounded by the offered options; a complete scheme that is
//!   challenged again settles in FAILURE

pub mod authenticator;
pub mod basic;
pub mod bearer;
pub mod challenge;
pub mod credentials;
pub mod digest;
pub mod scheme;
pub mod stage;
pub mod state;

use thiserror::Error;

pub use authenticator::Authenticator;
pub use challenge::{AuthChallenge, ChallengeType};
pub use credentials::{AuthScope, Credentials, CredentialsProvider, InMemoryCredentials};
pub use scheme::{AuthRequest, AuthScheme, AuthSchemeRegistry};
pub use stage::AuthStage;
pub use state::{AuthOption, AuthProtocolState, AuthState};

/// Failures while parsing challenges or producing credentials.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed challenge: {0}")]
    MalformedChallenge(String),

    #[error("challenge is missing the {0} parameter")]
    MissingParameter(&'static str),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported quality of protection: {0}")]
    UnsupportedQop(String),

    #[error("credentials not usable with {0}")]
    InvalidCredentials(&'static str),

    #[error("scheme has not been challenged")]
    NotChallenged,
}
