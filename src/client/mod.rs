//! Upstream side of the gateway.
//!
//! # Responsibilities
//! - Bound concurrent upstream requests per route and in total
//! - Send requests with hyper-util, directly or through an HTTP proxy
//! - Follow redirects and negotiate authentication challenges
//! - Forward inbound requests to the origin configured for their host
//!
//! # Data Flow
//! ```text
//! ForwardDispatch ─► ConnectionManager::exec_chain_for(origin)
//!                      ├─ RedirectStage   (optional)
//!                      ├─ AuthStage       (target + proxy challenges)
//!                      └─ Transport       (pool permit → hyper-util client)
//! ```

pub mod forward;
pub mod headers;
pub mod manager;
pub mod pool;
pub mod proxy;
pub mod redirect;
pub mod transport;

pub use forward::ForwardDispatch;
pub use manager::ConnectionManager;
pub use pool::{ConnectionPool, PoolPermit};
pub use proxy::ProxyConnector;
pub use redirect::RedirectStage;
pub use transport::Transport;
