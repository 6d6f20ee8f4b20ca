//! HTTP exchange engine: a server that turns each request into an
//! [`exchange::Exchange`], runs it through an ordered chain of protocol
//! stages and writes the response back in request order.

pub mod auth;
pub mod bridge;
pub mod cache;
pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod observability;
pub mod server;

pub use chain::{server_pipeline, ExecChain, Pipeline};
pub use config::ServerConfig;
pub use error::{ChainError, ChainResult};
pub use lifecycle::Shutdown;
pub use server::HttpServer;
