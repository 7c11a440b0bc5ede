//! `faith` - a Fetch-standard HTTP client
//!
//! # Features
//!
//! - **Protocol stack**: HTTP/1.1, HTTP/2, and opportunistic HTTP/3 over
//!   QUIC (raced on Alt-Svc evidence), TLS 1.2/1.3 with a bundled root store
//! - **Connection reuse**: per-agent pool with happy-eyeballs dialing,
//!   multiplexed h2/h3 sharing, and idle reaping
//! - **Fetch semantics**: one-shot shared bodies, `clone()`, redirect modes,
//!   credentials scoping, subresource integrity
//! - **Policy**: cookie jar, RFC 9111 cache (memory or disk), DNS
//!   overrides, per-request timeouts
//!
//! # Example
//!
//! ```rust,no_run
//! use faith::{fetch, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let response = fetch("https://example.com", RequestOptions::default()).await?;
//!     println!("{} {}", response.status(), response.text().await?);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod altsvc;
pub mod body;
pub mod cache;
mod cookies;
mod decode;
mod dispatch;
pub mod error;
mod integrity;
mod pool;
mod proto;
mod public_suffix;
pub mod request;
pub mod resolve;
pub mod response;
pub mod signal;
pub mod stats;
pub mod transport;

use once_cell::sync::Lazy;

pub use agent::{Agent, AgentConfig, DefaultHeader, Http3Config};
pub use altsvc::Http3Hint;
pub use body::BodyReader;
pub use cache::{CacheBackend, CacheConfig};
pub use error::{Error, ErrorKind, Result};
pub use request::{
    Body, CacheMode, Credentials, Duplex, RedirectMode, RequestOptions, Timeouts,
};
pub use resolve::{DnsConfig, DnsOverride, FamilyPreference};
pub use response::{Blob, PeerInfo, Response};
pub use signal::{AbortController, AbortSignal};
pub use stats::{AgentStats, AlpnClass, ConnectionInfo, ConnectionType};
pub use transport::CongestionAlgorithm;

/// Version of faith
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static DEFAULT_AGENT: Lazy<Agent> = Lazy::new(Agent::new);

/// Fetch with the process-default agent, unless the options name one.
pub async fn fetch(input: &str, mut options: RequestOptions) -> Result<Response> {
    let agent = options.agent.take().unwrap_or_else(|| DEFAULT_AGENT.clone());
    agent.fetch(input, options).await
}
