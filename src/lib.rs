//! # media-jail
//!
//! Signed-URL media proxy with SSRF-safe fetching.
//!
//! Clients get a signed token for a remote image or video; the proxy checks
//! the signature, validates the target against the network policy and
//! streams the resource back. Every redirect hop and every DNS answer is
//! re-checked, so the proxy cannot be used to reach internal hosts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use media_jail::{router, signature, Config, Proxy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new("0x24FEEDFACEDEADBEEFCAFE");
//! let path = signature::encode_path(
//!     config.key(),
//!     "https://example.com/logo.png",
//!     signature::Encoding::Base64,
//! );
//! println!("serve at {}", path);
//!
//! let app = router(Arc::new(Proxy::new(config)?))?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod blocklist;
mod config;
mod error;
mod fetch;
mod glob_trie;
mod guard;
mod host_matcher;
mod policy;
mod proxy;
mod safe_url;
mod server;

pub mod signature;

pub use blocklist::{is_hostname_blocked, is_ip_blocked};
pub use config::Config;
pub use error::{Error, ErrorKind};
pub use fetch::{BodyStream, FetchRequest, Fetched, Fetcher};
pub use glob_trie::GlobTrie;
pub use guard::{GuardedResolver, NetworkGuard};
pub use host_matcher::{load_patterns, HostMatcher};
pub use policy::Policy;
pub use proxy::{failure_status, Proxy, Stage};
pub use safe_url::SafeUrl;
pub use server::router;
