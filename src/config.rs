//! Proxy configuration.
//!
//! Built once at startup and shared read-only by every request.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::Error;

/// Configuration for the proxy.
///
/// Can be deserialized from TOML; every field has a default except the key.
/// Durations are given in milliseconds.
///
/// ```toml
/// hmac_key = "0x24FEEDFACEDEADBEEFCAFE"
/// max_size = 5242880
/// request_timeout = 4000
/// deny_list = ["*.internal.example.org"]
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared secret for token signatures.
    pub hmac_key: String,

    /// Maximum response size in bytes (0 = unlimited).
    pub max_size: u64,

    /// End-to-end deadline for one fetch, including redirects and body.
    #[serde(deserialize_with = "duration_from_millis")]
    pub request_timeout: Duration,

    /// Maximum number of redirects to follow.
    pub max_redirects: u32,

    /// Sent as `Server` on responses and `User-Agent` on upstream requests.
    pub server_name: String,

    /// Accept `video/*` in addition to `image/*`.
    pub allow_content_video: bool,

    /// Accept target URLs with `user:pass@`.
    pub allow_credential_urls: bool,

    /// Forward `X-Forwarded-For`, extended with the caller's address.
    pub enable_xfwd_for: bool,

    /// Disable address range filtering. Test-only.
    pub no_ip_filtering: bool,

    /// If non-empty, only hosts matching one of these patterns are fetched.
    pub allow_list: Vec<String>,

    /// Hosts matching any of these patterns are never fetched.
    pub deny_list: Vec<String>,

    /// Extra response headers, each `Name: value`.
    pub add_headers: Vec<String>,

    /// Listen address for the server binary.
    pub listen: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hmac_key: String::new(),
            max_size: 5 * 1024 * 1024,
            request_timeout: Duration::from_secs(4),
            max_redirects: 3,
            server_name: "media-jail".to_string(),
            allow_content_video: false,
            allow_credential_urls: false,
            enable_xfwd_for: false,
            no_ip_filtering: false,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            add_headers: Vec::new(),
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hmac_key", &"[REDACTED]")
            .field("max_size", &self.max_size)
            .field("request_timeout", &self.request_timeout)
            .field("max_redirects", &self.max_redirects)
            .field("server_name", &self.server_name)
            .field("allow_content_video", &self.allow_content_video)
            .field("allow_credential_urls", &self.allow_credential_urls)
            .field("enable_xfwd_for", &self.enable_xfwd_for)
            .field("no_ip_filtering", &self.no_ip_filtering)
            .field("allow_list", &self.allow_list)
            .field("deny_list", &self.deny_list)
            .field("add_headers", &self.add_headers)
            .field("listen", &self.listen)
            .finish()
    }
}

impl Config {
    /// Create a config with the given key and defaults for everything else.
    pub fn new(hmac_key: impl Into<String>) -> Self {
        Self {
            hmac_key: hmac_key.into(),
            ..Default::default()
        }
    }

    /// Load a config from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and [`Error::Config`]
    /// if it does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse a config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the config is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty key, a zero timeout, or a
    /// malformed extra header.
    pub fn validate(&self) -> Result<(), Error> {
        if self.hmac_key.is_empty() {
            return Err(Error::Config("hmac_key must not be empty".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be positive".into()));
        }
        self.extra_headers()?;
        Ok(())
    }

    /// Key bytes for the signature codec.
    pub fn key(&self) -> &[u8] {
        self.hmac_key.as_bytes()
    }

    /// Parse `add_headers` into name/value pairs.
    pub fn extra_headers(&self) -> Result<Vec<(String, String)>, Error> {
        self.add_headers
            .iter()
            .map(|h| {
                let (name, value) = h
                    .split_once(':')
                    .ok_or_else(|| Error::Config(format!("header {:?} is not 'Name: value'", h)))?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::Config(format!("header {:?} has no name", h)));
                }
                Ok((name.to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
