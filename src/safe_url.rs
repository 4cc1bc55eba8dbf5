//! Target URL parsing and normalization.

use std::net::IpAddr;

use url::Url;

use crate::Error;

/// A decoded target URL that passed syntactic checks.
///
/// Parsing does not look at the network policy: it only makes sure the URL
/// is something the proxy could fetch at all, and normalizes the host so
/// that the network guard and the host lists all see the same spelling.
#[derive(Debug, Clone)]
pub struct SafeUrl {
    inner: Url,
    host: String,
    ip: Option<IpAddr>,
}

impl SafeUrl {
    /// Parse and normalize a target URL.
    ///
    /// This performs:
    /// - Scheme validation (only http/https allowed)
    /// - Hostname normalization (lowercase, no trailing dot)
    /// - Rejection of userinfo (`user:pass@`) unless `allow_credentials`
    /// - Rejection of non-standard IPv4 spellings (octal, hex, decimal, short-form)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the URL is malformed, has no host or
    /// uses a forbidden scheme, and [`Error::CredentialUrl`] for refused
    /// userinfo.
    pub fn parse(input: &str, allow_credentials: bool) -> Result<Self, Error> {
        // Must run on the raw text: Url::parse rewrites 0177.1 into 127.0.0.1
        if let Some(reason) = non_standard_ip_in_raw_url(input) {
            return Err(Error::invalid_url(input, reason));
        }

        let url = Url::parse(input).map_err(|e| Error::invalid_url(input, e.to_string()))?;
        Self::from_url(url, allow_credentials)
    }

    /// Normalize an already parsed URL, for redirect targets joined onto a base.
    pub fn from_url(url: Url, allow_credentials: bool) -> Result<Self, Error> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(Error::invalid_url(
                    url.as_str(),
                    format!("scheme '{}' not allowed, only http/https", scheme),
                ));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_url(url.as_str(), "URL must have a host"))?;

        if !allow_credentials && (!url.username().is_empty() || url.password().is_some()) {
            return Err(Error::CredentialUrl {
                url: url.as_str().to_string(),
            });
        }

        let host = normalize_host(host, url.as_str())?;
        let ip = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok();

        Ok(Self {
            inner: url,
            host,
            ip,
        })
    }

    /// Get the normalized hostname. IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The host as an address, when the URL names an IP literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Get the port, defaulting to 80 for http and 443 for https.
    pub fn port(&self) -> u16 {
        self.inner.port_or_known_default().unwrap_or(80)
    }

    /// Get the full URL as a string.
    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }

    /// Borrow the underlying URL.
    pub fn url(&self) -> &Url {
        &self.inner
    }

    /// Get the underlying URL.
    pub fn into_url(self) -> Url {
        self.inner
    }
}

/// Normalize a hostname: lowercase, remove trailing dot.
fn normalize_host(host: &str, original_url: &str) -> Result<String, Error> {
    let mut normalized = host.to_ascii_lowercase();

    if normalized.ends_with('.') {
        normalized.pop();
    }

    if normalized.is_empty() {
        return Err(Error::invalid_url(original_url, "empty hostname"));
    }

    Ok(normalized)
}

/// Find a non-standard IPv4 spelling in the authority of a raw URL.
fn non_standard_ip_in_raw_url(url: &str) -> Option<&'static str> {
    let url_lower = url.to_ascii_lowercase();
    let after_scheme = url_lower
        .strip_prefix("http://")
        .or_else(|| url_lower.strip_prefix("https://"))?;

    let host_end = after_scheme
        .find(['/', '?', '#', '\\'])
        .unwrap_or(after_scheme.len());
    let authority = &after_scheme[..host_end];

    let host_with_port = authority
        .rfind('@')
        .map(|i| &authority[i + 1..])
        .unwrap_or(authority);

    if host_with_port.starts_with('[') {
        return None;
    }

    let host = host_with_port
        .rfind(':')
        .map(|i| &host_with_port[..i])
        .unwrap_or(host_with_port);

    non_standard_ip(host.trim_end_matches('.'))
}

fn non_standard_ip(host: &str) -> Option<&'static str> {
    let parts: Vec<&str> = host.split('.').collect();

    if parts.iter().any(|p| p.starts_with("0x")) {
        return Some("hexadecimal IP encoding not allowed");
    }

    if parts.len() == 1 && !host.is_empty() {
        if host.bytes().all(|c| c.is_ascii_digit()) {
            return Some("decimal IP encoding not allowed");
        }
        // Bare hex such as 7f000001
        if host.len() == 8 && host.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Some("hexadecimal IP encoding not allowed");
        }
    }

    let all_numeric = parts
        .iter()
        .all(|p| !p.is_empty() && p.bytes().all(|c| c.is_ascii_digit()));

    // 127.1 and 127.0.1 both expand to 127.0.0.1
    if (parts.len() == 2 || parts.len() == 3) && all_numeric {
        return Some("short-form IP encoding not allowed");
    }

    // Leading zero with more digits is octal (0177 = 127)
    if parts.len() == 4 && all_numeric && parts.iter().any(|p| p.len() > 1 && p.starts_with('0')) {
        return Some("octal IP encoding not allowed");
    }

    None
}
