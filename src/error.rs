//! Error types for media-jail.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of an [`Error`].
///
/// Every variant of [`Error`] belongs to exactly one kind, and the kind alone
/// decides how a failure is surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The token was malformed or its tag did not verify.
    Signature,
    /// The request or response broke the security policy.
    Policy,
    /// The upstream answered with a content type that is not a media type.
    MalformedUpstream,
    /// The upstream could not be reached or refused to serve the resource.
    UpstreamUnavailable,
    /// The end-to-end deadline elapsed.
    Timeout,
    /// Configuration or internal invariant failure.
    Internal,
}

/// Errors that can occur while decoding, validating or fetching.
#[derive(Debug, Error)]
pub enum Error {
    /// Token is not `<tag>/<url>` or one of the parts is not validly encoded.
    #[error("Malformed token: {reason}")]
    MalformedToken { reason: String },

    /// Token tag does not match the URL.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Invalid URL syntax, forbidden scheme or missing host.
    #[error("Invalid URL: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// URL carries `user:pass@` and the configuration forbids it.
    #[error("Credentials in URL not allowed: {url}")]
    CredentialUrl { url: String },

    /// IP address is blocked by policy.
    #[error("SSRF blocked: {ip} - {reason}")]
    SsrfBlocked {
        url: String,
        ip: IpAddr,
        reason: String,
    },

    /// Hostname is blocked by policy or by the deny/allow lists.
    #[error("SSRF blocked: {host} - {reason}")]
    HostnameBlocked {
        url: String,
        host: String,
        reason: String,
    },

    /// A redirect pointed to a blocked URL.
    #[error("Redirect blocked: {redirect_url} - {reason}")]
    RedirectBlocked {
        original_url: String,
        redirect_url: String,
        reason: String,
    },

    /// Too many redirects.
    #[error("Too many redirects (max {max})")]
    TooManyRedirects { url: String, max: u32 },

    /// Content-Type header absent or not a media type.
    #[error("Malformed content type from {url}: {content_type:?}")]
    MalformedContentType {
        url: String,
        content_type: Option<String>,
    },

    /// Content-Type parsed but is not in the allowed set.
    #[error("Content type not allowed: {content_type}")]
    DisallowedContentType { url: String, content_type: String },

    /// Response body larger than the configured ceiling.
    #[error("Response from {url} exceeds {max} bytes")]
    SizeExceeded { url: String, max: u64 },

    /// Upstream answered with a non-success status.
    #[error("Upstream {url} returned status {status}")]
    UpstreamStatus { url: String, status: u16 },

    /// DNS resolution failed.
    #[error("DNS error for {host}: {message}")]
    DnsError { host: String, message: String },

    /// Connection refused, reset, or any other transport failure.
    #[error("Upstream unavailable: {url}: {message}")]
    UpstreamUnavailable { url: String, message: String },

    /// End-to-end deadline elapsed.
    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// Glob trie invariant violated during construction.
    #[error("Glob trie invariant violated: {0}")]
    Trie(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedToken { .. } | Self::InvalidSignature => ErrorKind::Signature,
            Self::InvalidUrl { .. }
            | Self::CredentialUrl { .. }
            | Self::SsrfBlocked { .. }
            | Self::HostnameBlocked { .. }
            | Self::RedirectBlocked { .. }
            | Self::TooManyRedirects { .. }
            | Self::DisallowedContentType { .. }
            | Self::SizeExceeded { .. } => ErrorKind::Policy,
            Self::MalformedContentType { .. } => ErrorKind::MalformedUpstream,
            Self::UpstreamStatus { .. }
            | Self::DnsError { .. }
            | Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Trie(_) | Self::Config(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// True for host and address rejections raised by the network guard.
    pub fn is_host_blocked(&self) -> bool {
        matches!(self, Self::SsrfBlocked { .. } | Self::HostnameBlocked { .. })
    }

    pub(crate) fn malformed_token(reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            reason: reason.into(),
        }
    }

    pub(crate) fn ssrf_blocked(url: impl Into<String>, ip: IpAddr, reason: impl Into<String>) -> Self {
        Self::SsrfBlocked {
            url: url.into(),
            ip,
            reason: reason.into(),
        }
    }

    pub(crate) fn hostname_blocked(
        url: impl Into<String>,
        host: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::HostnameBlocked {
            url: url.into(),
            host: host.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn dns_error(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DnsError {
            host: host.into(),
            message: message.into(),
        }
    }

    pub(crate) fn upstream_unavailable(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            url: url.into(),
            message: message.into(),
        }
    }

    pub(crate) fn timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_kind() {
        assert_eq!(Error::InvalidSignature.kind(), ErrorKind::Signature);
        assert_eq!(Error::malformed_token("x").kind(), ErrorKind::Signature);
    }

    #[test]
    fn test_policy_kind() {
        let err = Error::ssrf_blocked("http://10.0.0.1/", "10.0.0.1".parse().unwrap(), "private");
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert!(err.is_host_blocked());

        let err = Error::TooManyRedirects {
            url: "http://example.com/".into(),
            max: 3,
        };
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert!(!err.is_host_blocked());
    }

    #[test]
    fn test_upstream_kinds() {
        assert_eq!(
            Error::dns_error("nope.invalid", "no records").kind(),
            ErrorKind::UpstreamUnavailable
        );
        assert_eq!(
            Error::MalformedContentType {
                url: "http://example.com/".into(),
                content_type: Some("what".into()),
            }
            .kind(),
            ErrorKind::MalformedUpstream
        );
        assert_eq!(
            Error::timeout("http://example.com/", Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_display_includes_reason() {
        let err = Error::hostname_blocked("http://localhost/", "localhost", "loopback hostname");
        assert_eq!(err.to_string(), "SSRF blocked: localhost - loopback hostname");
    }
}
