//! Request orchestration: decode, validate, fetch, stream.
//!
//! Every failure is terminal and nothing is retried. The stage a failure
//! happens in decides the status code the client sees, so the client cannot
//! tell a blocked redirect from an unreachable host.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{
    HeaderName, HeaderValue, CONTENT_SECURITY_POLICY, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS,
};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::fetch::{FetchRequest, Fetched, Fetcher};
use crate::guard::NetworkGuard;
use crate::signature;

const CSP: &str = "default-src 'none'; img-src data:; style-src 'unsafe-inline'";

/// Where in the pipeline a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decoding,
    Validating,
    Fetching,
}

/// The proxy: shared, read-only state for every request.
pub struct Proxy {
    config: Config,
    guard: Arc<NetworkGuard>,
    fetcher: Fetcher,
}

impl Proxy {
    /// Build the proxy from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unusable config and [`Error::Trie`]
    /// if a host list cannot be compiled.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let guard = Arc::new(NetworkGuard::from_config(&config)?);
        let fetcher = Fetcher::new(&config, Arc::clone(&guard))?;

        info!(
            max_size = config.max_size,
            timeout_ms = config.request_timeout.as_millis() as u64,
            max_redirects = config.max_redirects,
            policy = ?guard.policy(),
            "proxy configured"
        );
        if config.no_ip_filtering {
            warn!("address range filtering is disabled");
        }

        Ok(Self {
            config,
            guard,
            fetcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serve one proxied request for `token` (`<tag>/<encoded url>`).
    pub async fn handle(&self, token: &str, request: FetchRequest) -> Response {
        let head = request.method == Method::HEAD;

        let url = match signature::decode(self.config.key(), token) {
            Ok(url) => url,
            Err(e) => return failure(Stage::Decoding, &e),
        };

        let target = match self.guard.check_url(&url) {
            Ok(target) => target,
            Err(e) => return failure(Stage::Validating, &e),
        };

        debug!(url = target.as_str(), "fetching");
        match self.fetcher.fetch(&target, &request).await {
            Ok(fetched) => stream_response(fetched, head),
            Err(e) => failure(Stage::Fetching, &e),
        }
    }
}

/// Status and body reported for a failure at `stage`.
pub fn failure_status(stage: Stage, err: &Error) -> (StatusCode, &'static str) {
    match stage {
        Stage::Decoding => (StatusCode::BAD_REQUEST, "Bad Signature\n"),
        Stage::Validating if err.is_host_blocked() => (StatusCode::NOT_FOUND, "Bad url host\n"),
        Stage::Validating => (StatusCode::NOT_FOUND, "Bad url\n"),
        Stage::Fetching => match (err.kind(), err) {
            (ErrorKind::Timeout, _) => (StatusCode::GATEWAY_TIMEOUT, "Error Fetching Resource\n"),
            (ErrorKind::MalformedUpstream, _) => {
                (StatusCode::BAD_REQUEST, "Upstream content-type malformed\n")
            }
            (_, Error::DisallowedContentType { .. }) => {
                (StatusCode::NOT_FOUND, "Unsupported content-type returned\n")
            }
            (_, Error::SizeExceeded { .. }) => (StatusCode::NOT_FOUND, "Content length exceeded\n"),
            _ => (StatusCode::NOT_FOUND, "Error Fetching Resource\n"),
        },
    }
}

fn failure(stage: Stage, err: &Error) -> Response {
    let (status, body) = failure_status(stage, err);
    match err.kind() {
        ErrorKind::Policy | ErrorKind::Signature => {
            warn!(?stage, kind = ?err.kind(), error = %err, %status, "request refused")
        }
        _ => info!(?stage, kind = ?err.kind(), error = %err, %status, "request failed"),
    }
    (status, body).into_response()
}

fn stream_response(fetched: Fetched, head: bool) -> Response {
    let Fetched {
        status,
        url,
        content_type,
        headers,
        body,
    } = fetched;
    debug!(url, %status, head, "streaming response");

    let body = if head || status == StatusCode::NOT_MODIFIED {
        Body::empty()
    } else {
        Body::from_stream(body)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;

    let out = response.headers_mut();
    out.extend(headers);
    if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        out.insert(CONTENT_TYPE, value);
    }
    for (name, value) in security_headers() {
        out.insert(name, value);
    }
    response
}

fn security_headers() -> [(HeaderName, HeaderValue); 2] {
    [
        (X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
        (CONTENT_SECURITY_POLICY, HeaderValue::from_static(CSP)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn url_err() -> Error {
        Error::invalid_url("nope", "relative URL without a base")
    }

    // ==================== Status mapping ====================

    #[test]
    fn test_decoding_failures() {
        assert_eq!(
            failure_status(Stage::Decoding, &Error::InvalidSignature),
            (StatusCode::BAD_REQUEST, "Bad Signature\n")
        );
        assert_eq!(
            failure_status(Stage::Decoding, &Error::malformed_token("x")).0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_validating_failures() {
        let blocked = Error::ssrf_blocked("http://10.0.0.1/", "10.0.0.1".parse().unwrap(), "private");
        assert_eq!(
            failure_status(Stage::Validating, &blocked),
            (StatusCode::NOT_FOUND, "Bad url host\n")
        );
        let named = Error::hostname_blocked("http://localhost/", "localhost", "loopback");
        assert_eq!(failure_status(Stage::Validating, &named).1, "Bad url host\n");
        assert_eq!(
            failure_status(Stage::Validating, &url_err()),
            (StatusCode::NOT_FOUND, "Bad url\n")
        );
        let creds = Error::CredentialUrl {
            url: "http://u:p@example.com/".into(),
        };
        assert_eq!(failure_status(Stage::Validating, &creds).1, "Bad url\n");
    }

    #[test]
    fn test_fetching_failures() {
        let url = "http://example.com/a.png";
        assert_eq!(
            failure_status(Stage::Fetching, &Error::timeout(url, Duration::from_secs(1))),
            (StatusCode::GATEWAY_TIMEOUT, "Error Fetching Resource\n")
        );
        assert_eq!(
            failure_status(
                Stage::Fetching,
                &Error::MalformedContentType {
                    url: url.into(),
                    content_type: Some("what".into()),
                }
            ),
            (StatusCode::BAD_REQUEST, "Upstream content-type malformed\n")
        );
        assert_eq!(
            failure_status(
                Stage::Fetching,
                &Error::DisallowedContentType {
                    url: url.into(),
                    content_type: "text/html".into(),
                }
            ),
            (StatusCode::NOT_FOUND, "Unsupported content-type returned\n")
        );
        assert_eq!(
            failure_status(
                Stage::Fetching,
                &Error::SizeExceeded {
                    url: url.into(),
                    max: 1,
                }
            ),
            (StatusCode::NOT_FOUND, "Content length exceeded\n")
        );
    }

    #[test]
    fn test_blocked_redirect_is_indistinguishable() {
        let redirect = Error::RedirectBlocked {
            original_url: "http://example.com/".into(),
            redirect_url: "http://127.0.0.1/".into(),
            reason: "loopback".into(),
        };
        let too_many = Error::TooManyRedirects {
            url: "http://example.com/".into(),
            max: 3,
        };
        let down = Error::upstream_unavailable("http://example.com/", "connection refused");
        for err in [redirect, too_many, down] {
            assert_eq!(
                failure_status(Stage::Fetching, &err),
                (StatusCode::NOT_FOUND, "Error Fetching Resource\n")
            );
        }
    }

    // ==================== Construction ====================

    #[test]
    fn test_new_rejects_empty_key() {
        assert!(matches!(Proxy::new(Config::default()), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_handle_bad_signature() {
        let proxy = Proxy::new(Config::new("key")).unwrap();
        let response = proxy.handle("abc/def", FetchRequest::default()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_handle_blocked_target() {
        let proxy = Proxy::new(Config::new("key")).unwrap();
        let token = signature::encode(b"key", "http://10.0.0.1/foo.cgi", signature::Encoding::Base64);
        let response = proxy.handle(&token, FetchRequest::default()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
