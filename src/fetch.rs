//! Guarded upstream fetching.
//!
//! Redirects are followed manually so every hop can be checked by the
//! [`NetworkGuard`] before it is requested. Name resolution goes through the
//! [`GuardedResolver`], so the addresses actually connected to are the ones
//! that were checked. One deadline covers every hop and the whole body.

use std::error::Error as StdError;
use std::fmt;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    LOCATION,
};
use reqwest::redirect::Policy as RedirectPolicy;
use reqwest::{Client, Method, Response, StatusCode};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::glob_trie::GlobTrie;
use crate::guard::{GuardedResolver, NetworkGuard};
use crate::safe_url::SafeUrl;

/// Streamed response body. Yields an error and stops if the size limit or
/// the deadline is hit mid-stream.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Caller headers passed on to the upstream.
const FORWARDED_REQUEST_HEADERS: [HeaderName; 5] = [
    ACCEPT,
    ACCEPT_ENCODING,
    IF_NONE_MATCH,
    IF_MODIFIED_SINCE,
    CACHE_CONTROL,
];

/// Upstream headers passed back to the caller. Content-Type is handled
/// separately.
const FORWARDED_RESPONSE_HEADERS: [HeaderName; 6] = [
    CACHE_CONTROL,
    ETAG,
    EXPIRES,
    LAST_MODIFIED,
    CONTENT_LENGTH,
    CONTENT_ENCODING,
];

/// The caller's side of a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// `GET` or `HEAD`.
    pub method: Method,
    /// Inbound request headers. Only a fixed set is forwarded.
    pub headers: HeaderMap,
    /// Address of the caller, appended to `X-Forwarded-For` when enabled.
    pub client_ip: Option<IpAddr>,
}

/// A checked upstream response, ready to stream.
pub struct Fetched {
    pub status: StatusCode,
    /// Final URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    /// Upstream headers from the response allowlist.
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for Fetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetched")
            .field("status", &self.status)
            .field("url", &self.url)
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Outbound HTTP client with the proxy's limits applied.
pub struct Fetcher {
    client: Client,
    guard: Arc<NetworkGuard>,
    content_types: GlobTrie,
    default_accept: HeaderValue,
    max_size: u64,
    max_redirects: u32,
    timeout: Duration,
    forward_xff: bool,
}

impl Fetcher {
    /// Build a fetcher for `config`, resolving through `guard`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DnsError`] if the system resolver cannot be set up and
    /// [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: &Config, guard: Arc<NetworkGuard>) -> Result<Self, Error> {
        let resolver = GuardedResolver::new(Arc::clone(&guard))?;

        // No redirect following: every hop must go through the guard
        let client = Client::builder()
            .redirect(RedirectPolicy::none())
            .dns_resolver(Arc::new(resolver))
            .no_proxy()
            .user_agent(config.server_name.as_str())
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;

        let mut content_types = GlobTrie::new(true);
        content_types.add_path("image/*")?;
        let default_accept = if config.allow_content_video {
            content_types.add_path("video/*")?;
            HeaderValue::from_static("image/*, video/*")
        } else {
            HeaderValue::from_static("image/*")
        };

        Ok(Self {
            client,
            guard,
            content_types,
            default_accept,
            max_size: config.max_size,
            max_redirects: config.max_redirects,
            timeout: config.request_timeout,
            forward_xff: config.enable_xfwd_for,
        })
    }

    /// Fetch `target`, following redirects.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the deadline elapses before the headers arrive
    /// - [`Error::TooManyRedirects`] / [`Error::RedirectBlocked`] for redirects
    /// - [`Error::UpstreamStatus`] for a non-success final status
    /// - [`Error::MalformedContentType`] / [`Error::DisallowedContentType`]
    /// - [`Error::SizeExceeded`] if `Content-Length` is over the limit
    /// - [`Error::UpstreamUnavailable`] / [`Error::DnsError`] for transport failures
    pub async fn fetch(&self, target: &SafeUrl, request: &FetchRequest) -> Result<Fetched, Error> {
        let deadline = Instant::now() + self.timeout;
        match timeout_at(deadline, self.fetch_inner(target, request, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(target.as_str(), self.timeout)),
        }
    }

    async fn fetch_inner(
        &self,
        target: &SafeUrl,
        request: &FetchRequest,
        deadline: Instant,
    ) -> Result<Fetched, Error> {
        self.guard.check_target(target)?;

        let (response, url) = self.follow(target, request).await?;
        let status = response.status();
        let headers = copy_response_headers(response.headers());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched {
                status,
                url: url.as_str().to_string(),
                content_type: header_str(response.headers(), &CONTENT_TYPE),
                headers,
                body: Box::pin(stream::empty()),
            });
        }

        if !is_servable(status) {
            return Err(Error::UpstreamStatus {
                url: url.as_str().to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = self.check_content_type(url.as_str(), response.headers())?;

        if self.max_size > 0 {
            if let Some(length) = declared_length(response.headers()) {
                if length > self.max_size {
                    return Err(Error::SizeExceeded {
                        url: url.as_str().to_string(),
                        max: self.max_size,
                    });
                }
            }
        }

        let body = limit_body(
            response.bytes_stream(),
            BodyLimits {
                url: url.as_str().to_string(),
                max_size: self.max_size,
                deadline,
                timeout: self.timeout,
            },
        );

        Ok(Fetched {
            status,
            url: url.into_url().into(),
            content_type: Some(content_type),
            headers,
            body,
        })
    }

    /// Request `target` and follow redirects until a final response.
    async fn follow(
        &self,
        target: &SafeUrl,
        request: &FetchRequest,
    ) -> Result<(Response, SafeUrl), Error> {
        let outbound = self.outbound_headers(request);
        let mut current = target.clone();
        let mut redirects = 0u32;

        loop {
            let response = self
                .client
                .request(request.method.clone(), current.url().clone())
                .headers(outbound.clone())
                .send()
                .await
                .map_err(|e| transport_error(current.as_str(), &e))?;

            let status = response.status();
            debug!(
                url = current.as_str(),
                port = current.port(),
                %status,
                hop = redirects,
                "upstream response"
            );

            if !is_followed_redirect(status) {
                return Ok((response, current));
            }

            if redirects >= self.max_redirects {
                return Err(Error::TooManyRedirects {
                    url: target.as_str().to_string(),
                    max: self.max_redirects,
                });
            }
            redirects += 1;

            let location = header_str(response.headers(), &LOCATION).ok_or_else(|| {
                Error::upstream_unavailable(current.as_str(), "redirect without Location header")
            })?;
            current = next_hop(&self.guard, &current, &location, target.as_str())?;
        }
    }

    fn outbound_headers(&self, request: &FetchRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for name in &FORWARDED_REQUEST_HEADERS {
            for value in request.headers.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, self.default_accept.clone());
        }

        if self.forward_xff {
            if let Some(chain) = forwarded_for(&request.headers, request.client_ip) {
                headers.insert(X_FORWARDED_FOR, chain);
            }
        }
        headers
    }

    fn check_content_type(&self, url: &str, headers: &HeaderMap) -> Result<String, Error> {
        let raw = header_str(headers, &CONTENT_TYPE);
        let malformed = || Error::MalformedContentType {
            url: url.to_string(),
            content_type: raw.clone(),
        };

        let value = raw.as_deref().ok_or_else(malformed)?;
        let parsed: mime::Mime = value.parse().map_err(|_| malformed())?;

        if !self.content_types.check_path(parsed.essence_str()) {
            warn!(url, content_type = value, "content type not allowed");
            return Err(Error::DisallowedContentType {
                url: url.to_string(),
                content_type: value.to_string(),
            });
        }
        Ok(value.to_string())
    }
}

/// Only full and partial content is relayed; 204 and friends carry no media.
fn is_servable(status: StatusCode) -> bool {
    matches!(status, StatusCode::OK | StatusCode::PARTIAL_CONTENT)
}

/// 304 is a final answer to a conditional request, not a redirect.
fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Resolve a redirect `Location` against the current URL and check it.
pub(crate) fn next_hop(
    guard: &NetworkGuard,
    current: &SafeUrl,
    location: &str,
    original: &str,
) -> Result<SafeUrl, Error> {
    let joined = current.url().join(location).map_err(|e| Error::RedirectBlocked {
        original_url: original.to_string(),
        redirect_url: location.to_string(),
        reason: e.to_string(),
    })?;

    guard.check_url(joined.as_str()).map_err(|e| {
        warn!(original, redirect = joined.as_str(), error = %e, "redirect blocked");
        Error::RedirectBlocked {
            original_url: original.to_string(),
            redirect_url: joined.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Inbound `X-Forwarded-For` chain with the caller appended.
fn forwarded_for(headers: &HeaderMap, client_ip: Option<IpAddr>) -> Option<HeaderValue> {
    let mut hops: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if let Some(ip) = client_ip {
        hops.push(ip.to_string());
    }
    if hops.is_empty() {
        return None;
    }
    HeaderValue::from_str(&hops.join(", ")).ok()
}

fn copy_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in &FORWARDED_RESPONSE_HEADERS {
        for value in upstream.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Map a transport error, recovering a refusal raised by the resolver.
fn transport_error(url: &str, err: &reqwest::Error) -> Error {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(inner) = cause.downcast_ref::<Error>() {
            return match inner {
                Error::SsrfBlocked { ip, reason, .. } => Error::ssrf_blocked(url, *ip, reason.as_str()),
                Error::HostnameBlocked { host, reason, .. } => {
                    Error::hostname_blocked(url, host.as_str(), reason.as_str())
                }
                Error::DnsError { host, message } => Error::dns_error(host.as_str(), message.as_str()),
                other => Error::upstream_unavailable(url, other.to_string()),
            };
        }
        source = cause.source();
    }
    Error::upstream_unavailable(url, err.to_string())
}

struct BodyLimits {
    url: String,
    max_size: u64,
    deadline: Instant,
    timeout: Duration,
}

struct BodyState<S> {
    inner: Pin<Box<S>>,
    limits: BodyLimits,
    seen: u64,
}

/// Wrap an upstream body with the byte ceiling and the deadline.
///
/// A declared `Content-Length` over the ceiling is refused before this runs.
/// Without one the overflow is only seen mid-stream, after the status line
/// and earlier chunks have gone out; the stream then errors and the client
/// sees a truncated body on an aborted connection rather than an error status.
fn limit_body<S, E>(inner: S, limits: BodyLimits) -> BodyStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = BodyState {
        inner: Box::pin(inner),
        limits,
        seen: 0,
    };
    Box::pin(stream::try_unfold(state, next_chunk))
}

async fn next_chunk<S, E>(mut state: BodyState<S>) -> Result<Option<(Bytes, BodyState<S>)>, Error>
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: fmt::Display + Send,
{
    let limits = &state.limits;
    let next = timeout_at(limits.deadline, state.inner.next())
        .await
        .map_err(|_| Error::timeout(limits.url.as_str(), limits.timeout))?;

    let chunk = match next {
        None => return Ok(None),
        Some(chunk) => {
            chunk.map_err(|e| Error::upstream_unavailable(limits.url.as_str(), e.to_string()))?
        }
    };

    state.seen += chunk.len() as u64;
    if limits.max_size > 0 && state.seen > limits.max_size {
        warn!(url = limits.url.as_str(), max = limits.max_size, "body exceeded size limit");
        return Err(Error::SizeExceeded {
            url: limits.url.clone(),
            max: limits.max_size,
        });
    }
    Ok(Some((chunk, state)))
}
