//! HTTP front end.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue, SERVER};
use axum::http::{Method, StatusCode};
use axum::middleware::map_response;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Error;
use crate::fetch::FetchRequest;
use crate::proxy::Proxy;

/// Build the router serving `proxy`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the server name or an extra header is not a
/// valid header value.
pub fn router(proxy: Arc<Proxy>) -> Result<Router, Error> {
    let server_name = HeaderValue::from_str(&proxy.config().server_name)
        .map_err(|_| Error::Config("server_name is not a valid header value".into()))?;
    let extra = Arc::new(extra_headers(proxy.config())?);

    let router = Router::new()
        .route("/", get(health))
        .route("/healthcheck", get(health))
        .route("/favicon.ico", get(not_found))
        .fallback(proxy_request)
        .with_state(proxy)
        .layer(map_response(move |mut response: Response| {
            let extra = Arc::clone(&extra);
            async move {
                let headers = response.headers_mut();
                for (name, value) in extra.iter() {
                    headers.insert(name.clone(), value.clone());
                }
                response
            }
        }))
        .layer(SetResponseHeaderLayer::overriding(SERVER, server_name))
        .layer(TraceLayer::new_for_http());

    Ok(router)
}

fn extra_headers(config: &Config) -> Result<Vec<(HeaderName, HeaderValue)>, Error> {
    config
        .extra_headers()?
        .into_iter()
        .map(|(name, value)| {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| Error::Config(format!("invalid header name {:?}", name)))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|_| Error::Config(format!("invalid value for header {}", name)))?;
            Ok((name, value))
        })
        .collect()
}

async fn health() -> &'static str {
    "OK"
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 Not Found\n").into_response()
}

async fn proxy_request(State(proxy): State<Arc<Proxy>>, request: Request) -> Response {
    let method = request.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n").into_response();
    }

    let Some(token) = token_from_path(request.uri().path()) else {
        return (StatusCode::NOT_FOUND, "404 Not Found\n").into_response();
    };

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let fetch = FetchRequest {
        method,
        headers: request.headers().clone(),
        client_ip,
    };
    proxy.handle(token, fetch).await
}

/// `/<tag>/<url>` with both segments non-empty.
fn token_from_path(path: &str) -> Option<&str> {
    let token = path.strip_prefix('/')?;
    let (tag, url) = token.split_once('/')?;
    if tag.is_empty() || url.is_empty() || url.contains('/') {
        return None;
    }
    Some(token)
}
