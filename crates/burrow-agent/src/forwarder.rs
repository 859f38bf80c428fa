//! Rewrites tunnelled requests and forwards them to the local target.
//!
//! The hub annotates each request with `x-proxy-host` (where the agent
//! should send it) and `x-proxy-path` (the path the caller asked for).
//! The forwarder rebuilds the request URI from those headers, records the
//! original host in `x-forwarded-host` / `x-origin-host`, and replays the
//! request against the target over a pooled local HTTP client.

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{self, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// Header naming the host:port the agent should forward to.
pub const PROXY_HOST_HEADER: &str = "x-proxy-host";
/// Header carrying the path the external caller requested.
pub const PROXY_PATH_HEADER: &str = "x-proxy-path";
/// Set on the outbound request to the original `Host` of the caller.
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";
/// Set on the outbound request to the target host being contacted.
pub const ORIGIN_HOST_HEADER: &str = "x-origin-host";

pub type HttpClient = Client<HttpConnector, Incoming>;

/// Builds the pooled client used for all local forwards.
pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request is missing the {PROXY_HOST_HEADER} header")]
    MissingTargetHost,

    #[error("invalid forwarding metadata: {0}")]
    BadMetadata(String),

    #[error("target unreachable: {0}")]
    Unreachable(#[from] legacy::Error),
}

/// Rewrites a tunnelled request in place for delivery to the local target.
///
/// The target host comes from `x-proxy-host`, the path from `x-proxy-path`
/// (defaulting to `/`), and the caller's query string is preserved as-is.
pub fn rewrite<B>(req: &mut Request<B>) -> Result<(), ForwardError> {
    let target_host = req
        .headers()
        .get(PROXY_HOST_HEADER)
        .ok_or(ForwardError::MissingTargetHost)?
        .to_str()
        .map_err(|e| ForwardError::BadMetadata(e.to_string()))?
        .to_string();

    let path = match req.headers().get(PROXY_PATH_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|e| ForwardError::BadMetadata(e.to_string()))?
            .to_string(),
        None => "/".to_string(),
    };

    let uri = match req.uri().query() {
        Some(query) => format!("http://{}{}?{}", target_host, path, query),
        None => format!("http://{}{}", target_host, path),
    };
    let uri: Uri = uri
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::BadMetadata(e.to_string()))?;

    let original_host = req
        .headers()
        .get(HOST)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(""));

    *req.uri_mut() = uri;

    let headers = req.headers_mut();
    headers.remove(HOST);
    headers.insert(FORWARDED_HOST_HEADER, original_host);
    if let Ok(value) = HeaderValue::from_str(&target_host) {
        headers.insert(ORIGIN_HOST_HEADER, value);
    }

    Ok(())
}

/// Forwards one tunnelled request to the local target.
///
/// Always yields a response: forwarding failures surface to the hub as a
/// 502 rather than tearing down the tunnel stream.
pub async fn forward(
    client: HttpClient,
    mut req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let outcome = match rewrite(&mut req) {
        Ok(()) => {
            let target = req.uri().to_string();
            match client.request(req).await {
                Ok(resp) => return Ok(resp.map(|b| b.boxed())),
                Err(e) => {
                    tracing::warn!(target = %target, error = %e, "forward to local target failed");
                    ForwardError::Unreachable(e)
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "rejecting tunnelled request");
            e
        }
    };

    let body = Full::new(Bytes::from(outcome.to_string()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn request(uri: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .uri(uri)
            .body(Empty::new())
            .unwrap()
    }

    #[test]
    fn rewrite_builds_target_uri_from_headers() {
        let mut req = request("/api/v1/proxy/myid/hello");
        req.headers_mut()
            .insert(PROXY_HOST_HEADER, HeaderValue::from_static("127.0.0.1:9000"));
        req.headers_mut()
            .insert(PROXY_PATH_HEADER, HeaderValue::from_static("/hello"));

        rewrite(&mut req).unwrap();

        assert_eq!(req.uri().to_string(), "http://127.0.0.1:9000/hello");
        assert_eq!(
            req.headers().get(ORIGIN_HOST_HEADER).unwrap(),
            "127.0.0.1:9000"
        );
    }

    #[test]
    fn rewrite_preserves_query_string() {
        let mut req = request("/api/v1/proxy/myid/search?q=tunnel&page=2");
        req.headers_mut()
            .insert(PROXY_HOST_HEADER, HeaderValue::from_static("localhost:80"));
        req.headers_mut()
            .insert(PROXY_PATH_HEADER, HeaderValue::from_static("/search"));

        rewrite(&mut req).unwrap();

        assert_eq!(
            req.uri().to_string(),
            "http://localhost:80/search?q=tunnel&page=2"
        );
    }

    #[test]
    fn rewrite_defaults_path_to_root() {
        let mut req = request("/anything");
        req.headers_mut()
            .insert(PROXY_HOST_HEADER, HeaderValue::from_static("web:8080"));

        rewrite(&mut req).unwrap();

        assert_eq!(req.uri().path(), "/");
    }

    #[test]
    fn rewrite_records_original_host() {
        let mut req = request("/hello");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("hub.example.com"));
        req.headers_mut()
            .insert(PROXY_HOST_HEADER, HeaderValue::from_static("127.0.0.1:9000"));

        rewrite(&mut req).unwrap();

        assert_eq!(
            req.headers().get(FORWARDED_HOST_HEADER).unwrap(),
            "hub.example.com"
        );
        assert!(req.headers().get(HOST).is_none());
    }

    #[test]
    fn rewrite_without_target_host_fails() {
        let mut req = request("/hello");
        let err = rewrite(&mut req).unwrap_err();
        assert!(matches!(err, ForwardError::MissingTargetHost));
    }
}
