// Copyright (c) 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use key_broker::error::Error;
use log::{error, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A handler owns every path below the root it is registered under and is
/// given the remainder of the path.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn handle_request(
        &self,
        remote_addr: SocketAddr,
        url_path: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>>;

    fn not_allowed(&self) -> Result<Response<Body>> {
        self.message_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    }

    fn not_found(&self) -> Result<Response<Body>> {
        self.message_response(StatusCode::NOT_FOUND, "not found")
    }

    fn no_content(&self) -> Result<Response<Body>> {
        Ok(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())?)
    }

    fn json_response<T: Serialize + Sync>(&self, status: StatusCode, body: &T) -> Result<Response<Body>>
    where
        Self: Sized,
    {
        Ok(Response::builder()
            .status(status)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(Body::from(serde_json::to_vec(body)?))?)
    }

    fn message_response(&self, status: StatusCode, message: &str) -> Result<Response<Body>> {
        let body = serde_json::json!({ "message": message });
        Ok(Response::builder()
            .status(status)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(Body::from(body.to_string()))?)
    }

    /// Map a key broker error to its status code. Internal causes are logged
    /// and never returned.
    fn error_response(&self, err: &Error) -> Result<Response<Body>> {
        match err {
            Error::Internal { context, source } => error!("{context}: {source:#}"),
            other => warn!("Request rejected: {other}"),
        }
        let status = StatusCode::from_u16(err.kind().status_code())?;
        self.message_response(status, &err.public_message())
    }
}

pub struct Router {
    routes: Vec<(String, Box<dyn ApiHandler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn register_route(&mut self, root: &str, handler: Box<dyn ApiHandler>) {
        self.routes.push((root.trim_end_matches('/').to_string(), handler));
    }

    /// Remainder of `path` below `root`, if `path` is `root` or lies under it.
    fn strip_root<'a>(root: &str, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(root)?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    }

    pub async fn route(&self, remote_addr: SocketAddr, req: Request<Body>) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        for (root, handler) in &self.routes {
            if let Some(rest) = Self::strip_root(root, &path) {
                return handler.handle_request(remote_addr, rest, req).await;
            }
        }

        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())?)
    }
}

/// Path segments below a handler root, without empty segments.
pub fn segments(url_path: &str) -> Vec<&str> {
    url_path.split('/').filter(|s| !s.is_empty()).collect()
}

pub fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|v| form_urlencoded::parse(v.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

pub fn header<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Media type of the request body, lower-cased and without parameters.
pub fn content_type(req: &Request<Body>) -> Option<String> {
    header(req, CONTENT_TYPE.as_str()).map(|value| {
        value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    })
}

/// Require a JSON request body.
pub fn require_json(req: &Request<Body>) -> key_broker::error::Result<()> {
    match content_type(req).as_deref() {
        Some(JSON_CONTENT_TYPE) => Ok(()),
        other => Err(Error::UnsupportedMediaType(format!(
            "expected {JSON_CONTENT_TYPE}, got {}",
            other.unwrap_or("no content type")
        ))),
    }
}

/// Whether the client accepts a JSON response.
pub fn accepts_json(req: &Request<Body>) -> bool {
    match header(req, hyper::header::ACCEPT.as_str()) {
        None => true,
        Some(accept) => accept.split(',').any(|range| {
            let range = range.split(';').next().unwrap_or_default().trim();
            matches!(range, "*/*" | "application/*" | JSON_CONTENT_TYPE)
        }),
    }
}

pub fn is_method(req: &Request<Body>, methods: &[Method]) -> bool {
    methods.iter().any(|m| m == req.method())
}

pub fn header_value(value: &str) -> Result<HeaderValue> {
    Ok(HeaderValue::from_str(value)?)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("/v1/keys", "/v1/keys", Some(""))]
    #[case("/v1/keys", "/v1/keys/abc/transfer", Some("/abc/transfer"))]
    #[case("/v1/keys", "/v1/key-transfer-policies", None)]
    #[case("/v1/keys", "/v1/keysmith", None)]
    fn test_strip_root(#[case] root: &str, #[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(Router::strip_root(root, path), expected);
    }

    #[rstest]
    #[case(Some("application/json; charset=utf-8"), Some("application/json"))]
    #[case(Some("Application/SAMLAssertion+XML"), Some("application/samlassertion+xml"))]
    #[case(None, None)]
    fn test_content_type(#[case] value: Option<&str>, #[case] expected: Option<&str>) {
        let mut builder = Request::builder();
        if let Some(value) = value {
            builder = builder.header(CONTENT_TYPE, value);
        }
        let req = builder.body(Body::empty()).unwrap();
        assert_eq!(content_type(&req).as_deref(), expected);
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some("*/*"), true)]
    #[case(Some("text/html, application/json;q=0.9"), true)]
    #[case(Some("application/xml"), false)]
    fn test_accepts_json(#[case] accept: Option<&str>, #[case] expected: bool) {
        let mut builder = Request::builder();
        if let Some(accept) = accept {
            builder = builder.header(hyper::header::ACCEPT, accept);
        }
        let req = builder.body(Body::empty()).unwrap();
        assert_eq!(accepts_json(&req), expected);
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments("/abc/transfer/"), vec!["abc", "transfer"]);
        assert!(segments("").is_empty());
    }
}
