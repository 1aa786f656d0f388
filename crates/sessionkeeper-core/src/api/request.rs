//! Transport-neutral request and response values.
//!
//! `ApiRequest` is what callers hand to `SessionClient::send`; the client
//! owns the reserved headers (`Accept`, `Content-Type`, `Authorization`)
//! and the transport only ever sees the final, merged request.

use std::borrow::Cow;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;
use crate::auth::Token;

const JSON_MIME: &str = "application/json";

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute URL, or a path resolved against the transport's base URL
    pub target: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `body` as the JSON payload
    pub fn json<B: Serialize + ?Sized>(self, body: &B) -> Result<Self, serde_json::Error> {
        Ok(self.body(serde_json::to_vec(body)?))
    }

    /// Bearer credential currently carried by the request, if any
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }

    /// Fill in the JSON defaults for the reserved content headers.
    /// Values the caller already set are kept.
    pub(crate) fn apply_json_defaults(&mut self) {
        for name in [header::ACCEPT, header::CONTENT_TYPE] {
            if !self.headers.contains_key(&name) {
                self.headers.insert(name, HeaderValue::from_static(JSON_MIME));
            }
        }
    }

    /// Attach `token` as the bearer credential, replacing any existing value
    pub(crate) fn set_bearer(&mut self, token: &Token) -> Result<(), TransportError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
            .map_err(|_| {
                TransportError::InvalidRequest(format!(
                    "access token {} is not a valid header value",
                    token.preview()
                ))
            })?;
        value.set_sensitive(true);
        self.headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }

    pub(crate) fn clear_bearer(&mut self) {
        self.headers.remove(header::AUTHORIZATION);
    }
}

/// Response handed back verbatim to the caller.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
