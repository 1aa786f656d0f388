//! Outbound HTTP with transparent bearer-token renewal.
//!
//! `SessionClient` attaches the stored access token to every request. When
//! the server answers 401 it exchanges the refresh token at the renewal
//! endpoint once, then retries either with the new token or anonymously.

pub mod client;
pub mod error;
pub mod renewal;
pub mod request;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{SessionClient, DEFAULT_LOGIN_PATH};
pub use error::{ApiError, TransportError};
pub use renewal::{RenewOutcome, RenewalPolicy, Renewer, DEFAULT_RENEWAL_PATH};
pub use request::{ApiRequest, ApiResponse};
pub use transport::{ReqwestTransport, Transport, DEFAULT_REQUEST_TIMEOUT_SECS};
