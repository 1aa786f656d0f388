//! sessionkeeper core library.
//!
//! Keeps an access/refresh token pair for an HTTP API and wraps outbound
//! calls so expired access tokens are renewed transparently, at most once
//! per call.

pub mod api;
pub mod auth;
pub mod config;
pub mod utils;

pub use api::{
    ApiError, ApiRequest, ApiResponse, RenewOutcome, RenewalPolicy, ReqwestTransport,
    SessionClient, Transport, TransportError,
};
pub use auth::{
    CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, SessionState, SessionStatus, Token, TokenKind,
};
pub use config::{Config, CredentialBackend};
