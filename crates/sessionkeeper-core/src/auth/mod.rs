//! Authentication state: the two session credentials and where they live.
//!
//! This module provides:
//! - `CredentialStore`: the storage contract for access/refresh tokens
//! - Backends: in-memory, JSON file in the cache directory, OS keychain
//! - `SessionState`: anonymous/authenticated, derived from the store

pub mod credentials;
pub mod session;

pub use credentials::{
    CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, Token, TokenKind,
};
pub use session::{SessionState, SessionStatus};
