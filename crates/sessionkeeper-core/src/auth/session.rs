use std::fmt;

use serde::Serialize;

use super::{CredentialStore, TokenKind};

/// Session state derived from the credential store. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No access token stored
    Anonymous,
    /// Access token stored and not yet known to be invalid
    Authenticated,
    /// A 401 was observed on an authenticated call and renewal is in flight
    Renewing,
}

impl SessionState {
    /// Resting state of a store. `SessionClient::state` adds `Renewing`
    /// while one of its calls is renewing.
    pub fn of(store: &dyn CredentialStore) -> Self {
        if store.has_access() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        }
    }

    pub fn is_authenticated(self) -> bool {
        !matches!(self, SessionState::Anonymous)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticated => "authenticated",
            SessionState::Renewing => "renewing",
        })
    }
}

/// Point-in-time summary for display, with tokens reduced to previews.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub access_preview: Option<String>,
    pub refresh_preview: Option<String>,
}

impl SessionStatus {
    pub fn capture(store: &dyn CredentialStore) -> Self {
        Self {
            state: SessionState::of(store),
            access_preview: store.get(TokenKind::Access).map(|t| t.preview()),
            refresh_preview: store.get(TokenKind::Refresh).map(|t| t.preview()),
        }
    }
}
