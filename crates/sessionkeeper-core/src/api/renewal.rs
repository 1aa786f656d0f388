//! Exchanging the refresh token for a new access token.
//!
//! The routine is split into explicit steps (read credential, build call,
//! issue call, apply result) so each transition can be exercised on its own.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ApiRequest, ApiResponse, Transport};
use crate::auth::{CredentialStore, Token, TokenKind};
use crate::utils::truncate_body;

/// Renewal endpoint used when none is configured
pub const DEFAULT_RENEWAL_PATH: &str = "/auth/jwt/refresh/";

/// How concurrent `send` calls that each observe a 401 coordinate renewal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalPolicy {
    /// Every call renews on its own, with no cross-call coordination
    #[default]
    Independent,
    /// One renewal at a time; later callers reuse a rotation that already happened
    SingleFlight,
}

#[derive(Debug, Serialize)]
struct RenewalRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RenewalResponse {
    access: Option<String>,
    #[serde(default)]
    refresh: Option<String>,
}

/// Result of one renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    /// New access token stored; `rotated` when the refresh token was replaced too
    Renewed { rotated: bool },
    /// Nothing to renew with. Any stray access token was cleared.
    NoRefreshToken,
    /// Endpoint rejected the refresh token with 401. Both tokens were cleared.
    RefreshInvalid,
    /// Attempt failed for another reason. Stored tokens are untouched.
    Inconclusive(String),
}

impl RenewOutcome {
    pub fn is_renewed(&self) -> bool {
        matches!(self, RenewOutcome::Renewed { .. })
    }

    /// Whether the attempt left the session without credentials
    pub fn invalidated_session(&self) -> bool {
        matches!(self, RenewOutcome::NoRefreshToken | RenewOutcome::RefreshInvalid)
    }
}

impl fmt::Display for RenewOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenewOutcome::Renewed { rotated: true } => f.write_str("renewed (refresh token rotated)"),
            RenewOutcome::Renewed { rotated: false } => f.write_str("renewed"),
            RenewOutcome::NoRefreshToken => f.write_str("no refresh token stored"),
            RenewOutcome::RefreshInvalid => f.write_str("refresh token rejected"),
            RenewOutcome::Inconclusive(reason) => write!(f, "inconclusive: {}", reason),
        }
    }
}

/// Runs the renewal routine against a transport and a credential store.
#[derive(Clone)]
pub struct Renewer {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    endpoint: String,
}

impl Renewer {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            endpoint: endpoint.into(),
        }
    }

    pub async fn renew(&self) -> RenewOutcome {
        let Some(refresh) = self.store.get(TokenKind::Refresh) else {
            if self.store.has_access() {
                warn!("Access token stored without a refresh token, clearing it");
            }
            self.store.clear(TokenKind::Access);
            return RenewOutcome::NoRefreshToken;
        };

        let request = match renewal_request(&self.endpoint, &refresh) {
            Ok(request) => request,
            Err(e) => return RenewOutcome::Inconclusive(format!("could not encode renewal body: {}", e)),
        };

        debug!(endpoint = %self.endpoint, refresh = %refresh.preview(), "Renewing access token");
        let response = match self.transport.execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Renewal request failed");
                return RenewOutcome::Inconclusive(e.to_string());
            }
        };

        apply_renewal_response(self.store.as_ref(), &response)
    }
}

/// `POST {"refresh": ...}` with JSON content negotiation
pub(crate) fn renewal_request(endpoint: &str, refresh: &Token) -> Result<ApiRequest, serde_json::Error> {
    let mut request = ApiRequest::post(endpoint).json(&RenewalRequest {
        refresh: refresh.as_str(),
    })?;
    request.apply_json_defaults();
    Ok(request)
}

/// Translate the endpoint's answer into store writes and an outcome
pub(crate) fn apply_renewal_response(store: &dyn CredentialStore, response: &ApiResponse) -> RenewOutcome {
    if response.status.is_success() {
        let parsed: RenewalResponse = match response.json() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Renewal response is not valid JSON");
                return RenewOutcome::Inconclusive(format!("unparseable renewal response: {}", e));
            }
        };
        let Some(access) = parsed.access else {
            warn!("Renewal response OK but carries no access token");
            return RenewOutcome::Inconclusive("renewal response carries no access token".to_string());
        };

        let access = Token::new(access);
        info!(access = %access.preview(), "Access token renewed");
        store.set(TokenKind::Access, access);

        let rotated = match parsed.refresh {
            Some(refresh) => {
                debug!("Refresh token rotated");
                store.set(TokenKind::Refresh, Token::new(refresh));
                true
            }
            None => false,
        };
        return RenewOutcome::Renewed { rotated };
    }

    if response.status == reqwest::StatusCode::UNAUTHORIZED {
        info!("Refresh token rejected, clearing stored credentials");
        store.clear_all();
        return RenewOutcome::RefreshInvalid;
    }

    let body = truncate_body(&response.text());
    warn!(status = %response.status, body = %body, "Renewal failed");
    RenewOutcome::Inconclusive(format!("renewal endpoint returned {}", response.status))
}
