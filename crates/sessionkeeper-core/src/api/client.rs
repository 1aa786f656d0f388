//! Session-aware client wrapping every outbound call with the
//! authenticated-request protocol.
//!
//! Each `send` walks a small state machine: the initial attempt carries the
//! stored access token (if any); a 401 on that attempt escalates exactly
//! once, either to an authenticated retry after a successful renewal or to
//! an anonymous retry after a failed one. Retries never escalate again.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::renewal::{RenewOutcome, RenewalPolicy, Renewer, DEFAULT_RENEWAL_PATH};
use super::transport::ReqwestTransport;
use super::{ApiError, ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::{CredentialPair, CredentialStore, SessionState, Token, TokenKind};
use crate::config::Config;

/// Login endpoint used when none is configured
pub const DEFAULT_LOGIN_PATH: &str = "/auth/jwt/create/";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: Option<String>,
    refresh: Option<String>,
}

/// Where a `send` call is in its escalation.
#[derive(Debug)]
enum Attempt {
    /// First try; `sent` is the access token attached, if any
    Initial { sent: Option<Token> },
    /// Retry with the renewed access token
    Renewed,
    /// Retry without credentials after renewal failed
    Anonymous,
}

/// Renewal bookkeeping shared by every clone of a client.
#[derive(Debug, Default)]
struct RenewalGate {
    /// Calls currently escalating or renewing
    in_flight: AtomicUsize,
    /// Number of gated renewals completed so far
    generation: AtomicU64,
    /// Result of the latest gated renewal, handed to calls that queued behind it
    last: Mutex<Option<RenewOutcome>>,
}

/// Marks one renewal as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SessionClient {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    renewer: Renewer,
    login_path: String,
    policy: RenewalPolicy,
    renewal: Arc<RenewalGate>,
}

impl SessionClient {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn CredentialStore>) -> Self {
        let renewer = Renewer::new(transport.clone(), store.clone(), DEFAULT_RENEWAL_PATH);
        Self {
            transport,
            store,
            renewer,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            policy: RenewalPolicy::default(),
            renewal: Arc::new(RenewalGate::default()),
        }
    }

    /// Build a reqwest-backed client from configuration
    pub fn from_config(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(config.base_url.clone(), config.request_timeout_secs)?;
        Ok(Self::new(Arc::new(transport), store)
            .with_renewal_path(config.renewal_path.clone())
            .with_login_path(config.login_path.clone())
            .with_policy(config.renewal_policy))
    }

    pub fn with_renewal_path(mut self, path: impl Into<String>) -> Self {
        self.renewer = Renewer::new(self.transport.clone(), self.store.clone(), path);
        self
    }

    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    pub fn with_policy(mut self, policy: RenewalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn policy(&self) -> RenewalPolicy {
        self.policy
    }

    /// `Renewing` while any call on this client is renewing, otherwise
    /// derived from the store
    pub fn state(&self) -> SessionState {
        if self.renewal.in_flight.load(Ordering::SeqCst) > 0 {
            SessionState::Renewing
        } else {
            SessionState::of(self.store.as_ref())
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.has_access()
    }

    // ===== Authenticated requests =====

    /// Send `request` with the stored credential, renewing it at most once.
    ///
    /// Every HTTP outcome, including a final 401, comes back as `Ok`; only
    /// connection-level failures are errors.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut request = request;
        request.apply_json_defaults();
        let generation = self.renewal.generation.load(Ordering::SeqCst);
        let sent = self.attach_credential(&mut request)?;
        let mut attempt = Attempt::Initial { sent };

        loop {
            let response = self.transport.execute(&request).await?;

            attempt = match attempt {
                Attempt::Initial { sent: Some(token) } if response.status == StatusCode::UNAUTHORIZED => {
                    debug!(
                        path = %request.target,
                        access = %token.preview(),
                        "Access token rejected, attempting renewal"
                    );
                    match self.escalate(&token, generation).await {
                        Some(renewed) => {
                            request.set_bearer(&renewed)?;
                            Attempt::Renewed
                        }
                        None => {
                            request.clear_bearer();
                            Attempt::Anonymous
                        }
                    }
                }
                Attempt::Initial { .. } => return Ok(response),
                retry @ (Attempt::Renewed | Attempt::Anonymous) => {
                    if response.status == StatusCode::UNAUTHORIZED {
                        warn!(path = %request.target, retry = ?retry, "Retried request still unauthorized");
                    }
                    return Ok(response);
                }
            };
        }
    }

    /// Read the access token and, if present, make it the request's bearer
    fn attach_credential(&self, request: &mut ApiRequest) -> Result<Option<Token>, TransportError> {
        let token = self.store.get(TokenKind::Access);
        if let Some(ref token) = token {
            request.set_bearer(token)?;
        }
        Ok(token)
    }

    /// Run the single permitted renewal for a call that sent `sent` after
    /// `observed` gated renewals had completed.
    /// Returns the access token to retry with, or `None` to go anonymous.
    async fn escalate(&self, sent: &Token, observed: u64) -> Option<Token> {
        let _renewing = InFlight::enter(&self.renewal.in_flight);
        let outcome = match self.policy {
            RenewalPolicy::Independent => self.renewer.renew().await,
            RenewalPolicy::SingleFlight => {
                let mut last = self.renewal.last.lock().await;
                match self.store.get(TokenKind::Access) {
                    Some(current) if &current != sent => {
                        debug!(access = %current.preview(), "Access token already renewed by a concurrent call");
                        return Some(current);
                    }
                    None => {
                        debug!("Credentials cleared by a concurrent call");
                        return None;
                    }
                    Some(_) => {}
                }
                let completed = self.renewal.generation.load(Ordering::SeqCst);
                match last.clone() {
                    Some(shared) if completed != observed => {
                        debug!(outcome = %shared, "Reusing renewal completed while this call was in flight");
                        shared
                    }
                    _ => self.renew_gated(&mut last).await,
                }
            }
        };

        match outcome {
            RenewOutcome::Renewed { .. } => {
                let renewed = self.store.get(TokenKind::Access);
                if renewed.is_none() {
                    warn!("Renewal succeeded but no access token could be read back");
                }
                renewed
            }
            RenewOutcome::Inconclusive(ref reason) => {
                info!(reason = %reason, "Renewal inconclusive, retrying anonymously for this call");
                None
            }
            RenewOutcome::NoRefreshToken | RenewOutcome::RefreshInvalid => {
                info!(outcome = %outcome, "Session invalidated, retrying anonymously");
                None
            }
        }
    }

    // ===== Renewal =====

    /// Exchange the refresh token for a new access token
    pub async fn renew(&self) -> bool {
        self.renew_outcome().await.is_renewed()
    }

    pub async fn renew_outcome(&self) -> RenewOutcome {
        let _renewing = InFlight::enter(&self.renewal.in_flight);
        match self.policy {
            RenewalPolicy::Independent => self.renewer.renew().await,
            RenewalPolicy::SingleFlight => {
                let mut last = self.renewal.last.lock().await;
                self.renew_gated(&mut last).await
            }
        }
    }

    /// Renew while holding the gate and publish the result to queued callers
    async fn renew_gated(&self, last: &mut Option<RenewOutcome>) -> RenewOutcome {
        let outcome = self.renewer.renew().await;
        *last = Some(outcome.clone());
        self.renewal.generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    // ===== Session management =====

    /// Authenticate with email and password and store the issued pair.
    /// The response must carry both tokens or nothing is stored.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let mut request = ApiRequest::post(&self.login_path).json(&LoginRequest { email, password })?;
        request.apply_json_defaults();

        debug!(endpoint = %self.login_path, "Sending login request");
        let response = self.transport.execute(&request).await?;
        let response = check_response(response)?;

        let tokens: LoginResponse = response
            .json()
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;
        let (Some(access), Some(refresh)) = (tokens.access, tokens.refresh) else {
            return Err(ApiError::InvalidResponse(
                "Login response is missing the access or refresh token".to_string(),
            ));
        };
        self.install_tokens(CredentialPair::new(access, refresh))?;
        info!("Logged in");
        Ok(())
    }

    /// Seed the store with a pair obtained elsewhere. Both halves are required.
    pub fn install_tokens(&self, pair: CredentialPair) -> Result<(), ApiError> {
        match (&pair.access, &pair.refresh) {
            (Some(access), Some(refresh)) => {
                self.store.set(TokenKind::Access, access.clone());
                self.store.set(TokenKind::Refresh, refresh.clone());
                debug!(access = %access.preview(), "Session tokens installed");
                Ok(())
            }
            _ => Err(ApiError::IncompleteCredentials(format!(
                "access present: {}, refresh present: {}",
                pair.access.is_some(),
                pair.refresh.is_some()
            ))),
        }
    }

    /// Forget both tokens locally
    pub fn logout(&self) {
        self.store.clear_all();
        info!("Logged out, stored credentials cleared");
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, target: &str) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::get(target)).await?;
        parse_json(check_response(response)?, target)
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        target: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::post(target).json(body)?).await?;
        parse_json(check_response(response)?, target)
    }
}

/// Pass successful responses through, map everything else to an `ApiError`
fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ApiError::from_status(response.status, &response.text()))
    }
}

fn parse_json<T: DeserializeOwned>(response: ApiResponse, target: &str) -> Result<T, ApiError> {
    response
        .json()
        .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", target, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{respond, ScriptedTransport};
    use crate::auth::MemoryCredentialStore;
    use reqwest::header::{self, HeaderValue};

    const DATA: &str = "/api/tasks/";

    fn client_with(
        transport: &Arc<ScriptedTransport>,
        store: &Arc<MemoryCredentialStore>,
    ) -> SessionClient {
        SessionClient::new(transport.clone(), store.clone())
    }

    fn seeded(access: &str, refresh: &str) -> Arc<MemoryCredentialStore> {
        Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(access, refresh)))
    }

    /// Data endpoint accepts only `a2` or anonymous callers; renewal hands out `a2`
    fn renewing_server(request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        if request.target == DEFAULT_RENEWAL_PATH {
            return respond(200, r#"{"access":"a2"}"#);
        }
        match request.bearer() {
            Some("a2") => respond(200, r#"{"tasks":[1,2]}"#),
            Some(_) => respond(401, r#"{"detail":"Given token not valid for any token type"}"#),
            None => respond(200, r#"{"tasks":[]}"#),
        }
    }

    #[tokio::test]
    async fn test_no_token_401_is_returned_without_renewal() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(401, "")));
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 0);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_transparent_renewal() {
        let transport = Arc::new(ScriptedTransport::new(renewing_server));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), r#"{"tasks":[1,2]}"#);

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].bearer(), Some("a1"));
        assert_eq!(calls[1].target, DEFAULT_RENEWAL_PATH);
        assert_eq!(calls[2].bearer(), Some("a2"));
        assert_eq!(calls[2].target, DATA);

        // Rotation is optional: the refresh token stays put
        assert_eq!(store.snapshot(), CredentialPair::new("a2", "r1"));
    }

    #[tokio::test]
    async fn test_invalid_refresh_falls_back_to_anonymous() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            if request.target == DEFAULT_RENEWAL_PATH || request.bearer().is_some() {
                respond(401, "")
            } else {
                respond(200, "anonymous")
            }
        }));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "anonymous");
        assert!(store.snapshot().is_empty());
        assert_eq!(client.state(), SessionState::Anonymous);

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        let anonymous: Vec<_> = calls
            .iter()
            .filter(|c| c.target == DATA && c.headers.get(header::AUTHORIZATION).is_none())
            .collect();
        assert_eq!(anonymous.len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_replaces_refresh_token() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            if request.target == DEFAULT_RENEWAL_PATH {
                respond(200, r#"{"access":"a2","refresh":"r2"}"#)
            } else if request.bearer() == Some("a2") {
                respond(200, "ok")
            } else {
                respond(401, "")
            }
        }));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(store.snapshot(), CredentialPair::new("a2", "r2"));
    }

    #[tokio::test]
    async fn test_retry_is_never_escalated_again() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            if request.target == DEFAULT_RENEWAL_PATH {
                respond(200, r#"{"access":"a2"}"#)
            } else {
                respond(401, "still no")
            }
        }));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.text(), "still no");
        assert_eq!(transport.call_count(), 3);
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 1);
    }

    #[tokio::test]
    async fn test_anonymous_retry_401_is_returned_verbatim() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(401, "login required")));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.text(), "login required");
        assert_eq!(transport.call_count(), 3);
        assert!(transport.calls()[2].bearer().is_none());
    }

    #[tokio::test]
    async fn test_inconclusive_renewal_keeps_credentials() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            if request.target == DEFAULT_RENEWAL_PATH {
                respond(503, "maintenance")
            } else if request.bearer().is_some() {
                respond(401, "")
            } else {
                respond(200, "anonymous")
            }
        }));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.text(), "anonymous");
        assert_eq!(store.snapshot(), CredentialPair::new("a1", "r1"));

        // The next call tries to renew again
        client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 2);
    }

    #[tokio::test]
    async fn test_renewal_transport_failure_does_not_fail_send() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            if request.target == DEFAULT_RENEWAL_PATH {
                Err(TransportError::Timeout { timeout_secs: 30 })
            } else if request.bearer().is_some() {
                respond(401, "")
            } else {
                respond(200, "anonymous")
            }
        }));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(store.snapshot(), CredentialPair::new("a1", "r1"));
    }

    #[tokio::test]
    async fn test_missing_refresh_clears_access_without_renewal_call() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            if request.bearer().is_some() {
                respond(401, "")
            } else {
                respond(200, "anonymous")
            }
        }));
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(TokenKind::Access, Token::from("a1"));
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.text(), "anonymous");
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 0);
        assert_eq!(transport.call_count(), 2);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_propagates_without_retry() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Err(TransportError::Connect("connection refused".to_string()))
        }));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let err = client.send(ApiRequest::get(DATA)).await.expect_err("transport failure");
        assert_eq!(err, TransportError::Connect("connection refused".to_string()));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(store.snapshot(), CredentialPair::new("a1", "r1"));
    }

    #[tokio::test]
    async fn test_non_401_errors_are_returned_as_is() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(403, "forbidden")));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let response = client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_header_precedence() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(200, "")));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let request = ApiRequest::post(DATA)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller"))
            .header(
                header::HeaderName::from_static("x-csrftoken"),
                HeaderValue::from_static("csrf"),
            );
        client.send(request).await.expect("response");

        let sent = &transport.calls()[0];
        assert_eq!(sent.headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(sent.headers[header::ACCEPT], "application/json");
        assert_eq!(sent.headers["x-csrftoken"], "csrf");
        assert_eq!(sent.bearer(), Some("a1"));
    }

    #[tokio::test]
    async fn test_caller_authorization_kept_when_no_token() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(200, "")));
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_with(&transport, &store);

        let request = ApiRequest::get(DATA)
            .header(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        client.send(request).await.expect("response");

        let sent = &transport.calls()[0];
        assert_eq!(sent.headers[header::AUTHORIZATION], "Basic dXNlcjpwYXNz");
        assert_eq!(sent.headers[header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_same_request_is_reissued() {
        let transport = Arc::new(ScriptedTransport::new(renewing_server));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let request = ApiRequest::patch("/api/tasks/7/")
            .json(&serde_json::json!({"status": "paused"}))
            .expect("json");
        client.send(request).await.expect("response");

        let calls = transport.calls();
        assert_eq!(calls[0].method, calls[2].method);
        assert_eq!(calls[0].target, calls[2].target);
        assert_eq!(calls[0].body, calls[2].body);
    }

    #[tokio::test]
    async fn test_concurrent_independent_renewals() {
        let transport = Arc::new(ScriptedTransport::new(renewing_server));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let responses = futures::future::join_all(
            (0..2).map(|_| client.send(ApiRequest::get(DATA))),
        )
        .await;
        for response in responses {
            assert_eq!(response.expect("response").status, StatusCode::OK);
        }
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 2);
    }

    #[tokio::test]
    async fn test_concurrent_single_flight_renews_once() {
        let transport = Arc::new(ScriptedTransport::new(renewing_server));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store).with_policy(RenewalPolicy::SingleFlight);

        let responses = futures::future::join_all(
            (0..3).map(|_| client.send(ApiRequest::get(DATA))),
        )
        .await;
        for response in responses {
            assert_eq!(response.expect("response").text(), r#"{"tasks":[1,2]}"#);
        }
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 1);
        assert_eq!(store.snapshot(), CredentialPair::new("a2", "r1"));
    }

    /// Data endpoint rejects every bearer; renewal answers with `status`
    fn failing_renewal_server(status: u16) -> impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> {
        move |request| {
            if request.target == DEFAULT_RENEWAL_PATH {
                respond(status, "")
            } else if request.bearer().is_some() {
                respond(401, "")
            } else {
                respond(200, "anonymous")
            }
        }
    }

    #[tokio::test]
    async fn test_single_flight_shares_inconclusive_renewal() {
        let transport = Arc::new(ScriptedTransport::new(failing_renewal_server(503)));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store).with_policy(RenewalPolicy::SingleFlight);

        let responses = futures::future::join_all(
            (0..3).map(|_| client.send(ApiRequest::get(DATA))),
        )
        .await;
        for response in responses {
            assert_eq!(response.expect("response").text(), "anonymous");
        }
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 1);
        assert_eq!(store.snapshot(), CredentialPair::new("a1", "r1"));

        // A call started after that renewal finished tries again
        client.send(ApiRequest::get(DATA)).await.expect("response");
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 2);
    }

    #[tokio::test]
    async fn test_single_flight_shares_invalidated_session() {
        let transport = Arc::new(ScriptedTransport::new(failing_renewal_server(401)));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store).with_policy(RenewalPolicy::SingleFlight);

        let responses = futures::future::join_all(
            (0..3).map(|_| client.send(ApiRequest::get(DATA))),
        )
        .await;
        for response in responses {
            let response = response.expect("response");
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.text(), "anonymous");
        }
        assert_eq!(transport.calls_to(DEFAULT_RENEWAL_PATH), 1);
        assert!(store.snapshot().is_empty());

        let anonymous = transport
            .calls()
            .iter()
            .filter(|c| c.target == DATA && c.bearer().is_none())
            .count();
        assert_eq!(anonymous, 3);
    }

    #[tokio::test]
    async fn test_state_reports_renewing_while_renewal_in_flight() {
        let transport = Arc::new(ScriptedTransport::new(renewing_server));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);
        assert_eq!(client.state(), SessionState::Authenticated);

        let observe = async {
            while transport.calls_to(DEFAULT_RENEWAL_PATH) == 0 {
                tokio::task::yield_now().await;
            }
            client.state()
        };
        let (response, during) = futures::join!(client.send(ApiRequest::get(DATA)), observe);

        assert_eq!(response.expect("response").status, StatusCode::OK);
        assert_eq!(during, SessionState::Renewing);
        assert_eq!(client.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_renew_reports_success() {
        let transport = Arc::new(ScriptedTransport::new(renewing_server));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        assert!(client.renew().await);
        assert_eq!(store.get(TokenKind::Access), Some(Token::from("a2")));
    }

    #[tokio::test]
    async fn test_custom_renewal_path() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            if request.target == "/token/refresh" {
                respond(200, r#"{"access":"a2"}"#)
            } else {
                respond(404, "")
            }
        }));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store).with_renewal_path("/token/refresh");

        assert_eq!(client.renew_outcome().await, RenewOutcome::Renewed { rotated: false });
    }

    #[tokio::test]
    async fn test_login_stores_both_tokens() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            let body: serde_json::Value =
                serde_json::from_slice(request.body.as_deref().unwrap_or_default()).expect("json");
            if request.target == DEFAULT_LOGIN_PATH && body["password"] == "hunter2" {
                respond(200, r#"{"access":"a1","refresh":"r1"}"#)
            } else {
                respond(401, r#"{"detail":"No active account found with the given credentials"}"#)
            }
        }));
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_with(&transport, &store);

        let err = client.login("user@example.com", "wrong").await.expect_err("bad password");
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(store.snapshot().is_empty());

        client.login("user@example.com", "hunter2").await.expect("login");
        assert_eq!(store.snapshot(), CredentialPair::new("a1", "r1"));
        assert!(client.is_authenticated());
        assert!(transport.calls()[1].bearer().is_none());
    }

    #[tokio::test]
    async fn test_login_requires_both_tokens() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(200, r#"{"access":"a1"}"#)));
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_with(&transport, &store);

        let err = client.login("user@example.com", "pw").await.expect_err("missing refresh");
        assert!(matches!(err, ApiError::InvalidResponse(_)));
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_install_tokens_requires_both_halves() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(200, "")));
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_with(&transport, &store);

        let err = client
            .install_tokens(CredentialPair {
                access: Some(Token::from("a1")),
                refresh: None,
            })
            .expect_err("missing refresh");
        assert!(matches!(err, ApiError::IncompleteCredentials(_)));
        assert!(store.snapshot().is_empty());

        client.install_tokens(CredentialPair::new("a1", "r1")).expect("install");
        assert_eq!(client.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_logout_clears_store() {
        let transport = Arc::new(ScriptedTransport::new(|_| respond(200, "")));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        client.logout();
        client.logout();
        assert!(store.snapshot().is_empty());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_get_json_maps_failures() {
        let transport = Arc::new(ScriptedTransport::new(|request| match request.target.as_str() {
            "/api/ok/" => respond(200, r#"{"count":3}"#),
            "/api/missing/" => respond(404, "gone"),
            _ => respond(200, "not json"),
        }));
        let store = Arc::new(MemoryCredentialStore::new());
        let client = client_with(&transport, &store);

        let value: serde_json::Value = client.get_json("/api/ok/").await.expect("json");
        assert_eq!(value["count"], 3);

        let err = client
            .get_json::<serde_json::Value>("/api/missing/")
            .await
            .expect_err("404");
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = client
            .get_json::<serde_json::Value>("/api/garbled/")
            .await
            .expect_err("bad json");
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_post_json_goes_through_renewal() {
        let transport = Arc::new(ScriptedTransport::new(renewing_server));
        let store = seeded("a1", "r1");
        let client = client_with(&transport, &store);

        let value: serde_json::Value = client
            .post_json(DATA, &serde_json::json!({"name": "crawl"}))
            .await
            .expect("json");
        assert_eq!(value["tasks"], serde_json::json!([1, 2]));
        assert_eq!(transport.call_count(), 3);
    }
}
