//! Authenticated request pipeline.
//!
//! [`AuthPipeline::execute`] is the only path by which authenticated calls
//! reach the network:
//!
//! 1. Load the stored token pair and attach the access token, if any.
//! 2. Dispatch.
//! 3. On a 401 for a request that has not been retried: run the refresh
//!    protocol, then re-send once with the renewed token. If the refresh
//!    fails, the store is cleared and the original 401 is returned.
//! 4. A 401 on the retry is returned as-is; no second refresh.
//! 5. Every other outcome is returned untouched.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{
    CredentialStore, RefreshCoordinator, RefreshPolicy, SessionCheckpoint, SessionMonitor,
    TokenPair,
};

pub struct AuthPipeline {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    refresher: RefreshCoordinator,
    session: SessionMonitor,
}

impl std::fmt::Debug for AuthPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPipeline")
            .field("store", &self.store)
            .field("refresh_policy", &self.refresher.policy())
            .finish_non_exhaustive()
    }
}

impl AuthPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        session: SessionMonitor,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            refresher: RefreshCoordinator::new(policy),
            session,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn session(&self) -> &SessionMonitor {
        &self.session
    }

    /// Current tokens, read fresh. An unreadable store counts as empty.
    fn current_tokens(&self) -> Option<TokenPair> {
        match self.store.load() {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "Could not read stored tokens, sending unauthenticated");
                None
            }
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        debug!(
            method = %request.method,
            path = %request.path,
            authenticated = bearer.is_some(),
            retry = request.is_retry(),
            "Dispatching request"
        );
        Ok(self.transport.send(request, bearer).await?)
    }

    /// Run `request` through token attachment, refresh and single retry.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if request.is_anonymous() {
            return self.dispatch(&request, None).await?.error_for_status();
        }

        let mut request = request;
        let sent_with = self.current_tokens().map(|t| t.access);
        let response = self.dispatch(&request, sent_with.as_deref()).await?;

        if response.status != 401 {
            return response.error_for_status();
        }
        if request.is_retry() {
            debug!(path = %request.path, "401 on a retried request, giving up");
            return response.error_for_status();
        }

        info!(path = %request.path, "Request unauthorized, attempting token refresh");
        request.mark_retried();

        let renewed = match self
            .refresher
            .refresh(self.transport.as_ref(), &self.store, sent_with.as_deref())
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                // The coordinator has already cleared the store.
                debug!(error = %e, path = %request.path, "Returning original 401");
                self.session.recompute(SessionCheckpoint::RefreshFailed);
                return response.error_for_status();
            }
        };
        self.session.recompute(SessionCheckpoint::Refreshed);

        // Prefer what was just persisted; fall back to the pair in hand if the write failed.
        let access = self
            .current_tokens()
            .map(|t| t.access)
            .unwrap_or(renewed.access);
        self.dispatch(&request, Some(&access)).await?.error_for_status()
    }

    /// [`execute`](Self::execute) bounded by `timeout` across dispatch,
    /// refresh and retry.
    pub async fn execute_with_timeout(
        &self,
        request: ApiRequest,
        timeout: Duration,
    ) -> Result<ApiResponse, ApiError> {
        let path = request.path.clone();
        match tokio::time::timeout(timeout, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(path = %path, ?timeout, "Request timed out");
                Err(ApiError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::api::testing::{HangingTransport, ScriptedTransport};
    use crate::api::{ClassifiedError, ErrorKind, TransportError};
    use crate::auth::REFRESH_PATH;

    fn pipeline_with(
        transport: Arc<dyn Transport>,
        store: &CredentialStore,
        policy: RefreshPolicy,
    ) -> AuthPipeline {
        AuthPipeline::new(
            transport,
            store.clone(),
            SessionMonitor::new(store.clone()),
            policy,
        )
    }

    fn seeded_store() -> CredentialStore {
        let store = CredentialStore::in_memory();
        store.save(&TokenPair::new("access-1", "refresh-1")).unwrap();
        store
    }

    /// Backend that accepts only `valid_access` and renews to it.
    fn backend(valid_access: &'static str) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(move |req, bearer| {
            if req.path == REFRESH_PATH {
                return Ok(ApiResponse::new(
                    200,
                    format!(r#"{{"access": "{}"}}"#, valid_access),
                ));
            }
            if bearer == Some(valid_access) {
                Ok(ApiResponse::new(200, r#"{"id": 1}"#))
            } else {
                Ok(ApiResponse::new(401, r#"{"detail": "Token is invalid or expired"}"#))
            }
        }))
    }

    #[tokio::test]
    async fn test_attaches_stored_access_token() {
        let store = seeded_store();
        let transport = backend("access-1");
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        let response = pipeline.execute(ApiRequest::get("me/")).await.unwrap();

        assert_eq!(response.status, 200);
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bearer.as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_missing_token_sends_unauthenticated() {
        let store = CredentialStore::in_memory();
        let transport = Arc::new(ScriptedTransport::new(|_, _| Ok(ApiResponse::new(200, "[]"))));
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        pipeline.execute(ApiRequest::get("images/")).await.unwrap();
        assert_eq!(transport.calls()[0].bearer, None);
    }

    #[tokio::test]
    async fn test_single_401_refreshes_once_and_retries_once() {
        let store = seeded_store();
        let transport = backend("access-2");
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        let response = pipeline.execute(ApiRequest::get("me/")).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
        let me_calls = transport.calls_to("me/");
        assert_eq!(me_calls.len(), 2);
        assert_eq!(me_calls[0].bearer.as_deref(), Some("access-1"));
        assert_eq!(me_calls[1].bearer.as_deref(), Some("access-2"));
        assert!(me_calls[1].retry);
        assert_eq!(store.load().unwrap(), Some(TokenPair::new("access-2", "refresh-1")));
        assert!(pipeline.session().current().is_authenticated());
    }

    #[tokio::test]
    async fn test_401_after_retry_does_not_refresh_again() {
        let store = seeded_store();
        // Refresh "succeeds" but the backend keeps rejecting every token.
        let transport = Arc::new(ScriptedTransport::new(|req, _| {
            if req.path == REFRESH_PATH {
                Ok(ApiResponse::new(200, r#"{"access": "access-2"}"#))
            } else {
                Ok(ApiResponse::new(401, "{}"))
            }
        }));
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        let err = pipeline.execute(ApiRequest::get("me/")).await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
        assert_eq!(transport.calls_to("me/").len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_store_and_returns_original_401() {
        let store = seeded_store();
        let transport = Arc::new(ScriptedTransport::new(|req, _| {
            if req.path == REFRESH_PATH {
                Ok(ApiResponse::new(401, r#"{"detail": "Token is blacklisted", "code": "token_not_valid"}"#))
            } else {
                Ok(ApiResponse::new(401, r#"{"detail": "Authentication credentials were not provided."}"#))
            }
        }));
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);
        let mut session = pipeline.session().subscribe();

        let err = pipeline.execute(ApiRequest::get("me/")).await.unwrap_err();

        assert_eq!(store.load().unwrap(), None);
        assert!(session.has_changed().unwrap());
        assert!(!session.borrow_and_update().is_authenticated());
        assert_eq!(transport.calls_to("me/").len(), 1);

        let classified = ClassifiedError::from(err);
        assert_eq!(classified.kind, ErrorKind::Authentication);
        assert!(!classified.retryable);
        assert_eq!(classified.message, "Authentication credentials were not provided.");
    }

    #[tokio::test]
    async fn test_refresh_network_failure_also_tears_down_session() {
        let store = seeded_store();
        let transport = Arc::new(ScriptedTransport::new(|req, _| {
            if req.path == REFRESH_PATH {
                Err(TransportError::Connect("connection refused".to_string()))
            } else {
                Ok(ApiResponse::new(401, "{}"))
            }
        }));
        let pipeline = pipeline_with(transport, &store, RefreshPolicy::Coalesce);

        let err = pipeline.execute(ApiRequest::get("groups/")).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(!store.has_tokens());
    }

    #[tokio::test]
    async fn test_other_failures_bypass_refresh() {
        for status in [400, 403, 404, 429, 500] {
            let store = seeded_store();
            let transport = Arc::new(ScriptedTransport::new(move |_, _| {
                Ok(ApiResponse::new(status, "{}"))
            }));
            let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

            let err = pipeline.execute(ApiRequest::get("images/")).await.unwrap_err();
            assert_eq!(err.status(), Some(status));
            assert_eq!(transport.calls().len(), 1, "status {}", status);
            assert!(store.has_tokens());
        }
    }

    #[tokio::test]
    async fn test_network_failure_bypasses_refresh() {
        let store = seeded_store();
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Err(TransportError::Connect("dns failure".to_string()))
        }));
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        let err = pipeline.execute(ApiRequest::get("images/")).await.unwrap_err();
        assert_eq!(ClassifiedError::from(err).kind, ErrorKind::Network);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_request_never_refreshes() {
        let store = seeded_store();
        let transport = backend("access-1");
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        let request = ApiRequest::post("token/", &serde_json::json!({"username": "u"}))
            .unwrap()
            .anonymous();
        let err = pipeline.execute(request).await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(transport.calls()[0].bearer, None);
        assert!(store.has_tokens());
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let store = seeded_store();
        let transport = backend("access-2");
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        let results = join_all(
            ["me/", "images/", "groups/", "images/7/"]
                .into_iter()
                .map(|path| pipeline.execute(ApiRequest::get(path))),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_401s_with_rejected_refresh_send_it_once() {
        let store = seeded_store();
        let transport = Arc::new(ScriptedTransport::new(|req, _| {
            if req.path == REFRESH_PATH {
                Ok(ApiResponse::new(401, r#"{"detail": "Token is blacklisted"}"#))
            } else {
                Ok(ApiResponse::new(401, "{}"))
            }
        }));
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Coalesce);

        let results = join_all(
            ["me/", "images/", "groups/"]
                .into_iter()
                .map(|path| pipeline.execute(ApiRequest::get(path))),
        )
        .await;

        assert!(results
            .iter()
            .all(|r| r.as_ref().unwrap_err().status() == Some(401)));
        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
        assert!(!store.has_tokens());
        assert!(!pipeline.session().current().is_authenticated());
    }

    #[tokio::test]
    async fn test_independent_policy_refreshes_per_request() {
        let store = seeded_store();
        let transport = backend("access-2");
        let pipeline = pipeline_with(transport.clone(), &store, RefreshPolicy::Independent);

        let results = join_all(
            ["me/", "images/"]
                .into_iter()
                .map(|path| pipeline.execute(ApiRequest::get(path))),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_retryable_network_error() {
        let store = seeded_store();
        let pipeline = pipeline_with(Arc::new(HangingTransport), &store, RefreshPolicy::Coalesce);

        let err = pipeline
            .execute_with_timeout(ApiRequest::get("me/"), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Timeout(_)));
        let classified = ClassifiedError::from(err);
        assert_eq!(classified.kind, ErrorKind::Network);
        assert!(classified.retryable);
    }
}
