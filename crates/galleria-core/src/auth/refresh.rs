//! Access-token renewal.
//!
//! Renewal is only ever triggered by a 401 in the request pipeline. Under the
//! default [`RefreshPolicy::Coalesce`] a single async mutex acts as the
//! in-flight slot: whoever holds it performs the renewal call, and anyone who
//! queued behind it first checks whether the stored access token already
//! moved on before issuing a call of their own.
//!
//! The outcome is settled before the slot is released. A failed renewal
//! clears the store, and a successful one is remembered even when it could
//! not be persisted, so a waiter never re-sends a refresh token that was just
//! used.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CredentialStore, StorageError, TokenPair};
use crate::api::{ApiRequest, Transport, TransportError};

/// Token renewal endpoint
pub const REFRESH_PATH: &str = "token/refresh/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Concurrent 401s share one renewal call
    #[default]
    Coalesce,
    /// Every 401 performs its own renewal call
    Independent,
}

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("No refresh token is stored")]
    NoRefreshToken,

    #[error("Credential store unreadable: {0}")]
    Storage(#[from] StorageError),

    #[error("Refresh request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Refresh rejected with status {0}")]
    Rejected(u16),

    #[error("Malformed refresh response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Last successful renewal: the access token it replaced and its result.
struct Renewal {
    replaced: String,
    pair: TokenPair,
}

impl std::fmt::Debug for Renewal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renewal").field("pair", &self.pair).finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    policy: RefreshPolicy,
    in_flight: Mutex<Option<Renewal>>,
}

impl RefreshCoordinator {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            policy,
            in_flight: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Obtain a renewed pair for a request that was rejected while carrying
    /// `rejected_access` (None if it was sent without a token).
    ///
    /// On success the new pair has already been written to `store`, unless
    /// the write itself failed, which is logged and otherwise ignored. On
    /// failure the store has been cleared.
    pub async fn refresh(
        &self,
        transport: &dyn Transport,
        store: &CredentialStore,
        rejected_access: Option<&str>,
    ) -> Result<TokenPair, RefreshError> {
        match self.policy {
            RefreshPolicy::Independent => {
                let result = Self::renew_stored(transport, store).await;
                Self::clear_on_failure(store, result)
            }
            RefreshPolicy::Coalesce => {
                let mut last = self.in_flight.lock().await;
                let result =
                    Self::renew_coalesced(transport, store, rejected_access, &mut last).await;
                Self::clear_on_failure(store, result)
            }
        }
    }

    async fn renew_stored(
        transport: &dyn Transport,
        store: &CredentialStore,
    ) -> Result<TokenPair, RefreshError> {
        let current = store.load()?.ok_or(RefreshError::NoRefreshToken)?;
        Self::renew(transport, store, current).await
    }

    /// Runs with the in-flight slot held.
    async fn renew_coalesced(
        transport: &dyn Transport,
        store: &CredentialStore,
        rejected_access: Option<&str>,
        last: &mut Option<Renewal>,
    ) -> Result<TokenPair, RefreshError> {
        let current = store.load()?.ok_or(RefreshError::NoRefreshToken)?;
        if rejected_access.is_some_and(|rejected| rejected != current.access) {
            debug!("Access token already renewed by a concurrent request");
            return Ok(current);
        }
        // The store still holds the rejected token only if persisting the
        // last renewal failed.
        if let Some(done) = last.as_ref().filter(|done| done.replaced == current.access) {
            debug!("Reusing unpersisted renewal from a concurrent request");
            return Ok(done.pair.clone());
        }

        let replaced = current.access.clone();
        let pair = Self::renew(transport, store, current).await?;
        *last = Some(Renewal {
            replaced,
            pair: pair.clone(),
        });
        Ok(pair)
    }

    fn clear_on_failure(
        store: &CredentialStore,
        result: Result<TokenPair, RefreshError>,
    ) -> Result<TokenPair, RefreshError> {
        if let Err(e) = &result {
            warn!(error = %e, "Token refresh failed, clearing stored credentials");
            if let Err(clear_err) = store.clear() {
                warn!(error = %clear_err, "Failed to clear stored credentials");
            }
        }
        result
    }

    async fn renew(
        transport: &dyn Transport,
        store: &CredentialStore,
        current: TokenPair,
    ) -> Result<TokenPair, RefreshError> {
        info!("Refreshing access token");
        let request = ApiRequest::new(reqwest::Method::POST, REFRESH_PATH)
            .with_json(serde_json::json!({ "refresh": current.refresh }))
            .anonymous();

        let response = transport.send(&request, None).await.map_err(|e| {
            warn!(error = %e, "Token refresh request failed");
            RefreshError::from(e)
        })?;

        if !response.is_success() {
            warn!(status = response.status, "Token refresh rejected");
            return Err(RefreshError::Rejected(response.status));
        }

        let renewed: RefreshResponse = serde_json::from_str(&response.body)
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        if renewed.access.is_empty() {
            return Err(RefreshError::InvalidResponse("empty access token".to_string()));
        }

        let refresh = match renewed.refresh {
            Some(rotated) if !rotated.is_empty() => {
                debug!("Backend rotated the refresh token");
                rotated
            }
            _ => current.refresh,
        };
        let pair = TokenPair::new(renewed.access, refresh);

        if let Err(e) = store.save(&pair) {
            warn!(error = %e, "Failed to persist refreshed tokens");
        }
        info!("Access token refreshed");
        Ok(pair)
    }
}
