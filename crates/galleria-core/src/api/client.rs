//! API client for the gallery backend.
//!
//! `ApiClient` is what the presentation layer talks to. Every operation goes
//! through the [`AuthPipeline`] and fails with a [`ClassifiedError`], never a
//! raw transport or HTTP error.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    ApiError, ApiRequest, ApiResponse, AuthPipeline, ClassifiedError, ErrorKind, ReqwestTransport,
    Transport,
};
use crate::auth::{CredentialStore, RefreshPolicy, SessionCheckpoint, SessionMonitor, TokenPair};
use crate::config::Config;
use crate::models::{Group, Image, ListResponse, User};

// ============================================================================
// Endpoints
// ============================================================================

const TOKEN_PATH: &str = "token/";
const ME_PATH: &str = "me/";
const IMAGES_PATH: &str = "images/";
const GROUPS_PATH: &str = "groups/";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    refresh: String,
}

/// Clone is cheap; clones share the pipeline, store and session.
#[derive(Debug, Clone)]
pub struct ApiClient {
    pipeline: Arc<AuthPipeline>,
    timeout: Duration,
}

impl ApiClient {
    /// Client for the backend described by `config`, storing tokens in `store`
    pub fn new(config: &Config, store: CredentialStore) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.api_base_url.clone(), config.request_timeout())?;
        Ok(Self::with_transport(
            Arc::new(transport),
            store,
            config.refresh_policy,
            config.request_timeout(),
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        policy: RefreshPolicy,
        timeout: Duration,
    ) -> Self {
        let session = SessionMonitor::new(store.clone());
        Self {
            pipeline: Arc::new(AuthPipeline::new(transport, store, session, policy)),
            timeout,
        }
    }

    pub fn session(&self) -> &SessionMonitor {
        self.pipeline.session()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().current().is_authenticated()
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ClassifiedError> {
        self.pipeline
            .execute_with_timeout(request, self.timeout)
            .await
            .map_err(ClassifiedError::from)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClassifiedError> {
        let response = self.send(ApiRequest::get(path)).await?;
        Ok(response.json()?)
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ClassifiedError> {
        let list: ListResponse<T> = self.get(path).await?;
        Ok(list.into_items())
    }

    // ===== Session =====

    /// Exchange credentials for a token pair, persist it, and return the
    /// signed-in user.
    pub async fn login(&self, username: &str, password: &str) -> Result<User, ClassifiedError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(ClassifiedError::new(
                ErrorKind::Validation,
                "Please enter both a username and a password.",
            ));
        }

        let request = ApiRequest::post(
            TOKEN_PATH,
            &serde_json::json!({ "username": username, "password": password }),
        )?
        .anonymous();
        let tokens: TokenResponse = self.send(request).await?.json()?;

        let pair = TokenPair::new(tokens.access, tokens.refresh);
        if !pair.is_complete() {
            return Err(ApiError::InvalidResponse("token response has an empty field".to_string()).into());
        }

        if let Err(e) = self.pipeline.store().save(&pair) {
            warn!(error = %e, "Failed to persist tokens after login");
            self.session().recompute(SessionCheckpoint::Login);
            return Err(ClassifiedError::new(
                ErrorKind::Unknown,
                "You signed in, but your session could not be saved on this device. Please try again.",
            )
            .with_cause(e));
        }
        self.session().recompute(SessionCheckpoint::Login);
        info!(username = %username, "Logged in");

        self.current_user().await
    }

    /// Forget the stored tokens
    pub fn logout(&self) -> Result<(), ClassifiedError> {
        let cleared = self.pipeline.store().clear();
        self.session().recompute(SessionCheckpoint::Logout);
        cleared.map_err(|e| {
            warn!(error = %e, "Failed to clear stored tokens");
            ClassifiedError::from(ApiError::from(e))
        })?;
        info!("Logged out");
        Ok(())
    }

    // ===== Data Fetching Methods =====

    pub async fn current_user(&self) -> Result<User, ClassifiedError> {
        self.get(ME_PATH).await
    }

    pub async fn list_images(&self) -> Result<Vec<Image>, ClassifiedError> {
        let images: Vec<Image> = self.get_list(IMAGES_PATH).await?;
        debug!(count = images.len(), "Fetched images");
        Ok(images)
    }

    pub async fn image(&self, id: i64) -> Result<Image, ClassifiedError> {
        self.get(&format!("{}{}/", IMAGES_PATH, id)).await
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, ClassifiedError> {
        let groups: Vec<Group> = self.get_list(GROUPS_PATH).await?;
        debug!(count = groups.len(), "Fetched groups");
        Ok(groups)
    }

    pub async fn group(&self, id: i64) -> Result<Group, ClassifiedError> {
        self.get(&format!("{}{}/", GROUPS_PATH, id)).await
    }

    pub async fn group_images(&self, id: i64) -> Result<Vec<Image>, ClassifiedError> {
        self.get_list(&format!("{}{}/images/", GROUPS_PATH, id)).await
    }
}
