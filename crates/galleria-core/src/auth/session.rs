use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::CredentialStore;

/// Whether a usable token pair is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Authenticated,
    Unauthenticated,
}

/// Points at which the session status is re-derived from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionCheckpoint {
    Startup,
    Login,
    Logout,
    Refreshed,
    RefreshFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub checkpoint: SessionCheckpoint,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub observed_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }
}

/// Observable session state derived from the [`CredentialStore`].
///
/// The monitor never tracks authentication on its own; each
/// [`recompute`](Self::recompute) reads the store and publishes the result to
/// every subscriber.
#[derive(Debug, Clone)]
pub struct SessionMonitor {
    store: CredentialStore,
    tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl SessionMonitor {
    /// Create a monitor and derive the initial state (`Startup` checkpoint)
    pub fn new(store: CredentialStore) -> Self {
        let initial = Self::derive(&store, SessionCheckpoint::Startup);
        let (tx, _rx) = watch::channel(initial);
        Self {
            store,
            tx: Arc::new(tx),
        }
    }

    fn derive(store: &CredentialStore, checkpoint: SessionCheckpoint) -> SessionSnapshot {
        let status = match store.load() {
            Ok(Some(_)) => SessionStatus::Authenticated,
            Ok(None) => SessionStatus::Unauthenticated,
            Err(e) => {
                warn!(error = %e, ?checkpoint, "Credential store unreadable, treating session as signed out");
                SessionStatus::Unauthenticated
            }
        };
        SessionSnapshot {
            status,
            checkpoint,
            observed_at: Utc::now(),
        }
    }

    /// Re-read the store and publish the new snapshot
    pub fn recompute(&self, checkpoint: SessionCheckpoint) -> SessionSnapshot {
        let snapshot = Self::derive(&self.store, checkpoint);
        let previous = self.tx.borrow().status;
        if previous != snapshot.status {
            info!(from = ?previous, to = ?snapshot.status, ?checkpoint, "Session status changed");
        }
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    /// Latest published snapshot
    pub fn current(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenPair;

    #[test]
    fn test_startup_derives_from_store() {
        let store = CredentialStore::in_memory();
        assert!(!SessionMonitor::new(store.clone()).current().is_authenticated());

        store.save(&TokenPair::new("a", "r")).unwrap();
        let monitor = SessionMonitor::new(store);
        let snapshot = monitor.current();
        assert!(snapshot.is_authenticated());
        assert_eq!(snapshot.checkpoint, SessionCheckpoint::Startup);
    }

    #[test]
    fn test_recompute_follows_store_contents() {
        let store = CredentialStore::in_memory();
        let monitor = SessionMonitor::new(store.clone());

        store.save(&TokenPair::new("a", "r")).unwrap();
        assert!(monitor.recompute(SessionCheckpoint::Login).is_authenticated());

        store.clear().unwrap();
        let snapshot = monitor.recompute(SessionCheckpoint::Logout);
        assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
        assert_eq!(monitor.current().checkpoint, SessionCheckpoint::Logout);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let store = CredentialStore::in_memory();
        store.save(&TokenPair::new("a", "r")).unwrap();
        let monitor = SessionMonitor::new(store.clone());
        let mut rx = monitor.subscribe();

        store.clear().unwrap();
        monitor.recompute(SessionCheckpoint::RefreshFailed);

        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.status, SessionStatus::Unauthenticated);
        assert_eq!(seen.checkpoint, SessionCheckpoint::RefreshFailed);
    }
}
