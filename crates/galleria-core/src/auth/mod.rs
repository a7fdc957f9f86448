//! Authentication module for token storage, renewal and session state.
//!
//! This module provides:
//! - `CredentialStore`: persistence of the access/refresh `TokenPair`
//!   (OS keychain, encrypted file, or memory)
//! - `RefreshCoordinator`: access-token renewal, coalescing concurrent 401s
//! - `SessionMonitor`: observable signed-in state derived from the store

pub mod credentials;
pub mod refresh;
pub mod session;

pub use credentials::{
    CredentialStore, EncryptedFileBackend, KeyringBackend, MemoryBackend, SecretBackend,
    StorageError, TokenPair, SERVICE_NAME, TOKEN_KEY,
};
pub use refresh::{RefreshCoordinator, RefreshError, RefreshPolicy, REFRESH_PATH};
pub use session::{SessionCheckpoint, SessionMonitor, SessionSnapshot, SessionStatus};
