//! Core library for galleria.
//!
//! Authenticated access to a photo-gallery backend: token storage, a
//! request pipeline that refreshes expired access tokens and retries once,
//! and classification of every failure into a small, display-ready taxonomy.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ClassifiedError, ErrorKind, Remedy};
pub use auth::{CredentialStore, SessionMonitor, SessionSnapshot, SessionStatus, TokenPair};
pub use config::Config;
