//! Authenticated access to the gallery REST API.
//!
//! This module provides:
//! - `AuthPipeline`: bearer attachment, refresh-on-401 and single retry
//! - `Transport`: the send seam, with `ReqwestTransport` for production
//! - `classify`: reduction of any failure to a `ClassifiedError`
//! - `ApiClient`: typed operations for login, `me/`, images and groups

pub mod classify;
pub mod client;
pub mod error;
pub mod pipeline;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{classify, ClassifiedError, ErrorKind, RawFailure, Remedy};
pub use client::ApiClient;
pub use error::{ApiError, TransportError};
pub use pipeline::AuthPipeline;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
