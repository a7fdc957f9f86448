//! Data models for gallery entities.
//!
//! - `User`: the signed-in account returned by `me/`
//! - `Image`, `Group`: gallery content
//! - `ListResponse`: list endpoints, bare or paginated

pub mod gallery;
pub mod user;

pub use gallery::{Group, Image, ListResponse, Page};
pub use user::User;
