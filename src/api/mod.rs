//! HTTP access to the project-management API.

mod client;
pub mod request;

pub use client::ApiClient;
pub use request::{Credentials, DEFAULT_BASE_URL};
