//! Credentials: the caller-facing basic auth check and the upstream bearer token cache.

pub mod basic;
pub mod token;

pub use basic::{BasicCredentials, UserTable};
pub use token::{AccessToken, TokenProvider};
