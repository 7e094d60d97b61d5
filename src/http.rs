//! Shared HTTP client factory.
//!
//! Every outbound provider call goes through a client built here so none of them is unbounded.

use reqwest::Client;
use std::time::Duration;

/// Default timeout for provider calls (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout, kept short so a dead provider fails fast.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a new HTTP client with the default timeout.
pub fn create_client() -> Result<Client, reqwest::Error> {
    create_client_with_timeout(DEFAULT_TIMEOUT)
}

/// Create a new HTTP client with a custom overall timeout.
pub fn create_client_with_timeout(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
        .build()
}
