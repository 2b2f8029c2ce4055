mod client;
mod request;
mod single_flight;

use std::time::Duration;

use reqwest::Client;

use crate::auth::AuthError;

pub use client::{SessionClient, TeardownHook};
pub use request::ApiRequest;

const USER_AGENT: &str = concat!("jointrip/", env!("CARGO_PKG_VERSION"));

/// HTTP client shared by the session client and the OAuth flow handler.
pub(crate) fn http_client(timeout: Duration) -> Result<Client, AuthError> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}
