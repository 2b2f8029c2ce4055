use std::fs;
use std::path::Path;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::api::http_client;
use crate::config::{BackendEndpoints, ClientConfig};

use super::callback::AuthorizationCallback;
use super::token_store::write_private;
use super::{AuthError, TokenPair, UserSnapshot};

/// An authorization redirect that has been requested but not yet answered.
///
/// Consumed by [`PendingAuthorization::verify`], so a pending request can validate at most
/// one callback.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub url: Url,
    pub state: String,
}

impl PendingAuthorization {
    /// Check that a callback answers this request and yield its code.
    pub fn verify(self, callback: &AuthorizationCallback) -> Result<AuthorizationGrant, AuthError> {
        let grant = callback.grant()?;
        match grant.state.as_deref() {
            Some(returned) if returned == self.state => Ok(grant),
            _ => Err(AuthError::StateMismatch),
        }
    }

    /// Persist the request so a later process can check the callback against it.
    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let document = PendingDocument {
            version: 1,
            url: self.url.to_string(),
            state: self.state.clone(),
        };
        write_private(path, &serde_json::to_string_pretty(&document)?)
    }

    /// Load and remove a persisted request. A request can only be taken once.
    pub fn take(path: &Path) -> Result<Option<Self>, AuthError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        fs::remove_file(path)?;
        let document: PendingDocument = serde_json::from_str(&raw)?;
        Ok(Some(Self {
            url: Url::parse(&document.url)?,
            state: document.state,
        }))
    }
}

#[derive(Serialize, Deserialize)]
struct PendingDocument {
    version: u8,
    url: String,
    state: String,
}

/// Code and state extracted from a successful provider redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationGrant {
    pub code: String,
    pub state: Option<String>,
}

/// Result of a successful code exchange.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub user: Option<UserSnapshot>,
}

/// Bridges the identity-provider redirect back into a token pair via the backend.
#[derive(Debug, Clone)]
pub struct OAuthFlowHandler {
    http: Client,
    endpoints: BackendEndpoints,
}

impl OAuthFlowHandler {
    pub fn new(config: &ClientConfig) -> Result<Self, AuthError> {
        Ok(Self {
            http: http_client(config.request_timeout)?,
            endpoints: config.endpoints(),
        })
    }

    pub fn with_client(http: Client, endpoints: BackendEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &BackendEndpoints {
        &self.endpoints
    }

    /// Ask the backend to mint a provider authorization URL and anti-forgery state.
    pub async fn request_authorization_url(
        &self,
        state: Option<&str>,
    ) -> Result<PendingAuthorization, AuthError> {
        let mut request = self.http.get(self.endpoints.authorization_url()?);
        if let Some(state) = state {
            request = request.query(&[("state", state)]);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Status { status, body });
        }

        let payload: AuthUrlResponse = response.json().await?;
        let url = Url::parse(&payload.auth_url)?;
        debug!(provider = self.endpoints.provider(), "authorization URL issued");
        Ok(PendingAuthorization {
            url,
            state: payload.state,
        })
    }

    /// Exchange an authorization code for a token pair. Performs exactly one round trip.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: Option<&str>,
    ) -> Result<LoginOutcome, AuthError> {
        if code.trim().is_empty() {
            return Err(AuthError::MissingCode);
        }

        let body = ExchangeRequest { code, state };
        let response = self
            .http
            .post(self.endpoints.login()?)
            .json(&body)
            .send()
            .await
            .map_err(|err| AuthError::ExchangeFailed {
                status: err.status(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::ExchangeFailed {
                status: Some(status),
                reason: body,
            });
        }

        let payload: ExchangeResponse =
            response.json().await.map_err(|err| AuthError::ExchangeFailed {
                status: Some(status),
                reason: format!("malformed exchange response: {err}"),
            })?;
        let outcome = payload.into_outcome(status)?;
        info!(
            provider = self.endpoints.provider(),
            user_id = outcome.user.as_ref().map(|u| u.id.as_str()),
            "authorization code exchanged"
        );
        Ok(outcome)
    }
}

#[derive(Debug, Deserialize)]
struct AuthUrlResponse {
    auth_url: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
    user: Option<UserSnapshot>,
}

impl ExchangeResponse {
    fn into_outcome(self, status: reqwest::StatusCode) -> Result<LoginOutcome, AuthError> {
        match (self.access_token, self.refresh_token) {
            (Some(access_token), Some(refresh_token))
                if !access_token.is_empty() && !refresh_token.is_empty() =>
            {
                Ok(LoginOutcome {
                    tokens: TokenPair {
                        access_token,
                        refresh_token,
                    },
                    user: self.user,
                })
            }
            _ => Err(AuthError::ExchangeFailed {
                status: Some(status),
                reason: "exchange response did not include a complete token pair".into(),
            }),
        }
    }
}
