use tracing::warn;
use url::Url;

use super::context::SessionContext;
use super::oauth::{AuthorizationGrant, PendingAuthorization};
use super::{AuthError, TokenStore, UserSnapshot};

/// Query parameters delivered to the redirect callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizationCallback {
    /// Parse a full redirect URL or a bare query string (with or without a leading `?`).
    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let input = input.trim();
        let url = match Url::parse(input) {
            Ok(url) => url,
            Err(_) => Url::parse(&format!(
                "http://localhost/callback?{}",
                input.trim_start_matches('?')
            ))?,
        };
        Ok(Self::from_url(&url))
    }

    pub fn from_url(url: &Url) -> Self {
        let mut callback = Self::default();
        for (key, value) in url.query_pairs() {
            let value = Some(value.into_owned()).filter(|v| !v.is_empty());
            match key.as_ref() {
                "code" => callback.code = value,
                "state" => callback.state = value,
                "error" => callback.error = value,
                "error_description" => callback.error_description = value,
                _ => {}
            }
        }
        callback
    }

    /// Extract the code, failing if the provider reported an error or sent no code.
    pub fn grant(&self) -> Result<AuthorizationGrant, AuthError> {
        if let Some(error) = &self.error {
            let reason = match &self.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error.clone(),
            };
            return Err(AuthError::AuthorizationDenied(reason));
        }
        let code = self.code.clone().ok_or(AuthError::MissingCode)?;
        Ok(AuthorizationGrant {
            code,
            state: self.state.clone(),
        })
    }
}

/// Phase of the redirect-callback handling.
#[derive(Debug)]
pub enum CallbackPhase {
    Idle,
    Processing,
    Success(UserSnapshot),
    Failed(AuthError),
}

/// Drives a single callback through login. Failures are terminal until [`CallbackFlow::restart`].
#[derive(Debug)]
pub struct CallbackFlow {
    phase: CallbackPhase,
}

impl Default for CallbackFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackFlow {
    pub fn new() -> Self {
        Self {
            phase: CallbackPhase::Idle,
        }
    }

    pub fn phase(&self) -> &CallbackPhase {
        &self.phase
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            CallbackPhase::Success(_) | CallbackPhase::Failed(_)
        )
    }

    /// Process the callback against the session context.
    ///
    /// When `pending` is the request that issued the redirect, its `state` must match the
    /// callback's. Provider errors, missing codes and a foreign `state` end in `Failed`
    /// without contacting the backend.
    pub async fn run<S>(
        &mut self,
        context: &SessionContext<S>,
        callback: &AuthorizationCallback,
        pending: Option<PendingAuthorization>,
    ) -> Result<&CallbackPhase, AuthError>
    where
        S: TokenStore + 'static,
    {
        if !matches!(self.phase, CallbackPhase::Idle) {
            return Err(AuthError::FlowInProgress);
        }
        self.phase = CallbackPhase::Processing;

        let grant = match pending {
            Some(pending) => pending.verify(callback),
            None => callback.grant(),
        };
        let outcome = match grant {
            Ok(grant) => context.login(&grant.code, grant.state.as_deref()).await,
            Err(err) => Err(err),
        };

        self.phase = match outcome {
            Ok(user) => CallbackPhase::Success(user),
            Err(err) => {
                warn!(error = %err, "authorization callback failed");
                CallbackPhase::Failed(err)
            }
        };
        Ok(&self.phase)
    }

    /// User-initiated reset once the flow has finished.
    pub fn restart(&mut self) -> Result<(), AuthError> {
        if matches!(self.phase, CallbackPhase::Processing) {
            return Err(AuthError::FlowInProgress);
        }
        self.phase = CallbackPhase::Idle;
        Ok(())
    }
}
