use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::FutureExt;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, TokenPair, TokenStore, UserSnapshot};
use crate::config::{BackendEndpoints, ClientConfig};

use super::request::ApiRequest;
use super::single_flight::{RefreshFailure, RefreshGate, RefreshOutcome, Ticket};
use super::http_client;

const VALIDATE_PATH: &str = "auth/validate";
const PROFILE_PATH: &str = "profile";
const LOGOUT_PATH: &str = "auth/logout";

/// Callback run after a failed refresh has cleared the token store.
pub type TeardownHook = Arc<dyn Fn() + Send + Sync>;

/// Request pipeline that attaches the stored access token and recovers from expiry.
///
/// A 401 on a request sends it through a single-flight refresh and replays it once with
/// the new access token. Cloning is cheap and shares the store and refresh gate.
pub struct SessionClient<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for SessionClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    http: Client,
    endpoints: BackendEndpoints,
    store: Arc<S>,
    gate: RefreshGate,
    hooks: Mutex<Vec<TeardownHook>>,
    timeout: Duration,
}

impl<S> SessionClient<S>
where
    S: TokenStore + 'static,
{
    pub fn new(config: &ClientConfig, store: Arc<S>) -> Result<Self, AuthError> {
        let http = http_client(config.request_timeout)?;
        Ok(Self::with_client(
            http,
            config.endpoints(),
            store,
            config.request_timeout,
        ))
    }

    pub fn with_client(
        http: Client,
        endpoints: BackendEndpoints,
        store: Arc<S>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                endpoints,
                store,
                gate: RefreshGate::default(),
                hooks: Mutex::new(Vec::new()),
                timeout,
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn endpoints(&self) -> &BackendEndpoints {
        &self.inner.endpoints
    }

    /// Store a new pair without racing a refresh that is settling.
    pub fn commit_tokens(&self, pair: &TokenPair) -> Result<(), AuthError> {
        self.inner.gate.exclusive(|| self.inner.store.write(pair))
    }

    /// Clear the store without racing a refresh that is settling.
    pub fn clear_tokens(&self) -> Result<(), AuthError> {
        self.inner.gate.exclusive(|| self.inner.store.clear())
    }

    /// Register a callback for forced teardown after a failed refresh.
    pub fn on_teardown(&self, hook: TeardownHook) {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Send a request, refreshing and replaying it once if the backend answers 401.
    ///
    /// Any other status is returned untouched. A 401 on the replay is returned as-is
    /// without a second refresh.
    pub async fn execute(&self, request: ApiRequest) -> Result<Response, AuthError> {
        let attached = self
            .inner
            .store
            .read()?
            .map(|pair| pair.access_token);
        let response = self.inner.dispatch(&request, attached.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path = request.path(), "request rejected with 401");
        let token = match self.recover(attached.as_deref()).await? {
            Some(token) => token,
            None => return Ok(response),
        };

        debug!(path = request.path(), "replaying request with refreshed token");
        let replay = self.inner.dispatch(&request, Some(&token)).await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            warn!(path = request.path(), "request rejected again after refresh");
        }
        Ok(replay)
    }

    /// Send a request and decode a successful JSON body.
    pub async fn send_json<T>(&self, request: ApiRequest) -> Result<T, AuthError>
    where
        T: DeserializeOwned,
    {
        let response = ensure_success(self.execute(request).await?).await?;
        Ok(response.json().await?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }

    /// Ask the backend whether the stored access token is still accepted.
    pub async fn validate(&self) -> Result<(), AuthError> {
        let response = self.execute(ApiRequest::get(VALIDATE_PATH)).await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn fetch_profile(&self) -> Result<UserSnapshot, AuthError> {
        #[derive(Deserialize)]
        struct ProfileEnvelope {
            user: UserSnapshot,
        }

        let envelope: ProfileEnvelope = self.get_json(PROFILE_PATH).await?;
        Ok(envelope.user)
    }

    /// Tell the backend to end the session. Never refreshes; the caller clears local state.
    pub async fn revoke(&self) -> Result<(), AuthError> {
        let Some(pair) = self.inner.store.read()? else {
            return Ok(());
        };
        let response = self
            .inner
            .dispatch(&ApiRequest::post(LOGOUT_PATH), Some(&pair.access_token))
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Refresh the stored pair now, joining any refresh already in progress.
    pub async fn refresh_session(&self) -> Result<TokenPair, AuthError> {
        let stored = self
            .inner
            .store
            .read()?
            .ok_or_else(|| AuthError::RefreshInvalid("no refresh token stored".into()))?;
        match self.enter_gate(Some(&stored.access_token))? {
            Ticket::Current(pair) => Ok(pair),
            Ticket::Wait(pending) => pending
                .await
                .map_err(|RefreshFailure(reason)| AuthError::RefreshInvalid(reason)),
            Ticket::Empty => Err(AuthError::RefreshInvalid("no refresh token stored".into())),
        }
    }

    /// Access token to replay with, `None` if the original response should be surfaced.
    async fn recover(&self, stale: Option<&str>) -> Result<Option<String>, AuthError> {
        match self.enter_gate(stale)? {
            Ticket::Current(pair) => Ok(Some(pair.access_token)),
            Ticket::Wait(pending) => match pending.await {
                Ok(pair) => Ok(Some(pair.access_token)),
                Err(_) => Err(AuthError::SessionExpired),
            },
            // Sent without credentials and still none stored: nothing to salvage.
            Ticket::Empty if stale.is_none() => Ok(None),
            Ticket::Empty => Err(AuthError::SessionExpired),
        }
    }

    fn enter_gate(&self, stale: Option<&str>) -> Result<Ticket, AuthError> {
        let inner = Arc::clone(&self.inner);
        self.inner.gate.enter(
            stale,
            || self.inner.store.read(),
            move |pair| inner.run_refresh(pair).boxed(),
        )
    }
}

impl<S> Inner<S>
where
    S: TokenStore + 'static,
{
    async fn dispatch(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<Response, AuthError> {
        let url = self.endpoints.resolve(&request.path)?;
        let mut builder = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.send().await?)
    }

    async fn run_refresh(self: Arc<Self>, current: TokenPair) -> RefreshOutcome {
        let result = self.request_refresh(&current.refresh_token).await;
        let settled = self
            .gate
            .settle(&current.access_token, || self.settle_refresh(&current, result));

        match settled {
            Settled::Committed(pair) => {
                info!("access token refreshed");
                Ok(pair)
            }
            Settled::Superseded(pair) => {
                debug!("session replaced while refreshing; keeping the newer pair");
                Ok(pair)
            }
            Settled::Ended => Err(RefreshFailure("session ended while refreshing".into())),
            Settled::TornDown(reason) => {
                self.fire_hooks();
                Err(RefreshFailure(reason))
            }
        }
    }

    /// Apply a refresh result only if the store still holds the pair it started from.
    fn settle_refresh(&self, current: &TokenPair, result: Result<TokenPair, String>) -> Settled {
        match self.store.read() {
            Ok(Some(stored)) if stored == *current => {}
            Ok(Some(stored)) => return Settled::Superseded(stored),
            Ok(None) => return Settled::Ended,
            Err(err) => warn!(error = %err, "could not re-read token store after refresh"),
        }

        let reason = match result {
            Ok(refreshed) => match self.store.write(&refreshed) {
                Ok(()) => return Settled::Committed(refreshed),
                Err(err) => format!("failed to persist refreshed tokens: {err}"),
            },
            Err(reason) => reason,
        };
        warn!(reason = %reason, "refresh failed; clearing session");
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to clear token store during teardown");
        }
        Settled::TornDown(reason)
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenPair, String> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            #[serde(rename = "refreshToken")]
            refresh_token: &'a str,
        }

        #[derive(Deserialize)]
        struct RefreshResponse {
            #[serde(rename = "accessToken")]
            access_token: String,
            #[serde(rename = "refreshToken")]
            refresh_token: Option<String>,
        }

        let url = self.endpoints.refresh().map_err(|err| err.to_string())?;
        let call = async {
            let response = self
                .http
                .post(url)
                .json(&RefreshRequest { refresh_token })
                .send()
                .await
                .map_err(|err| format!("refresh request failed: {err}"))?;

            let status = response.status();
            if !status.is_success() {
                return Err(format!("refresh endpoint returned {status}"));
            }

            let payload: RefreshResponse = response
                .json()
                .await
                .map_err(|err| format!("malformed refresh response: {err}"))?;
            Ok(TokenPair {
                access_token: payload.access_token,
                refresh_token: payload
                    .refresh_token
                    .filter(|token| !token.is_empty())
                    .unwrap_or_else(|| refresh_token.to_owned()),
            })
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(format!("refresh timed out after {:?}", self.timeout)),
        }
    }

    fn fire_hooks(&self) {
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook();
        }
    }
}

/// How a finished refresh left the store.
enum Settled {
    Committed(TokenPair),
    /// A login replaced the pair mid-refresh; the result was discarded.
    Superseded(TokenPair),
    /// A logout cleared the store mid-refresh; nothing was written.
    Ended,
    TornDown(String),
}

/// Map a non-2xx response to an error; 401 at this point means the session is gone.
async fn ensure_success(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(AuthError::SessionExpired);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthError::Status { status, body })
}
