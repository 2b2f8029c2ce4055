use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::SessionClient;

use super::oauth::{OAuthFlowHandler, PendingAuthorization};
use super::{AuthError, TokenStore, UserSnapshot};

/// Externally visible session state.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Initial restore has not completed yet. Not the same as logged out.
    Unknown,
    Restoring,
    Authenticated(UserSnapshot),
    Unauthenticated,
}

impl SessionState {
    pub fn is_loading(&self) -> bool {
        matches!(self, SessionState::Unknown | SessionState::Restoring)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn user(&self) -> Option<&UserSnapshot> {
        match self {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }
}

/// Owns the session state machine and the user snapshot.
///
/// Transitions are published on a `watch` channel. A failed refresh inside the
/// [`SessionClient`] demotes the state to `Unauthenticated` through a teardown hook.
pub struct SessionContext<S> {
    client: SessionClient<S>,
    oauth: OAuthFlowHandler,
    state: Arc<watch::Sender<SessionState>>,
}

impl<S> SessionContext<S>
where
    S: TokenStore + 'static,
{
    pub fn new(client: SessionClient<S>, oauth: OAuthFlowHandler) -> Self {
        let (sender, _) = watch::channel(SessionState::Unknown);
        let state = Arc::new(sender);

        let weak = Arc::downgrade(&state);
        client.on_teardown(Arc::new(move || {
            if let Some(state) = weak.upgrade() {
                info!("session torn down after refresh failure");
                state.send_replace(SessionState::Unauthenticated);
            }
        }));

        Self {
            client,
            oauth,
            state,
        }
    }

    pub fn client(&self) -> &SessionClient<S> {
        &self.client
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn user(&self) -> Option<UserSnapshot> {
        self.state.borrow().user().cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// Re-establish the session from persisted tokens.
    ///
    /// Without stored tokens this resolves to `Unauthenticated` without any network call.
    pub async fn restore_from_storage(&self) -> SessionState {
        let stored = match self.client.store().read() {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "unable to read stored tokens");
                None
            }
        };
        if stored.is_none() {
            self.clear_store();
            self.transition(SessionState::Unauthenticated);
            return self.state();
        }

        self.transition(SessionState::Restoring);
        let restored = async {
            self.client.validate().await?;
            self.client.fetch_profile().await
        }
        .await;

        match restored {
            Ok(user) => {
                info!(user_id = %user.id, "session restored");
                self.transition(SessionState::Authenticated(user));
            }
            Err(err) => {
                warn!(error = %err, "session restore failed");
                self.clear_store();
                self.transition(SessionState::Unauthenticated);
            }
        }
        self.state()
    }

    pub async fn request_authorization_url(
        &self,
        state: Option<&str>,
    ) -> Result<PendingAuthorization, AuthError> {
        self.oauth.request_authorization_url(state).await
    }

    /// Exchange an authorization code and become `Authenticated`.
    ///
    /// Also used for re-authentication; the previous snapshot is replaced wholesale.
    pub async fn login(&self, code: &str, state: Option<&str>) -> Result<UserSnapshot, AuthError> {
        let outcome = self.oauth.complete_authorization(code, state).await?;
        self.client.commit_tokens(&outcome.tokens)?;

        let user = match outcome.user {
            Some(user) => user,
            None => match self.client.fetch_profile().await {
                Ok(user) => user,
                Err(err) => {
                    warn!(error = %err, "profile fetch after login failed");
                    self.clear_store();
                    self.transition(SessionState::Unauthenticated);
                    return Err(err);
                }
            },
        };

        info!(user_id = %user.id, "login succeeded");
        self.transition(SessionState::Authenticated(user.clone()));
        Ok(user)
    }

    /// Best-effort server-side logout followed by an unconditional local clear.
    pub async fn logout(&self) {
        if let Err(err) = self.client.revoke().await {
            warn!(error = %err, "server-side logout failed");
        }
        self.clear_store();
        self.transition(SessionState::Unauthenticated);
        info!("logged out");
    }

    fn clear_store(&self) {
        if let Err(err) = self.client.clear_tokens() {
            warn!(error = %err, "failed to clear token store");
        }
    }

    fn transition(&self, next: SessionState) {
        self.state.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryTokenStore, TokenPair};
    use crate::config::ClientConfig;
    use httpmock::prelude::*;
    use std::time::Duration;
    use url::Url;

    fn context_for(
        server: &MockServer,
        store: Arc<MemoryTokenStore>,
    ) -> SessionContext<MemoryTokenStore> {
        let config = ClientConfig::new(Url::parse(&server.url("/api/v1")).unwrap())
            .with_timeout(Duration::from_secs(5));
        let client = SessionClient::new(&config, store).unwrap();
        let oauth = OAuthFlowHandler::new(&config).unwrap();
        SessionContext::new(client, oauth)
    }

    fn profile_body(id: &str, email: &str) -> serde_json::Value {
        serde_json::json!({
            "user": {
                "id": id,
                "email": email,
                "first_name": "Ada",
                "last_name": "Lovelace",
                "is_verified": true
            }
        })
    }

    #[tokio::test]
    async fn starts_unknown_and_loading() {
        let server = MockServer::start();
        let context = context_for(&server, Arc::new(MemoryTokenStore::new()));
        assert_eq!(context.state(), SessionState::Unknown);
        assert!(context.is_loading());
        assert!(!context.is_authenticated());
    }

    #[tokio::test]
    async fn restore_without_tokens_makes_no_calls() {
        let server = MockServer::start();
        let validate = server.mock(|when, then| {
            when.path("/api/v1/auth/validate");
            then.status(200);
        });
        let profile = server.mock(|when, then| {
            when.path("/api/v1/profile");
            then.status(200);
        });

        let context = context_for(&server, Arc::new(MemoryTokenStore::new()));
        assert_eq!(context.restore_from_storage().await, SessionState::Unauthenticated);
        assert_eq!(context.restore_from_storage().await, SessionState::Unauthenticated);
        validate.assert_hits(0);
        profile.assert_hits(0);
    }

    #[tokio::test]
    async fn restore_with_valid_tokens_authenticates() {
        let server = MockServer::start();
        let validate = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/auth/validate")
                .header("authorization", "Bearer access-1");
            then.status(200).json_body_obj(&serde_json::json!({ "valid": true }));
        });
        let profile = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/profile")
                .header("authorization", "Bearer access-1");
            then.status(200).json_body_obj(&profile_body("u1", "a@b.com"));
        });

        let store = Arc::new(MemoryTokenStore::with_pair(TokenPair::new(
            "access-1",
            "refresh-1",
        )));
        let context = context_for(&server, store);
        let mut updates = context.subscribe();

        let state = context.restore_from_storage().await;
        validate.assert();
        profile.assert();
        let user = state.user().unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.email, "a@b.com");
        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().is_authenticated());
    }

    #[tokio::test]
    async fn failed_restore_clears_store() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/auth/validate");
            then.status(500);
        });

        let store = Arc::new(MemoryTokenStore::with_pair(TokenPair::new("a", "r")));
        let context = context_for(&server, store.clone());
        assert_eq!(context.restore_from_storage().await, SessionState::Unauthenticated);
        assert!(store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_failure_forces_unauthenticated() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/auth/validate")
                .header("authorization", "Bearer old");
            then.status(200);
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/profile");
            then.status(200).json_body_obj(&profile_body("u1", "a@b.com"));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/trips");
            then.status(401);
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/v1/auth/refresh");
            then.status(401);
        });

        let store = Arc::new(MemoryTokenStore::with_pair(TokenPair::new("old", "revoked")));
        let context = context_for(&server, store.clone());
        assert!(context.restore_from_storage().await.is_authenticated());

        let client = context.client();
        let (a, b, c) = tokio::join!(
            client.get_json::<serde_json::Value>("trips"),
            client.get_json::<serde_json::Value>("trips"),
            client.get_json::<serde_json::Value>("trips"),
        );
        for result in [a, b, c] {
            assert!(matches!(result.unwrap_err(), AuthError::SessionExpired));
        }
        refresh.assert_hits(1);
        assert!(store.read().unwrap().is_none());
        assert_eq!(context.state(), SessionState::Unauthenticated);
        assert!(context.user().is_none());
    }

    #[tokio::test]
    async fn login_stores_tokens_and_user() {
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST).path("/api/v1/auth/google/login");
            then.status(200).json_body_obj(&serde_json::json!({
                "accessToken": "access-1",
                "refreshToken": "refresh-1",
                "user": { "id": "u1", "email": "a@b.com" }
            }));
        });

        let store = Arc::new(MemoryTokenStore::new());
        let context = context_for(&server, store.clone());
        context.restore_from_storage().await;

        let user = context.login("code-1", Some("state-1")).await.unwrap();
        exchange.assert();
        assert_eq!(user.id, "u1");
        assert_eq!(context.user().unwrap().id, "u1");
        assert_eq!(
            store.read().unwrap(),
            Some(TokenPair::new("access-1", "refresh-1"))
        );
    }

    #[tokio::test]
    async fn login_without_user_fetches_profile() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v1/auth/google/login");
            then.status(200).json_body_obj(&serde_json::json!({
                "accessToken": "access-2",
                "refreshToken": "refresh-2"
            }));
        });
        let profile = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/profile")
                .header("authorization", "Bearer access-2");
            then.status(200).json_body_obj(&profile_body("u2", "c@d.com"));
        });

        let context = context_for(&server, Arc::new(MemoryTokenStore::new()));
        let user = context.login("code-2", None).await.unwrap();
        profile.assert();
        assert_eq!(user.id, "u2");
    }

    #[tokio::test]
    async fn relogin_replaces_snapshot() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/auth/google/login")
                .json_body_obj(&serde_json::json!({ "code": "first" }));
            then.status(200).json_body_obj(&serde_json::json!({
                "accessToken": "a1",
                "refreshToken": "r1",
                "user": { "id": "u1", "email": "a@b.com" }
            }));
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/auth/google/login")
                .json_body_obj(&serde_json::json!({ "code": "second" }));
            then.status(200).json_body_obj(&serde_json::json!({
                "accessToken": "a2",
                "refreshToken": "r2",
                "user": { "id": "u9", "email": "z@b.com" }
            }));
        });

        let context = context_for(&server, Arc::new(MemoryTokenStore::new()));
        context.login("first", None).await.unwrap();
        context.login("second", None).await.unwrap();
        assert_eq!(context.user().unwrap().id, "u9");
    }

    #[tokio::test]
    async fn failed_login_keeps_state() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v1/auth/google/login");
            then.status(401);
        });

        let store = Arc::new(MemoryTokenStore::new());
        let context = context_for(&server, store.clone());
        context.restore_from_storage().await;
        let err = context.login("expired", None).await.unwrap_err();
        assert!(matches!(err, AuthError::ExchangeFailed { .. }));
        assert_eq!(context.state(), SessionState::Unauthenticated);
        assert!(store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_clears_even_when_server_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/auth/validate");
            then.status(200);
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/profile");
            then.status(200).json_body_obj(&profile_body("u1", "a@b.com"));
        });
        let logout = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/auth/logout")
                .header("authorization", "Bearer a");
            then.status(500);
        });

        let store = Arc::new(MemoryTokenStore::with_pair(TokenPair::new("a", "r")));
        let context = context_for(&server, store.clone());
        assert!(context.restore_from_storage().await.is_authenticated());

        context.logout().await;
        logout.assert();
        assert!(store.read().unwrap().is_none());
        assert_eq!(context.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn relogin_with_failed_profile_ends_session() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/auth/google/login")
                .json_body_obj(&serde_json::json!({ "code": "first" }));
            then.status(200).json_body_obj(&serde_json::json!({
                "accessToken": "a1",
                "refreshToken": "r1",
                "user": { "id": "u1", "email": "a@b.com" }
            }));
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/auth/google/login")
                .json_body_obj(&serde_json::json!({ "code": "second" }));
            then.status(200).json_body_obj(&serde_json::json!({
                "accessToken": "a2",
                "refreshToken": "r2"
            }));
        });
        let profile = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/profile")
                .header("authorization", "Bearer a2");
            then.status(500);
        });

        let store = Arc::new(MemoryTokenStore::new());
        let context = context_for(&server, store.clone());
        context.login("first", None).await.unwrap();
        assert!(context.is_authenticated());

        let err = context.login("second", None).await.unwrap_err();
        assert!(matches!(err, AuthError::Status { .. }));
        profile.assert();
        assert!(store.read().unwrap().is_none());
        assert_eq!(context.state(), SessionState::Unauthenticated);
        assert!(context.user().is_none());
    }

    #[tokio::test]
    async fn login_during_failing_refresh_survives() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/trips")
                .header("authorization", "Bearer old");
            then.status(401);
        });
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/trips")
                .header("authorization", "Bearer a2");
            then.status(200).json_body_obj(&serde_json::json!({ "trips": [] }));
        });
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/api/v1/auth/refresh");
            then.status(401).delay(Duration::from_millis(300));
        });
        server.mock(|when, then| {
            when.method(POST).path("/api/v1/auth/google/login");
            then.status(200).json_body_obj(&serde_json::json!({
                "accessToken": "a2",
                "refreshToken": "r2",
                "user": { "id": "u2", "email": "c@d.com" }
            }));
        });

        let store = Arc::new(MemoryTokenStore::with_pair(TokenPair::new("old", "r")));
        let context = context_for(&server, store.clone());
        let (trips, login) = tokio::join!(
            context.client().get_json::<serde_json::Value>("trips"),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                context.login("code", None).await
            },
        );

        assert_eq!(login.unwrap().id, "u2");
        assert_eq!(trips.unwrap()["trips"], serde_json::json!([]));
        refresh.assert_hits(1);
        fresh.assert_hits(1);
        assert_eq!(store.read().unwrap(), Some(TokenPair::new("a2", "r2")));
        assert_eq!(context.user().unwrap().id, "u2");
        assert!(context.is_authenticated());
    }
}
