use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage key of the access token.
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Storage key of the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Access and refresh token issued together by the backend.
///
/// Both values are opaque bearer strings; validity is only ever judged by the backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Point-in-time copy of the authenticated user's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawUser")]
pub struct UserSnapshot {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub picture: Option<String>,
    pub is_verified: bool,
    pub fetched_at: DateTime<Utc>,
}

impl UserSnapshot {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => self.email.clone(),
        }
    }
}

/// Backend user payload; the API mixes snake_case and camelCase field names.
#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    #[serde(default)]
    email: String,
    first_name: Option<String>,
    #[serde(rename = "firstName")]
    first_name_camel: Option<String>,
    last_name: Option<String>,
    #[serde(rename = "lastName")]
    last_name_camel: Option<String>,
    profile_photo_url: Option<String>,
    google_photo_url: Option<String>,
    picture: Option<String>,
    is_verified: Option<bool>,
    #[serde(rename = "isVerified")]
    is_verified_camel: Option<bool>,
    fetched_at: Option<DateTime<Utc>>,
}

impl From<RawUser> for UserSnapshot {
    fn from(raw: RawUser) -> Self {
        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
        Self {
            id: raw.id,
            email: raw.email,
            first_name: non_empty(raw.first_name).or(non_empty(raw.first_name_camel)),
            last_name: non_empty(raw.last_name).or(non_empty(raw.last_name_camel)),
            picture: non_empty(raw.profile_photo_url)
                .or(non_empty(raw.google_photo_url))
                .or(non_empty(raw.picture)),
            is_verified: raw.is_verified.or(raw.is_verified_camel).unwrap_or(false),
            fetched_at: raw.fetched_at.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_pair_uses_storage_keys() {
        let value = serde_json::to_value(TokenPair::new("a", "r")).unwrap();
        assert_eq!(value[ACCESS_TOKEN_KEY], "a");
        assert_eq!(value[REFRESH_TOKEN_KEY], "r");
    }

    #[test]
    fn debug_redacts_tokens() {
        let rendered = format!("{:?}", TokenPair::new("secret-access", "secret-refresh"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn user_from_snake_case_payload() {
        let user: UserSnapshot = serde_json::from_value(serde_json::json!({
            "id": "u1",
            "email": "a@b.com",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "google_photo_url": "https://img/google.png",
            "is_verified": true
        }))
        .unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.display_name(), "Ada Lovelace");
        assert_eq!(user.picture.as_deref(), Some("https://img/google.png"));
        assert!(user.is_verified);
    }

    #[test]
    fn user_prefers_profile_photo_and_accepts_camel_case() {
        let user: UserSnapshot = serde_json::from_value(serde_json::json!({
            "id": "u2",
            "email": "c@d.com",
            "firstName": "Grace",
            "profile_photo_url": "https://img/custom.png",
            "google_photo_url": "https://img/google.png",
            "isVerified": false
        }))
        .unwrap();
        assert_eq!(user.first_name.as_deref(), Some("Grace"));
        assert_eq!(user.last_name, None);
        assert_eq!(user.picture.as_deref(), Some("https://img/custom.png"));
        assert!(!user.is_verified);
        assert_eq!(user.display_name(), "Grace");
    }
}
