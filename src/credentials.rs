use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::oauth::{self, ConsentFlow};

/// Scope needed to send mail as the authorizing user
pub const GMAIL_SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

/// Tokens this close to their expiry are treated as already expired
pub const EXPIRY_SKEW_SECS: i64 = 300;

/// Bearer token handed to the mail transport
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        AccessToken(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Contents of `token.json`
///
/// The field names follow the Google "authorized user" file, so a token written
/// by other Google client libraries can be reused as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    /// Access token, absent if the file only carries a refresh token
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Endpoint used for refreshing
    pub token_uri: String,

    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    /// `None` means the token never expires
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        // Expiries too close to the start of time to subtract the skew from count as expired
        self.expiry.is_some_and(|expiry| {
            expiry
                .checked_sub_signed(Duration::seconds(EXPIRY_SKEW_SECS))
                .is_none_or(|deadline| now >= deadline)
        })
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// The access token, if there is one
    pub fn access_token(&self) -> Result<AccessToken> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(AccessToken::new)
            .ok_or_else(|| Error::OAuth("token has no access token".to_string()))
    }
}

/// What a request has to do before it can send mail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No token file: run the consent flow
    Missing,
    /// Use the cached token as-is
    Valid,
    /// Refresh silently at the token endpoint
    ExpiredRefreshable,
    /// Nothing to refresh with: run the consent flow
    ExpiredUnrefreshable,
}

impl TokenState {
    /// Classify a cached token at time `now`
    ///
    /// A token without an access token counts as expired.
    pub fn of(token: Option<&StoredToken>, now: DateTime<Utc>) -> Self {
        match token {
            None => TokenState::Missing,
            Some(t) if t.access_token().is_ok() && !t.is_expired(now) => TokenState::Valid,
            Some(t) if t.has_refresh_token() => TokenState::ExpiredRefreshable,
            Some(_) => TokenState::ExpiredUnrefreshable,
        }
    }
}

/// `token.json` on disk
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TokenStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached token; `Ok(None)` when the file does not exist
    ///
    /// # Errors
    /// * `Error::Json` if the file exists but is not a valid token
    pub async fn load(&self) -> Result<Option<StoredToken>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the cached token
    ///
    /// Written to a sibling temp file first and renamed into place, so readers
    /// never see a half-written token.
    pub async fn save(&self, token: &StoredToken) -> Result<()> {
        let json = serde_json::to_vec_pretty(token)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Source of access tokens for the mail transport
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return an access token good for the sends of the current request
    async fn access_token(&self) -> Result<AccessToken>;
}

/// Credential provider backed by `token.json`
///
/// Every call re-reads the file and walks the [`TokenState`] transitions:
/// valid tokens are used as-is, expired ones are refreshed, and a missing or
/// unrefreshable token starts the interactive consent flow. The result is
/// written back unless the cached token was used unchanged. Calls are
/// serialized so two requests never refresh or authorize at the same time.
pub struct FileCredentialProvider {
    store: TokenStore,
    consent: Arc<dyn ConsentFlow>,
    scopes: Vec<String>,
    lock: Mutex<()>,
}

impl FileCredentialProvider {
    pub fn new(token_path: impl Into<PathBuf>, consent: Arc<dyn ConsentFlow>) -> Self {
        FileCredentialProvider {
            store: TokenStore::new(token_path),
            consent,
            scopes: vec![GMAIL_SEND_SCOPE.to_string()],
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn access_token(&self) -> Result<AccessToken> {
        let _guard = self.lock.lock().await;

        let cached = self.store.load().await?;
        let state = TokenState::of(cached.as_ref(), Utc::now());

        let token = match (state, cached) {
            (TokenState::Valid, Some(token)) => return token.access_token(),
            (TokenState::ExpiredRefreshable, Some(token)) => {
                log::info!("access token expired, refreshing");
                oauth::refresh(&token).await?
            }
            (state, _) => {
                log::warn!("no usable token ({:?}), starting consent flow", state);
                self.consent.authorize(&self.scopes).await?
            }
        };

        self.store.save(&token).await?;
        log::info!("saved token to {}", self.store.path().display());
        token.access_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(access: Option<&str>, refresh: Option<&str>, expiry: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            token: access.map(String::from),
            refresh_token: refresh.map(String::from),
            token_uri: "https://oauth2.googleapis.com/token".into(),
            client_id: "client".into(),
            client_secret: "secret".into(),
            scopes: vec![GMAIL_SEND_SCOPE.into()],
            expiry,
        }
    }

    #[test]
    fn classifies_token_states() {
        let now = Utc::now();
        let later = Some(now + Duration::hours(1));
        let earlier = Some(now - Duration::minutes(1));

        assert_eq!(TokenState::of(None, now), TokenState::Missing);
        assert_eq!(
            TokenState::of(Some(&token(Some("a"), None, later)), now),
            TokenState::Valid
        );
        assert_eq!(
            TokenState::of(Some(&token(Some("a"), None, None)), now),
            TokenState::Valid
        );
        assert_eq!(
            TokenState::of(Some(&token(Some("a"), Some("r"), earlier)), now),
            TokenState::ExpiredRefreshable
        );
        assert_eq!(
            TokenState::of(Some(&token(Some("a"), None, earlier)), now),
            TokenState::ExpiredUnrefreshable
        );
        assert_eq!(
            TokenState::of(Some(&token(None, Some("r"), None)), now),
            TokenState::ExpiredRefreshable
        );
    }

    #[test]
    fn tokens_inside_the_skew_window_are_expired() {
        let now = Utc::now();
        let soon = token(Some("a"), None, Some(now + Duration::seconds(EXPIRY_SKEW_SECS - 1)));
        assert!(soon.is_expired(now));
    }

    #[test]
    fn earliest_representable_expiry_is_expired() {
        let ancient = token(Some("a"), Some("r"), Some(DateTime::<Utc>::MIN_UTC));
        assert!(ancient.is_expired(Utc::now()));
        assert_eq!(
            TokenState::of(Some(&ancient), Utc::now()),
            TokenState::ExpiredRefreshable
        );
    }

    #[test]
    fn reads_google_authorized_user_file() {
        let json = r#"{
            "token": "ya29.abc",
            "refresh_token": "1//refresh",
            "token_uri": "https://oauth2.googleapis.com/token",
            "client_id": "id.apps.googleusercontent.com",
            "client_secret": "shh",
            "scopes": ["https://www.googleapis.com/auth/gmail.send"],
            "universe_domain": "googleapis.com",
            "account": "",
            "expiry": "2030-01-01T12:00:00.123456Z"
        }"#;
        let parsed: StoredToken = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token().unwrap().secret(), "ya29.abc");
        assert!(parsed.has_refresh_token());
        assert!(parsed.expiry.is_some());
    }

    #[tokio::test]
    async fn store_round_trips_and_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        assert!(store.load().await.unwrap().is_none());

        let saved = token(Some("a"), Some("r"), Some(Utc::now()));
        store.save(&saved).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved));
        assert!(!dir.path().join("token.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_token_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(TokenStore::new(path).load().await, Err(Error::Json(_))));
    }

    #[test]
    fn debug_output_hides_the_secret() {
        assert_eq!(format!("{:?}", AccessToken::new("ya29")), "AccessToken(..)");
    }
}
