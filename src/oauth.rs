use async_trait::async_trait;
use axum::Router;
use axum::extract::Query;
use axum::response::Html;
use axum::routing::get;
use chrono::Utc;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::credentials::StoredToken;
use crate::error::{Error, Result};

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";

const CALLBACK_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Authorization complete</title></head>\
<body><p>The authentication flow has completed. You may close this window.</p></body></html>";

/// OAuth2 client registration, as found in `credentials.json`
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,

    pub token_uri: String,
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.to_string()
}

// Google wraps the registration in "installed" (desktop) or "web"
#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn from_json(json: &str) -> Result<Self> {
        let file: SecretsFile = serde_json::from_str(json)?;
        file.installed.or(file.web).ok_or_else(|| {
            Error::OAuth("client secrets have neither an \"installed\" nor a \"web\" section".into())
        })
    }

    /// Read `credentials.json`
    pub async fn from_file(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::OAuth(format!("cannot read client secrets {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    fn client(&self) -> Result<BasicClient> {
        oauth_client(&self.client_id, &self.client_secret, &self.auth_uri, &self.token_uri)
    }
}

fn oauth_client(
    client_id: &str,
    client_secret: &str,
    auth_uri: &str,
    token_uri: &str,
) -> Result<BasicClient> {
    let secret = (!client_secret.is_empty()).then(|| ClientSecret::new(client_secret.to_string()));
    let client = BasicClient::new(
        ClientId::new(client_id.to_string()),
        secret,
        AuthUrl::new(auth_uri.to_string()).map_err(|e| Error::OAuth(e.to_string()))?,
        Some(TokenUrl::new(token_uri.to_string()).map_err(|e| Error::OAuth(e.to_string()))?),
    )
    // Google expects the client credentials in the form body
    .set_auth_type(AuthType::RequestBody);
    Ok(client)
}

// Turn a token endpoint reply into what goes into token.json
fn stored_token(
    resp: &BasicTokenResponse,
    client_id: &str,
    client_secret: &str,
    token_uri: &str,
    requested_scopes: &[String],
    previous_refresh: Option<&str>,
) -> StoredToken {
    let scopes = resp
        .scopes()
        .map(|granted| granted.iter().map(|s| s.as_str().to_string()).collect())
        .unwrap_or_else(|| requested_scopes.to_vec());

    StoredToken {
        token: Some(resp.access_token().secret().clone()),
        refresh_token: resp
            .refresh_token()
            .map(|t| t.secret().clone())
            .or_else(|| previous_refresh.map(String::from)),
        token_uri: token_uri.to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        scopes,
        // An expiry past the representable range is stored as no expiry
        expiry: resp
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| Utc::now().checked_add_signed(d)),
    }
}

/// Exchange the refresh token of `token` for a new access token
///
/// The endpoint, client id and secret come from the token itself. When the
/// endpoint does not hand out a new refresh token the old one is kept.
///
/// # Errors
/// * `Error::OAuth` if the token has no refresh token or the endpoint refuses
pub async fn refresh(token: &StoredToken) -> Result<StoredToken> {
    let refresh = token
        .refresh_token
        .as_deref()
        .ok_or_else(|| Error::OAuth("token has no refresh token".into()))?;

    let client = oauth_client(
        &token.client_id,
        &token.client_secret,
        GOOGLE_AUTH_URI,
        &token.token_uri,
    )?;

    let resp = client
        .exchange_refresh_token(&RefreshToken::new(refresh.to_string()))
        .request_async(async_http_client)
        .await
        .map_err(|e| Error::OAuth(format!("token refresh failed: {}", e)))?;

    Ok(stored_token(
        &resp,
        &token.client_id,
        &token.client_secret,
        &token.token_uri,
        &token.scopes,
        Some(refresh),
    ))
}

/// Interactive authorization that yields a brand new token
#[async_trait]
pub trait ConsentFlow: Send + Sync {
    async fn authorize(&self, scopes: &[String]) -> Result<StoredToken>;
}

/// Installed-application consent flow
///
/// Listens on an ephemeral loopback port, sends the user's browser to the
/// consent screen and waits for the redirect carrying the authorization code.
/// Blocks the calling request until the user has answered.
pub struct InstalledAppFlow {
    secrets_path: PathBuf,
}

impl InstalledAppFlow {
    pub fn new(secrets_path: impl Into<PathBuf>) -> Self {
        InstalledAppFlow {
            secrets_path: secrets_path.into(),
        }
    }
}

#[async_trait]
impl ConsentFlow for InstalledAppFlow {
    async fn authorize(&self, scopes: &[String]) -> Result<StoredToken> {
        let secrets = ClientSecrets::from_file(&self.secrets_path).await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let redirect = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
        let client = secrets
            .client()?
            .set_redirect_uri(RedirectUrl::new(redirect).map_err(|e| Error::OAuth(e.to_string()))?);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge)
            .add_extra_param("access_type", "offline");
        for scope in scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (auth_url, csrf_state) = request.url();

        log::warn!("Please visit this URL to authorize this application: {}", auth_url);
        if let Err(e) = open::that(auth_url.as_str()) {
            log::warn!("could not open a browser: {}", e);
        }

        let callback = wait_for_callback(listener).await?;
        if let Some(error) = callback.error {
            return Err(Error::OAuth(format!("authorization denied: {}", error)));
        }
        if callback.state.as_deref() != Some(csrf_state.secret().as_str()) {
            return Err(Error::OAuth("authorization state mismatch".into()));
        }
        let code = callback
            .code
            .ok_or_else(|| Error::OAuth("redirect carried no authorization code".into()))?;

        let resp = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::OAuth(format!("code exchange failed: {}", e)))?;

        log::info!("authorization granted");
        Ok(stored_token(
            &resp,
            &secrets.client_id,
            &secrets.client_secret,
            &secrets.token_uri,
            scopes,
            None,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct Callback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

// Serve the redirect target until a request carrying a code or an error arrives
async fn wait_for_callback(listener: TcpListener) -> Result<Callback> {
    let (tx, mut rx) = mpsc::channel::<Callback>(1);
    let app = Router::new().route(
        "/",
        get(move |Query(callback): Query<Callback>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(callback).await;
                Html(CALLBACK_PAGE)
            }
        }),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_rx.await.ok();
            })
            .await
    });

    let callback = loop {
        match rx.recv().await {
            Some(cb) if cb.code.is_some() || cb.error.is_some() => break cb,
            Some(_) => continue,
            None => return Err(Error::OAuth("callback listener stopped".into())),
        }
    };

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
        log::debug!("callback listener did not shut down in time");
    }

    Ok(callback)
}
