use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

// Defaults
const DEFAULT_BIND: ([u8; 4], u16) = ([127, 0, 0, 1], 5000);
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_TOKEN_FILE: &str = "token.json";
const DEFAULT_CREDENTIALS_FILE: &str = "credentials.json";
const DEFAULT_STATIC_DIR: &str = "static";
const DEFAULT_GMAIL_API: &str = "https://gmail.googleapis.com";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Runtime settings for the web server
///
/// Every field has a default and can be overridden with a
/// `SHEETMAILER_*` environment variable (see [`Settings::from_env`]).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the HTTP server listens on
    pub bind_addr: SocketAddr,

    /// Directory uploaded spreadsheets are written to
    pub upload_dir: PathBuf,

    /// Cached OAuth2 token
    pub token_path: PathBuf,

    /// Pre-provisioned OAuth2 client secrets, never written by the server
    pub credentials_path: PathBuf,

    /// Directory served under `/static`
    pub static_dir: PathBuf,

    /// Base URL of the Gmail REST API
    pub gmail_api_base: String,

    /// Largest accepted request body
    pub max_upload_bytes: usize,

    /// Development mode: verbose logging
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: SocketAddr::from(DEFAULT_BIND),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            token_path: PathBuf::from(DEFAULT_TOKEN_FILE),
            credentials_path: PathBuf::from(DEFAULT_CREDENTIALS_FILE),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            gmail_api_base: DEFAULT_GMAIL_API.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            debug: true,
        }
    }
}

impl Settings {
    /// Build settings from the process environment
    ///
    /// # Errors
    /// * Returns `Error::Config` if a variable is set but cannot be parsed
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(addr) = parsed(&lookup, "SHEETMAILER_BIND")? {
            settings.bind_addr = addr;
        }
        if let Some(dir) = lookup("SHEETMAILER_UPLOAD_DIR") {
            settings.upload_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("SHEETMAILER_TOKEN_FILE") {
            settings.token_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("SHEETMAILER_CREDENTIALS_FILE") {
            settings.credentials_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("SHEETMAILER_STATIC_DIR") {
            settings.static_dir = PathBuf::from(dir);
        }
        if let Some(base) = lookup("SHEETMAILER_GMAIL_API") {
            settings.gmail_api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(limit) = parsed(&lookup, "SHEETMAILER_MAX_UPLOAD_BYTES")? {
            settings.max_upload_bytes = limit;
        }
        if let Some(flag) = lookup("SHEETMAILER_DEBUG") {
            settings.debug = parse_flag(&flag)
                .ok_or_else(|| Error::Config(format!("SHEETMAILER_DEBUG: not a boolean: {flag}")))?;
        }

        Ok(settings)
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
