use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};

/// Cookie carrying pending messages across the post/redirect/get cycle
pub const FLASH_COOKIE: &str = "flash";

/// Severity of a flash message, used as the alert style on the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Warning,
    Danger,
}

/// One-shot status message shown on the next page render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub level: Level,
    pub message: String,
}

impl Flash {
    pub fn success(message: impl Into<String>) -> Self {
        Flash { level: Level::Success, message: message.into() }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Flash { level: Level::Warning, message: message.into() }
    }

    pub fn danger(message: impl Into<String>) -> Self {
        Flash { level: Level::Danger, message: message.into() }
    }
}

/// Queue `flash` behind any messages already pending in `jar`
pub fn push(jar: CookieJar, flash: Flash) -> CookieJar {
    let mut pending = jar
        .get(FLASH_COOKIE)
        .map(|c| decode(c.value()))
        .unwrap_or_default();
    pending.push(flash);

    let cookie = Cookie::build((FLASH_COOKIE, encode(&pending)))
        .path("/")
        .http_only(true);
    jar.add(cookie)
}

/// Remove and return every pending message
pub fn take(jar: CookieJar) -> (CookieJar, Vec<Flash>) {
    match jar.get(FLASH_COOKIE).map(|c| decode(c.value())) {
        Some(pending) => {
            let jar = jar.remove(Cookie::build(FLASH_COOKIE).path("/"));
            (jar, pending)
        }
        None => (jar, Vec::new()),
    }
}

fn encode(flashes: &[Flash]) -> String {
    let json = serde_json::to_string(flashes).unwrap_or_else(|_| "[]".to_string());
    urlencoding::encode(&json).into_owned()
}

/// Parse a cookie value; anything unreadable yields no messages
pub fn decode(value: &str) -> Vec<Flash> {
    urlencoding::decode(value)
        .ok()
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}
