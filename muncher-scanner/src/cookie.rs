use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Purpose assigned to cookies the knowledge source has no record of.
pub const UNKNOWN_PURPOSE: &str = "Unknown";

/// A cookie as read out of a browser session's jar, before it is tied to a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Unix seconds; `None` for session cookies.
    pub expires: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
}

/// A cookie captured while harvesting one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub http_only: bool,
    pub secure: bool,
    pub expires: Option<i64>,
    pub source_url: String,
    pub captured_at: DateTime<Utc>,
}

impl RawCookie {
    pub fn captured(cookie: BrowserCookie, source_url: &str) -> Self {
        Self {
            name: cookie.name,
            value: cookie.value,
            domain: cookie.domain,
            path: cookie.path,
            http_only: cookie.http_only,
            secure: cookie.secure,
            expires: cookie.expires,
            source_url: source_url.to_string(),
            captured_at: Utc::now(),
        }
    }

    pub fn is_session(&self) -> bool {
        self.expires.is_none()
    }
}

/// What the knowledge source knows about a cookie name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieMetadata {
    pub name: String,
    pub purpose: String,
    pub about: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl CookieMetadata {
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            purpose: UNKNOWN_PURPOSE.to_string(),
            about: None,
            resolved_at: Utc::now(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.purpose == UNKNOWN_PURPOSE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCookie {
    pub cookie: RawCookie,
    pub metadata: CookieMetadata,
}

impl ResolvedCookie {
    pub fn name(&self) -> &str {
        &self.cookie.name
    }

    pub fn purpose(&self) -> &str {
        if self.metadata.purpose.trim().is_empty() {
            UNKNOWN_PURPOSE
        } else {
            &self.metadata.purpose
        }
    }
}
