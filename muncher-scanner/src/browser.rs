//! Browser drivers for the cookie harvester.
//!
//! [`ChromeDriver`] runs a real headless Chromium per session and sees every
//! cookie a page sets, including ones written by scripts. [`HttpCookieDriver`]
//! only sees `Set-Cookie` headers but needs nothing installed.

use crate::cookie::BrowserCookie;
use crate::error::{Result, ScanError};
use crate::harvester::{BrowserDriver, BrowserSession};
use async_trait::async_trait;
use ::cookie::Cookie;
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Client, redirect};
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

const MAX_REDIRECTS: usize = 10;

/// Harvests cookies from HTTP response headers, following redirects by hand
/// so cookies set on intermediate hops are kept.
pub struct HttpCookieDriver {
    user_agent: String,
    timeout: Duration,
}

impl HttpCookieDriver {
    pub fn new(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl BrowserDriver for HttpCookieDriver {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        let client = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Box::new(HttpSession {
            client,
            jar: Vec::new(),
        }))
    }
}

struct HttpSession {
    client: Client,
    jar: Vec<BrowserCookie>,
}

impl HttpSession {
    fn store(&mut self, cookie: BrowserCookie) {
        self.jar.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });

        let expired = cookie
            .expires
            .is_some_and(|at| at <= chrono::Utc::now().timestamp());
        if !expired {
            self.jar.push(cookie);
        }
    }

    /// Builds the `Cookie` header for `url` from the jar entries that would
    /// be sent there.
    fn cookie_header(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let pairs: Vec<String> = self
            .jar
            .iter()
            .filter(|c| domain_matches(&host, &c.domain))
            .filter(|c| path_matches(url.path(), &c.path))
            .filter(|c| !c.secure || url.scheme() == "https")
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path[cookie_path.len()..].starts_with('/'))
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.jar.clear();

        let mut current = Url::parse(url).map_err(|e| ScanError::InvalidUrl(format!("{}: {}", url, e)))?;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(current.as_str());
            if let Some(header) = self.cookie_header(&current) {
                request = request.header(COOKIE, header);
            }
            let response = request.send().await?;
            let status = response.status();

            for value in response.headers().get_all(SET_COOKIE) {
                let Ok(raw) = value.to_str() else {
                    continue;
                };
                match parse_set_cookie(raw, &current) {
                    Some(cookie) => {
                        trace!("Set-Cookie {} from {}", cookie.name, current);
                        self.store(cookie);
                    }
                    None => debug!("Ignoring malformed Set-Cookie from {}", current),
                }
            }

            if status.is_redirection() {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|l| l.to_str().ok())
                    .and_then(|l| current.join(l).ok());
                if let Some(next) = next {
                    debug!("Following redirect {} -> {}", current, next);
                    current = next;
                    continue;
                }
            }

            if !status.is_success() {
                return Err(ScanError::HttpStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(());
        }

        Err(ScanError::Other(format!("too many redirects from {}", url)))
    }

    async fn read_cookies(&mut self) -> Result<Vec<BrowserCookie>> {
        Ok(self.jar.clone())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Turns one `Set-Cookie` header into a jar entry. Host and path default to
/// the responding URL the way a browser would fill them in.
pub fn parse_set_cookie(header: &str, response_url: &Url) -> Option<BrowserCookie> {
    let parsed = Cookie::parse(header.to_string()).ok()?;

    let domain = parsed
        .domain()
        .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .or_else(|| response_url.host_str().map(str::to_string))?;

    let path = parsed
        .path()
        .filter(|p| p.starts_with('/'))
        .map(str::to_string)
        .unwrap_or_else(|| default_path(response_url));

    // Max-Age takes precedence over Expires
    let expires = match parsed.max_age() {
        Some(max_age) => Some(chrono::Utc::now().timestamp() + max_age.whole_seconds()),
        None => parsed
            .expires()
            .and_then(|e| e.datetime())
            .map(|dt| dt.unix_timestamp()),
    };

    Some(BrowserCookie {
        name: parsed.name().to_string(),
        value: parsed.value().to_string(),
        domain,
        path,
        expires,
        http_only: parsed.http_only().unwrap_or(false),
        secure: parsed.secure().unwrap_or(false),
    })
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

#[cfg(feature = "browser")]
pub use chrome::{ChromeDriver, ChromeOptions};

#[cfg(feature = "browser")]
mod chrome {
    use super::*;
    use chromiumoxide::cdp::browser_protocol::network::{
        ClearBrowserCookiesParams, SetUserAgentOverrideParams,
    };
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tracing::{info, warn};

    static SESSION_SEQ: AtomicUsize = AtomicUsize::new(0);

    /// Creates a fresh Chromium profile directory. It is removed when the
    /// returned handle is dropped or closed.
    fn profile_dir(seq: usize) -> Result<TempDir> {
        let prefix = format!("muncher-chrome-{}-{}-", std::process::id(), seq);
        Ok(tempfile::Builder::new().prefix(&prefix).tempdir()?)
    }

    #[derive(Debug, Clone)]
    pub struct ChromeOptions {
        pub user_agent: String,
        pub headless: bool,
        pub chrome_path: Option<PathBuf>,
        /// Time given to scripts after the load event before the jar is read.
        pub settle: Duration,
        pub extra_args: Vec<String>,
    }

    impl ChromeOptions {
        pub fn new(user_agent: &str) -> Self {
            Self {
                user_agent: user_agent.to_string(),
                headless: true,
                chrome_path: None,
                settle: Duration::from_millis(1000),
                extra_args: Vec::new(),
            }
        }
    }

    /// Launches one Chromium process per session, each with its own profile
    /// directory.
    pub struct ChromeDriver {
        options: ChromeOptions,
    }

    impl ChromeDriver {
        pub fn new(options: ChromeOptions) -> Self {
            Self { options }
        }
    }

    #[async_trait]
    impl BrowserDriver for ChromeDriver {
        async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
            let seq = SESSION_SEQ.fetch_add(1, Ordering::SeqCst);
            let profile = profile_dir(seq)?;

            let mut builder = BrowserConfig::builder().user_data_dir(profile.path());
            if let Some(ref path) = self.options.chrome_path {
                builder = builder.chrome_executable(path);
            }
            if !self.options.headless {
                builder = builder.with_head();
            }
            builder = builder
                .arg("--disable-dev-shm-usage")
                .arg("--no-first-run")
                .arg("--no-default-browser-check")
                .arg("--disable-sync")
                .arg("--no-sandbox")
                .arg("--disable-gpu");
            for arg in &self.options.extra_args {
                builder = builder.arg(arg);
            }

            let config = builder
                .build()
                .map_err(|e| ScanError::BrowserError(format!("Failed to build browser config: {}", e)))?;

            info!(
                "Launching Chromium session {} (profile {})",
                seq,
                profile.path().display()
            );
            let (browser, mut handler) = Browser::launch(config).await?;

            let handler = tokio::spawn(async move {
                while let Some(h) = handler.next().await {
                    if h.is_err() {
                        break;
                    }
                }
            });

            Ok(Box::new(ChromeSession {
                browser,
                handler,
                profile,
                page: None,
                user_agent: self.options.user_agent.clone(),
                settle: self.options.settle,
            }))
        }
    }

    struct ChromeSession {
        browser: Browser,
        handler: JoinHandle<()>,
        profile: TempDir,
        page: Option<Page>,
        user_agent: String,
        settle: Duration,
    }

    #[async_trait]
    impl BrowserSession for ChromeSession {
        async fn navigate(&mut self, url: &str) -> Result<()> {
            if let Some(previous) = self.page.take()
                && let Err(e) = previous.close().await
            {
                debug!("Failed to close previous tab: {}", e);
            }

            let page = self.browser.new_page("about:blank").await?;
            page.execute(ClearBrowserCookiesParams::default()).await?;
            page.execute(SetUserAgentOverrideParams::new(self.user_agent.clone()))
                .await?;

            // keep the tab so a timed-out load can still be closed
            self.page = Some(page.clone());

            page.goto(url).await?;
            page.wait_for_navigation().await?;
            tokio::time::sleep(self.settle).await;
            Ok(())
        }

        async fn read_cookies(&mut self) -> Result<Vec<BrowserCookie>> {
            let cookies = self.browser.get_cookies().await?;
            Ok(cookies
                .into_iter()
                .map(|c| BrowserCookie {
                    expires: if c.session || c.expires < 0.0 {
                        None
                    } else {
                        Some(c.expires as i64)
                    },
                    name: c.name,
                    value: c.value,
                    domain: c.domain.trim_start_matches('.').to_string(),
                    path: c.path,
                    http_only: c.http_only,
                    secure: c.secure,
                })
                .collect())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            let mut this = *self;
            if let Some(page) = this.page.take()
                && let Err(e) = page.close().await
            {
                debug!("Failed to close tab: {}", e);
            }
            if let Err(e) = this.browser.close().await {
                warn!("Failed to close Chromium: {}", e);
            }
            if let Err(e) = this.browser.wait().await {
                warn!("Failed to reap Chromium: {}", e);
            }
            this.handler.abort();

            let profile = this.profile.path().to_path_buf();
            if let Err(e) = this.profile.close() {
                warn!("Failed to remove Chromium profile {}: {}", profile.display(), e);
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_profile_dir_is_removed_on_close() {
            let profile = profile_dir(7).unwrap();
            let path = profile.path().to_path_buf();

            assert!(path.is_dir());
            assert!(path.starts_with(std::env::temp_dir()));
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(&format!("muncher-chrome-{}-7-", std::process::id())));

            std::fs::write(path.join("Local State"), "{}").unwrap();
            profile.close().unwrap();
            assert!(!path.exists());
        }

        #[test]
        fn test_profile_dirs_are_distinct() {
            let a = profile_dir(1).unwrap();
            let b = profile_dir(1).unwrap();
            assert_ne!(a.path(), b.path());
        }
    }
}
