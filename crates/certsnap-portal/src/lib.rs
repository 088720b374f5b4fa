//! Portal login session + authenticated report download.
//!
//! The portal has no API; a WebDriver-driven headless browser walks the
//! interactive login form and the resulting session cookies authenticate a
//! plain HTTP GET of the CSV export. Everything downstream sees only the
//! [`CookieJar`], so the browser dependency stays contained here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use certsnap_core::PortalCredentials;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "certsnap-portal";

const USERNAME_INPUT_ID: &str = "loginPage:loginForm:registerWhoEmailInput";
const PASSWORD_INPUT_ID: &str = "loginPage:loginForm:registerPassPasswordInput";
const LOGIN_BUTTON_ID: &str = "loginPage:loginForm:loginBtn";
const CONSENT_ACCEPT_SELECTOR: &str = "[data-id='awsccc-cb-btn-accept']";
// Rendered by the portal only once a login has been accepted.
const LOGGED_IN_MARKER_ID: &str = "context + logout";

const HEADLESS_CHROME_ARGS: &[&str] = &[
    "--headless",
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-dev-tools",
    "--no-zygote",
    "--single-process",
    "--user-data-dir=/tmp/chromium",
];

/// Session cookies captured from the authenticated browser, as an ordered
/// name -> value map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Render the jar as a `Cookie` request header value.
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl FromIterator<(String, String)> for CookieJar {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            cookies: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login form did not appear within {timeout:?}")]
    LoginPageTimeout { timeout: Duration },
    #[error("no logged-in marker within {timeout:?}; portal rejected the login")]
    AuthenticationFailed { timeout: Duration },
    #[error("webdriver session could not be established: {0}")]
    Session(#[from] fantoccini::error::NewSessionError),
    #[error(transparent)]
    WebDriver(#[from] CmdError),
}

/// Produces an authenticated cookie jar. The pipeline has no awareness of
/// how the cookies were obtained.
#[async_trait]
pub trait PortalAuthenticator: Send + Sync {
    async fn authenticate(&self, credentials: &PortalCredentials) -> Result<CookieJar, AuthError>;
}

/// Drives a headless Chrome session through the portal login form.
#[derive(Debug, Clone)]
pub struct WebDriverAuthenticator {
    webdriver_url: String,
    login_url: String,
    wait_timeout: Duration,
}

impl WebDriverAuthenticator {
    pub fn new(
        webdriver_url: impl Into<String>,
        login_url: impl Into<String>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            webdriver_url: webdriver_url.into(),
            login_url: login_url.into(),
            wait_timeout,
        }
    }

    async fn connect(&self) -> Result<Client, AuthError> {
        let mut capabilities = serde_json::map::Map::new();
        capabilities.insert(
            "goog:chromeOptions".to_string(),
            json!({ "args": HEADLESS_CHROME_ARGS }),
        );
        let mut builder = ClientBuilder::native();
        builder.capabilities(capabilities);
        Ok(builder.connect(&self.webdriver_url).await?)
    }

    async fn dismiss_consent_banner(&self, client: &Client) -> Result<(), AuthError> {
        match client.find(Locator::Css(CONSENT_ACCEPT_SELECTOR)).await {
            Ok(button) => Ok(button.click().await?),
            Err(ref err) if err.is_no_such_element() => {
                debug!("no consent banner to dismiss");
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn drive_login(
        &self,
        client: &Client,
        credentials: &PortalCredentials,
    ) -> Result<CookieJar, AuthError> {
        client.goto(&self.login_url).await?;

        client
            .wait()
            .at_most(self.wait_timeout)
            .for_element(Locator::Id(USERNAME_INPUT_ID))
            .await
            .map_err(|err| match err {
                CmdError::WaitTimeout => AuthError::LoginPageTimeout {
                    timeout: self.wait_timeout,
                },
                other => AuthError::WebDriver(other),
            })?;

        self.dismiss_consent_banner(client).await?;

        client
            .find(Locator::Id(USERNAME_INPUT_ID))
            .await?
            .send_keys(&credentials.username)
            .await?;
        client
            .find(Locator::Id(PASSWORD_INPUT_ID))
            .await?
            .send_keys(&credentials.password)
            .await?;
        client.find(Locator::Id(LOGIN_BUTTON_ID)).await?.click().await?;

        client
            .wait()
            .at_most(self.wait_timeout)
            .for_element(Locator::Id(LOGGED_IN_MARKER_ID))
            .await
            .map_err(|err| match err {
                CmdError::WaitTimeout => AuthError::AuthenticationFailed {
                    timeout: self.wait_timeout,
                },
                other => AuthError::WebDriver(other),
            })?;

        let mut jar = CookieJar::new();
        for cookie in client.get_all_cookies().await? {
            jar.insert(cookie.name().to_string(), cookie.value().to_string());
        }
        debug!(cookies = jar.len(), "captured session cookies");
        Ok(jar)
    }
}

#[async_trait]
impl PortalAuthenticator for WebDriverAuthenticator {
    async fn authenticate(&self, credentials: &PortalCredentials) -> Result<CookieJar, AuthError> {
        info!("getting login cookies");
        let client = self.connect().await?;
        let outcome = self.drive_login(&client, credentials).await;
        // The browser is single-use; tear it down whether or not login worked.
        if let Err(err) = client.close().await {
            warn!(error = %err, "webdriver session did not close cleanly");
        }
        outcome
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("report request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Downloads the raw CSV export for an authenticated session.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch_report(&self, cookies: &CookieJar) -> Result<Vec<u8>, FetchError>;
}

/// One cookie-authenticated GET of the export endpoint, redirects followed,
/// whole body buffered.
#[derive(Debug, Clone)]
pub struct ExportFetcher {
    client: reqwest::Client,
    export_url: String,
}

impl ExportFetcher {
    pub fn new(
        export_url: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            export_url: export_url.into(),
        })
    }
}

#[async_trait]
impl ReportSource for ExportFetcher {
    async fn fetch_report(&self, cookies: &CookieJar) -> Result<Vec<u8>, FetchError> {
        info!("fetching certification report");
        let response = self
            .client
            .get(&self.export_url)
            .header(reqwest::header::COOKIE, cookies.header_value())
            .send()
            .await?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
