// src/repository/client.rs

//! HTTP client for repository operations
//!
//! Provides a per-repository session around reqwest with proxy, basic
//! auth, client certificate and certificate verification settings taken
//! from the repository descriptor.

use crate::config::RepositoryDescriptor;
use crate::error::{Error, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT_ENCODING, USER_AGENT};
use reqwest::{NoProxy, Proxy, StatusCode};
use std::fs;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for small requests (listings, metafiles, checksums)
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for package downloads and range fetches
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(8 * 3600);

/// Maximum attempts for requests failing at the transport level
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Hosts never reached through a proxy
const NO_PROXY_HOSTS: &str = "localhost,127.0.0.1,ip6-localhost,::1";

/// Settings shared by every session of a run
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user_agent: String,
    pub timeout: Duration,
    /// Proxy used when the repository does not configure its own
    pub proxy: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            timeout: HTTP_TIMEOUT,
            proxy: None,
        }
    }
}

/// HTTP session bound to one repository
pub struct HttpSession {
    client: Client,
    user_agent: String,
    timeout: Duration,
    username: Option<String>,
    password: Option<String>,
}

impl HttpSession {
    /// Create a session without repository specific settings
    pub fn new(settings: &SessionSettings) -> Result<Self> {
        let client = Self::builder(settings, settings.proxy.as_deref())?
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            user_agent: settings.user_agent.clone(),
            timeout: settings.timeout,
            username: None,
            password: None,
        })
    }

    /// Create a session for a repository
    pub fn for_repository(repo: &RepositoryDescriptor, settings: &SessionSettings) -> Result<Self> {
        debug!(
            "Opening session for repository '{}' ({}) with verify={}",
            repo.name, repo.base_url, repo.verify_cert
        );
        let proxy = repo.proxy.as_deref().or(settings.proxy.as_deref());
        let mut builder = Self::builder(settings, proxy)?
            .danger_accept_invalid_certs(!repo.verify_cert);

        if let Some((cert, key)) = repo.credentials.client_identity() {
            debug!("Using client certificate {} {}", cert.display(), key.display());
            let mut pem = fs::read(cert)?;
            pem.push(b'\n');
            pem.extend(fs::read(key)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::InitError(format!("Invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            user_agent: settings.user_agent.clone(),
            timeout: settings.timeout,
            username: repo.credentials.username.clone(),
            password: repo.credentials.password.clone(),
        })
    }

    /// Authenticate every request with basic auth
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn builder(settings: &SessionSettings, proxy: Option<&str>) -> Result<reqwest::blocking::ClientBuilder> {
        let mut builder = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(settings.timeout);

        if let Some(proxy) = proxy {
            let proxy = Proxy::all(proxy)
                .map_err(|e| Error::ConfigError(format!("Invalid proxy '{proxy}': {e}")))?
                .no_proxy(NoProxy::from_string(NO_PROXY_HOSTS));
            builder = builder.proxy(proxy);
        }

        Ok(builder)
    }

    fn prepare(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(USER_AGENT, &self.user_agent);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    /// GET request with session headers and the short timeout
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.prepare(self.client.get(url)).timeout(self.timeout)
    }

    /// GET request for a bulk transfer, without content encoding
    pub fn get_transfer(&self, url: &str) -> RequestBuilder {
        self.prepare(self.client.get(url))
            .header(ACCEPT_ENCODING, "identity")
            .timeout(TRANSFER_TIMEOUT)
    }

    pub fn head(&self, url: &str) -> RequestBuilder {
        self.prepare(self.client.head(url)).timeout(self.timeout)
    }

    /// PUT request for uploads
    pub fn put(&self, url: &str) -> RequestBuilder {
        self.prepare(self.client.put(url)).timeout(TRANSFER_TIMEOUT)
    }

    /// Send a request, retrying transport failures
    ///
    /// HTTP error statuses are returned as responses, not retried.
    pub fn send<F>(&self, url: &str, make_request: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match make_request().send() {
                Ok(response) => return Ok(response),
                Err(e) if attempt < MAX_RETRIES && (e.is_connect() || e.is_timeout()) => {
                    warn!(
                        "Request to {} failed (attempt {}/{}): {}",
                        url, attempt, MAX_RETRIES, e
                    );
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
                Err(e) => {
                    return Err(Error::DownloadError(format!(
                        "Request to {url} failed after {attempt} attempts: {e}"
                    )));
                }
            }
        }
    }

    /// GET a resource and return its status and body
    pub fn fetch(&self, url: &str) -> Result<(StatusCode, Vec<u8>)> {
        let response = self.send(url, || self.get(url))?;
        let status = response.status();
        let body = response
            .bytes()
            .map_err(|e| Error::DownloadError(format!("Failed to read response from {url}: {e}")))?;
        Ok((status, body.to_vec()))
    }

    /// GET a text resource, failing on non-success statuses
    pub fn fetch_text(&self, url: &str) -> Result<String> {
        let (status, body) = self.fetch(url)?;
        if !status.is_success() {
            return Err(Error::DownloadError(format!("HTTP {status} from {url}")));
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Whether the server (or proxy) accepts byte range requests for `url`
    pub fn accepts_ranges(&self, url: &str) -> Result<bool> {
        let response = self.send(url, || self.head(url))?;
        let accepts = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));
        Ok(response.status().is_success() && accepts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;

    #[test]
    fn test_fetch_text_sends_user_agent_and_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/listing/")
                .header("user-agent", "test-agent")
                .header_exists("authorization");
            then.status(200).body("<a href=\"x.opsi\">x</a>");
        });

        let mut repo = RepositoryDescriptor::new("test", server.base_url());
        repo.credentials.username = Some("user".into());
        repo.credentials.password = Some("secret".into());
        let settings = SessionSettings {
            user_agent: "test-agent".into(),
            ..Default::default()
        };

        let session = HttpSession::for_repository(&repo, &settings).unwrap();
        let body = session.fetch_text(&server.url("/listing/")).unwrap();
        mock.assert();
        assert!(body.contains("x.opsi"));
    }

    #[test]
    fn test_fetch_text_fails_on_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing/");
            then.status(404);
        });

        let session = HttpSession::new(&SessionSettings::default()).unwrap();
        assert!(session.fetch_text(&server.url("/missing/")).is_err());
    }

    #[test]
    fn test_accepts_ranges() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(HEAD).path("/ranged.opsi");
            then.status(200).header("accept-ranges", "bytes");
        });
        server.mock(|when, then| {
            when.method(HEAD).path("/plain.opsi");
            then.status(200);
        });

        let session = HttpSession::new(&SessionSettings::default()).unwrap();
        assert!(session.accepts_ranges(&server.url("/ranged.opsi")).unwrap());
        assert!(!session.accepts_ranges(&server.url("/plain.opsi")).unwrap());
    }
}
