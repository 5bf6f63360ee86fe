use std::io::{Read, Write};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::domain::Credentials;
use crate::error::SyncError;

pub const DEFAULT_PORTAL_URL: &str = "https://genome.jgi.doe.gov";
pub const DEFAULT_SIGNON_URL: &str = "https://signon.jgi.doe.gov/signon/create";
pub const DEFAULT_ORGANISM: &str = "PhytozomeV10";

const CHUNK_SIZE: usize = 64 * 1024;

/// Issues authenticated sessions against the remote portal.
pub trait PortalClient: Send + Sync {
    type Session: PortalSession;

    /// One login round-trip. Never retried: a failure here ends the run.
    fn authenticate(&self, credentials: &Credentials) -> Result<Self::Session, SyncError>;
}

/// An authenticated handle. Shared by reference across download workers.
pub trait PortalSession: Send + Sync {
    /// Base URL that relative listing links are resolved against.
    fn base_url(&self) -> &str;

    /// Raw listing document for everything the session can see.
    fn fetch_listing(&self) -> Result<String, SyncError>;

    /// Stream `url` into `destination`, returning the number of bytes written.
    fn download(
        &self,
        url: &str,
        destination: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<u64, SyncError>;
}

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub portal_url: String,
    pub signon_url: String,
    pub organism: String,
    pub timeout: Duration,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            signon_url: DEFAULT_SIGNON_URL.to_string(),
            organism: DEFAULT_ORGANISM.to_string(),
            timeout: Duration::from_secs(600),
        }
    }
}

/// JGI Genomes Portal (Phytozome downloads).
#[derive(Debug, Clone)]
pub struct JgiPortalClient {
    settings: PortalSettings,
}

impl JgiPortalClient {
    pub fn new(settings: PortalSettings) -> Self {
        Self { settings }
    }

    fn build_client(&self) -> Result<Client, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cds-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::Network(err.to_string()))?,
        );
        Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .timeout(self.settings.timeout)
            .build()
            .map_err(|err| SyncError::Network(err.to_string()))
    }
}

impl PortalClient for JgiPortalClient {
    type Session = JgiSession;

    fn authenticate(&self, credentials: &Credentials) -> Result<JgiSession, SyncError> {
        let client = self.build_client()?;
        debug!(url = %self.settings.signon_url, user = %credentials.user, "signing on");
        let response = client
            .post(&self.settings.signon_url)
            .form(&[
                ("login", credentials.user.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .map_err(|err| SyncError::Auth(format!("login endpoint unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Auth(format!("login rejected with status {status}")));
        }
        let body = response
            .text()
            .map_err(|err| SyncError::Auth(format!("unreadable login response: {err}")))?;
        if login_rejected(&body) {
            return Err(SyncError::Auth("credentials rejected".to_string()));
        }

        Ok(JgiSession {
            client,
            portal_url: self.settings.portal_url.trim_end_matches('/').to_string(),
            organism: self.settings.organism.clone(),
        })
    }
}

/// The sign-on page answers 200 either way; a failed login re-renders the form.
fn login_rejected(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("login failed")
        || lower.contains("invalid login")
        || lower.contains("invalid username or password")
        || (lower.contains("name=\"password\"") && lower.contains("<form"))
}

#[derive(Debug, Clone)]
pub struct JgiSession {
    client: Client,
    portal_url: String,
    organism: String,
}

impl JgiSession {
    fn listing_url(&self) -> String {
        format!(
            "{}/portal/ext-api/downloads/get-directory?organism={}",
            self.portal_url, self.organism
        )
    }

    fn handle_status(response: Response) -> Result<Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "portal request failed".to_string());
        Err(SyncError::PortalStatus { status, message })
    }
}

impl PortalSession for JgiSession {
    fn base_url(&self) -> &str {
        &self.portal_url
    }

    fn fetch_listing(&self) -> Result<String, SyncError> {
        let url = self.listing_url();
        debug!(%url, "fetching listing");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| SyncError::Network(err.to_string()))?;
        Self::handle_status(response)?
            .text()
            .map_err(|err| SyncError::Network(err.to_string()))
    }

    fn download(
        &self,
        url: &str,
        destination: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<u64, SyncError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SyncError::Network(err.to_string()))?;
        let mut response = Self::handle_status(response)?;
        copy_cancellable(&mut response, destination, cancel)
    }
}

/// `io::copy` that checks `cancel` between chunks.
pub fn copy_cancellable<R: Read + ?Sized>(
    reader: &mut R,
    writer: &mut dyn Write,
    cancel: &CancelToken,
) -> Result<u64, SyncError> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let read = reader
            .read(&mut buffer)
            .map_err(|err| SyncError::Network(err.to_string()))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        written += read as u64;
    }
    writer
        .flush()
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(written)
}
