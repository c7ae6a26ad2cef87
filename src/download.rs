//! Pobieranie obrazków z limitem rozmiaru i whitelistą hostów.

use std::time::Duration;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ScanError;

static CT_IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^image/[a-z0-9.+-]+").expect("content-type regex"));

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    max_bytes: u64,
    /// puste => dowolny host
    allowed_hosts: Vec<String>,
}

impl Downloader {
    pub fn new(max_bytes: u64, allowed_hosts: Vec<String>) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .user_agent("Tigris-ImageGuard/1.0")
            .connect_timeout(Duration::from_millis(1500))
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| ScanError::download(format!("http client: {e}")))?;
        Ok(Self::with_client(client, max_bytes, allowed_hosts))
    }

    pub fn with_client(client: reqwest::Client, max_bytes: u64, allowed_hosts: Vec<String>) -> Self {
        Self {
            client,
            max_bytes,
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn host_allowed(&self, raw: &str) -> bool {
        let Ok(u) = url::Url::parse(raw) else {
            return false;
        };
        if !matches!(u.scheme(), "http" | "https") {
            return false;
        }
        if self.allowed_hosts.is_empty() {
            return true;
        }
        u.host_str()
            .map(|h| h.to_ascii_lowercase())
            .is_some_and(|h| self.allowed_hosts.iter().any(|a| *a == h))
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, ScanError> {
        if !self.host_allowed(url) {
            return Err(ScanError::download(format!("host not allowed: {url}")));
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScanError::download(format!("request failed: {e}")))?;

        // finalny URL po redirectach też musi być na whiteliście
        if !self.host_allowed(resp.url().as_str()) {
            return Err(ScanError::download("redirected to a host that is not allowed"));
        }
        if !resp.status().is_success() {
            return Err(ScanError::download(format!("status {}", resp.status())));
        }

        let is_image = {
            let ct = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            matches!(ct, Some(v) if CT_IMAGE_RE.is_match(v))
        };
        if !is_image {
            return Err(ScanError::download("response is not an image"));
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_bytes {
                return Err(ScanError::download(format!(
                    "image too large ({len} > {} bytes)",
                    self.max_bytes
                )));
            }
        }

        let mut stream = resp.bytes_stream();
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ScanError::download(format!("body: {e}")))?;
            if (bytes.len() as u64) + (chunk.len() as u64) > self.max_bytes {
                return Err(ScanError::download(format!(
                    "image exceeds {} bytes",
                    self.max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}
