// src/transfer/http.rs

//! HTTP(S) fetcher backed by a blocking reqwest client

use super::{CONNECT_TIMEOUT, Fetcher, READ_TIMEOUT};
use crate::error::{Error, Result, TransferFailure};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::io::Read;
use tracing::debug;

/// Fetches paths relative to a fixed server base URL
pub struct HttpFetcher {
    client: Client,
    base_url: String,
}

impl HttpFetcher {
    /// Create a fetcher for the given base URL
    ///
    /// The blocking client applies `READ_TIMEOUT` to every read of the
    /// response body, so a stalled transfer fails instead of hanging.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Full URL for a server-relative path
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let url = self.url_for(path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::transfer(&url, classify(&e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::transfer(&url, TransferFailure::NotFound));
        }
        if !status.is_success() {
            return Err(Error::transfer(&url, TransferFailure::Status(status.as_u16())));
        }

        Ok(Box::new(response))
    }

    fn describe(&self, path: &str) -> String {
        self.url_for(path)
    }
}

fn classify(e: &reqwest::Error) -> TransferFailure {
    if e.is_timeout() {
        TransferFailure::Timeout
    } else {
        TransferFailure::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_joins_single_slash() {
        let fetcher = HttpFetcher::new("https://updates.example.com/builds/").unwrap();
        assert_eq!(
            fetcher.url_for("marlin"),
            "https://updates.example.com/builds/marlin"
        );
        assert_eq!(
            fetcher.url_for("/marlin-ota_update-42.zip"),
            "https://updates.example.com/builds/marlin-ota_update-42.zip"
        );
    }

    #[test]
    fn test_unreachable_server_is_transfer_error() {
        // Port 9 (discard) on localhost is refused on any sane test host
        let fetcher = HttpFetcher::new("http://127.0.0.1:9").unwrap();
        let result = fetcher.fetch("marlin");
        assert!(matches!(result, Err(Error::Transfer { .. })));
    }
}
