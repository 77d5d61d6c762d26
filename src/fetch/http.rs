use std::time::Duration;

use reqwest::blocking::Client;

use super::Fetch;
use crate::merge::{Provenance, SourceUnavailable};

/// Fetches dumps over plain HTTP GET requests.
///
/// Each rank's address (`host:port`, or a full `http://` URL) is joined with a fixed path, so
/// rank 3 at `10.0.0.4:9090` with the default path is fetched from
/// `http://10.0.0.4:9090/stacks`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    path: String,
}

impl HttpFetcher {
    /// Creates a fetcher that requests `path` on every rank.
    pub fn new<S: Into<String>>(path: S) -> reqwest::Result<Self> {
        let client = Client::builder().build()?;
        Ok(HttpFetcher {
            client,
            path: path.into(),
        })
    }

    fn url_for(&self, address: &str) -> String {
        let address = address.trim_end_matches('/');
        let sep = if self.path.starts_with('/') { "" } else { "/" };
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}{}", address, sep, self.path)
        } else {
            format!("http://{}{}{}", address, sep, self.path)
        }
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, provenance: &Provenance, timeout: Duration) -> Result<String, SourceUnavailable> {
        let address = provenance
            .origin
            .as_deref()
            .ok_or_else(|| SourceUnavailable::Fetch("no address configured".to_string()))?;
        let url = self.url_for(address);
        debug!("Fetching {} from {}", provenance, url);

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                SourceUnavailable::Timeout(timeout)
            } else {
                SourceUnavailable::Fetch(e.to_string())
            }
        };

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .map_err(map_err)?;
        if !response.status().is_success() {
            return Err(SourceUnavailable::Fetch(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }
        response.text().map_err(map_err)
    }
}
