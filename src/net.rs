//! Network transfers.
//!
//! The backend only ever needs two things from the network: a small text
//! document (the snapshot index) and a large binary download (the snapshot
//! archive). Both go through [`Transport`] so tests can count and fake them.

use anyhow::Result;
use std::io::{self, Write};
use std::time::Duration;
use tracing::debug;

use crate::error::BackendError;

pub trait Transport: Send + Sync {
    /// GET a text document.
    fn fetch_text(&self, url: &str) -> Result<String>;

    /// GET a binary resource, streaming it into `dest`. Returns bytes written.
    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64>;
}

/// Blocking HTTPS transport.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new() -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(Duration::from_secs(30)))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn network_error(url: &str, detail: impl ToString) -> anyhow::Error {
    BackendError::Network {
        url: url.to_string(),
        detail: detail.to_string(),
    }
    .into()
}

impl Transport for HttpTransport {
    fn fetch_text(&self, url: &str) -> Result<String> {
        debug!("GET {}", url);
        let mut response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| network_error(url, e))?;
        response
            .body_mut()
            .read_to_string()
            .map_err(|e| network_error(url, e))
    }

    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        debug!("GET {}", url);
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| network_error(url, e))?;
        let mut reader = response.into_body().into_reader();
        io::copy(&mut reader, dest).map_err(|e| network_error(url, e))
    }
}

/// Join a mirror base URL and a path, collapsing duplicate slashes at the seam.
pub fn join_mirror(mirror: &str, path: &str) -> String {
    format!(
        "{}/{}",
        mirror.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
