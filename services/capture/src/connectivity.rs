//! Network reachability checks ahead of each upload.

use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("Invalid upload URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// Reports whether the upload server is reachable right now.
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// TCP connect probe against the upload server.
#[derive(Debug, Clone)]
pub struct ServerProbe {
    address: String,
    timeout: Duration,
}

impl ServerProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// Probe the host and port an upload URL points at.
    pub fn for_url(upload_url: &str, timeout: Duration) -> Result<Self, ConnectivityError> {
        let invalid = |message: &str| ConnectivityError::InvalidUrl {
            url: upload_url.to_string(),
            message: message.to_string(),
        };

        let url = Url::parse(upload_url).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;

        Ok(Self::new(format!("{host}:{port}"), timeout))
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connectivity for ServerProbe {
    async fn is_connected(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(address = %self.address, error = %e, "Probe connect failed");
                false
            }
            Err(_) => {
                debug!(address = %self.address, timeout = ?self.timeout, "Probe timed out");
                false
            }
        }
    }
}

/// Always reports a live link.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnected;

#[async_trait]
impl Connectivity for AlwaysConnected {
    async fn is_connected(&self) -> bool {
        true
    }
}
