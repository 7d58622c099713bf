//! HTTP client setup and remote size queries

use crate::error::DownloadError;
use reqwest::{Certificate, Client, StatusCode};
use splitfetch_types::TransferConfig;
use tracing::{info, warn};

/// Attempts made to learn the remote size before falling back to one connection
pub const SIZE_QUERY_ATTEMPTS: u32 = 2;

/// Build the client shared by every request of a job
pub fn build_client(config: &TransferConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(concat!("splitfetch/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout());

    if let Some(path) = &config.ca_bundle {
        let pem = std::fs::read(path)?;
        let certificate = Certificate::from_pem(&pem).map_err(|e| {
            DownloadError::Config(format!("invalid CA bundle {}: {}", path.display(), e))
        })?;
        builder = builder.add_root_certificate(certificate);
    }

    Ok(builder.build()?)
}

/// Ask the server for the size of `url` with a HEAD request
pub async fn query_remote_size(client: &Client, url: &str) -> Result<i64, DownloadError> {
    let response = client.head(url).send().await?;

    if response.status() != StatusCode::OK {
        return Err(DownloadError::SizeQuery(format!(
            "HEAD returned status {}",
            response.status().as_u16()
        )));
    }

    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| DownloadError::SizeQuery("no Content-Length in response".to_string()))
}

/// Query the remote size, retrying once. `None` means the size is unknown.
pub async fn probe_size(client: &Client, url: &str) -> Option<i64> {
    for attempt in 1..=SIZE_QUERY_ATTEMPTS {
        match query_remote_size(client, url).await {
            Ok(size) if size > 0 => {
                info!("Remote size of {}: {} bytes", url, size);
                return Some(size);
            }
            Ok(size) => {
                warn!("Remote size of {} reported as {}, treating as unknown", url, size);
                return None;
            }
            Err(e) => warn!("Size query {}/{} failed: {}", attempt, SIZE_QUERY_ATTEMPTS, e),
        }
    }

    warn!("Size of {} unknown, using a single connection", url);
    None
}
