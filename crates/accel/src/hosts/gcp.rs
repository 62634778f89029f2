//! GCE instance metadata host environment.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::HostEnv;
use crate::error::AccelResult;

/// Base URL of the GCE instance metadata service.
const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Timeout for metadata requests.
const METADATA_TIMEOUT_SECS: u64 = 10;

/// Host environment backed by the GCE metadata server.
pub struct GcpEnv {
    client: Client,
    base_url: String,
}

impl GcpEnv {
    /// Environment talking to the real metadata service.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> AccelResult<Self> {
        Self::with_base_url(DEFAULT_METADATA_URL)
    }

    /// Environment with a custom metadata endpoint.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_base_url(base_url: impl Into<String>) -> AccelResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(METADATA_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Fetch one metadata value.
    async fn metadata(&self, path: &str) -> AccelResult<String> {
        let url = format!("{}/{path}", self.base_url);
        debug!(url = %url, "Querying instance metadata");

        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?;

        Ok(response.text().await?.trim().to_string())
    }
}

#[async_trait]
impl HostEnv for GcpEnv {
    fn provider(&self) -> &'static str {
        "gcp"
    }

    async fn host_name(&self) -> AccelResult<String> {
        self.metadata("instance/name").await
    }

    async fn zone(&self) -> AccelResult<Option<String>> {
        // The service reports `projects/<id>/zones/<zone>`; only the leaf
        // matters for provider commands.
        let raw = self.metadata("instance/zone").await?;
        let leaf = raw.rsplit('/').next().unwrap_or(&raw).to_string();
        Ok(Some(leaf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_host_name_from_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/name"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_string("host1\n"))
            .mount(&server)
            .await;

        let env = GcpEnv::with_base_url(server.uri()).unwrap();
        assert_eq!(env.host_name().await.unwrap(), "host1");
    }

    #[tokio::test]
    async fn test_zone_keeps_only_leaf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/zone"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("projects/123456/zones/us-central1-b"),
            )
            .mount(&server)
            .await;

        let env = GcpEnv::with_base_url(server.uri()).unwrap();
        assert_eq!(env.zone().await.unwrap().as_deref(), Some("us-central1-b"));
    }

    #[tokio::test]
    async fn test_metadata_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instance/name"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let env = GcpEnv::with_base_url(server.uri()).unwrap();
        assert!(env.host_name().await.is_err());
    }
}
