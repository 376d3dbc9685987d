use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, trace};

use super::{ByteFetcher, FetchRequest, FetchResponse};
use crate::config::HttpConfig;
use crate::error::{IngestError, Result};

/// Build the shared `reqwest` client from the HTTP configuration.
pub fn create_client(config: &HttpConfig) -> Result<Client> {
    let redirect = if config.follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };
    Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .redirect(redirect)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build()
        .map_err(|e| IngestError::internal(format!("failed to build HTTP client: {e}")))
}

/// [`ByteFetcher`] over a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpByteFetcher {
    client: Client,
}

impl HttpByteFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &HttpConfig) -> Result<Self> {
        Ok(Self::new(create_client(config)?))
    }
}

#[async_trait]
impl ByteFetcher for HttpByteFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(range) = &request.range {
            builder = builder.header(reqwest::header::RANGE, range.header_value());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| IngestError::from_transport(&e, request.url.as_str(), false))?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %request.url, %status, "Request rejected");
            return Err(IngestError::http_status(status, request.url.as_str()));
        }

        trace!(
            url = %request.url,
            http_version = ?response.version(),
            content_length = ?response.content_length(),
            "Response headers received"
        );

        let final_url = response.url().clone();
        let content_length = response.content_length();
        let url = request.url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| IngestError::from_transport(&e, &url, true)))
            .boxed();

        Ok(FetchResponse {
            status,
            content_length,
            final_url,
            body,
        })
    }
}
