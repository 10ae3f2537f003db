/*
[INPUT]:  HTTP configuration (base URL, timeouts, content type) and an optional authenticator
[OUTPUT]: Typed JSON responses from the gateway backend
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing client behavior
*/

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::auth::RequestAuthenticator;
use super::error::{GatewayError, Result};

/// Default gateway base URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Declared content type; also the content of every auth event
    pub content_type: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            content_type: "application/json".to_string(),
        }
    }
}

/// HTTP client for the gateway backend
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http_client: Client,
    base_url: Url,
    config: ClientConfig,
    authenticator: Option<Arc<RequestAuthenticator>>,
}

impl GatewayClient {
    /// Create a new client with default configuration
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_config_and_base_url(ClientConfig::default(), base_url)
    }

    /// Create a new client with custom configuration against the default base URL
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        Self::with_config_and_base_url(config, DEFAULT_BASE_URL)
    }

    pub fn with_config_and_base_url(config: ClientConfig, base_url: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: Url::parse(base_url)?,
            config,
            authenticator: None,
        })
    }

    pub fn with_authenticator(mut self, authenticator: Arc<RequestAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn authenticator(&self) -> Option<&Arc<RequestAuthenticator>> {
        self.authenticator.as_ref()
    }

    /// Build full URL for an endpoint
    pub fn url(&self, endpoint: &str) -> Result<Url> {
        Ok(self.base_url.join(endpoint)?)
    }

    /// Authenticated GET
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        self.execute(Method::GET, endpoint, None, true).await
    }

    /// GET without an Authorization header
    pub async fn get_public<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        self.execute(Method::GET, endpoint, None, false).await
    }

    pub async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::POST, endpoint, Some(body)).await
    }

    /// Authenticated request with an optional JSON body
    pub async fn send_json<B, T>(&self, method: Method, endpoint: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = body.map(serde_json::to_string).transpose()?;
        self.execute(method, endpoint, body, true).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<String>,
        authenticate: bool,
    ) -> Result<T> {
        let url = self.url(endpoint)?;
        let authenticator = self.authenticator.as_ref().filter(|_| authenticate);

        let mut builder = self.http_client.request(method.clone(), url.clone());
        let mut generation = None;
        if let Some(authenticator) = authenticator {
            // unsigned requests still carry the identity they were sent under
            let observed = authenticator.identity().generation();
            generation = match authenticator
                .authorize(&url, &method, &self.config.content_type)
                .await?
            {
                Some(header) => {
                    builder = builder.header(AUTHORIZATION, header.value);
                    Some(header.generation)
                }
                None => Some(observed),
            };
        }
        if let Some(body) = body {
            builder = builder
                .header(CONTENT_TYPE, self.config.content_type.as_str())
                .body(body);
        }

        debug!(method = %method, url = %url, "sending request");
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            warn!(method = %method, url = %url, "request rejected with 401");
            if let Some(authenticator) = authenticator {
                authenticator.handle_rejection(generation);
            }
            return Err(GatewayError::api_error(status, text));
        }
        if !status.is_success() {
            return Err(GatewayError::api_error(status, text));
        }

        serde_json::from_str(&text).map_err(|e| {
            GatewayError::InvalidResponse(format!("{method} {url}: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let client = GatewayClient::new("https://gateway.example").unwrap();
        assert_eq!(
            client.url("/api/mints").unwrap().as_str(),
            "https://gateway.example/api/mints"
        );
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            GatewayClient::new("not a url"),
            Err(GatewayError::UrlParse(_))
        ));
    }

    #[test]
    fn test_default_content_type() {
        assert_eq!(ClientConfig::default().content_type, "application/json");
    }
}
