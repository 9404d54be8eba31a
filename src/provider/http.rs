//! Generic JSON REST provider adapter.
//!
//! Talks to a provider gateway exposing resources under
//! `{endpoint}/accounts/{account}/regions/{region}/resources`.

use async_trait::async_trait;
use reqwest::{Client, Method, NoProxy, Proxy, Response, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ProxySettings;
use crate::error::{ControlPlaneError, ProviderError, Result};
use crate::state::ScopeRef;

use super::{CreateSpec, ExternalObservation, ProviderAdapter};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Fallback when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// REST adapter over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpProviderAdapter {
    /// HTTP client.
    client: Client,
    /// Gateway base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    api_key: String,
    /// Base retry delay.
    retry_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    external_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl HttpProviderAdapter {
    /// Creates an adapter with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        Self::with_timeout(endpoint, api_key, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates an adapter with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        Self::with_options(endpoint, api_key, timeout_secs, &ProxySettings::default())
    }

    /// Creates an adapter that reaches the gateway through `proxy`.
    ///
    /// Hosts matched by `no_proxy` are contacted directly.
    ///
    /// # Errors
    ///
    /// Returns an error if a proxy URL is invalid or the HTTP client cannot
    /// be created.
    pub fn with_options(
        endpoint: &str,
        api_key: &str,
        timeout_secs: u64,
        proxy: &ProxySettings,
    ) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(timeout_secs));
        let bypass = proxy.no_proxy.as_deref();
        if let Some(url) = &proxy.http_proxy {
            debug!("Routing http gateway traffic through {url}");
            let p = Proxy::http(url)
                .map_err(|e| ProviderError::network(format!("Invalid http proxy {url}: {e}")))?;
            builder = builder.proxy(p.no_proxy(bypass.and_then(NoProxy::from_string)));
        }
        if let Some(url) = &proxy.https_proxy {
            debug!("Routing https gateway traffic through {url}");
            let p = Proxy::https(url)
                .map_err(|e| ProviderError::network(format!("Invalid https proxy {url}: {e}")))?;
            builder = builder.proxy(p.no_proxy(bypass.and_then(NoProxy::from_string)));
        }
        let client = builder
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Overrides the base retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn resources_url(&self, scope: &ScopeRef) -> String {
        format!(
            "{}/accounts/{}/regions/{}/resources",
            self.endpoint, scope.account, scope.region
        )
    }

    /// Sends a request with retries on retryable failures.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {url}");
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            match self.send_once(method.clone(), url, body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::network("Max retries exceeded").into()))
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response),
            401 | 403 => Err(ProviderError::AuthenticationFailed {
                message: String::from("Invalid API key"),
            }
            .into()),
            404 => Err(ProviderError::NotFound {
                external_id: url.rsplit('/').next().unwrap_or_default().to_string(),
            }
            .into()),
            429 => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                Err(ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                }
                .into())
            }
            400..=499 => Err(ProviderError::rejected(error_message(response).await).into()),
            _ => Err(ProviderError::api_error(status, error_message(response).await).into()),
        }
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        response.json().await.map_err(|e| {
            ControlPlaneError::from(ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            })
        })
    }
}

/// Extracts `{"message": ...}` from an error body, or the raw text.
async fn error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorBody>(&text).map_or(text, |b| b.message)
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn list_remote(&self, scope: &ScopeRef) -> Result<Vec<ExternalObservation>> {
        let response = self
            .send(Method::GET, &self.resources_url(scope), None)
            .await?;
        let observations: Vec<ExternalObservation> = Self::json(response).await?;
        debug!(scope = %scope, count = observations.len(), "Listed remote objects");
        Ok(observations)
    }

    async fn create_remote(&self, scope: &ScopeRef, spec: &CreateSpec) -> Result<String> {
        let body = serde_json::to_value(spec).map_err(|e| {
            ControlPlaneError::internal(format!("Failed to serialize create request: {e}"))
        })?;
        let response = self
            .send(Method::POST, &self.resources_url(scope), Some(&body))
            .await?;
        let created: CreatedResponse = Self::json(response).await?;
        Ok(created.external_id)
    }

    async fn delete_remote(&self, scope: &ScopeRef, external_id: &str) -> Result<()> {
        let url = format!("{}/{external_id}", self.resources_url(scope));
        self.send(Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn refresh(&self, scope: &ScopeRef, external_id: &str) -> Result<ExternalObservation> {
        let url = format!("{}/{external_id}", self.resources_url(scope));
        let response = self.send(Method::GET, &url, None).await?;
        Self::json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ProviderKind, ResourceKind};
    use serde_json::json;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scope() -> ScopeRef {
        ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1")
    }

    fn adapter(server: &MockServer) -> HttpProviderAdapter {
        HttpProviderAdapter::new(&server.uri(), "secret")
            .expect("client")
            .with_retry_delay(Duration::from_millis(5))
    }

    const RESOURCES: &str = "/accounts/acct/regions/us-east-1/resources";

    #[tokio::test]
    async fn test_list_remote_parses_observations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RESOURCES))
            .and(header_eq("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"kind": "network", "external_id": "vpc-1", "name": "main", "status": "available"},
                {"kind": "disk", "external_id": "vol-1", "name": "data", "status": "available", "size_gb": 20}
            ])))
            .mount(&server)
            .await;

        let observed = adapter(&server)
            .list_remote(&scope())
            .await
            .expect("list should succeed");
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[1].kind, ResourceKind::Disk);
        assert_eq!(observed[1].size_gb, Some(20));
    }

    #[tokio::test]
    async fn test_rejection_keeps_provider_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RESOURCES))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "quota exceeded"})),
            )
            .mount(&server)
            .await;

        let spec = CreateSpec {
            kind: ResourceKind::Disk,
            name: String::from("data"),
            size_gb: Some(10),
            storage_type: Some(String::from("gp2")),
            parent_external_id: None,
            tags: Default::default(),
        };
        let err = adapter(&server)
            .create_remote(&scope(), &spec)
            .await
            .expect_err("create should be rejected");
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[tokio::test]
    async fn test_create_returns_external_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RESOURCES))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"external_id": "vol-9"})))
            .mount(&server)
            .await;

        let spec = CreateSpec {
            kind: ResourceKind::Disk,
            name: String::from("data"),
            size_gb: Some(10),
            storage_type: None,
            parent_external_id: None,
            tags: Default::default(),
        };
        let id = adapter(&server)
            .create_remote(&scope(), &spec)
            .await
            .expect("create");
        assert_eq!(id, "vol-9");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried_then_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{RESOURCES}/vol-1")))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .expect(u64::from(MAX_RETRIES))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .refresh(&scope(), "vol-1")
            .await
            .expect_err("should be rate limited");
        assert!(matches!(
            err,
            ControlPlaneError::Provider(ProviderError::RateLimited {
                retry_after_secs: 7
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_object_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(format!("{RESOURCES}/vol-404")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .delete_remote(&scope(), "vol-404")
            .await
            .expect_err("should not be found");
        assert!(matches!(
            err,
            ControlPlaneError::Provider(ProviderError::NotFound { ref external_id }) if external_id == "vol-404"
        ));
    }

    #[tokio::test]
    async fn test_gateway_traffic_goes_through_proxy() {
        let proxy = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&proxy)
            .await;

        let settings = ProxySettings {
            http_proxy: Some(proxy.uri()),
            ..ProxySettings::default()
        };
        let adapter =
            HttpProviderAdapter::with_options("http://gateway.invalid", "secret", 5, &settings)
                .expect("client");
        let observed = adapter.list_remote(&scope()).await.expect("proxied list");
        assert!(observed.is_empty());
    }

    #[tokio::test]
    async fn test_no_proxy_hosts_are_reached_directly() {
        let gateway = MockServer::start().await;
        let proxy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RESOURCES))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&gateway)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(0)
            .mount(&proxy)
            .await;

        let settings = ProxySettings {
            http_proxy: Some(proxy.uri()),
            https_proxy: None,
            no_proxy: Some(String::from("127.0.0.1,localhost")),
        };
        let adapter = HttpProviderAdapter::with_options(&gateway.uri(), "secret", 5, &settings)
            .expect("client");
        adapter.list_remote(&scope()).await.expect("direct list");
    }

    #[test]
    fn test_invalid_proxy_url_is_rejected() {
        let settings = ProxySettings {
            https_proxy: Some(String::from("::not a url::")),
            ..ProxySettings::default()
        };
        assert!(
            HttpProviderAdapter::with_options("https://gateway.internal", "secret", 5, &settings)
                .is_err()
        );
    }
}
