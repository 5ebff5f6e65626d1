//! HTTPS implementation of [`WebApi`] over reqwest.

use crate::auth::TokenProvider;
use crate::client::api::WebApi;
use crate::client::request::{ApiRequest, ApiResponse};
use crate::client::retry::{parse_retry_after, with_rate_limit_retry, Attempt, RetryPolicy};
use crate::error::ProvisionError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const API_VERSION_PATH: &str = "api/data/v9.2";

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
    odata: bool,
}

impl RestClient {
    /// Client for an environment's Dataverse Web API (`{env}/api/data/v9.2`).
    pub fn dataverse(environment_url: &str, tokens: Arc<dyn TokenProvider>) -> Result<Self, ProvisionError> {
        let base = format!("{}/{}", environment_url.trim_end_matches('/'), API_VERSION_PATH);
        let mut client = Self::new(&base, tokens)?;
        client.odata = true;
        Ok(client)
    }

    /// Plain JSON REST client (Graph, Key Vault).
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            retry: RetryPolicy::default(),
            odata: false,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Acquire a token up front so credential problems surface before any step runs.
    pub async fn authenticate(&self) -> Result<(), ProvisionError> {
        self.tokens.token().await.map(|_| ())
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        if self.odata {
            headers.insert("OData-MaxVersion", HeaderValue::from_static("4.0"));
            headers.insert("OData-Version", HeaderValue::from_static("4.0"));
            headers.insert("Prefer", HeaderValue::from_static("odata.include-annotations=*"));
        }
        headers
    }

    async fn send_once(&self, request: &ApiRequest, url: &str) -> Result<Attempt<ApiResponse>, ProvisionError> {
        let token = self.tokens.token().await?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(self.default_headers())
            .bearer_auth(token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(solution) = &request.solution {
            builder = builder.header("MSCRM.SolutionUniqueName", solution.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        debug!(method = %request.method, path = %request.path, "request");
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok());
            return Ok(Attempt::Throttled(parse_retry_after(after)));
        }
        let entity_id = response
            .headers()
            .get("OData-EntityId")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
        };
        debug!(status = status.as_u16(), path = %request.path, "response");
        Ok(Attempt::Done(ApiResponse {
            status: status.as_u16(),
            entity_id,
            body,
        }))
    }
}

#[async_trait]
impl WebApi for RestClient {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ProvisionError> {
        let url = self.url(&request.path);
        with_rate_limit_retry(&self.retry, &request.path, || self.send_once(&request, &url)).await
    }
}
