//! Bearer-token acquisition against the identity provider (client credentials or device code).

use crate::error::ProvisionError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

pub const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Public client id used for interactive sign-in when no app registration is supplied.
pub const DEFAULT_PUBLIC_CLIENT_ID: &str = "51f81489-12ee-4a9e-aaae-a2591f45987d";

/// Tokens are refreshed this long before they expire.
const EXPIRY_SKEW: Duration = Duration::from_secs(300);

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, ProvisionError>;
}

/// `.default` scope for a resource, e.g. `https://org.crm.dynamics.com/.default`.
pub fn scope_for(resource: &str) -> String {
    format!("{}/.default", resource.trim_end_matches('/'))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

enum Grant {
    Issued { token: String, lifetime: Duration },
    Rejected { error: String, description: String },
}

fn read_grant(response: TokenResponse) -> Grant {
    match response.access_token {
        Some(token) => Grant::Issued {
            token,
            lifetime: Duration::from_secs(response.expires_in.unwrap_or(3600)),
        },
        None => Grant::Rejected {
            error: response.error.unwrap_or_else(|| "unknown_error".into()),
            description: response.error_description.unwrap_or_default(),
        },
    }
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Default)]
struct TokenCache(Mutex<Option<CachedToken>>);

impl TokenCache {
    async fn get(&self) -> Option<String> {
        let guard = self.0.lock().await;
        guard
            .as_ref()
            .filter(|t| Instant::now() < t.refresh_at)
            .map(|t| t.value.clone())
    }

    async fn put(&self, value: String, lifetime: Duration) {
        let refresh_at = Instant::now() + lifetime.saturating_sub(EXPIRY_SKEW);
        *self.0.lock().await = Some(CachedToken { value, refresh_at });
    }
}

fn http_client() -> Result<reqwest::Client, ProvisionError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(ProvisionError::from)
}

async fn post_token_form(
    http: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, ProvisionError> {
    let response = http.post(url).form(form).send().await?;
    let status = response.status();
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|_| {
        ProvisionError::Auth(format!("identity provider returned HTTP {}: {}", status.as_u16(), text))
    })
}

/// OAuth2 client-credentials grant for a registered application.
pub struct ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: TokenCache,
}

impl ClientCredentials {
    pub fn new(
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
    ) -> Result<Self, ProvisionError> {
        Ok(Self {
            http: http_client()?,
            token_url: format!("{}/{}/oauth2/v2.0/token", AUTHORITY_HOST, tenant_id),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: scope.into(),
            cache: TokenCache::default(),
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentials {
    async fn token(&self) -> Result<String, ProvisionError> {
        if let Some(token) = self.cache.get().await {
            return Ok(token);
        }
        debug!(scope = %self.scope, "requesting client-credentials token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        match read_grant(post_token_form(&self.http, &self.token_url, &form).await?) {
            Grant::Issued { token, lifetime } => {
                self.cache.put(token.clone(), lifetime).await;
                Ok(token)
            }
            Grant::Rejected { error, description } => {
                Err(ProvisionError::Auth(format!("{}: {}", error, description)))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    message: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// Interactive sign-in via the OAuth2 device-code grant.
pub struct DeviceCodeLogin {
    http: reqwest::Client,
    authority: String,
    client_id: String,
    scope: String,
    cache: TokenCache,
}

impl DeviceCodeLogin {
    pub fn new(tenant_id: &str, client_id: Option<&str>, scope: impl Into<String>) -> Result<Self, ProvisionError> {
        Ok(Self {
            http: http_client()?,
            authority: format!("{}/{}/oauth2/v2.0", AUTHORITY_HOST, tenant_id),
            client_id: client_id.unwrap_or(DEFAULT_PUBLIC_CLIENT_ID).to_string(),
            scope: scope.into(),
            cache: TokenCache::default(),
        })
    }

    async fn sign_in(&self) -> Result<(String, Duration), ProvisionError> {
        let url = format!("{}/devicecode", self.authority);
        let response = self
            .http
            .post(&url)
            .form(&[("client_id", self.client_id.as_str()), ("scope", self.scope.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Auth(format!("device code request failed ({}): {}", status, body)));
        }
        let code: DeviceCodeResponse = response.json().await?;
        eprintln!("{}", code.message);

        let token_url = format!("{}/token", self.authority);
        let deadline = Instant::now() + Duration::from_secs(code.expires_in);
        let mut interval = Duration::from_secs(code.interval);
        while Instant::now() < deadline {
            sleep(interval).await;
            let form = [
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.client_id.as_str()),
                ("device_code", code.device_code.as_str()),
            ];
            match read_grant(post_token_form(&self.http, &token_url, &form).await?) {
                Grant::Issued { token, lifetime } => {
                    info!("interactive sign-in complete");
                    return Ok((token, lifetime));
                }
                Grant::Rejected { error, .. } if error == "authorization_pending" => {}
                Grant::Rejected { error, .. } if error == "slow_down" => {
                    interval += Duration::from_secs(5);
                }
                Grant::Rejected { error, description } => {
                    return Err(ProvisionError::Auth(format!("{}: {}", error, description)));
                }
            }
        }
        Err(ProvisionError::Auth("device code expired before sign-in completed".into()))
    }
}

#[async_trait]
impl TokenProvider for DeviceCodeLogin {
    async fn token(&self) -> Result<String, ProvisionError> {
        if let Some(token) = self.cache.get().await {
            return Ok(token);
        }
        let (token, lifetime) = self.sign_in().await?;
        self.cache.put(token.clone(), lifetime).await;
        Ok(token)
    }
}

/// A token obtained elsewhere.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, ProvisionError> {
        Ok(self.0.clone())
    }
}
