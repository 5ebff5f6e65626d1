//! Connection settings and token-provider construction.

use crate::auth::{scope_for, ClientCredentials, DeviceCodeLogin, TokenProvider};
use crate::client::rest::RestClient;
use crate::error::{ConfigError, ProvisionError};
use std::sync::Arc;

pub const ENV_TENANT_ID: &str = "ELM_TENANT_ID";
pub const ENV_CLIENT_ID: &str = "ELM_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "ELM_CLIENT_SECRET";
pub const ENV_ENVIRONMENT_URL: &str = "ELM_ENVIRONMENT_URL";

#[derive(Clone, Default)]
pub struct ConnectionSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub environment_url: Option<String>,
    /// Device-code sign-in instead of client credentials.
    pub interactive: bool,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("environment_url", &self.environment_url)
            .field("interactive", &self.interactive)
            .finish()
    }
}

impl ConnectionSettings {
    pub fn tenant(&self) -> Result<&str, ConfigError> {
        required(&self.tenant_id, "tenant id", ENV_TENANT_ID)
    }

    /// Environment URL without a trailing slash.
    pub fn environment(&self) -> Result<&str, ConfigError> {
        let url = required(&self.environment_url, "environment URL", ENV_ENVIRONMENT_URL)?;
        if !url.starts_with("https://") {
            return Err(ConfigError::Validation(format!("environment URL must use https: {}", url)));
        }
        Ok(url.trim_end_matches('/'))
    }

    /// Token provider for `resource` (e.g. the environment URL or Microsoft Graph).
    pub fn token_provider(&self, resource: &str) -> Result<Arc<dyn TokenProvider>, ProvisionError> {
        let tenant = self.tenant()?;
        let scope = scope_for(resource);
        if self.interactive {
            return Ok(Arc::new(DeviceCodeLogin::new(tenant, self.client_id.as_deref(), scope)?));
        }
        let client_id = required(&self.client_id, "client id", ENV_CLIENT_ID)?;
        let secret = self.client_secret.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| {
            ProvisionError::Auth(format!(
                "client secret required: set {} or use interactive sign-in",
                ENV_CLIENT_SECRET
            ))
        })?;
        Ok(Arc::new(ClientCredentials::new(tenant, client_id, secret, scope)?))
    }

    pub fn dataverse_client(&self) -> Result<RestClient, ProvisionError> {
        let environment = self.environment()?;
        RestClient::dataverse(environment, self.token_provider(environment)?)
    }
}

fn required<'a>(value: &'a Option<String>, what: &str, env: &str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Validation(format!("{} is required (flag or {})", what, env)))
}
