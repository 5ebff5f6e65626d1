//! Service principal registration: Entra ID application, client secret, Key Vault storage.

use crate::client::api::WebApi;
use crate::client::request::{quote, ApiRequest};
use crate::error::ProvisionError;
use chrono::{Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const GRAPH_RESOURCE: &str = "https://graph.microsoft.com";
pub const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
const KEY_VAULT_API_VERSION: &str = "7.4";
const SECRET_DISPLAY_NAME: &str = "Provisioning Secret";

pub fn vault_url(vault_name: &str) -> String {
    format!("https://{}.vault.azure.net", vault_name)
}

#[derive(Clone, Debug)]
pub struct RegistrationOptions {
    pub app_name: String,
    pub secret_name: String,
    pub expiry_days: i64,
    /// Add a new secret to an application that already exists.
    pub rotate_secret: bool,
    pub dry_run: bool,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            app_name: "ELM-Provisioning-ServicePrincipal".into(),
            secret_name: "ELM-ServicePrincipal-Secret".into(),
            expiry_days: 90,
            rotate_secret: false,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub app_name: String,
    /// Application (client) id; `None` when a dry run would create the application.
    pub app_id: Option<String>,
    pub object_id: Option<String>,
    pub app_created: bool,
    pub secret_key_id: Option<String>,
    pub secret_expires: Option<String>,
    pub secret_stored: bool,
    pub secret_version: Option<String>,
}

/// Find or create the application, then create and store a secret when it is new or rotated.
pub async fn register_service_principal(
    graph: &dyn WebApi,
    vault: &dyn WebApi,
    options: &RegistrationOptions,
) -> Result<Registration, ProvisionError> {
    let mut registration = Registration {
        app_name: options.app_name.clone(),
        ..Default::default()
    };

    let existing = graph
        .get_by_filter(
            "applications",
            &format!("displayName eq {}", quote(&options.app_name)),
            &["id", "appId", "displayName"],
        )
        .await?;
    let app = match existing {
        Some(app) => {
            info!(app = %options.app_name, "application already exists");
            Some(app)
        }
        None if options.dry_run => {
            info!(app = %options.app_name, "would create application");
            None
        }
        None => {
            let created = graph
                .request(ApiRequest::post(
                    "applications",
                    json!({
                        "displayName": options.app_name,
                        "signInAudience": "AzureADMyOrg",
                        "requiredResourceAccess": [],
                    }),
                ))
                .await?
                .body
                .ok_or_else(|| ProvisionError::UnexpectedResponse("application create returned no body".into()))?;
            registration.app_created = true;
            Some(created)
        }
    };
    if let Some(app) = &app {
        registration.app_id = field(app, "appId");
        registration.object_id = field(app, "id");
        info!(app_id = ?registration.app_id, object_id = ?registration.object_id, "application ready");
    }

    if !registration.app_created && app.is_some() && !options.rotate_secret {
        info!("existing application keeps its current secret; pass rotate to add a new one");
        return Ok(registration);
    }
    if options.dry_run {
        info!(expiry_days = options.expiry_days, secret = %options.secret_name, "would create and store client secret");
        return Ok(registration);
    }
    let object_id = registration
        .object_id
        .clone()
        .ok_or_else(|| ProvisionError::UnexpectedResponse("application has no object id".into()))?;

    let end = (Utc::now() + Duration::days(options.expiry_days)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let secret = graph
        .action(
            &format!("applications/{}/addPassword", object_id),
            json!({ "passwordCredential": { "displayName": SECRET_DISPLAY_NAME, "endDateTime": end } }),
        )
        .await?
        .ok_or_else(|| ProvisionError::UnexpectedResponse("addPassword returned no body".into()))?;
    let secret_text = field(&secret, "secretText")
        .ok_or_else(|| ProvisionError::UnexpectedResponse("addPassword returned no secretText".into()))?;
    registration.secret_key_id = field(&secret, "keyId");
    registration.secret_expires = field(&secret, "endDateTime");
    info!(key_id = ?registration.secret_key_id, expires = ?registration.secret_expires, "client secret created");

    let stored = vault
        .request(
            ApiRequest::put(
                format!("secrets/{}", options.secret_name),
                json!({ "value": secret_text, "contentType": "client-secret" }),
            )
            .param("api-version", KEY_VAULT_API_VERSION),
        )
        .await?;
    registration.secret_stored = true;
    registration.secret_version = stored
        .body
        .as_ref()
        .and_then(|b| b.get("id"))
        .and_then(Value::as_str)
        .and_then(|id| id.rsplit('/').next())
        .map(str::to_string);
    info!(secret = %options.secret_name, version = ?registration.secret_version, "secret stored in key vault");
    Ok(registration)
}

fn field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}
