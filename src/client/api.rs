//! The `WebApi` seam: one transport method plus the query helpers every step builds on.

use crate::client::request::{ApiRequest, ApiResponse};
use crate::error::ProvisionError;
use async_trait::async_trait;
use serde_json::Value;

const MAX_ERROR_BODY: usize = 500;

/// How an existing resource is found by its natural key.
#[derive(Clone, Debug)]
pub enum Lookup {
    /// Keyed GET where 404 means absent.
    Keyed(String),
    /// First row of a data collection matching a filter.
    Filter { collection: &'static str, filter: String },
    /// First row of a metadata collection; 404 on the parent means absent.
    Metadata { collection: String, filter: String },
}

#[async_trait]
pub trait WebApi: Send + Sync {
    /// Send one request. Non-success statuses come back as responses, not errors.
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ProvisionError>;

    /// Send and require a 2xx status.
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ProvisionError> {
        let method = request.method.to_string();
        let path = request.path.clone();
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(http_error(method, path, &response))
        }
    }

    /// Keyed GET; 404 means absent.
    async fn get_optional(&self, path: &str) -> Result<Option<Value>, ProvisionError> {
        let response = self.send(ApiRequest::get(path)).await?;
        match response.status {
            404 => Ok(None),
            _ if response.is_success() => Ok(response.body),
            _ => Err(http_error("GET".into(), path.to_string(), &response)),
        }
    }

    /// First record matching `filter`, if any.
    async fn get_by_filter(
        &self,
        collection: &str,
        filter: &str,
        select: &[&str],
    ) -> Result<Option<Value>, ProvisionError> {
        let request = ApiRequest::get(collection).filter(filter).select(select).top(1);
        let response = self.request(request).await?;
        Ok(first_value(response.body))
    }

    /// The existing resource `lookup` names, if any.
    async fn find(&self, lookup: &Lookup) -> Result<Option<Value>, ProvisionError> {
        match lookup {
            Lookup::Keyed(path) => self.get_optional(path).await,
            Lookup::Filter { collection, filter } => self.get_by_filter(collection, filter, &[]).await,
            Lookup::Metadata { collection, filter } => {
                let response = self.send(ApiRequest::get(collection.as_str()).filter(filter.as_str())).await?;
                if response.status == 404 {
                    return Ok(None);
                }
                if !response.is_success() {
                    return Err(http_error("GET".into(), collection.clone(), &response));
                }
                Ok(first_value(response.body))
            }
        }
    }

    /// Collection query following `@odata.nextLink` until exhausted.
    async fn query(&self, request: ApiRequest) -> Result<Vec<Value>, ProvisionError> {
        let mut records = Vec::new();
        let mut next = Some(request);
        while let Some(request) = next.take() {
            let response = self.request(request).await?;
            let Some(mut body) = response.body else {
                break;
            };
            if let Some(Value::Array(page)) = body.get_mut("value").map(Value::take) {
                records.extend(page);
            }
            if let Some(link) = body.get("@odata.nextLink").and_then(Value::as_str) {
                next = Some(ApiRequest::get(link));
            }
        }
        Ok(records)
    }

    /// POST a new record; returns the created id when the platform reports one.
    async fn create(&self, request: ApiRequest, id_field: &str) -> Result<Option<String>, ProvisionError> {
        let response = self.request(request).await?;
        Ok(response.created_id(id_field))
    }

    async fn update(&self, path: &str, body: Value) -> Result<(), ProvisionError> {
        self.request(ApiRequest::patch(path, body)).await.map(|_| ())
    }

    /// Invoke a bound or unbound action; returns the response body if any.
    async fn action(&self, path: &str, body: Value) -> Result<Option<Value>, ProvisionError> {
        let response = self.request(ApiRequest::post(path, body)).await?;
        Ok(response.body)
    }
}

pub fn http_error(method: String, path: String, response: &ApiResponse) -> ProvisionError {
    let mut body = response.body_text();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    ProvisionError::Http {
        method,
        path,
        status: response.status,
        body,
    }
}

fn first_value(body: Option<Value>) -> Option<Value> {
    let mut body = body?;
    match body.get_mut("value").map(Value::take) {
        Some(Value::Array(mut records)) if !records.is_empty() => Some(records.swap_remove(0)),
        _ => None,
    }
}

/// Organization name, used as a connectivity check.
pub async fn organization_name(api: &dyn WebApi) -> Result<String, ProvisionError> {
    let response = api
        .request(ApiRequest::get("organizations").select(&["name"]).top(1))
        .await?;
    first_value(response.body)
        .and_then(|org| org.get("name").and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| ProvisionError::UnexpectedResponse("organizations returned no rows".into()))
}

/// Root business unit id (the one without a parent).
pub async fn root_business_unit(api: &dyn WebApi) -> Result<String, ProvisionError> {
    api.get_by_filter(
        "businessunits",
        "_parentbusinessunitid_value eq null",
        &["businessunitid", "name"],
    )
    .await?
    .and_then(|bu| bu.get("businessunitid").and_then(Value::as_str).map(str::to_string))
    .ok_or(ProvisionError::MissingPrerequisite {
        kind: "business unit",
        name: "root".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves canned pages in order.
    struct Pages(Mutex<Vec<ApiResponse>>, Mutex<Vec<String>>);

    #[async_trait]
    impl WebApi for Pages {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ProvisionError> {
            self.1.lock().unwrap().push(request.path.clone());
            Ok(self.0.lock().unwrap().remove(0))
        }
    }

    fn ok(body: Value) -> ApiResponse {
        ApiResponse {
            status: 200,
            entity_id: None,
            body: Some(body),
        }
    }

    #[tokio::test]
    async fn query_follows_next_link() {
        let api = Pages(
            Mutex::new(vec![
                ok(json!({"value": [{"n": 1}, {"n": 2}], "@odata.nextLink": "https://org/api/data/v9.2/audits?$skiptoken=2"})),
                ok(json!({"value": [{"n": 3}]})),
            ]),
            Mutex::new(Vec::new()),
        );
        let records = api.query(ApiRequest::get("audits")).await.unwrap();
        assert_eq!(records.len(), 3);
        let paths = api.1.lock().unwrap().clone();
        assert_eq!(paths, vec!["audits", "https://org/api/data/v9.2/audits?$skiptoken=2"]);
    }

    #[tokio::test]
    async fn keyed_get_maps_404_to_absent() {
        let api = Pages(
            Mutex::new(vec![ApiResponse {
                status: 404,
                ..Default::default()
            }]),
            Mutex::new(Vec::new()),
        );
        assert!(api
            .get_optional("EntityDefinitions(LogicalName='x')")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn non_success_becomes_http_error_with_truncated_body() {
        let api = Pages(
            Mutex::new(vec![ApiResponse {
                status: 400,
                entity_id: None,
                body: Some(Value::String("x".repeat(2_000))),
            }]),
            Mutex::new(Vec::new()),
        );
        match api.request(ApiRequest::post("roles", json!({}))).await {
            Err(ProvisionError::Http { status, body, method, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(method, "POST");
                assert!(body.len() <= MAX_ERROR_BODY + 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn metadata_lookup_treats_missing_parent_as_absent() {
        let api = Pages(
            Mutex::new(vec![
                ApiResponse {
                    status: 404,
                    ..Default::default()
                },
                ok(json!({"value": [{"LogicalName": "mcg_messagecenteridkey"}]})),
                ApiResponse {
                    status: 500,
                    ..Default::default()
                },
            ]),
            Mutex::new(Vec::new()),
        );
        let lookup = Lookup::Metadata {
            collection: "EntityDefinitions(LogicalName='mcg_messagecenterpost')/Keys".into(),
            filter: "LogicalName eq 'mcg_messagecenteridkey'".into(),
        };
        assert!(api.find(&lookup).await.unwrap().is_none());
        let found = api.find(&lookup).await.unwrap().unwrap();
        assert_eq!(found["LogicalName"], "mcg_messagecenteridkey");
        assert!(matches!(api.find(&lookup).await, Err(ProvisionError::Http { status: 500, .. })));
    }
}
