//! Request/response values exchanged with a Web API implementation.

use reqwest::Method;
use serde_json::Value;

#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base (e.g. `roles`), or an absolute `@odata.nextLink`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Sent as `MSCRM.SolutionUniqueName` so created components land in the solution.
    pub solution: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            solution: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).body(body)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn filter(self, filter: impl Into<String>) -> Self {
        self.param("$filter", filter)
    }

    pub fn select(self, fields: &[&str]) -> Self {
        if fields.is_empty() {
            return self;
        }
        self.param("$select", fields.join(","))
    }

    pub fn order_by(self, order: impl Into<String>) -> Self {
        self.param("$orderby", order)
    }

    pub fn top(self, n: usize) -> Self {
        self.param("$top", n.to_string())
    }

    pub fn in_solution(mut self, solution: Option<&str>) -> Self {
        self.solution = solution.map(str::to_string);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ApiResponse {
    pub status: u16,
    /// `OData-EntityId` header of a create response.
    pub entity_id: Option<String>,
    pub body: Option<Value>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Id parsed from the `OData-EntityId` header, falling back to an id-like body field.
    pub fn created_id(&self, id_field: &str) -> Option<String> {
        self.entity_id
            .as_deref()
            .and_then(id_from_entity_url)
            .or_else(|| {
                self.body
                    .as_ref()
                    .and_then(|b| b.get(id_field))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
    }

    pub fn body_text(&self) -> String {
        match &self.body {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Extract the key from `https://org/api/data/v9.2/roles(00000000-...)`.
pub fn id_from_entity_url(url: &str) -> Option<String> {
    let open = url.rfind('(')?;
    let close = url[open..].find(')')? + open;
    let id = url[open + 1..close].trim_matches('\'');
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Quote a string literal for OData (`'` doubled).
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `Collection(Key='value')` path segment.
pub fn keyed(collection: &str, key: &str, value: &str) -> String {
    format!("{}({}={})", collection, key, quote(value))
}

/// `EntityDefinitions(LogicalName='..')`.
pub fn entity_definition(table: &str) -> String {
    keyed("EntityDefinitions", "LogicalName", table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_from_entity_header() {
        assert_eq!(
            id_from_entity_url("https://org.crm.dynamics.com/api/data/v9.2/roles(3f1a5c2e-0000-0000-0000-000000000001)"),
            Some("3f1a5c2e-0000-0000-0000-000000000001".to_string())
        );
        assert_eq!(id_from_entity_url("https://org/api/data/v9.2/roles"), None);
    }

    #[test]
    fn quotes_literals() {
        assert_eq!(quote("O'Brien"), "'O''Brien'");
        assert_eq!(
            keyed("GlobalOptionSetDefinitions", "Name", "fsi_er_zone"),
            "GlobalOptionSetDefinitions(Name='fsi_er_zone')"
        );
    }

    #[test]
    fn builder_collects_query_options() {
        let req = ApiRequest::get("roles")
            .filter("name eq 'ELM Admin'")
            .select(&["roleid", "name"])
            .top(1);
        assert_eq!(req.query_value("$filter"), Some("name eq 'ELM Admin'"));
        assert_eq!(req.query_value("$select"), Some("roleid,name"));
        assert_eq!(req.query_value("$top"), Some("1"));
        assert_eq!(req.query_value("$orderby"), None);
    }
}
