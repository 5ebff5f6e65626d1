//! In-memory environment answering the subset of the Web API the provisioning steps use.

use crate::client::api::WebApi;
use crate::client::request::{id_from_entity_url, ApiRequest, ApiResponse};
use crate::config::PrivilegeOp;
use crate::error::ProvisionError;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

const BASE: &str = "https://contoso.crm.dynamics.com/api/data/v9.2";
const ALL_OPS: [PrivilegeOp; 8] = [
    PrivilegeOp::Create,
    PrivilegeOp::Read,
    PrivilegeOp::Write,
    PrivilegeOp::Delete,
    PrivilegeOp::Append,
    PrivilegeOp::AppendTo,
    PrivilegeOp::Assign,
    PrivilegeOp::Share,
];

#[derive(Default)]
struct State {
    collections: BTreeMap<String, Vec<Value>>,
    role_privileges: HashMap<String, Vec<Value>>,
    mutations: Vec<String>,
    next_type_code: i64,
    key_status: String,
}

pub struct FakeEnvironment {
    state: Mutex<State>,
    pub root_business_unit: String,
}

impl FakeEnvironment {
    pub fn new() -> Self {
        let root = Uuid::new_v4().to_string();
        let mut state = State {
            next_type_code: 10_400,
            key_status: "Active".into(),
            ..Default::default()
        };
        state.collections.insert(
            "businessunits".into(),
            vec![json!({"businessunitid": root, "name": "contoso", "_parentbusinessunitid_value": null})],
        );
        state
            .collections
            .insert("organizations".into(), vec![json!({"name": "Contoso"})]);
        Self {
            state: Mutex::new(state),
            root_business_unit: root,
        }
    }

    /// Every non-GET request seen, as `METHOD path`.
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert(&self, collection: &str, record: Value) {
        self.state
            .lock()
            .unwrap()
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record);
    }

    /// Status given to alternate keys created from now on.
    pub fn set_key_status(&self, status: &str) {
        self.state.lock().unwrap().key_status = status.to_string();
    }

    /// Role privileges as (privilege name, depth name).
    pub fn role_privileges(&self, role_name: &str) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        let Some(role_id) = find_id(&state, "roles", "name", role_name, "roleid") else {
            return Vec::new();
        };
        state
            .role_privileges
            .get(&role_id)
            .map(|privs| {
                privs
                    .iter()
                    .map(|p| (text(p, "PrivilegeName").unwrap_or_default(), text(p, "Depth").unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Grant a privilege directly, creating the role and privilege records when missing.
    pub fn grant(&self, role_name: &str, privilege_name: &str, depth: &str) {
        let mut state = self.state.lock().unwrap();
        let role_id = match find_id(&state, "roles", "name", role_name, "roleid") {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                state
                    .collections
                    .entry("roles".into())
                    .or_default()
                    .push(json!({"roleid": id, "name": role_name}));
                id
            }
        };
        let privilege_id = match find_id(&state, "privileges", "name", privilege_name, "privilegeid") {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                state
                    .collections
                    .entry("privileges".into())
                    .or_default()
                    .push(json!({"privilegeid": id, "name": privilege_name}));
                id
            }
        };
        let entry = state.role_privileges.entry(role_id).or_default();
        entry.retain(|p| text(p, "PrivilegeId").as_deref() != Some(privilege_id.as_str()));
        entry.push(json!({
            "PrivilegeId": privilege_id,
            "PrivilegeName": privilege_name,
            "Depth": depth,
        }));
    }
}

#[async_trait]
impl WebApi for FakeEnvironment {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ProvisionError> {
        let mut state = self.state.lock().unwrap();
        let path = request.path.trim_start_matches(BASE).trim_start_matches('/').to_string();
        if request.method != Method::GET {
            state.mutations.push(format!("{} {}", request.method, path));
        }
        let response = match request.method {
            Method::GET => get(&state, &path, &request),
            Method::POST => post(&mut state, &path, request.body.unwrap_or(Value::Null)),
            Method::PUT => put(&mut state, &path, request.body.unwrap_or(Value::Null)),
            _ => status(204),
        };
        Ok(response)
    }
}

fn status(code: u16) -> ApiResponse {
    ApiResponse {
        status: code,
        entity_id: None,
        body: None,
    }
}

fn ok(body: Value) -> ApiResponse {
    ApiResponse {
        status: 200,
        entity_id: None,
        body: Some(body),
    }
}

fn error(code: u16, message: &str) -> ApiResponse {
    ApiResponse {
        status: code,
        entity_id: None,
        body: Some(json!({"error": {"message": message}})),
    }
}

fn text(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn find_id(state: &State, collection: &str, field: &str, value: &str, id_field: &str) -> Option<String> {
    state
        .collections
        .get(collection)?
        .iter()
        .find(|r| text(r, field).as_deref() == Some(value))
        .and_then(|r| text(r, id_field))
}

fn id_field_for(collection: &str) -> String {
    match collection {
        "savedqueries" => "savedqueryid".into(),
        "systemforms" => "formid".into(),
        "applications" => "id".into(),
        c if is_metadata(c) => "MetadataId".into(),
        c => format!("{}id", c.trim_end_matches('s')),
    }
}

fn is_metadata(collection: &str) -> bool {
    matches!(
        collection,
        "EntityDefinitions" | "GlobalOptionSetDefinitions" | "RelationshipDefinitions"
    ) || collection.ends_with("/Attributes")
        || collection.ends_with("/Keys")
}

/// `Coll(Key='v')` -> (`Coll`, Some((Key, v))); `Coll(guid)` keys on the id field.
fn split_key(path: &str) -> (String, Option<(String, String)>) {
    if !path.ends_with(')') {
        return (path.to_string(), None);
    }
    let Some(open) = path.rfind('(') else {
        return (path.to_string(), None);
    };
    let collection = path[..open].to_string();
    let inner = &path[open + 1..path.len() - 1];
    let key = match inner.split_once('=') {
        Some((k, v)) => (k.to_string(), unquote(v)),
        None => (id_field_for(&collection), unquote(inner)),
    };
    (collection, Some(key))
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        raw[1..raw.len() - 1].replace("''", "'")
    } else {
        raw.to_string()
    }
}

/// Table a nested metadata path belongs to, e.g. `EntityDefinitions(LogicalName='x')/Keys` -> x.
fn parent_table(collection: &str) -> Option<String> {
    let rest = collection.strip_prefix("EntityDefinitions(LogicalName=")?;
    let (quoted, _) = rest.split_once(")/")?;
    Some(unquote(quoted))
}

fn table_exists(state: &State, table: &str) -> bool {
    find_id(state, "EntityDefinitions", "LogicalName", table, "MetadataId").is_some()
}

fn get(state: &State, path: &str, request: &ApiRequest) -> ApiResponse {
    if let Some(rest) = path.strip_suffix("/Microsoft.Dynamics.CRM.RetrieveRolePrivilegesRole()") {
        let (_, key) = split_key(rest);
        let Some((_, role_id)) = key else {
            return error(400, "role id required");
        };
        let privileges = state.role_privileges.get(&role_id).cloned().unwrap_or_default();
        return ok(json!({ "RolePrivileges": privileges }));
    }
    let (collection, key) = split_key(path);
    if let Some((field, value)) = key {
        return state
            .collections
            .get(&collection)
            .and_then(|records| records.iter().find(|r| text(r, &field).as_deref() == Some(value.as_str())))
            .map(|r| ok(r.clone()))
            .unwrap_or_else(|| status(404));
    }
    if let Some(table) = parent_table(&collection) {
        if !table_exists(state, &table) {
            return error(404, "table not found");
        }
    }
    let mut records: Vec<Value> = state
        .collections
        .get(&collection)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|r| request.query_value("$filter").map(|f| eval(r, f)).unwrap_or(true))
        .collect();
    if let Some(order) = request.query_value("$orderby") {
        sort_records(&mut records, order);
    }
    if let Some(top) = request.query_value("$top").and_then(|t| t.parse::<usize>().ok()) {
        records.truncate(top);
    }
    ok(json!({ "value": records }))
}

fn post(state: &mut State, path: &str, body: Value) -> ApiResponse {
    match path {
        "PublishAllXml" => {
            publish(state);
            return status(204);
        }
        "PublishXml" => return status(204),
        "AddAppComponents" => {
            state.collections.entry("appcomponents".into()).or_default().push(body);
            return status(204);
        }
        _ => {}
    }
    if let Some(rest) = path.strip_suffix("/Microsoft.Dynamics.CRM.AddPrivilegesRole") {
        return add_privileges(state, rest, &body);
    }
    if let Some(app_path) = path.strip_suffix("/addPassword") {
        let app = app_path.rsplit('/').next().unwrap_or_default();
        let key_id = Uuid::new_v4().to_string();
        state
            .collections
            .entry("passwordCredentials".into())
            .or_default()
            .push(json!({"application": app, "keyId": key_id}));
        return ok(json!({
            "keyId": key_id,
            "secretText": format!("secret-{}", key_id),
            "endDateTime": body["passwordCredential"]["endDateTime"],
        }));
    }
    insert(state, path, body)
}

fn put(state: &mut State, path: &str, body: Value) -> ApiResponse {
    let (collection, name) = path.rsplit_once('/').unwrap_or((path, ""));
    let mut record = body;
    record["name"] = json!(name);
    let records = state.collections.entry(collection.to_string()).or_default();
    records.retain(|r| text(r, "name").as_deref() != Some(name));
    records.push(record.clone());
    ok(record)
}

fn insert(state: &mut State, collection: &str, body: Value) -> ApiResponse {
    if let Some(table) = parent_table(collection) {
        if !table_exists(state, &table) {
            return error(404, "table not found");
        }
    }
    let Value::Object(mut record) = body else {
        return error(400, "body must be an object");
    };
    let id = Uuid::new_v4().to_string();
    let id_field = id_field_for(collection);
    record.insert(id_field, json!(id));
    if collection == "applications" {
        record.insert("appId".into(), json!(Uuid::new_v4().to_string()));
    }
    let binds: Vec<(String, String)> = record
        .iter()
        .filter_map(|(k, v)| {
            let name = k.strip_suffix("@odata.bind")?;
            let target = id_from_entity_url(v.as_str()?)?;
            Some((format!("_{}_value", name), target))
        })
        .collect();
    for (field, target) in binds {
        record.insert(field, json!(target));
    }
    if let Some(schema) = record.get("SchemaName").and_then(Value::as_str) {
        let logical = schema.to_lowercase();
        record.insert("LogicalName".into(), json!(logical));
    }
    if collection == "EntityDefinitions" {
        on_table_created(state, &mut record);
    }
    if collection.ends_with("/Keys") {
        record.insert("EntityKeyIndexStatus".into(), json!(state.key_status));
    }
    if collection == "RelationshipDefinitions" {
        on_relationship_created(state, &record);
    }
    let record = Value::Object(record);
    state
        .collections
        .entry(collection.to_string())
        .or_default()
        .push(record.clone());
    ApiResponse {
        status: 201,
        entity_id: Some(format!("{}/{}({})", BASE, collection, id)),
        body: Some(record),
    }
}

fn on_table_created(state: &mut State, record: &mut Map<String, Value>) {
    record.insert("ObjectTypeCode".into(), json!(state.next_type_code));
    state.next_type_code += 1;
    let Some(table) = record.get("LogicalName").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    let attributes = state
        .collections
        .entry(format!("EntityDefinitions(LogicalName='{}')/Attributes", table))
        .or_default();
    if let Some(Value::Array(primary)) = record.get("Attributes") {
        for attribute in primary {
            let mut attribute = attribute.clone();
            if let Some(schema) = attribute.get("SchemaName").and_then(Value::as_str) {
                attribute["LogicalName"] = json!(schema.to_lowercase());
            }
            attributes.push(attribute);
        }
    }
}

fn on_relationship_created(state: &mut State, record: &Map<String, Value>) {
    let Some(table) = record.get("ReferencingEntity").and_then(Value::as_str) else {
        return;
    };
    let Some(lookup) = record.get("Lookup") else {
        return;
    };
    let mut attribute = lookup.clone();
    if let Some(schema) = lookup.get("SchemaName").and_then(Value::as_str) {
        attribute["LogicalName"] = json!(schema.to_lowercase());
    }
    state
        .collections
        .entry(format!("EntityDefinitions(LogicalName='{}')/Attributes", table))
        .or_default()
        .push(attribute);
}

/// Publishing makes privilege records exist for every table.
fn publish(state: &mut State) {
    let tables: Vec<String> = state
        .collections
        .get("EntityDefinitions")
        .map(|t| t.iter().filter_map(|r| text(r, "LogicalName")).collect())
        .unwrap_or_default();
    for table in tables {
        for op in ALL_OPS {
            let name = op.privilege_name(&table);
            if find_id(state, "privileges", "name", &name, "privilegeid").is_none() {
                state
                    .collections
                    .entry("privileges".into())
                    .or_default()
                    .push(json!({"privilegeid": Uuid::new_v4().to_string(), "name": name}));
            }
        }
    }
}

fn add_privileges(state: &mut State, role_path: &str, body: &Value) -> ApiResponse {
    let (_, key) = split_key(role_path);
    let Some((_, role_id)) = key else {
        return error(400, "role id required");
    };
    if find_id(state, "roles", "roleid", &role_id, "roleid").is_none() {
        return error(404, "role not found");
    }
    let mut granted = Vec::new();
    for privilege in body["Privileges"].as_array().cloned().unwrap_or_default() {
        let Some(privilege_id) = text(&privilege, "PrivilegeId") else {
            return error(400, "PrivilegeId required");
        };
        let Some(name) = find_id(state, "privileges", "privilegeid", &privilege_id, "name") else {
            return error(404, "privilege not found");
        };
        granted.push(json!({
            "PrivilegeId": privilege_id,
            "PrivilegeName": name,
            "Depth": privilege["Depth"],
            "BusinessUnitId": privilege["BusinessUnitId"],
        }));
    }
    let held = state.role_privileges.entry(role_id).or_default();
    for grant in granted {
        held.retain(|p| p["PrivilegeId"] != grant["PrivilegeId"]);
        held.push(grant);
    }
    status(204)
}

fn sort_records(records: &mut [Value], order: &str) {
    let keys: Vec<(String, bool)> = order
        .split(',')
        .map(|part| {
            let mut bits = part.split_whitespace();
            let field = bits.next().unwrap_or_default().to_string();
            let descending = bits.next() == Some("desc");
            (field, descending)
        })
        .collect();
    records.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ordering = compare(text(a, field).as_deref(), text(b, field).as_deref());
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn compare(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(b),
        },
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    }
}

/// Evaluate the OData `$filter` subset used by the provisioning steps.
fn eval(record: &Value, expr: &str) -> bool {
    let expr = strip_parens(expr.trim());
    let ors = split_top_level(expr, " or ");
    if ors.len() > 1 {
        return ors.iter().any(|e| eval(record, e));
    }
    let ands = split_top_level(expr, " and ");
    if ands.len() > 1 {
        return ands.iter().all(|e| eval(record, e));
    }
    let mut parts = expr.splitn(3, ' ');
    let (Some(field), Some(op), Some(literal)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let actual = text(record, field);
    let literal = literal.trim();
    if literal == "null" {
        return match op {
            "eq" => actual.is_none(),
            "ne" => actual.is_some(),
            _ => false,
        };
    }
    let expected = unquote(literal);
    let ordering = compare(actual.as_deref(), Some(expected.as_str()));
    match op {
        "eq" => actual.as_deref() == Some(expected.as_str()),
        "ne" => actual.as_deref() != Some(expected.as_str()),
        "ge" => actual.is_some() && ordering != Ordering::Less,
        "gt" => actual.is_some() && ordering == Ordering::Greater,
        "le" => actual.is_some() && ordering != Ordering::Greater,
        "lt" => actual.is_some() && ordering == Ordering::Less,
        _ => false,
    }
}

fn strip_parens(expr: &str) -> &str {
    if !(expr.starts_with('(') && expr.ends_with(')')) {
        return expr;
    }
    let mut depth = 0;
    for (i, ch) in expr.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && i != expr.len() - 1 {
                    return expr;
                }
            }
            _ => {}
        }
    }
    strip_parens(expr[1..expr.len() - 1].trim())
}

fn split_top_level<'a>(expr: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut start = 0;
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth -= 1,
            _ if !in_quote && depth == 0 && bytes[i..].starts_with(separator.as_bytes()) => {
                parts.push(&expr[start..i]);
                i += separator.len();
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_subset() {
        let record = json!({"name": "ELM Admin", "category": 2, "_parentbusinessunitid_value": null, "createdon": "2026-02-01T10:00:00Z"});
        assert!(eval(&record, "name eq 'ELM Admin' and category eq 2"));
        assert!(eval(&record, "_parentbusinessunitid_value eq null"));
        assert!(eval(&record, "(name eq 'x' or category eq 2)"));
        assert!(eval(&record, "createdon ge 2026-01-01T00:00:00Z and createdon le 2026-03-31T23:59:59Z"));
        assert!(!eval(&record, "createdon ge 2026-04-01T00:00:00Z"));
        assert!(!eval(&record, "name eq 'ELM Auditor'"));
    }

    #[test]
    fn splits_keyed_paths() {
        assert_eq!(
            split_key("EntityDefinitions(LogicalName='a')/Attributes(LogicalName='b')"),
            (
                "EntityDefinitions(LogicalName='a')/Attributes".to_string(),
                Some(("LogicalName".to_string(), "b".to_string()))
            )
        );
        assert_eq!(
            split_key("roles(42)"),
            ("roles".to_string(), Some(("roleid".to_string(), "42".to_string())))
        );
    }
}
