//! Audit-based validation that an append-only table stayed append-only.

use crate::client::api::WebApi;
use crate::client::request::{quote, ApiRequest};
use crate::config::FullConfig;
use crate::error::{ConfigError, ProvisionError, EXIT_POLICY_VIOLATION};
use crate::period::DateRange;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Audit `operation` codes.
const AUDIT_UPDATE: u8 = 2;
const AUDIT_DELETE: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImmutabilityStatus {
    Passed,
    /// No modification attempts, but incomplete or orphaned records.
    Partial,
    /// Update or delete attempts were audited.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub audit_id: String,
    pub created_on: Option<String>,
    pub user_id: Option<String>,
    pub object_id: Option<String>,
}

impl AuditEntry {
    fn from_record(record: &Value) -> Self {
        let field = |name: &str| record.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            audit_id: field("auditid").unwrap_or_default(),
            created_on: field("createdon"),
            user_id: field("_userid_value"),
            object_id: field("_objectid_value"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmutabilityReport {
    pub table: String,
    pub range: DateRange,
    pub records_checked: usize,
    pub update_attempts: Vec<AuditEntry>,
    pub delete_attempts: Vec<AuditEntry>,
    /// Ids of records missing a required field.
    pub incomplete_records: Vec<String>,
    /// Ids of records without a parent.
    pub orphaned_records: Vec<String>,
}

impl ImmutabilityReport {
    pub fn integrity_issues(&self) -> usize {
        self.incomplete_records.len() + self.orphaned_records.len()
    }

    pub fn status(&self) -> ImmutabilityStatus {
        if !self.update_attempts.is_empty() || !self.delete_attempts.is_empty() {
            ImmutabilityStatus::Failed
        } else if self.integrity_issues() > 0 {
            ImmutabilityStatus::Partial
        } else {
            ImmutabilityStatus::Passed
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status() {
            ImmutabilityStatus::Passed => 0,
            ImmutabilityStatus::Partial | ImmutabilityStatus::Failed => EXIT_POLICY_VIOLATION,
        }
    }
}

pub async fn validate_immutability(
    api: &dyn WebApi,
    config: &FullConfig,
    range: DateRange,
) -> Result<ImmutabilityReport, ProvisionError> {
    let target = config
        .immutability
        .as_ref()
        .ok_or_else(|| ConfigError::Validation("definition set declares no immutable table".into()))?;
    let table = config.table(&target.table).ok_or_else(|| ConfigError::MissingReference {
        kind: "table",
        id: target.table.clone(),
    })?;
    let entity_set = table.entity_set();
    let id_field = table.primary_id();
    let in_range = range.filter(&target.timestamp_field);
    info!(table = %target.table, range = %range, "validating immutability");

    let records_checked = api
        .query(ApiRequest::get(entity_set.as_str()).select(&[&id_field]).filter(in_range.as_str()))
        .await?
        .len();

    let update_attempts = audit_attempts(api, &target.table, AUDIT_UPDATE, &range).await?;
    let delete_attempts = audit_attempts(api, &target.table, AUDIT_DELETE, &range).await?;

    let incomplete_records = if target.required_fields.is_empty() {
        Vec::new()
    } else {
        let missing = target
            .required_fields
            .iter()
            .map(|f| format!("{} eq null", f))
            .collect::<Vec<_>>()
            .join(" or ");
        record_ids(api, &entity_set, &id_field, &format!("{} and ({})", in_range, missing)).await?
    };
    let orphaned_records = match &target.parent_lookup {
        Some(lookup) => record_ids(api, &entity_set, &id_field, &format!("{} and {} eq null", in_range, lookup)).await?,
        None => Vec::new(),
    };

    let report = ImmutabilityReport {
        table: target.table.clone(),
        range,
        records_checked,
        update_attempts,
        delete_attempts,
        incomplete_records,
        orphaned_records,
    };
    match report.status() {
        ImmutabilityStatus::Passed => info!(records = records_checked, "no immutability violations"),
        ImmutabilityStatus::Partial => warn!(issues = report.integrity_issues(), "data integrity issues found"),
        ImmutabilityStatus::Failed => warn!(
            updates = report.update_attempts.len(),
            deletes = report.delete_attempts.len(),
            "immutability violations detected"
        ),
    }
    Ok(report)
}

async fn audit_attempts(
    api: &dyn WebApi,
    table: &str,
    operation: u8,
    range: &DateRange,
) -> Result<Vec<AuditEntry>, ProvisionError> {
    let filter = format!(
        "objecttypecode eq {} and operation eq {} and {}",
        quote(table),
        operation,
        range.filter("createdon")
    );
    let request = ApiRequest::get("audits")
        .select(&["auditid", "createdon", "_userid_value", "operation", "_objectid_value"])
        .filter(filter)
        .order_by("createdon desc");
    Ok(api.query(request).await?.iter().map(AuditEntry::from_record).collect())
}

async fn record_ids(api: &dyn WebApi, entity_set: &str, id_field: &str, filter: &str) -> Result<Vec<String>, ProvisionError> {
    let rows = api
        .query(ApiRequest::get(entity_set).select(&[id_field]).filter(filter))
        .await?;
    Ok(rows
        .iter()
        .filter_map(|r| r.get(id_field).and_then(Value::as_str).map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeEnvironment;
    use crate::config::bundled;
    use serde_json::json;

    fn q1() -> DateRange {
        DateRange::parse("2026-01-01", "2026-03-31").unwrap()
    }

    fn log(id: &str, timestamp: &str, parent: Option<&str>) -> Value {
        json!({
            "fsi_provisioninglogid": id,
            "fsi_timestamp": timestamp,
            "fsi_action": 1,
            "fsi_actor": "svc-elm",
            "fsi_success": true,
            "_fsi_environmentrequest_value": parent,
        })
    }

    #[tokio::test]
    async fn clean_log_passes() {
        let env = FakeEnvironment::new();
        env.insert("fsi_provisioninglogs", log("a", "2026-02-01T09:00:00Z", Some("r1")));
        env.insert("fsi_provisioninglogs", log("b", "2026-05-01T09:00:00Z", None));
        let report = validate_immutability(&env, &bundled("elm").unwrap(), q1()).await.unwrap();
        assert_eq!(report.records_checked, 1);
        assert_eq!(report.status(), ImmutabilityStatus::Passed);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn audited_update_fails() {
        let env = FakeEnvironment::new();
        env.insert("fsi_provisioninglogs", log("a", "2026-02-01T09:00:00Z", Some("r1")));
        env.insert(
            "audits",
            json!({
                "auditid": "au1",
                "objecttypecode": "fsi_provisioninglog",
                "operation": 2,
                "createdon": "2026-02-02T10:00:00Z",
                "_userid_value": "u1",
                "_objectid_value": "a",
            }),
        );
        env.insert(
            "audits",
            json!({
                "auditid": "au2",
                "objecttypecode": "fsi_environmentrequest",
                "operation": 3,
                "createdon": "2026-02-02T10:00:00Z",
            }),
        );
        let report = validate_immutability(&env, &bundled("elm").unwrap(), q1()).await.unwrap();
        assert_eq!(report.update_attempts.len(), 1);
        assert_eq!(report.update_attempts[0].user_id.as_deref(), Some("u1"));
        assert!(report.delete_attempts.is_empty());
        assert_eq!(report.status(), ImmutabilityStatus::Failed);
        assert_eq!(report.exit_code(), 3);
    }

    #[tokio::test]
    async fn incomplete_and_orphaned_records_are_partial() {
        let env = FakeEnvironment::new();
        env.insert("fsi_provisioninglogs", log("orphan", "2026-01-10T09:00:00Z", None));
        let mut incomplete = log("incomplete", "2026-01-11T09:00:00Z", Some("r1"));
        incomplete["fsi_actor"] = Value::Null;
        env.insert("fsi_provisioninglogs", incomplete);

        let report = validate_immutability(&env, &bundled("elm").unwrap(), q1()).await.unwrap();
        assert_eq!(report.incomplete_records, vec!["incomplete".to_string()]);
        assert_eq!(report.orphaned_records, vec!["orphan".to_string()]);
        assert_eq!(report.status(), ImmutabilityStatus::Partial);
        assert_eq!(report.exit_code(), 3);
    }

    #[tokio::test]
    async fn definition_set_without_target_is_rejected() {
        let env = FakeEnvironment::new();
        let err = validate_immutability(&env, &bundled("mcg").unwrap(), q1()).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
