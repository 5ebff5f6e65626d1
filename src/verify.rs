//! Read-only verification of a deployed definition set.
//!
//! Every resource class is re-queried by natural key and counted against the definitions.
//! Security roles additionally get a privilege audit: each audited operation on each table a
//! role mentions must be granted at exactly the declared depth, or not at all when undeclared,
//! and none of the role's forbidden privileges may be held.

use crate::client::api::{root_business_unit, Lookup, WebApi};
use crate::client::request::{entity_definition, keyed, quote, ApiRequest};
use crate::config::{FullConfig, PrivilegeDepth, PrivilegeMatrix, PrivilegeOp, RoleConfig};
use crate::deploy::{form_filter, view_filter, ResourceKind};
use crate::error::{ConfigError, ProvisionError, EXIT_POLICY_VIOLATION, EXIT_VERIFICATION_MISMATCH};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Privileges a role holds, as (privilege name, depth).
pub async fn held_privileges(api: &dyn WebApi, role_id: &str) -> Result<Vec<(String, PrivilegeDepth)>, ProvisionError> {
    let body = api
        .request(ApiRequest::get(format!(
            "roles({})/Microsoft.Dynamics.CRM.RetrieveRolePrivilegesRole()",
            role_id
        )))
        .await?
        .body
        .unwrap_or(Value::Null);
    let rows = body
        .get("RolePrivileges")
        .and_then(Value::as_array)
        .ok_or_else(|| ProvisionError::UnexpectedResponse("RetrieveRolePrivilegesRole returned no RolePrivileges".into()))?;

    let mut held = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(name) = row.get("PrivilegeName").and_then(Value::as_str) else {
            continue;
        };
        let depth = match row.get("Depth") {
            Some(Value::String(s)) => PrivilegeDepth::from_api_name(s),
            Some(Value::Number(n)) => n.as_u64().and_then(PrivilegeDepth::from_mask),
            _ => None,
        };
        match depth {
            Some(depth) => held.push((name.to_string(), depth)),
            None => warn!(privilege = name, depth = ?row.get("Depth"), "unrecognised privilege depth"),
        }
    }
    Ok(held)
}

/// Fold held privilege names into a table -> operation -> depth matrix.
pub fn privilege_matrix(held: &[(String, PrivilegeDepth)]) -> PrivilegeMatrix {
    let mut matrix = PrivilegeMatrix::new();
    for (name, depth) in held {
        if let Some((op, table)) = PrivilegeOp::parse_privilege_name(name) {
            matrix.entry(table).or_default().insert(op, *depth);
        }
    }
    matrix
}

/// Outcome of auditing one role against what it holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoleAudit {
    /// Operations granted at the wrong depth, missing, or granted when undeclared.
    pub mismatches: Vec<String>,
    /// Forbidden privileges the role holds.
    pub violations: Vec<String>,
}

impl RoleAudit {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && self.violations.is_empty()
    }
}

pub fn check_role(role: &RoleConfig, actual: &PrivilegeMatrix) -> RoleAudit {
    let mut audit = RoleAudit::default();
    let is_forbidden =
        |table: &str, op: PrivilegeOp| role.forbidden.iter().any(|f| f.table == table && f.operation == op);

    for (table, expected) in &role.privileges {
        let held = actual.get(table);
        for op in PrivilegeOp::AUDITED {
            if is_forbidden(table, op) {
                continue;
            }
            let want = expected.get(&op);
            let got = held.and_then(|h| h.get(&op));
            match (want, got) {
                (None, Some(got)) => audit
                    .mismatches
                    .push(format!("{}: {} should NOT be granted (found: {})", table, op, got)),
                (Some(want), None) => audit
                    .mismatches
                    .push(format!("{}: {} should be {} (not granted)", table, op, want)),
                (Some(want), Some(got)) if want != got => audit
                    .mismatches
                    .push(format!("{}: {} should be {} (found: {})", table, op, want, got)),
                _ => {}
            }
        }
    }
    for forbidden in &role.forbidden {
        if let Some(got) = actual.get(&forbidden.table).and_then(|h| h.get(&forbidden.operation)) {
            audit.violations.push(format!(
                "{}: {} is forbidden (found: {})",
                forbidden.table, forbidden.operation, got
            ));
        }
    }
    audit
}

#[derive(Clone, Debug, Serialize)]
pub struct ResourceCount {
    pub kind: ResourceKind,
    pub expected: usize,
    pub found: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoleCheck {
    pub role: String,
    pub found: bool,
    pub passed: bool,
    #[serde(flatten)]
    pub audit: RoleAudit,
    /// What the role actually holds, by table.
    pub actual: PrivilegeMatrix,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub timestamp: DateTime<Utc>,
    pub environment_url: String,
    pub counts: Vec<ResourceCount>,
    pub issues: Vec<String>,
    pub roles: Vec<RoleCheck>,
}

impl VerificationReport {
    pub fn resources_complete(&self) -> bool {
        self.issues.is_empty() && self.counts.iter().all(|c| c.found >= c.expected)
    }

    pub fn roles_passed(&self) -> bool {
        self.roles.iter().all(|r| r.passed)
    }

    /// 0 when everything matches, 3 when a found role fails its audit, otherwise 2.
    pub fn exit_code(&self) -> i32 {
        if self.roles.iter().any(|r| r.found && !r.passed) {
            EXIT_POLICY_VIOLATION
        } else if !self.resources_complete() || !self.roles_passed() {
            EXIT_VERIFICATION_MISMATCH
        } else {
            0
        }
    }

    pub async fn write_json(&self, path: &Path) -> Result<(), ProvisionError> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), "verification report written");
        Ok(())
    }
}

struct Tally<'a> {
    api: &'a dyn WebApi,
    counts: BTreeMap<ResourceKind, (usize, usize)>,
    issues: Vec<String>,
}

impl<'a> Tally<'a> {
    async fn check(&mut self, kind: ResourceKind, name: &str, lookup: Lookup) -> Result<Option<Value>, ProvisionError> {
        let found = self.api.find(&lookup).await?;
        let entry = self.counts.entry(kind).or_default();
        entry.0 += 1;
        if found.is_some() {
            entry.1 += 1;
        } else {
            warn!(kind = %kind, name, "missing");
            self.issues.push(format!("missing {} '{}'", kind, name));
        }
        Ok(found)
    }
}

/// Verify every resource in `config`, auditing only `role_filter` when given.
pub async fn verify(
    api: &dyn WebApi,
    config: &FullConfig,
    environment_url: &str,
    role_filter: Option<&str>,
) -> Result<VerificationReport, ProvisionError> {
    let roles: Vec<&RoleConfig> = match role_filter {
        Some(name) => {
            let role = config.roles.iter().find(|r| r.name == name).ok_or_else(|| ConfigError::MissingReference {
                kind: "role",
                id: name.to_string(),
            })?;
            vec![role]
        }
        None => config.roles.iter().collect(),
    };

    let mut tally = Tally {
        api,
        counts: BTreeMap::new(),
        issues: Vec::new(),
    };
    if role_filter.is_none() {
        verify_schema(&mut tally, config).await?;
    }

    let mut checks = Vec::new();
    if !roles.is_empty() {
        let business_unit = root_business_unit(api).await?;
        for role in roles {
            let filter = format!("name eq {} and _businessunitid_value eq {}", quote(&role.name), business_unit);
            let found = tally.check(ResourceKind::SecurityRole, &role.name, Lookup::Filter { collection: "roles", filter }).await?;
            checks.push(audit_role(&mut tally, role, found).await?);
        }
    }

    if role_filter.is_none() {
        verify_ui(&mut tally, config).await?;
    }

    let report = VerificationReport {
        timestamp: Utc::now(),
        environment_url: environment_url.to_string(),
        counts: tally
            .counts
            .into_iter()
            .map(|(kind, (expected, found))| ResourceCount { kind, expected, found })
            .collect(),
        issues: tally.issues,
        roles: checks,
    };
    info!(
        issues = report.issues.len(),
        roles_passed = report.roles_passed(),
        exit_code = report.exit_code(),
        "verification finished"
    );
    Ok(report)
}

async fn audit_role(tally: &mut Tally<'_>, role: &RoleConfig, found: Option<Value>) -> Result<RoleCheck, ProvisionError> {
    let role_id = found
        .as_ref()
        .and_then(|r| r.get("roleid"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let Some(role_id) = role_id else {
        return Ok(RoleCheck {
            role: role.name.clone(),
            found: false,
            passed: false,
            audit: RoleAudit {
                mismatches: vec![format!("Role '{}' not found", role.name)],
                violations: Vec::new(),
            },
            actual: PrivilegeMatrix::new(),
        });
    };
    let held = held_privileges(tally.api, &role_id).await?;
    if held.is_empty() {
        tally.issues.push(format!("role '{}' has zero privileges", role.name));
    }
    let actual = privilege_matrix(&held);
    let audit = check_role(role, &actual);
    if audit.passed() {
        info!(role = %role.name, "role privileges match");
    } else {
        warn!(role = %role.name, mismatches = audit.mismatches.len(), violations = audit.violations.len(), "role privileges differ");
    }
    Ok(RoleCheck {
        role: role.name.clone(),
        found: true,
        passed: audit.passed(),
        audit,
        actual,
    })
}

async fn verify_schema(tally: &mut Tally<'_>, config: &FullConfig) -> Result<(), ProvisionError> {
    if let Some(publisher) = &config.publisher {
        let filter = format!("customizationprefix eq {}", quote(&publisher.prefix));
        tally.check(ResourceKind::Publisher, &publisher.unique_name, Lookup::Filter { collection: "publishers", filter }).await?;
    }
    if let Some(solution) = &config.solution {
        let filter = format!("uniquename eq {}", quote(&solution.unique_name));
        tally.check(ResourceKind::Solution, &solution.unique_name, Lookup::Filter { collection: "solutions", filter }).await?;
    }
    for choice in config.choices.iter().filter(|c| c.global) {
        let path = keyed("GlobalOptionSetDefinitions", "Name", &choice.name);
        tally.check(ResourceKind::ChoiceSet, &choice.name, Lookup::Keyed(path)).await?;
    }
    for table in &config.tables {
        let logical = table.logical_name();
        tally.check(ResourceKind::Table, &logical, Lookup::Keyed(entity_definition(&logical))).await?;
    }
    for column in &config.columns {
        let logical = column.logical_name();
        let path = format!("{}/{}", entity_definition(&column.table), keyed("Attributes", "LogicalName", &logical));
        tally
            .check(ResourceKind::Column, &format!("{}.{}", column.table, logical), Lookup::Keyed(path))
            .await?;
    }
    for rel in &config.relationships {
        let path = keyed("RelationshipDefinitions", "SchemaName", &rel.schema_name);
        tally.check(ResourceKind::Relationship, &rel.schema_name, Lookup::Keyed(path)).await?;
    }
    for key in &config.keys {
        let logical = key.logical_name();
        let name = format!("{}.{}", key.table, logical);
        let collection = format!("{}/Keys", entity_definition(&key.table));
        let filter = format!("LogicalName eq {}", quote(&logical));
        let found = tally.check(ResourceKind::AlternateKey, &name, Lookup::Metadata { collection, filter }).await?;
        let status = found
            .as_ref()
            .and_then(|k| k.get("EntityKeyIndexStatus"))
            .and_then(Value::as_str);
        if let Some(status) = status.filter(|s| *s != "Active") {
            tally.issues.push(format!("alternate key '{}' is {}", name, status));
        }
    }
    Ok(())
}

async fn verify_ui(tally: &mut Tally<'_>, config: &FullConfig) -> Result<(), ProvisionError> {
    for profile in &config.field_security {
        let filter = format!("name eq {}", quote(&profile.name));
        let found = tally
            .check(ResourceKind::FieldSecurityProfile, &profile.name, Lookup::Filter { collection: "fieldsecurityprofiles", filter })
            .await?;
        let profile_id = found
            .as_ref()
            .and_then(|p| p.get("fieldsecurityprofileid"))
            .and_then(Value::as_str)
            .map(str::to_string);
        for permission in &profile.permissions {
            let label = format!("{}: {}.{}", profile.name, profile.table, permission.column);
            let Some(profile_id) = &profile_id else {
                let entry = tally.counts.entry(ResourceKind::FieldPermission).or_default();
                entry.0 += 1;
                continue;
            };
            let filter = format!(
                "_fieldsecurityprofileid_value eq {} and entityname eq {} and attributelogicalname eq {}",
                profile_id,
                quote(&profile.table),
                quote(&permission.column)
            );
            tally
                .check(ResourceKind::FieldPermission, &label, Lookup::Filter { collection: "fieldpermissions", filter })
                .await?;
        }
    }
    for rule in &config.business_rules {
        let filter = format!(
            "name eq {} and category eq 2 and primaryentity eq {}",
            quote(&rule.name),
            quote(&rule.table)
        );
        tally.check(ResourceKind::BusinessRule, &rule.name, Lookup::Filter { collection: "workflows", filter }).await?;
    }
    for view in &config.views {
        let filter = view_filter(&view.name, &view.table);
        tally.check(ResourceKind::View, &view.name, Lookup::Filter { collection: "savedqueries", filter }).await?;
    }
    for form in &config.forms {
        let filter = form_filter(&form.name, &form.table);
        tally.check(ResourceKind::Form, &form.name, Lookup::Filter { collection: "systemforms", filter }).await?;
    }
    for app in &config.apps {
        let filter = format!("uniquename eq {}", quote(&app.unique_name));
        tally.check(ResourceKind::AppModule, &app.unique_name, Lookup::Filter { collection: "appmodules", filter }).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeEnvironment;
    use crate::config::{bundled, ForbiddenPrivilege};
    use crate::deploy::{deploy, DeployOptions};
    use pretty_assertions::assert_eq;

    const ENV: &str = "https://contoso.crm.dynamics.com";

    fn log_writer_role() -> RoleConfig {
        let mut log = BTreeMap::new();
        log.insert(PrivilegeOp::Create, PrivilegeDepth::Organization);
        log.insert(PrivilegeOp::Read, PrivilegeDepth::Organization);
        let mut privileges = PrivilegeMatrix::new();
        privileges.insert("fsi_provisioninglog".to_string(), log);
        RoleConfig {
            name: "Log Writer".into(),
            description: String::new(),
            privileges,
            forbidden: vec![
                ForbiddenPrivilege {
                    table: "fsi_provisioninglog".into(),
                    operation: PrivilegeOp::Write,
                },
                ForbiddenPrivilege {
                    table: "fsi_provisioninglog".into(),
                    operation: PrivilegeOp::Delete,
                },
            ],
        }
    }

    fn held(entries: &[(&str, PrivilegeDepth)]) -> PrivilegeMatrix {
        let held: Vec<(String, PrivilegeDepth)> = entries.iter().map(|(n, d)| (n.to_string(), *d)).collect();
        privilege_matrix(&held)
    }

    #[test]
    fn role_without_write_or_delete_passes() {
        let actual = held(&[
            ("prvCreatefsi_provisioninglog", PrivilegeDepth::Organization),
            ("prvReadfsi_provisioninglog", PrivilegeDepth::Organization),
        ]);
        assert!(check_role(&log_writer_role(), &actual).passed());
    }

    #[test]
    fn forbidden_delete_is_a_violation() {
        let actual = held(&[
            ("prvCreatefsi_provisioninglog", PrivilegeDepth::Organization),
            ("prvReadfsi_provisioninglog", PrivilegeDepth::Organization),
            ("prvDeletefsi_provisioninglog", PrivilegeDepth::User),
        ]);
        let audit = check_role(&log_writer_role(), &actual);
        assert!(audit.mismatches.is_empty());
        assert_eq!(
            audit.violations,
            vec!["fsi_provisioninglog: Delete is forbidden (found: User)".to_string()]
        );
    }

    #[test]
    fn depth_and_undeclared_grants_are_mismatches() {
        let actual = held(&[
            ("prvCreatefsi_provisioninglog", PrivilegeDepth::BusinessUnit),
            ("prvAppendTofsi_provisioninglog", PrivilegeDepth::User),
        ]);
        let audit = check_role(&log_writer_role(), &actual);
        assert_eq!(
            audit.mismatches,
            vec![
                "fsi_provisioninglog: Create should be Organization (found: Business Unit)".to_string(),
                "fsi_provisioninglog: Read should be Organization (not granted)".to_string(),
                "fsi_provisioninglog: AppendTo should NOT be granted (found: User)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn held_privileges_reads_api_depth_names() {
        let env = FakeEnvironment::new();
        env.grant("Mixed", "prvReadfsi_x", "Local");
        env.grant("Mixed", "prvCreatefsi_x", "Global");
        let role_id = env.records("roles")[0]["roleid"].as_str().unwrap().to_string();
        let mut held = held_privileges(&env, &role_id).await.unwrap();
        held.sort();
        assert_eq!(
            held,
            vec![
                ("prvCreatefsi_x".to_string(), PrivilegeDepth::Organization),
                ("prvReadfsi_x".to_string(), PrivilegeDepth::BusinessUnit),
            ]
        );
    }

    #[tokio::test]
    async fn deployed_environment_verifies_clean() {
        let env = FakeEnvironment::new();
        let config = bundled("elm").unwrap();
        deploy(&env, &config, DeployOptions::default()).await.unwrap();

        let report = verify(&env, &config, ENV, None).await.unwrap();
        assert_eq!(report.issues, Vec::<String>::new());
        assert!(report.counts.iter().all(|c| c.found == c.expected));
        assert_eq!(report.roles.len(), config.roles.len());
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn empty_environment_is_a_mismatch() {
        let env = FakeEnvironment::new();
        let config = bundled("elm").unwrap();
        let report = verify(&env, &config, ENV, None).await.unwrap();
        assert!(!report.resources_complete());
        assert!(report.roles.iter().all(|r| !r.found));
        assert_eq!(report.exit_code(), EXIT_VERIFICATION_MISMATCH);
    }

    #[tokio::test]
    async fn granted_log_write_is_a_policy_violation() {
        let env = FakeEnvironment::new();
        let config = bundled("elm").unwrap();
        deploy(&env, &config, DeployOptions::default()).await.unwrap();
        env.grant("ELM Admin", "prvWritefsi_provisioninglog", "Global");

        let report = verify(&env, &config, ENV, Some("ELM Admin")).await.unwrap();
        assert_eq!(report.roles.len(), 1);
        assert_eq!(
            report.roles[0].audit.violations,
            vec!["fsi_provisioninglog: Write is forbidden (found: Organization)".to_string()]
        );
        assert_eq!(report.exit_code(), EXIT_POLICY_VIOLATION);
    }

    #[tokio::test]
    async fn unknown_role_filter_is_a_config_error() {
        let env = FakeEnvironment::new();
        let config = bundled("elm").unwrap();
        let err = verify(&env, &config, ENV, Some("Nobody")).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn report_exports_as_json() {
        let env = FakeEnvironment::new();
        let config = bundled("elm").unwrap();
        let report = verify(&env, &config, ENV, None).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verification.json");
        report.write_json(&path).await.unwrap();
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["environmentUrl"], ENV);
        assert!(written["counts"].as_array().unwrap().len() > 5);
    }
}
