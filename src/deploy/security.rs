//! Security roles, privilege assignment, and field security profiles.

use super::{Deployer, Lookup, ResourceKind, StepAction};
use crate::client::api::root_business_unit;
use crate::client::request::{entity_definition, keyed, quote, ApiRequest};
use crate::config::{payload, PrivilegeDepth, RoleConfig};
use crate::error::ProvisionError;
use crate::verify::held_privileges;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

impl<'a> Deployer<'a> {
    pub(super) async fn deploy_roles(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        if config.roles.is_empty() {
            return Ok(());
        }
        let business_unit = root_business_unit(self.api).await?;
        for role in &config.roles {
            let ensured = self
                .ensure(
                    ResourceKind::SecurityRole,
                    &role.name,
                    Lookup::Filter {
                        collection: "roles",
                        filter: format!(
                            "name eq {} and _businessunitid_value eq {}",
                            quote(&role.name),
                            business_unit
                        ),
                    },
                    ApiRequest::post(
                        "roles",
                        json!({
                            "name": role.name,
                            "description": role.description,
                            "businessunitid@odata.bind": format!("/businessunits({})", business_unit),
                        }),
                    )
                    .in_solution(config.solution_name()),
                    "roleid",
                )
                .await?;
            let role_id = self.ensured_id(&ensured, "roleid", &role.name)?;
            self.assign_privileges(role, role_id.as_deref(), &business_unit).await?;
        }
        Ok(())
    }

    async fn assign_privileges(
        &mut self,
        role: &RoleConfig,
        role_id: Option<&str>,
        business_unit: &str,
    ) -> Result<(), ProvisionError> {
        let held: HashMap<String, PrivilegeDepth> = match role_id {
            Some(id) => held_privileges(self.api, id).await?.into_iter().collect(),
            None => HashMap::new(),
        };
        let mut batch = Vec::new();
        let mut added = Vec::new();
        for (table, ops) in &role.privileges {
            for (op, depth) in ops {
                let privilege = op.privilege_name(table);
                let label = format!("{}: {} ({})", role.name, privilege, depth);
                if held.get(&privilege) == Some(depth) {
                    self.report.record(ResourceKind::RolePrivilege, label, StepAction::Skipped);
                    continue;
                }
                let Some(role_id) = role_id.filter(|_| !self.options.dry_run) else {
                    self.report.record(ResourceKind::RolePrivilege, label, StepAction::WouldCreate);
                    continue;
                };
                let record = self
                    .api
                    .get_by_filter("privileges", &format!("name eq {}", quote(&privilege)), &["privilegeid", "name"])
                    .await?
                    .ok_or_else(|| ProvisionError::MissingPrerequisite {
                        kind: "privilege",
                        name: privilege.clone(),
                    })?;
                let privilege_id = record
                    .get("privilegeid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProvisionError::UnexpectedResponse(format!("privilege {} has no id", privilege)))?;
                debug!(role = %role.name, role_id, privilege = %privilege, "queueing privilege");
                batch.push(json!({
                    "Depth": depth.api_name(),
                    "PrivilegeId": privilege_id,
                    "BusinessUnitId": business_unit,
                }));
                added.push(label);
            }
        }
        if let (Some(role_id), false) = (role_id, batch.is_empty()) {
            self.api
                .action(
                    &format!("roles({})/Microsoft.Dynamics.CRM.AddPrivilegesRole", role_id),
                    json!({ "Privileges": batch }),
                )
                .await?;
            for label in added {
                self.report.record(ResourceKind::RolePrivilege, label, StepAction::Created);
            }
        }
        Ok(())
    }

    pub(super) async fn deploy_field_security(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for profile in &config.field_security {
            if self.require_table(&profile.table).await?.is_some() {
                for permission in &profile.permissions {
                    self.require_field(&profile.table, &permission.column).await?;
                }
            }

            let ensured = self
                .ensure(
                    ResourceKind::FieldSecurityProfile,
                    &profile.name,
                    Lookup::Filter {
                        collection: "fieldsecurityprofiles",
                        filter: format!("name eq {}", quote(&profile.name)),
                    },
                    ApiRequest::post(
                        "fieldsecurityprofiles",
                        json!({ "name": profile.name, "description": profile.description }),
                    )
                    .in_solution(config.solution_name()),
                    "fieldsecurityprofileid",
                )
                .await?;
            let profile_id = self.ensured_id(&ensured, "fieldsecurityprofileid", &profile.name)?;

            for permission in &profile.permissions {
                let label = format!("{}: {}.{}", profile.name, profile.table, permission.column);
                let Some(profile_id) = profile_id.as_deref() else {
                    self.report.record(ResourceKind::FieldPermission, label, StepAction::WouldCreate);
                    continue;
                };
                self.ensure(
                    ResourceKind::FieldPermission,
                    &label,
                    Lookup::Filter {
                        collection: "fieldpermissions",
                        filter: format!(
                            "_fieldsecurityprofileid_value eq {} and entityname eq {} and attributelogicalname eq {}",
                            profile_id,
                            quote(&profile.table),
                            quote(&permission.column)
                        ),
                    },
                    ApiRequest::post(
                        "fieldpermissions",
                        json!({
                            "fieldsecurityprofileid@odata.bind": format!("/fieldsecurityprofiles({})", profile_id),
                            "entityname": profile.table,
                            "attributelogicalname": permission.column,
                            "canread": payload::permission_flag(permission.read),
                            "cancreate": payload::permission_flag(permission.create),
                            "canupdate": payload::permission_flag(permission.update),
                        }),
                    ),
                    "fieldpermissionid",
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Fail unless the attribute exists, or a dry run plans to create it.
    async fn require_field(&self, table: &str, field: &str) -> Result<(), ProvisionError> {
        let path = format!("{}/{}", entity_definition(table), keyed("Attributes", "LogicalName", field));
        if self.api.get_optional(&path).await?.is_some() || self.field_planned(table, field) {
            return Ok(());
        }
        Err(ProvisionError::MissingPrerequisite {
            kind: "column",
            name: format!("{}.{}", table, field),
        })
    }

    fn field_planned(&self, table: &str, field: &str) -> bool {
        if !self.options.dry_run {
            return false;
        }
        self.report.is_planned(ResourceKind::Column, &format!("{}.{}", table, field))
            || self.config.relationships.iter().any(|r| {
                r.referencing_table == table
                    && r.lookup_logical_name() == field
                    && self.report.is_planned(ResourceKind::Relationship, &r.schema_name)
            })
    }
}
