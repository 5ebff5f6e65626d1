//! Business rules, views, forms, and the model-driven app module.

use super::{Deployer, Ensured, Lookup, ResourceKind};
use crate::client::request::{quote, ApiRequest};
use crate::config::{payload, AppModuleConfig};
use crate::error::ProvisionError;
use serde_json::{json, Value};
use tracing::info;

impl<'a> Deployer<'a> {
    pub(super) async fn deploy_business_rules(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for rule in &config.business_rules {
            self.require_table(&rule.table).await?;
            self.ensure(
                ResourceKind::BusinessRule,
                &rule.name,
                Lookup::Filter {
                    collection: "workflows",
                    filter: format!(
                        "name eq {} and category eq 2 and primaryentity eq {}",
                        quote(&rule.name),
                        quote(&rule.table)
                    ),
                },
                ApiRequest::post("workflows", payload::business_rule(rule)).in_solution(config.solution_name()),
                "workflowid",
            )
            .await?;
        }
        Ok(())
    }

    pub(super) async fn deploy_views(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for view in &config.views {
            let Some(table) = config.table(&view.table) else {
                continue;
            };
            let type_code = self
                .require_table(&view.table)
                .await?
                .and_then(|meta| meta.get("ObjectTypeCode").and_then(Value::as_i64))
                .unwrap_or(0);
            self.ensure(
                ResourceKind::View,
                &view.name,
                Lookup::Filter {
                    collection: "savedqueries",
                    filter: view_filter(&view.name, &view.table),
                },
                ApiRequest::post("savedqueries", payload::view(view, table, type_code))
                    .in_solution(config.solution_name()),
                "savedqueryid",
            )
            .await?;
        }
        Ok(())
    }

    pub(super) async fn deploy_forms(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for form in &config.forms {
            self.require_table(&form.table).await?;
            let body = payload::form(form, |field| payload::attribute_label(config, &form.table, field));
            self.ensure(
                ResourceKind::Form,
                &form.name,
                Lookup::Filter {
                    collection: "systemforms",
                    filter: form_filter(&form.name, &form.table),
                },
                ApiRequest::post("systemforms", body).in_solution(config.solution_name()),
                "formid",
            )
            .await?;
        }
        Ok(())
    }

    pub(super) async fn deploy_apps(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for app in &config.apps {
            let ensured = self
                .ensure(
                    ResourceKind::AppModule,
                    &app.unique_name,
                    Lookup::Filter {
                        collection: "appmodules",
                        filter: format!("uniquename eq {}", quote(&app.unique_name)),
                    },
                    ApiRequest::post(
                        "appmodules",
                        json!({
                            "uniquename": app.unique_name,
                            "name": app.name,
                            "description": app.description,
                            "webresourceid": payload::DEFAULT_APP_ICON,
                            "clienttype": 4,
                        }),
                    )
                    .in_solution(config.solution_name()),
                    "appmoduleid",
                )
                .await?;
            // Components are only added to an app this run created.
            if let Ensured::Created(_) = ensured {
                let app_id = self
                    .ensured_id(&ensured, "appmoduleid", &app.unique_name)?
                    .unwrap_or_default();
                self.add_app_components(app, &app_id).await?;
            }
        }
        Ok(())
    }

    async fn add_app_components(&self, app: &AppModuleConfig, app_id: &str) -> Result<(), ProvisionError> {
        let config = self.config;
        let mut components = Vec::new();
        for table in &app.tables {
            let meta = self
                .require_table(table)
                .await?
                .ok_or_else(|| missing("table", table))?;
            let metadata_id = id_field(&meta, "MetadataId").ok_or_else(|| missing("table", table))?;
            components.push(json!({
                "@odata.type": "Microsoft.Dynamics.CRM.entity",
                "entityid": metadata_id,
            }));
        }
        for name in &app.views {
            let table = config
                .views
                .iter()
                .find(|v| &v.name == name)
                .map(|v| v.table.as_str())
                .unwrap_or_default();
            let id = self
                .api
                .get_by_filter("savedqueries", &view_filter(name, table), &["savedqueryid"])
                .await?
                .and_then(|v| id_field(&v, "savedqueryid"))
                .ok_or_else(|| missing("view", name))?;
            components.push(json!({
                "@odata.type": "Microsoft.Dynamics.CRM.savedquery",
                "savedqueryid": id,
            }));
        }
        for name in &app.forms {
            let table = config
                .forms
                .iter()
                .find(|f| &f.name == name)
                .map(|f| f.table.as_str())
                .unwrap_or_default();
            let id = self
                .api
                .get_by_filter("systemforms", &form_filter(name, table), &["formid"])
                .await?
                .and_then(|f| id_field(&f, "formid"))
                .ok_or_else(|| missing("form", name))?;
            components.push(json!({
                "@odata.type": "Microsoft.Dynamics.CRM.systemform",
                "formid": id,
            }));
        }

        let count = components.len();
        self.api
            .action("AddAppComponents", json!({ "AppId": app_id, "Components": components }))
            .await?;
        self.api
            .action(
                "PublishXml",
                json!({
                    "ParameterXml": format!(
                        "<importexportxml><appmodules><appmodule>{}</appmodule></appmodules></importexportxml>",
                        app_id
                    )
                }),
            )
            .await?;
        info!(app = %app.unique_name, components = count, "app module components added and published");
        Ok(())
    }
}

pub(crate) fn view_filter(name: &str, table: &str) -> String {
    format!("name eq {} and returnedtypecode eq {}", quote(name), quote(table))
}

pub(crate) fn form_filter(name: &str, table: &str) -> String {
    format!("name eq {} and objecttypecode eq {} and type eq 2", quote(name), quote(table))
}

fn id_field(record: &Value, field: &str) -> Option<String> {
    record.get(field).and_then(Value::as_str).map(str::to_string)
}

fn missing(kind: &'static str, name: &str) -> ProvisionError {
    ProvisionError::MissingPrerequisite {
        kind,
        name: name.to_string(),
    }
}
