//! Ordered, idempotent deployment of a definition set.
//!
//! Every step looks the resource up by its natural key and creates it only when absent, so a
//! failed run is recovered by running again. Phases follow platform dependencies: publisher and
//! solution, choice sets, tables, columns, relationships, alternate keys, publish, roles and
//! privileges, field security, business rules, views, forms, and the app module.

pub mod report;
mod schema;
mod security;
mod ui;

pub(crate) use ui::{form_filter, view_filter};

pub use report::*;

use crate::client::api::{Lookup, WebApi};
use crate::client::request::{entity_definition, ApiRequest};
use crate::client::retry::PollPolicy;
use crate::config::{validate, FullConfig};
use crate::error::ProvisionError;
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeployScope {
    #[default]
    Full,
    /// Publisher through publish.
    TablesOnly,
    /// Security roles and their privileges.
    RolesOnly,
}

#[derive(Clone, Debug, Default)]
pub struct DeployOptions {
    pub dry_run: bool,
    pub scope: DeployScope,
    pub poll: PollPolicy,
}

enum Ensured {
    Existing(Value),
    Created(Option<String>),
    Planned,
}

impl Ensured {
    fn is_created(&self) -> bool {
        matches!(self, Ensured::Created(_))
    }
}

pub struct Deployer<'a> {
    api: &'a dyn WebApi,
    config: &'a FullConfig,
    options: DeployOptions,
    report: DeployReport,
}

impl<'a> Deployer<'a> {
    pub fn new(api: &'a dyn WebApi, config: &'a FullConfig, options: DeployOptions) -> Self {
        let report = DeployReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        Self {
            api,
            config,
            options,
            report,
        }
    }

    pub async fn run(mut self) -> Result<DeployReport, ProvisionError> {
        validate(self.config)?;
        info!(scope = ?self.options.scope, dry_run = self.options.dry_run, "starting deployment");
        let scope = self.options.scope;
        if scope != DeployScope::RolesOnly {
            self.deploy_schema().await?;
        }
        if scope != DeployScope::TablesOnly {
            self.deploy_roles().await?;
        }
        if scope == DeployScope::Full {
            self.deploy_field_security().await?;
            self.deploy_business_rules().await?;
            self.deploy_views().await?;
            self.deploy_forms().await?;
            self.deploy_apps().await?;
        }
        info!(summary = %self.report.summary(), "deployment finished");
        Ok(self.report)
    }

    /// Look up by natural key; create when absent unless this is a dry run.
    async fn ensure(
        &mut self,
        kind: ResourceKind,
        name: &str,
        lookup: Lookup,
        create: ApiRequest,
        id_field: &str,
    ) -> Result<Ensured, ProvisionError> {
        if let Some(found) = self.api.find(&lookup).await? {
            self.report.record(kind, name, StepAction::Skipped);
            return Ok(Ensured::Existing(found));
        }
        if self.options.dry_run {
            self.report.record(kind, name, StepAction::WouldCreate);
            return Ok(Ensured::Planned);
        }
        match self.api.create(create, id_field).await {
            Ok(id) => {
                self.report.record(kind, name, StepAction::Created);
                Ok(Ensured::Created(id))
            }
            Err(e) if e.is_duplicate() => {
                warn!(kind = %kind, name, "create reported a duplicate, treating as existing");
                self.report.record(kind, name, StepAction::Skipped);
                let found = self.api.find(&lookup).await?.unwrap_or(Value::Null);
                Ok(Ensured::Existing(found))
            }
            Err(e) => Err(e),
        }
    }

    /// Id of an ensured resource. `None` only for resources planned by a dry run.
    fn ensured_id(&self, ensured: &Ensured, id_field: &str, what: &str) -> Result<Option<String>, ProvisionError> {
        let id = match ensured {
            Ensured::Planned => return Ok(None),
            Ensured::Created(id) => id.clone(),
            Ensured::Existing(found) => found.get(id_field).and_then(Value::as_str).map(str::to_string),
        };
        id.map(Some)
            .ok_or_else(|| ProvisionError::UnexpectedResponse(format!("no {} returned for {}", id_field, what)))
    }

    /// Table metadata, or `None` when a dry run plans to create the table.
    async fn require_table(&self, table: &str) -> Result<Option<Value>, ProvisionError> {
        if let Some(meta) = self.api.get_optional(&entity_definition(table)).await? {
            return Ok(Some(meta));
        }
        if self.options.dry_run && self.report.is_planned(ResourceKind::Table, table) {
            debug!(table, "table planned by this dry run");
            return Ok(None);
        }
        Err(ProvisionError::MissingPrerequisite {
            kind: "table",
            name: table.to_string(),
        })
    }
}

/// Run a deployment with the given options.
pub async fn deploy(
    api: &dyn WebApi,
    config: &FullConfig,
    options: DeployOptions,
) -> Result<DeployReport, ProvisionError> {
    Deployer::new(api, config, options).run().await
}
