//! Publisher, solution, choice sets, tables, columns, relationships, alternate keys, publish.

use super::{Deployer, Ensured, Lookup, ResourceKind};
use crate::client::request::{entity_definition, keyed, quote, ApiRequest};
use crate::client::retry::{wait_until, Poll};
use crate::config::{payload, ColumnType};
use crate::error::ProvisionError;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

impl<'a> Deployer<'a> {
    pub(super) async fn deploy_schema(&mut self) -> Result<(), ProvisionError> {
        self.deploy_publisher_and_solution().await?;
        self.deploy_choices().await?;
        self.deploy_tables().await?;
        self.deploy_columns().await?;
        self.deploy_relationships().await?;
        self.deploy_keys().await?;
        self.publish_all().await
    }

    async fn deploy_publisher_and_solution(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        let Some(publisher) = &config.publisher else {
            return Ok(());
        };
        let ensured = self
            .ensure(
                ResourceKind::Publisher,
                &publisher.unique_name,
                Lookup::Filter {
                    collection: "publishers",
                    filter: format!("customizationprefix eq {}", quote(&publisher.prefix)),
                },
                ApiRequest::post(
                    "publishers",
                    json!({
                        "uniquename": publisher.unique_name,
                        "friendlyname": publisher.friendly_name,
                        "customizationprefix": publisher.prefix,
                        "customizationoptionvalueprefix": publisher.option_value_prefix,
                    }),
                ),
                "publisherid",
            )
            .await?;
        let publisher_id = self.ensured_id(&ensured, "publisherid", "publisher")?;

        let Some(solution) = &config.solution else {
            return Ok(());
        };
        let publisher_ref = format!("/publishers({})", publisher_id.unwrap_or_default());
        self.ensure(
            ResourceKind::Solution,
            &solution.unique_name,
            Lookup::Filter {
                collection: "solutions",
                filter: format!("uniquename eq {}", quote(&solution.unique_name)),
            },
            ApiRequest::post(
                "solutions",
                json!({
                    "uniquename": solution.unique_name,
                    "friendlyname": solution.friendly_name,
                    "version": solution.version,
                    "publisherid@odata.bind": publisher_ref,
                }),
            ),
            "solutionid",
        )
        .await?;
        Ok(())
    }

    async fn deploy_choices(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for choice in config.choices.iter().filter(|c| c.global) {
            self.ensure(
                ResourceKind::ChoiceSet,
                &choice.name,
                Lookup::Keyed(keyed("GlobalOptionSetDefinitions", "Name", &choice.name)),
                ApiRequest::post("GlobalOptionSetDefinitions", payload::global_option_set(choice))
                    .in_solution(config.solution_name()),
                "MetadataId",
            )
            .await?;
        }
        Ok(())
    }

    async fn deploy_tables(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for table in &config.tables {
            let logical = table.logical_name();
            let path = entity_definition(&logical);
            let ensured = self
                .ensure(
                    ResourceKind::Table,
                    &logical,
                    Lookup::Keyed(path.clone()),
                    ApiRequest::post("EntityDefinitions", payload::table(table)).in_solution(config.solution_name()),
                    "MetadataId",
                )
                .await?;
            if ensured.is_created() {
                let api = self.api;
                wait_until(&self.options.poll, &format!("table {}", logical), || async {
                    Ok(match api.get_optional(&path).await? {
                        Some(_) => Poll::Ready(()),
                        None => Poll::Pending("not yet queryable".into()),
                    })
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn deploy_columns(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for column in &config.columns {
            let logical = column.logical_name();
            let table_path = entity_definition(&column.table);
            let choice = match &column.kind {
                ColumnType::Picklist { choice } => config.choice(choice),
                _ => None,
            };
            self.ensure(
                ResourceKind::Column,
                &format!("{}.{}", column.table, logical),
                Lookup::Keyed(format!("{}/{}", table_path, keyed("Attributes", "LogicalName", &logical))),
                ApiRequest::post(format!("{}/Attributes", table_path), payload::column(column, choice))
                    .in_solution(config.solution_name()),
                "MetadataId",
            )
            .await?;
        }
        Ok(())
    }

    async fn deploy_relationships(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for rel in &config.relationships {
            self.ensure(
                ResourceKind::Relationship,
                &rel.schema_name,
                Lookup::Keyed(keyed("RelationshipDefinitions", "SchemaName", &rel.schema_name)),
                ApiRequest::post("RelationshipDefinitions", payload::relationship(rel))
                    .in_solution(config.solution_name()),
                "MetadataId",
            )
            .await?;
        }
        Ok(())
    }

    async fn deploy_keys(&mut self) -> Result<(), ProvisionError> {
        let config = self.config;
        for key in &config.keys {
            let logical = key.logical_name();
            let collection = format!("{}/Keys", entity_definition(&key.table));
            let filter = format!("LogicalName eq {}", quote(&logical));
            let name = format!("{}.{}", key.table, logical);
            let ensured = self
                .ensure(
                    ResourceKind::AlternateKey,
                    &name,
                    Lookup::Metadata {
                        collection: collection.clone(),
                        filter: filter.clone(),
                    },
                    ApiRequest::post(collection.as_str(), payload::alternate_key(key))
                        .in_solution(config.solution_name()),
                    "MetadataId",
                )
                .await?;
            let current = match &ensured {
                Ensured::Planned => continue,
                Ensured::Existing(found) => key_status(found),
                Ensured::Created(_) => None,
            };
            if current.as_deref() == Some("Active") {
                continue;
            }
            let api = self.api;
            let request = ApiRequest::get(collection.as_str()).filter(filter.as_str());
            wait_until(&self.options.poll, &format!("alternate key {}", name), || async {
                let status = api.query(request.clone()).await?.first().and_then(key_status);
                match status.as_deref() {
                    Some("Active") => Ok(Poll::Ready(())),
                    Some("Failed") => Err(ProvisionError::UnexpectedResponse(format!(
                        "alternate key {} activation failed",
                        name
                    ))),
                    other => Ok(Poll::Pending(other.unwrap_or("absent").to_string())),
                }
            })
            .await?;
            info!(key = %name, "alternate key active");
        }
        Ok(())
    }

    async fn publish_all(&mut self) -> Result<(), ProvisionError> {
        if self.options.dry_run {
            return Ok(());
        }
        self.api.request(ApiRequest::new(Method::POST, "PublishAllXml")).await?;
        self.report.published = true;
        info!("published all customizations");
        Ok(())
    }
}

fn key_status(key: &Value) -> Option<String> {
    key.get("EntityKeyIndexStatus")
        .and_then(Value::as_str)
        .map(str::to_string)
}
