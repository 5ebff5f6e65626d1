//! Definition validation: referential integrity and natural-key uniqueness.

use crate::config::{ColumnType, FullConfig};
use crate::error::ConfigError;
use std::collections::HashSet;

pub fn validate(config: &FullConfig) -> Result<(), ConfigError> {
    if config.solution.is_some() && config.publisher.is_none() {
        return Err(ConfigError::Validation("a solution requires a publisher".into()));
    }

    unique("choice set", config.choices.iter().map(|c| c.name.clone()))?;
    unique("table", config.tables.iter().map(|t| t.logical_name()))?;
    unique(
        "column",
        config
            .columns
            .iter()
            .map(|c| format!("{}.{}", c.table, c.logical_name())),
    )?;
    unique("relationship", config.relationships.iter().map(|r| r.schema_name.clone()))?;
    unique("alternate key", config.keys.iter().map(|k| format!("{}.{}", k.table, k.logical_name())))?;
    unique("role", config.roles.iter().map(|r| r.name.clone()))?;
    unique("field security profile", config.field_security.iter().map(|p| p.name.clone()))?;
    unique("business rule", config.business_rules.iter().map(|b| b.name.clone()))?;
    unique("view", config.views.iter().map(|v| format!("{}.{}", v.table, v.name)))?;
    unique("form", config.forms.iter().map(|f| format!("{}.{}", f.table, f.name)))?;
    unique("app module", config.apps.iter().map(|a| a.unique_name.clone()))?;

    for choice in &config.choices {
        unique(
            "choice value",
            choice.options.iter().map(|o| format!("{}={}", choice.name, o.value)),
        )?;
    }

    for c in &config.columns {
        require_table(config, &c.table)?;
        if let ColumnType::Picklist { choice } = &c.kind {
            if config.choice(choice).is_none() {
                return Err(ConfigError::MissingReference {
                    kind: "choice set",
                    id: choice.clone(),
                });
            }
        }
    }

    for r in &config.relationships {
        require_table(config, &r.referencing_table)?;
    }

    for k in &config.keys {
        require_table(config, &k.table)?;
        if k.columns.is_empty() {
            return Err(ConfigError::Validation(format!("alternate key {} has no columns", k.schema_name)));
        }
        for column in &k.columns {
            require_attribute(config, &k.table, column)?;
        }
    }

    for role in &config.roles {
        if role.privileges.is_empty() {
            return Err(ConfigError::Validation(format!("role {} declares no privileges", role.name)));
        }
        for table in role.privileges.keys() {
            require_table(config, table)?;
        }
        for forbidden in &role.forbidden {
            require_table(config, &forbidden.table)?;
            let granted = role
                .privileges
                .get(&forbidden.table)
                .map(|ops| ops.contains_key(&forbidden.operation))
                .unwrap_or(false);
            if granted {
                return Err(ConfigError::Validation(format!(
                    "role {} both grants and forbids {} on {}",
                    role.name, forbidden.operation, forbidden.table
                )));
            }
        }
    }

    for profile in &config.field_security {
        require_table(config, &profile.table)?;
        for permission in &profile.permissions {
            require_attribute(config, &profile.table, &permission.column)?;
        }
    }

    for rule in &config.business_rules {
        require_table(config, &rule.table)?;
        require_attribute(config, &rule.table, &rule.condition.attribute)?;
        require_attribute(config, &rule.table, &rule.target_attribute)?;
    }

    for view in &config.views {
        require_table(config, &view.table)?;
        for column in &view.columns {
            require_attribute(config, &view.table, &column.name)?;
        }
        for filter in &view.filters {
            require_attribute(config, &view.table, &filter.attribute)?;
        }
        if let Some(order) = &view.order {
            require_attribute(config, &view.table, &order.attribute)?;
        }
    }

    for form in &config.forms {
        require_table(config, &form.table)?;
        for field in form.tabs.iter().flat_map(|t| &t.fields) {
            require_attribute(config, &form.table, field)?;
        }
    }

    for app in &config.apps {
        for table in &app.tables {
            require_table(config, table)?;
        }
        for view in &app.views {
            if !config.views.iter().any(|v| &v.name == view) {
                return Err(ConfigError::MissingReference {
                    kind: "view",
                    id: view.clone(),
                });
            }
        }
        for form in &app.forms {
            if !config.forms.iter().any(|f| &f.name == form) {
                return Err(ConfigError::MissingReference {
                    kind: "form",
                    id: form.clone(),
                });
            }
        }
    }

    if let Some(evidence) = &config.evidence {
        unique("evidence prefix", evidence.targets.iter().map(|t| t.file_prefix.clone()))?;
        for target in &evidence.targets {
            require_table(config, &target.table)?;
            require_attribute(config, &target.table, &target.date_field)?;
        }
    }

    if let Some(immutable) = &config.immutability {
        require_table(config, &immutable.table)?;
        require_attribute(config, &immutable.table, &immutable.timestamp_field)?;
        for field in &immutable.required_fields {
            require_attribute(config, &immutable.table, field)?;
        }
    }

    Ok(())
}

fn unique(kind: &'static str, names: impl Iterator<Item = String>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.to_lowercase()) {
            return Err(ConfigError::Duplicate { kind, name });
        }
    }
    Ok(())
}

fn require_table(config: &FullConfig, table: &str) -> Result<(), ConfigError> {
    if config.table(table).is_none() {
        return Err(ConfigError::MissingReference {
            kind: "table",
            id: table.to_string(),
        });
    }
    Ok(())
}

fn require_attribute(config: &FullConfig, table: &str, attribute: &str) -> Result<(), ConfigError> {
    if !config.attribute_names(table).iter().any(|a| a == attribute) {
        return Err(ConfigError::MissingReference {
            kind: "column",
            id: format!("{}.{}", table, attribute),
        });
    }
    Ok(())
}
