use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ResourceKind {
    Publisher,
    Solution,
    ChoiceSet,
    Table,
    Column,
    Relationship,
    AlternateKey,
    SecurityRole,
    RolePrivilege,
    FieldSecurityProfile,
    FieldPermission,
    BusinessRule,
    View,
    Form,
    AppModule,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Publisher => "publisher",
            ResourceKind::Solution => "solution",
            ResourceKind::ChoiceSet => "choice set",
            ResourceKind::Table => "table",
            ResourceKind::Column => "column",
            ResourceKind::Relationship => "relationship",
            ResourceKind::AlternateKey => "alternate key",
            ResourceKind::SecurityRole => "security role",
            ResourceKind::RolePrivilege => "role privilege",
            ResourceKind::FieldSecurityProfile => "field security profile",
            ResourceKind::FieldPermission => "field permission",
            ResourceKind::BusinessRule => "business rule",
            ResourceKind::View => "view",
            ResourceKind::Form => "form",
            ResourceKind::AppModule => "app module",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StepAction {
    Created,
    Skipped,
    WouldCreate,
}

#[derive(Clone, Debug, Serialize)]
pub struct StepOutcome {
    pub kind: ResourceKind,
    pub name: String,
    pub action: StepAction,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DeployReport {
    pub dry_run: bool,
    pub published: bool,
    pub steps: Vec<StepOutcome>,
}

impl DeployReport {
    pub fn record(&mut self, kind: ResourceKind, name: impl Into<String>, action: StepAction) {
        let name = name.into();
        match action {
            StepAction::Created => tracing::info!(kind = %kind, name = %name, "created"),
            StepAction::Skipped => tracing::info!(kind = %kind, name = %name, "already exists, skipping"),
            StepAction::WouldCreate => tracing::info!(kind = %kind, name = %name, "would create"),
        }
        self.steps.push(StepOutcome { kind, name, action });
    }

    pub fn count(&self, action: StepAction) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    pub fn created(&self) -> usize {
        self.count(StepAction::Created)
    }

    pub fn action_for(&self, kind: ResourceKind, name: &str) -> Option<StepAction> {
        self.steps
            .iter()
            .find(|s| s.kind == kind && s.name == name)
            .map(|s| s.action)
    }

    /// True when this dry run plans to create the named resource.
    pub fn is_planned(&self, kind: ResourceKind, name: &str) -> bool {
        self.action_for(kind, name) == Some(StepAction::WouldCreate)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} created, {} skipped, {} would be created",
            self.count(StepAction::Created),
            self.count(StepAction::Skipped),
            self.count(StepAction::WouldCreate)
        )
    }
}
