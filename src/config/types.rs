//! Raw definition types matching the bundled JSON definition files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub unique_name: String,
    pub friendly_name: String,
    pub prefix: String,
    pub option_value_prefix: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolutionConfig {
    pub unique_name: String,
    pub friendly_name: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub value: i32,
    pub label: String,
}

/// A choice list. Global sets are created once and bound by name; local sets are inlined
/// into every picklist column that references them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChoiceSetConfig {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub global: bool,
    pub options: Vec<ChoiceOption>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipType {
    UserOwned,
    OrganizationOwned,
}

impl OwnershipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipType::UserOwned => "UserOwned",
            OwnershipType::OrganizationOwned => "OrganizationOwned",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrimaryNameConfig {
    pub schema_name: String,
    pub display_name: String,
    pub max_length: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub auto_number_format: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableConfig {
    pub schema_name: String,
    /// Web API collection name for data queries. Defaults to the logical name plus "s".
    #[serde(default)]
    pub entity_set_name: Option<String>,
    pub display_name: String,
    pub display_collection_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub ownership: OwnershipType,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
    pub primary_name: PrimaryNameConfig,
}

impl TableConfig {
    pub fn logical_name(&self) -> String {
        self.schema_name.to_lowercase()
    }

    pub fn entity_set(&self) -> String {
        self.entity_set_name
            .clone()
            .unwrap_or_else(|| format!("{}s", self.logical_name()))
    }

    /// Name of the primary key attribute (e.g. `fsi_environmentrequestid`).
    pub fn primary_id(&self) -> String {
        format!("{}id", self.logical_name())
    }

    pub fn primary_name_logical(&self) -> String {
        self.primary_name.schema_name.to_lowercase()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringFormat {
    #[default]
    Text,
    Url,
    Email,
}

impl StringFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StringFormat::Text => "Text",
            StringFormat::Url => "Url",
            StringFormat::Email => "Email",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    String {
        max_length: u32,
        #[serde(default)]
        format: StringFormat,
    },
    Memo {
        max_length: u32,
    },
    Integer {
        min: i32,
        max: i32,
    },
    DateTime {
        #[serde(default)]
        date_only: bool,
    },
    Boolean {
        #[serde(default)]
        default: bool,
    },
    Picklist {
        choice: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// Logical name of the owning table.
    pub table: String,
    pub schema_name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub kind: ColumnType,
}

impl ColumnConfig {
    pub fn logical_name(&self) -> String {
        self.schema_name.to_lowercase()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadeDelete {
    #[default]
    Restrict,
    RemoveLink,
    Cascade,
}

impl CascadeDelete {
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeDelete::Restrict => "Restrict",
            CascadeDelete::RemoveLink => "RemoveLink",
            CascadeDelete::Cascade => "Cascade",
        }
    }
}

/// One-to-many relationship; creating it also creates the lookup column on the referencing table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub schema_name: String,
    /// May be a system table (e.g. `systemuser`) that is not defined here.
    pub referenced_table: String,
    pub referencing_table: String,
    pub lookup_schema_name: String,
    pub lookup_display_name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub cascade_delete: CascadeDelete,
}

impl RelationshipConfig {
    pub fn lookup_logical_name(&self) -> String {
        self.lookup_schema_name.to_lowercase()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlternateKeyConfig {
    pub table: String,
    pub schema_name: String,
    pub display_name: String,
    /// Logical column names making up the key.
    pub columns: Vec<String>,
}

impl AlternateKeyConfig {
    pub fn logical_name(&self) -> String {
        self.schema_name.to_lowercase()
    }
}

/// Table-level operation a role privilege grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrivilegeOp {
    Create,
    Read,
    Write,
    Delete,
    Append,
    AppendTo,
    Assign,
    Share,
}

impl PrivilegeOp {
    /// Operations checked for every table a role mentions.
    pub const AUDITED: [PrivilegeOp; 6] = [
        PrivilegeOp::Create,
        PrivilegeOp::Read,
        PrivilegeOp::Write,
        PrivilegeOp::Delete,
        PrivilegeOp::Append,
        PrivilegeOp::AppendTo,
    ];

    // AppendTo precedes Append so prefix matching picks the longer name.
    const PARSE_ORDER: [PrivilegeOp; 8] = [
        PrivilegeOp::Create,
        PrivilegeOp::Read,
        PrivilegeOp::Write,
        PrivilegeOp::Delete,
        PrivilegeOp::AppendTo,
        PrivilegeOp::Append,
        PrivilegeOp::Assign,
        PrivilegeOp::Share,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegeOp::Create => "Create",
            PrivilegeOp::Read => "Read",
            PrivilegeOp::Write => "Write",
            PrivilegeOp::Delete => "Delete",
            PrivilegeOp::Append => "Append",
            PrivilegeOp::AppendTo => "AppendTo",
            PrivilegeOp::Assign => "Assign",
            PrivilegeOp::Share => "Share",
        }
    }

    /// Platform privilege name, e.g. `prvCreatefsi_environmentrequest`.
    pub fn privilege_name(&self, table: &str) -> String {
        format!("prv{}{}", self.as_str(), table)
    }

    /// Split a privilege name back into operation and table logical name.
    pub fn parse_privilege_name(name: &str) -> Option<(PrivilegeOp, String)> {
        let rest = name.strip_prefix("prv")?;
        Self::PARSE_ORDER.iter().find_map(|op| {
            rest.strip_prefix(op.as_str())
                .filter(|table| !table.is_empty())
                .map(|table| (*op, table.to_string()))
        })
    }
}

impl fmt::Display for PrivilegeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope of a privilege in the platform's access model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrivilegeDepth {
    User,
    BusinessUnit,
    ParentChild,
    Organization,
}

impl PrivilegeDepth {
    pub fn mask(&self) -> u8 {
        match self {
            PrivilegeDepth::User => 1,
            PrivilegeDepth::BusinessUnit => 2,
            PrivilegeDepth::ParentChild => 4,
            PrivilegeDepth::Organization => 8,
        }
    }

    pub fn from_mask(mask: u64) -> Option<Self> {
        match mask {
            1 => Some(PrivilegeDepth::User),
            2 => Some(PrivilegeDepth::BusinessUnit),
            4 => Some(PrivilegeDepth::ParentChild),
            8 => Some(PrivilegeDepth::Organization),
            _ => None,
        }
    }

    /// Name used by the Web API `PrivilegeDepth` enum type.
    pub fn api_name(&self) -> &'static str {
        match self {
            PrivilegeDepth::User => "Basic",
            PrivilegeDepth::BusinessUnit => "Local",
            PrivilegeDepth::ParentChild => "Deep",
            PrivilegeDepth::Organization => "Global",
        }
    }

    pub fn from_api_name(name: &str) -> Option<Self> {
        match name {
            "Basic" => Some(PrivilegeDepth::User),
            "Local" => Some(PrivilegeDepth::BusinessUnit),
            "Deep" => Some(PrivilegeDepth::ParentChild),
            "Global" => Some(PrivilegeDepth::Organization),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PrivilegeDepth::User => "User",
            PrivilegeDepth::BusinessUnit => "Business Unit",
            PrivilegeDepth::ParentChild => "Parent: Child Business Units",
            PrivilegeDepth::Organization => "Organization",
        }
    }
}

impl fmt::Display for PrivilegeDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// table logical name -> operation -> depth
pub type PrivilegeMatrix = BTreeMap<String, BTreeMap<PrivilegeOp, PrivilegeDepth>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForbiddenPrivilege {
    pub table: String,
    pub operation: PrivilegeOp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    pub description: String,
    pub privileges: PrivilegeMatrix,
    /// Privileges that must never be granted (e.g. Write/Delete on an append-only log).
    #[serde(default)]
    pub forbidden: Vec<ForbiddenPrivilege>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldPermissionConfig {
    pub column: String,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSecurityProfileConfig {
    pub name: String,
    pub description: String,
    pub table: String,
    pub permissions: Vec<FieldPermissionConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleCondition {
    pub attribute: String,
    /// The rule fires when the attribute equals any of these option values.
    pub equals: Vec<i32>,
}

/// Business rule toggling a column between required and optional.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusinessRuleConfig {
    pub name: String,
    pub description: String,
    pub table: String,
    pub condition: RuleCondition,
    pub target_attribute: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewColumn {
    pub name: String,
    #[serde(default = "default_width")]
    pub width: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewFilter {
    pub attribute: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewOrder {
    pub attribute: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    pub description: String,
    pub table: String,
    #[serde(default)]
    pub is_default: bool,
    pub columns: Vec<ViewColumn>,
    #[serde(default)]
    pub filters: Vec<ViewFilter>,
    #[serde(default)]
    pub order: Option<ViewOrder>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormTab {
    pub name: String,
    pub label: String,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormConfig {
    pub name: String,
    pub description: String,
    pub table: String,
    pub tabs: Vec<FormTab>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppModuleConfig {
    pub unique_name: String,
    pub name: String,
    pub description: String,
    pub tables: Vec<String>,
    /// View names to add as app components.
    #[serde(default)]
    pub views: Vec<String>,
    /// Form names to add as app components.
    #[serde(default)]
    pub forms: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceTarget {
    pub table: String,
    pub date_field: String,
    /// File name prefix, e.g. `EnvironmentRequest` -> `EnvironmentRequest-2026-Q1.json`.
    pub file_prefix: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvidenceConfig {
    pub targets: Vec<EvidenceTarget>,
}

/// An append-only table whose audit trail must show no updates or deletes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImmutabilityConfig {
    pub table: String,
    pub timestamp_field: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Lookup value field that must be set on every record (e.g. `_fsi_environmentrequest_value`).
    #[serde(default)]
    pub parent_lookup: Option<String>,
}

/// Columns the platform adds to every custom table.
pub const SYSTEM_ATTRIBUTES: [&str; 7] = [
    "createdon",
    "createdby",
    "modifiedon",
    "modifiedby",
    "ownerid",
    "statecode",
    "statuscode",
];

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    150
}

/// All definitions in one struct for in-memory loading.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FullConfig {
    pub publisher: Option<PublisherConfig>,
    pub solution: Option<SolutionConfig>,
    pub choices: Vec<ChoiceSetConfig>,
    pub tables: Vec<TableConfig>,
    pub columns: Vec<ColumnConfig>,
    pub relationships: Vec<RelationshipConfig>,
    pub keys: Vec<AlternateKeyConfig>,
    pub roles: Vec<RoleConfig>,
    pub field_security: Vec<FieldSecurityProfileConfig>,
    pub business_rules: Vec<BusinessRuleConfig>,
    pub views: Vec<ViewConfig>,
    pub forms: Vec<FormConfig>,
    pub apps: Vec<AppModuleConfig>,
    pub evidence: Option<EvidenceConfig>,
    pub immutability: Option<ImmutabilityConfig>,
}

impl FullConfig {
    pub fn table(&self, logical_name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.logical_name() == logical_name)
    }

    pub fn choice(&self, name: &str) -> Option<&ChoiceSetConfig> {
        self.choices.iter().find(|c| c.name == name)
    }

    pub fn columns_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnConfig> + 'a {
        self.columns.iter().filter(move |c| c.table == table)
    }

    pub fn solution_name(&self) -> Option<&str> {
        self.solution.as_ref().map(|s| s.unique_name.as_str())
    }

    /// Every attribute logical name a table will carry once deployed: platform columns,
    /// primary name, configured columns, and lookups created by relationships.
    pub fn attribute_names(&self, table: &str) -> Vec<String> {
        let mut names: Vec<String> = SYSTEM_ATTRIBUTES.iter().map(|s| s.to_string()).collect();
        if let Some(t) = self.table(table) {
            names.push(t.primary_id());
            names.push(t.primary_name_logical());
        }
        names.extend(self.columns_for(table).map(|c| c.logical_name()));
        names.extend(
            self.relationships
                .iter()
                .filter(|r| r.referencing_table == table)
                .map(|r| r.lookup_logical_name()),
        );
        names
    }
}
