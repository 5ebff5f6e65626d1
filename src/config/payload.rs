//! Web API metadata bodies and the XML documents (FetchXML, layout, XAML, form) built from
//! definitions.

use crate::config::types::*;
use serde_json::{json, Value};
use std::fmt::Write;
use uuid::Uuid;

pub const LANGUAGE_CODE: u32 = 1033;

/// Default app module icon web resource shipped with every environment.
pub const DEFAULT_APP_ICON: &str = "953b9fac-1e5e-e611-80d6-00155ded156f";

pub fn label(text: &str) -> Value {
    json!({
        "@odata.type": "Microsoft.Dynamics.CRM.Label",
        "LocalizedLabels": [{
            "@odata.type": "Microsoft.Dynamics.CRM.LocalizedLabel",
            "Label": text,
            "LanguageCode": LANGUAGE_CODE,
        }],
    })
}

pub fn required_level(required: bool) -> Value {
    let level = if required { "ApplicationRequired" } else { "None" };
    json!({
        "Value": level,
        "CanBeChanged": true,
        "ManagedPropertyLogicalName": "canmodifyrequirementlevelsettings",
    })
}

fn options(choice: &ChoiceSetConfig) -> Vec<Value> {
    choice
        .options
        .iter()
        .map(|o| json!({ "Value": o.value, "Label": label(&o.label) }))
        .collect()
}

/// Body for `POST GlobalOptionSetDefinitions`.
pub fn global_option_set(choice: &ChoiceSetConfig) -> Value {
    let mut body = json!({
        "@odata.type": "Microsoft.Dynamics.CRM.OptionSetMetadata",
        "Name": choice.name,
        "DisplayName": label(&choice.display_name),
        "OptionSetType": "Picklist",
        "IsGlobal": true,
        "Options": options(choice),
    });
    if let Some(description) = &choice.description {
        body["Description"] = label(description);
    }
    body
}

fn local_option_set(choice: &ChoiceSetConfig) -> Value {
    json!({
        "@odata.type": "Microsoft.Dynamics.CRM.OptionSetMetadata",
        "IsGlobal": false,
        "OptionSetType": "Picklist",
        "Options": options(choice),
    })
}

/// Body for `POST EntityDefinitions`, including the primary name attribute.
pub fn table(table: &TableConfig) -> Value {
    let primary = &table.primary_name;
    let mut primary_attr = json!({
        "@odata.type": "Microsoft.Dynamics.CRM.StringAttributeMetadata",
        "SchemaName": primary.schema_name,
        "DisplayName": label(&primary.display_name),
        "IsPrimaryName": true,
        "MaxLength": primary.max_length,
        "RequiredLevel": required_level(true),
        "FormatName": { "Value": "Text" },
    });
    if let Some(description) = &primary.description {
        primary_attr["Description"] = label(description);
    }
    if let Some(format) = &primary.auto_number_format {
        primary_attr["AutoNumberFormat"] = json!(format);
    }
    let mut body = json!({
        "@odata.type": "Microsoft.Dynamics.CRM.EntityMetadata",
        "SchemaName": table.schema_name,
        "DisplayName": label(&table.display_name),
        "DisplayCollectionName": label(&table.display_collection_name),
        "OwnershipType": table.ownership.as_str(),
        "HasActivities": false,
        "HasNotes": false,
        "IsAuditEnabled": {
            "Value": table.audit_enabled,
            "CanBeChanged": true,
            "ManagedPropertyLogicalName": "canmodifyauditsettings",
        },
        "PrimaryNameAttribute": table.primary_name_logical(),
        "Attributes": [primary_attr],
    });
    if let Some(description) = &table.description {
        body["Description"] = label(description);
    }
    body
}

/// Body for `POST EntityDefinitions(LogicalName='..')/Attributes`. `choice` must be the set a
/// picklist column refers to.
pub fn column(column: &ColumnConfig, choice: Option<&ChoiceSetConfig>) -> Value {
    let mut body = json!({
        "SchemaName": column.schema_name,
        "DisplayName": label(&column.display_name),
        "RequiredLevel": required_level(column.required),
    });
    if let Some(description) = &column.description {
        body["Description"] = label(description);
    }
    let typed = match &column.kind {
        ColumnType::String { max_length, format } => json!({
            "@odata.type": "Microsoft.Dynamics.CRM.StringAttributeMetadata",
            "MaxLength": max_length,
            "FormatName": { "Value": format.as_str() },
        }),
        ColumnType::Memo { max_length } => json!({
            "@odata.type": "Microsoft.Dynamics.CRM.MemoAttributeMetadata",
            "MaxLength": max_length,
            "Format": "TextArea",
        }),
        ColumnType::Integer { min, max } => json!({
            "@odata.type": "Microsoft.Dynamics.CRM.IntegerAttributeMetadata",
            "MinValue": min,
            "MaxValue": max,
            "Format": "None",
        }),
        ColumnType::DateTime { date_only } => {
            let (format, behavior) = if *date_only {
                ("DateOnly", "DateOnly")
            } else {
                ("DateAndTime", "UserLocal")
            };
            json!({
                "@odata.type": "Microsoft.Dynamics.CRM.DateTimeAttributeMetadata",
                "Format": format,
                "DateTimeBehavior": { "Value": behavior },
            })
        }
        ColumnType::Boolean { default } => json!({
            "@odata.type": "Microsoft.Dynamics.CRM.BooleanAttributeMetadata",
            "DefaultValue": default,
            "OptionSet": {
                "@odata.type": "Microsoft.Dynamics.CRM.BooleanOptionSetMetadata",
                "TrueOption": { "Value": 1, "Label": label("Yes") },
                "FalseOption": { "Value": 0, "Label": label("No") },
                "OptionSetType": "Boolean",
            },
        }),
        ColumnType::Picklist { choice: name } => match choice {
            Some(set) if !set.global => json!({
                "@odata.type": "Microsoft.Dynamics.CRM.PicklistAttributeMetadata",
                "OptionSet": local_option_set(set),
            }),
            _ => json!({
                "@odata.type": "Microsoft.Dynamics.CRM.PicklistAttributeMetadata",
                "GlobalOptionSet@odata.bind": format!("/GlobalOptionSetDefinitions(Name='{}')", name),
            }),
        },
    };
    merge(&mut body, typed);
    body
}

/// Body for `POST RelationshipDefinitions`.
pub fn relationship(rel: &RelationshipConfig) -> Value {
    json!({
        "@odata.type": "Microsoft.Dynamics.CRM.OneToManyRelationshipMetadata",
        "SchemaName": rel.schema_name,
        "ReferencedEntity": rel.referenced_table,
        "ReferencedAttribute": format!("{}id", rel.referenced_table),
        "ReferencingEntity": rel.referencing_table,
        "CascadeConfiguration": {
            "Assign": "NoCascade",
            "Delete": rel.cascade_delete.as_str(),
            "Merge": "NoCascade",
            "Reparent": "NoCascade",
            "Share": "NoCascade",
            "Unshare": "NoCascade",
        },
        "Lookup": {
            "@odata.type": "Microsoft.Dynamics.CRM.LookupAttributeMetadata",
            "SchemaName": rel.lookup_schema_name,
            "DisplayName": label(&rel.lookup_display_name),
            "RequiredLevel": required_level(rel.required),
        },
    })
}

/// Body for `POST EntityDefinitions(LogicalName='..')/Keys`.
pub fn alternate_key(key: &AlternateKeyConfig) -> Value {
    json!({
        "@odata.type": "Microsoft.Dynamics.CRM.EntityKeyMetadata",
        "SchemaName": key.schema_name,
        "DisplayName": label(&key.display_name),
        "KeyAttributes": key.columns,
    })
}

/// Body for `POST workflows` creating an activated, table-scoped business rule.
pub fn business_rule(rule: &BusinessRuleConfig) -> Value {
    json!({
        "name": rule.name,
        "description": rule.description,
        "primaryentity": rule.table,
        "category": 2,
        "type": 1,
        "scope": 4,
        "mode": 0,
        "statecode": 1,
        "statuscode": 2,
        "xaml": business_rule_xaml(rule),
    })
}

fn set_required_action(table: &str, attribute: &str, level: &str) -> String {
    format!(
        concat!(
            "        <Action Name=\"Set Required Level\">\n",
            "          <Arguments>\n",
            "            <Argument Name=\"EntityName\">{}</Argument>\n",
            "            <Argument Name=\"AttributeName\">{}</Argument>\n",
            "            <Argument Name=\"RequiredLevel\">{}</Argument>\n",
            "          </Arguments>\n",
            "        </Action>\n",
        ),
        xml_escape(table),
        xml_escape(attribute),
        level
    )
}

/// Rule definition: target is Required while the condition holds, None otherwise.
pub fn business_rule_xaml(rule: &BusinessRuleConfig) -> String {
    let table = xml_escape(&rule.table);
    let attribute = xml_escape(&rule.condition.attribute);
    let mut conditions = String::new();
    for value in &rule.condition.equals {
        let _ = write!(
            conditions,
            "          <Condition EntityName=\"{}\" AttributeName=\"{}\" Operator=\"Equals\"><Value>{}</Value></Condition>\n",
            table, attribute, value
        );
    }
    if rule.condition.equals.len() > 1 {
        conditions = format!("        <Or>\n{}        </Or>\n", conditions);
    }
    format!(
        concat!(
            "<RuleDefinitions xmlns=\"http://schemas.microsoft.com/crm/2009/WebServices\">\n",
            "  <Steps>\n",
            "    <Step Name=\"{name}\" Description=\"{description}\">\n",
            "      <Condition>\n{conditions}      </Condition>\n",
            "      <TrueStep>\n{when_true}      </TrueStep>\n",
            "      <FalseStep>\n{when_false}      </FalseStep>\n",
            "    </Step>\n",
            "  </Steps>\n",
            "</RuleDefinitions>"
        ),
        name = xml_escape(&rule.name),
        description = xml_escape(&rule.description),
        conditions = conditions,
        when_true = set_required_action(&rule.table, &rule.target_attribute, "Required"),
        when_false = set_required_action(&rule.table, &rule.target_attribute, "None"),
    )
}

pub fn view_fetch_xml(view: &ViewConfig) -> String {
    let mut xml = String::from("<fetch version=\"1.0\" output-format=\"xml-platform\" mapping=\"logical\">\n");
    let _ = writeln!(xml, "  <entity name=\"{}\">", xml_escape(&view.table));
    for column in &view.columns {
        let _ = writeln!(xml, "    <attribute name=\"{}\"/>", xml_escape(&column.name));
    }
    if let Some(order) = &view.order {
        if !view.columns.iter().any(|c| c.name == order.attribute) {
            let _ = writeln!(xml, "    <attribute name=\"{}\"/>", xml_escape(&order.attribute));
        }
        let _ = writeln!(
            xml,
            "    <order attribute=\"{}\" descending=\"{}\"/>",
            xml_escape(&order.attribute),
            order.descending
        );
    }
    if !view.filters.is_empty() {
        xml.push_str("    <filter type=\"and\">\n");
        for filter in &view.filters {
            match &filter.value {
                Some(value) => {
                    let _ = writeln!(
                        xml,
                        "      <condition attribute=\"{}\" operator=\"{}\" value=\"{}\"/>",
                        xml_escape(&filter.attribute),
                        xml_escape(&filter.operator),
                        xml_escape(value)
                    );
                }
                None => {
                    let _ = writeln!(
                        xml,
                        "      <condition attribute=\"{}\" operator=\"{}\"/>",
                        xml_escape(&filter.attribute),
                        xml_escape(&filter.operator)
                    );
                }
            }
        }
        xml.push_str("    </filter>\n");
    }
    xml.push_str("  </entity>\n</fetch>");
    xml
}

/// Grid layout. `object_type_code` comes from the deployed table's metadata.
pub fn view_layout_xml(view: &ViewConfig, table: &TableConfig, object_type_code: i64) -> String {
    let mut xml = format!(
        "<grid name=\"resultset\" object=\"{}\" jump=\"{}\" select=\"1\" icon=\"1\" preview=\"1\">\n",
        object_type_code,
        table.primary_name_logical()
    );
    let _ = writeln!(xml, "  <row name=\"result\" id=\"{}\">", table.primary_id());
    for column in &view.columns {
        let _ = writeln!(
            xml,
            "    <cell name=\"{}\" width=\"{}\"/>",
            xml_escape(&column.name),
            column.width
        );
    }
    xml.push_str("  </row>\n</grid>");
    xml
}

/// Body for `POST savedqueries`.
pub fn view(view: &ViewConfig, table: &TableConfig, object_type_code: i64) -> Value {
    json!({
        "name": view.name,
        "description": view.description,
        "returnedtypecode": view.table,
        "querytype": 0,
        "isdefault": view.is_default,
        "fetchxml": view_fetch_xml(view),
        "layoutxml": view_layout_xml(view, table, object_type_code),
    })
}

const TEXT_CONTROL_CLASS: &str = "{4273EDBD-AC1D-40d3-9FB2-095C621B552D}";

fn braced_id() -> String {
    format!("{{{}}}", Uuid::new_v4())
}

/// Main form with one single-column section per tab. `field_label` resolves display names.
pub fn form_xml(form: &FormConfig, field_label: impl Fn(&str) -> String) -> String {
    let mut xml = String::from("<form><tabs>");
    for tab in &form.tabs {
        let tab_label = xml_escape(&tab.label);
        let _ = write!(
            xml,
            "<tab name=\"{}\" id=\"{}\" IsUserDefined=\"1\" verticallayout=\"true\"><labels><label description=\"{}\" languagecode=\"{}\"/></labels>",
            xml_escape(&tab.name),
            braced_id(),
            tab_label,
            LANGUAGE_CODE
        );
        let _ = write!(
            xml,
            "<columns><column width=\"100%\"><sections><section name=\"{}_section\" id=\"{}\" IsUserDefined=\"1\" showlabel=\"false\" showbar=\"false\"><labels><label description=\"{}\" languagecode=\"{}\"/></labels><rows>",
            xml_escape(&tab.name),
            braced_id(),
            tab_label,
            LANGUAGE_CODE
        );
        for field in &tab.fields {
            let _ = write!(
                xml,
                "<row><cell id=\"{}\"><labels><label description=\"{}\" languagecode=\"{}\"/></labels><control id=\"{}\" classid=\"{}\" datafieldname=\"{}\"/></cell></row>",
                braced_id(),
                xml_escape(&field_label(field)),
                LANGUAGE_CODE,
                xml_escape(field),
                TEXT_CONTROL_CLASS,
                xml_escape(field)
            );
        }
        xml.push_str("</rows></section></sections></column></columns></tab>");
    }
    xml.push_str("</tabs></form>");
    xml
}

/// Body for `POST systemforms` (type 2 = main form).
pub fn form(form: &FormConfig, field_label: impl Fn(&str) -> String) -> Value {
    json!({
        "name": form.name,
        "description": form.description,
        "objecttypecode": form.table,
        "type": 2,
        "formxml": form_xml(form, field_label),
    })
}

/// Display name for an attribute, falling back to its logical name.
pub fn attribute_label(config: &FullConfig, table: &str, attribute: &str) -> String {
    if let Some(t) = config.table(table) {
        if t.primary_name_logical() == attribute {
            return t.primary_name.display_name.clone();
        }
    }
    if let Some(c) = config.columns_for(table).find(|c| c.logical_name() == attribute) {
        return c.display_name.clone();
    }
    if let Some(r) = config
        .relationships
        .iter()
        .find(|r| r.referencing_table == table && r.lookup_logical_name() == attribute)
    {
        return r.lookup_display_name.clone();
    }
    attribute.to_string()
}

/// Field permission flag: 4 = allowed, 0 = not allowed.
pub fn permission_flag(allowed: bool) -> u8 {
    if allowed {
        4
    } else {
        0
    }
}

pub fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        target.extend(extra);
    }
}
