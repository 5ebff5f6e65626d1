//! Quarterly evidence export with per-file and manifest SHA-256 hashes.
//!
//! Records are written as canonical JSON (object keys sorted at every depth, two-space
//! indentation) so the same record set always hashes the same regardless of the key order the
//! service returned. The manifest hash covers the manifest serialized without its own hash.

use crate::client::api::WebApi;
use crate::client::request::ApiRequest;
use crate::config::{EvidenceTarget, FullConfig};
use crate::error::{ConfigError, ProvisionError};
use crate::period::DateRange;
use chrono::{SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
const EXPORTED_BY: &str = concat!("dataverse-provisioner ", env!("CARGO_PKG_VERSION"));

/// Serializes a JSON value with object keys in sorted order.
pub struct Canonical<'a>(pub &'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    out.serialize_entry(key, &Canonical(value))?;
                }
                out.end()
            }
            Value::Array(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(&Canonical(item))?;
                }
                out.end()
            }
            other => other.serialize(serializer),
        }
    }
}

pub fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&Canonical(value))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFile {
    pub name: String,
    pub table: String,
    pub record_count: usize,
    pub sha256: String,
    pub is_empty: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct ManifestRange {
    pub start: String,
    pub end: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub export_date: String,
    pub exported_by: String,
    pub environment_url: String,
    pub date_range: ManifestRange,
    pub files: Vec<ExportedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
}

impl Manifest {
    /// Hash of the manifest with `manifestHash` omitted.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut unsigned = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut unsigned {
            map.remove("manifestHash");
        }
        Ok(sha256_hex(canonical_json(&unsigned)?.as_bytes()))
    }

    pub fn total_records(&self) -> usize {
        self.files.iter().map(|f| f.record_count).sum()
    }
}

/// Evidence file name, e.g. `ProvisioningLog-2026-Q1.json`.
pub fn file_name(prefix: &str, range: &DateRange) -> String {
    let (year, quarter) = range.quarter();
    format!("{}-{}-{}.json", prefix, year, quarter)
}

/// Export every configured evidence target for `range` into `output_dir`.
pub async fn export_evidence(
    api: &dyn WebApi,
    config: &FullConfig,
    range: DateRange,
    output_dir: &Path,
    environment_url: &str,
) -> Result<Manifest, ProvisionError> {
    let targets = config
        .evidence
        .as_ref()
        .map(|e| e.targets.as_slice())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConfigError::Validation("definition set declares no evidence targets".into()))?;
    tokio::fs::create_dir_all(output_dir).await?;
    info!(range = %range, dir = %output_dir.display(), "exporting evidence");

    let mut files = Vec::with_capacity(targets.len());
    for target in targets {
        files.push(export_target(api, config, target, &range, output_dir).await?);
    }

    let mut manifest = Manifest {
        export_date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        exported_by: EXPORTED_BY.to_string(),
        environment_url: environment_url.to_string(),
        date_range: ManifestRange {
            start: range.start.to_string(),
            end: range.end.to_string(),
        },
        files,
        manifest_hash: None,
    };
    manifest.manifest_hash = Some(manifest.compute_hash()?);
    let content = canonical_json(&serde_json::to_value(&manifest)?)?;
    tokio::fs::write(output_dir.join(MANIFEST_FILE), content).await?;

    if manifest.total_records() == 0 {
        warn!("every export is empty; check the date range and that the tables are populated");
    }
    info!(files = manifest.files.len(), records = manifest.total_records(), "evidence export complete");
    Ok(manifest)
}

async fn export_target(
    api: &dyn WebApi,
    config: &FullConfig,
    target: &EvidenceTarget,
    range: &DateRange,
    output_dir: &Path,
) -> Result<ExportedFile, ProvisionError> {
    let table = config.table(&target.table).ok_or_else(|| ConfigError::MissingReference {
        kind: "table",
        id: target.table.clone(),
    })?;
    let request = ApiRequest::get(table.entity_set())
        .filter(range.filter(&target.date_field))
        .order_by(format!("{} asc,{} asc", target.date_field, table.primary_id()));
    let records: Vec<Value> = api.query(request).await?.into_iter().map(strip_annotations).collect();

    let name = file_name(&target.file_prefix, range);
    let content = canonical_json(&Value::Array(records.clone()))?;
    let sha256 = sha256_hex(content.as_bytes());
    tokio::fs::write(output_dir.join(&name), &content).await?;

    if records.is_empty() {
        warn!(table = %target.table, file = %name, "no records in date range");
    } else {
        info!(table = %target.table, file = %name, records = records.len(), sha256 = %sha256, "exported");
    }
    Ok(ExportedFile {
        name,
        table: target.table.clone(),
        record_count: records.len(),
        sha256,
        is_empty: records.is_empty(),
    })
}

/// Drop `@odata.*` annotations, which change between reads of the same record.
fn strip_annotations(record: Value) -> Value {
    match record {
        Value::Object(map) => Value::Object(map.into_iter().filter(|(k, _)| !k.starts_with("@odata.")).collect()),
        other => other,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileCheck {
    pub name: String,
    pub expected: String,
    /// `None` when the file is missing.
    pub actual: Option<String>,
}

impl FileCheck {
    pub fn ok(&self) -> bool {
        self.actual.as_deref() == Some(self.expected.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ManifestCheck {
    pub manifest_ok: bool,
    pub files: Vec<FileCheck>,
}

impl ManifestCheck {
    pub fn passed(&self) -> bool {
        self.manifest_ok && self.files.iter().all(FileCheck::ok)
    }
}

/// Recompute every hash recorded in `<dir>/manifest.json`.
pub async fn verify_manifest(dir: &Path) -> Result<ManifestCheck, ProvisionError> {
    let raw = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
    let manifest: Manifest = serde_json::from_str(&raw)?;
    let manifest_ok = manifest.manifest_hash.as_deref() == Some(manifest.compute_hash()?.as_str());
    if !manifest_ok {
        warn!(dir = %dir.display(), "manifest hash mismatch");
    }

    let mut files = Vec::with_capacity(manifest.files.len());
    for file in &manifest.files {
        let actual = match tokio::fs::read(dir.join(&file.name)).await {
            Ok(bytes) => Some(sha256_hex(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let check = FileCheck {
            name: file.name.clone(),
            expected: file.sha256.clone(),
            actual,
        };
        if !check.ok() {
            warn!(file = %check.name, "file hash mismatch");
        }
        files.push(check);
    }
    Ok(ManifestCheck { manifest_ok, files })
}
