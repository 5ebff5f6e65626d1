//! Load definitions from a JSON file or from the sets bundled into the binary.

use crate::config::{validate, FullConfig};
use crate::error::ConfigError;
use std::path::Path;

const ELM_DEFINITIONS: &str = include_str!("../../definitions/elm.json");
const MCG_DEFINITIONS: &str = include_str!("../../definitions/mcg.json");

/// Names accepted by [`bundled`].
pub const BUNDLED_SETS: [&str; 2] = ["elm", "mcg"];

pub fn from_json_str(raw: &str) -> Result<FullConfig, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::Load(e.to_string()))
}

/// Parse one of the bundled definition sets. Does not validate.
pub fn bundled(name: &str) -> Result<FullConfig, ConfigError> {
    let raw = match name.to_lowercase().as_str() {
        "elm" => ELM_DEFINITIONS,
        "mcg" => MCG_DEFINITIONS,
        _ => return Err(ConfigError::UnknownBundle(name.to_string())),
    };
    from_json_str(raw)
}

/// Read, parse and validate a definition file.
pub async fn load_from_path(path: impl AsRef<Path>) -> Result<FullConfig, ConfigError> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "loading definitions");
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    let config = from_json_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unknown_bundle_is_rejected() {
        assert!(matches!(bundled("crm"), Err(ConfigError::UnknownBundle(_))));
    }

    #[test]
    fn bundle_names_are_case_insensitive() {
        let config = bundled("ELM").unwrap();
        assert!(config.table("fsi_environmentrequest").is_some());
    }

    #[tokio::test]
    async fn loads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MCG_DEFINITIONS.as_bytes()).unwrap();
        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.solution_name(), Some("MessageCenterGovernance"));
    }

    #[tokio::test]
    async fn malformed_file_is_a_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ \"tables\": 3 }").unwrap();
        assert!(matches!(load_from_path(file.path()).await, Err(ConfigError::Load(_))));
    }
}
