//! Typed errors and process exit-code mapping.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("unknown bundled definition set: {0}")]
    UnknownBundle(String),
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{method} {path} failed with HTTP {status}: {body}")]
    Http {
        method: String,
        path: String,
        status: u16,
        body: String,
    },
    #[error("rate limit exceeded for {path} after {attempts} attempts")]
    RateLimitExceeded { path: String, attempts: u32 },
    #[error("{kind} '{name}' must exist before this step")]
    MissingPrerequisite { kind: &'static str, name: String },
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Config(_) => 1,
            ProvisionError::Io(_) | ProvisionError::Json(_) => 1,
            ProvisionError::PolicyViolation(_) => 3,
            ProvisionError::Auth(_) => 4,
            ProvisionError::Http { .. }
            | ProvisionError::RateLimitExceeded { .. }
            | ProvisionError::Transport(_)
            | ProvisionError::UnexpectedResponse(_)
            | ProvisionError::Timeout { .. } => 5,
            ProvisionError::MissingPrerequisite { .. } => 6,
        }
    }

    /// True for HTTP failures the platform reports as a duplicate record.
    pub fn is_duplicate(&self) -> bool {
        match self {
            ProvisionError::Http { status, body, .. } => {
                let lower = body.to_lowercase();
                *status == 412 || lower.contains("duplicate") || lower.contains("already exists")
            }
            _ => false,
        }
    }
}

/// Exit code for a verification pass that found missing or mismatched resources.
pub const EXIT_VERIFICATION_MISMATCH: i32 = 2;
/// Exit code for a policy check (role privileges, log immutability) that failed.
pub const EXIT_POLICY_VIOLATION: i32 = 3;
/// Exit code after the operator interrupted a run.
pub const EXIT_INTERRUPTED: i32 = 130;
