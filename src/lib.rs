//! Dataverse provisioner: idempotent deployment, verification and audit evidence over the Web API.

pub mod auth;
pub mod boundary;
pub mod client;
pub mod config;
pub mod deploy;
pub mod error;
pub mod evidence;
pub mod immutability;
pub mod period;
pub mod registration;
pub mod settings;
pub mod verify;

pub use client::{RestClient, WebApi};
pub use config::{bundled, load_from_path, validate, FullConfig};
pub use deploy::{deploy, DeployOptions, DeployReport, DeployScope};
pub use error::{ConfigError, ProvisionError};
pub use evidence::{export_evidence, verify_manifest, Manifest};
pub use immutability::{validate_immutability, ImmutabilityReport};
pub use period::DateRange;
pub use settings::ConnectionSettings;
pub use verify::{verify, VerificationReport};
