//! `provisioner`: deploy, verify and audit Dataverse definition sets from the command line.
//!
//! Connection flags fall back to `ELM_*` environment variables, which may also come from `.env`.

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dataverse_provisioner::boundary::{check_hook_input, BoundaryConfig};
use dataverse_provisioner::client::organization_name;
use dataverse_provisioner::error::EXIT_INTERRUPTED;
use dataverse_provisioner::immutability::ImmutabilityStatus;
use dataverse_provisioner::period::parse_date;
use dataverse_provisioner::registration::{
    register_service_principal, vault_url, RegistrationOptions, GRAPH_BASE_URL, GRAPH_RESOURCE, KEY_VAULT_RESOURCE,
};
use dataverse_provisioner::settings::{ENV_CLIENT_ID, ENV_CLIENT_SECRET, ENV_ENVIRONMENT_URL, ENV_TENANT_ID};
use dataverse_provisioner::{
    bundled, deploy, export_evidence, load_from_path, validate, validate_immutability, verify, verify_manifest,
    ConnectionSettings, DateRange, DeployOptions, DeployScope, FullConfig, ProvisionError, RestClient,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "dataverse_provisioner=info,provisioner=info";
const DEBUG_LOG_FILTER: &str = "dataverse_provisioner=debug,provisioner=debug";

#[derive(Parser)]
#[command(name = "provisioner", version)]
#[command(about = "Idempotent Dataverse provisioning, verification and audit evidence")]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create every missing resource; existing ones are skipped
    Deploy {
        #[command(flatten)]
        definitions: DefinitionArgs,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Report what would be created without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Publisher through publish; no security roles
        #[arg(long, conflicts_with = "roles_only")]
        tables_only: bool,
        /// Security roles and privileges only
        #[arg(long)]
        roles_only: bool,
        /// Write the step report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Compare the environment against the definitions without changing anything
    Verify {
        #[command(flatten)]
        definitions: DefinitionArgs,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Check only this security role
        #[arg(long)]
        role: Option<String>,
        /// Write the verification report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check the audit trail for updates or deletes on the append-only table
    ValidateImmutability {
        #[command(flatten)]
        definitions: DefinitionArgs,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Start date (YYYY-MM-DD), default: 7 days before the end date
        #[arg(long)]
        start_date: Option<String>,
        /// End date (YYYY-MM-DD), default: today
        #[arg(long)]
        end_date: Option<String>,
        /// Write the report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Export records in a date range with per-file hashes and a signed manifest
    ExportEvidence {
        #[command(flatten)]
        definitions: DefinitionArgs,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start_date: String,
        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end_date: String,
        /// Directory for the export files and manifest.json
        #[arg(long)]
        output_path: PathBuf,
    },
    /// Recompute the hashes recorded in an evidence manifest
    VerifyEvidence {
        /// Directory holding manifest.json
        path: PathBuf,
    },
    /// Read a shell hook payload on stdin and print an allow/block decision
    BoundaryCheck {
        /// Project root commands may touch (default: current directory)
        #[arg(long, env = "BOUNDARY_PROJECT_ROOT")]
        root: Option<PathBuf>,
        /// Additional allowed root; repeatable
        #[arg(long = "allow")]
        allow: Vec<PathBuf>,
    },
    /// Register the provisioning application and store its client secret in Key Vault
    RegisterSp {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long, default_value = "ELM-Provisioning-ServicePrincipal")]
        app_name: String,
        /// Azure Key Vault name
        #[arg(long)]
        key_vault_name: String,
        #[arg(long, default_value = "ELM-ServicePrincipal-Secret")]
        secret_name: String,
        #[arg(long, default_value_t = 90)]
        expiry_days: i64,
        /// Add a new secret even when the application already exists
        #[arg(long)]
        rotate_secret: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Authenticate and read the organization name
    TestConnection {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Load and validate a definition set offline
    Validate {
        #[command(flatten)]
        definitions: DefinitionArgs,
    },
}

#[derive(Args)]
struct DefinitionArgs {
    /// Definition file (JSON); overrides --bundle
    #[arg(long)]
    definitions: Option<PathBuf>,
    /// Bundled definition set: elm or mcg
    #[arg(long, default_value = "elm")]
    bundle: String,
}

impl DefinitionArgs {
    async fn load(&self) -> Result<FullConfig, ProvisionError> {
        match &self.definitions {
            Some(path) => Ok(load_from_path(path).await?),
            None => {
                let config = bundled(&self.bundle)?;
                validate(&config)?;
                Ok(config)
            }
        }
    }
}

#[derive(Args)]
struct ConnectionArgs {
    #[arg(long, env = ENV_TENANT_ID)]
    tenant_id: Option<String>,
    #[arg(long, env = ENV_CLIENT_ID)]
    client_id: Option<String>,
    #[arg(long, env = ENV_CLIENT_SECRET, hide_env_values = true)]
    client_secret: Option<String>,
    #[arg(long, env = ENV_ENVIRONMENT_URL)]
    environment_url: Option<String>,
    /// Device-code sign-in instead of client credentials
    #[arg(long)]
    interactive: bool,
}

impl ConnectionArgs {
    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            tenant_id: self.tenant_id.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            environment_url: self.environment_url.clone(),
            interactive: self.interactive,
        }
    }

    async fn dataverse(&self) -> Result<(RestClient, String), ProvisionError> {
        let settings = self.settings();
        let client = settings.dataverse_client()?;
        client.authenticate().await?;
        Ok((client, settings.environment()?.to_string()))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let default_filter = if cli.verbose { DEBUG_LOG_FILTER } else { DEFAULT_LOG_FILTER };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(command: Command) -> Result<i32, ProvisionError> {
    match command {
        Command::Deploy {
            definitions,
            connection,
            dry_run,
            tables_only,
            roles_only,
            report,
        } => {
            let config = definitions.load().await?;
            let (client, environment) = connection.dataverse().await?;
            let scope = if tables_only {
                DeployScope::TablesOnly
            } else if roles_only {
                DeployScope::RolesOnly
            } else {
                DeployScope::Full
            };
            tracing::info!(environment = %environment, ?scope, dry_run, "starting deployment");
            let options = DeployOptions {
                dry_run,
                scope,
                ..Default::default()
            };
            tokio::select! {
                result = deploy(&client, &config, options) => {
                    let outcome = result?;
                    println!("Deployment {}: {}", if dry_run { "plan" } else { "complete" }, outcome.summary());
                    if let Some(path) = report {
                        write_json(&path, &serde_json::to_value(&outcome)?).await?;
                    }
                    Ok(0)
                }
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("Deployment cancelled by user.");
                    Ok(EXIT_INTERRUPTED)
                }
            }
        }
        Command::Verify {
            definitions,
            connection,
            role,
            output,
        } => {
            let config = definitions.load().await?;
            let (client, environment) = connection.dataverse().await?;
            let report = verify(&client, &config, &environment, role.as_deref()).await?;
            for count in &report.counts {
                let mark = if count.found >= count.expected { "ok" } else { "MISSING" };
                println!("  {:<24} {:>3}/{:<3} {}", count.kind.label(), count.found, count.expected, mark);
            }
            for issue in &report.issues {
                println!("  issue: {}", issue);
            }
            for check in &report.roles {
                let status = match (check.found, check.passed) {
                    (false, _) => "NOT FOUND",
                    (true, true) => "PASS",
                    (true, false) => "FAIL",
                };
                println!("  role {:<30} {}", check.role, status);
                for line in check.audit.mismatches.iter().chain(&check.audit.violations) {
                    println!("    {}", line);
                }
            }
            if let Some(path) = output {
                report.write_json(&path).await?;
            }
            Ok(report.exit_code())
        }
        Command::ValidateImmutability {
            definitions,
            connection,
            start_date,
            end_date,
            output,
        } => {
            let config = definitions.load().await?;
            let range = immutability_range(start_date.as_deref(), end_date.as_deref())?;
            let (client, _) = connection.dataverse().await?;
            let report = validate_immutability(&client, &config, range).await?;
            println!("Table:              {}", report.table);
            println!("Range:              {}", report.range);
            println!("Records checked:    {}", report.records_checked);
            println!("Update attempts:    {}", report.update_attempts.len());
            println!("Delete attempts:    {}", report.delete_attempts.len());
            println!("Incomplete records: {}", report.incomplete_records.len());
            println!("Orphaned records:   {}", report.orphaned_records.len());
            let status = match report.status() {
                ImmutabilityStatus::Passed => "PASSED",
                ImmutabilityStatus::Partial => "PARTIAL",
                ImmutabilityStatus::Failed => "FAILED",
            };
            println!("Status:             {}", status);
            if let Some(path) = output {
                write_json(&path, &serde_json::to_value(&report)?).await?;
            }
            Ok(report.exit_code())
        }
        Command::ExportEvidence {
            definitions,
            connection,
            start_date,
            end_date,
            output_path,
        } => {
            let config = definitions.load().await?;
            let range = DateRange::parse(&start_date, &end_date)?;
            let (client, environment) = connection.dataverse().await?;
            let manifest = export_evidence(&client, &config, range, &output_path, &environment).await?;
            for file in &manifest.files {
                println!("  {:<40} {:>6} records  {}", file.name, file.record_count, file.sha256);
            }
            println!(
                "Exported {} records to {}; manifest hash {}",
                manifest.total_records(),
                output_path.display(),
                manifest.manifest_hash.as_deref().unwrap_or("-")
            );
            Ok(0)
        }
        Command::VerifyEvidence { path } => {
            let check = verify_manifest(&path).await?;
            println!("  manifest.json {}", if check.manifest_ok { "ok" } else { "HASH MISMATCH" });
            for file in &check.files {
                let status = match &file.actual {
                    None => "MISSING",
                    Some(_) if file.ok() => "ok",
                    Some(_) => "HASH MISMATCH",
                };
                println!("  {:<40} {}", file.name, status);
            }
            Ok(if check.passed() { 0 } else { 2 })
        }
        Command::BoundaryCheck { root, allow } => {
            let root = match root {
                Some(root) => root,
                None => std::env::current_dir()?,
            };
            let config = allow.into_iter().fold(BoundaryConfig::new(root), BoundaryConfig::allow);
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            let decision = check_hook_input(&input, &config);
            println!("{}", serde_json::to_string(&decision)?);
            Ok(0)
        }
        Command::RegisterSp {
            connection,
            app_name,
            key_vault_name,
            secret_name,
            expiry_days,
            rotate_secret,
            dry_run,
        } => {
            let settings = connection.settings();
            let graph = RestClient::new(GRAPH_BASE_URL, settings.token_provider(GRAPH_RESOURCE)?)?;
            let vault = RestClient::new(&vault_url(&key_vault_name), settings.token_provider(KEY_VAULT_RESOURCE)?)?;
            let options = RegistrationOptions {
                app_name,
                secret_name,
                expiry_days,
                rotate_secret,
                dry_run,
            };
            let registration = register_service_principal(&graph, &vault, &options).await?;
            println!("{}", serde_json::to_string_pretty(&registration)?);
            if registration.secret_stored {
                println!(
                    "Set {} to the application id and read {} from Key Vault '{}'.",
                    ENV_CLIENT_ID, options.secret_name, key_vault_name
                );
            }
            Ok(0)
        }
        Command::TestConnection { connection } => {
            let (client, environment) = connection.dataverse().await?;
            let organization = organization_name(&client).await?;
            println!("Connected to {} ({})", organization, environment);
            Ok(0)
        }
        Command::Validate { definitions } => {
            let config = definitions.load().await?;
            println!(
                "Definitions valid: {} tables, {} columns, {} roles, {} views",
                config.tables.len(),
                config.columns.len(),
                config.roles.len(),
                config.views.len()
            );
            Ok(0)
        }
    }
}

fn immutability_range(start: Option<&str>, end: Option<&str>) -> Result<DateRange, ProvisionError> {
    let end = match end {
        Some(raw) => parse_date(raw)?,
        None => Utc::now().date_naive(),
    };
    Ok(match start {
        Some(raw) => DateRange::new(parse_date(raw)?, end)?,
        None => DateRange::trailing(7, end),
    })
}

async fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), ProvisionError> {
    tokio::fs::write(path, serde_json::to_string_pretty(value)?).await?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}
