mod client;
mod config;
mod engine;
mod provider;
mod resources;
mod secret;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::debug;
use vaultform_core::schema::ResourceSchema;
use vaultform_core::state::{Address, StateError, StateFile};

use crate::client::{VaultApiError, VaultClient};
use crate::config::{ConfigError, Definitions};
use crate::engine::{Engine, EngineError};
use crate::provider::{Provider, RegistryError};

/// Definitions file written by `vaultform init`.
const SAMPLE_DEFINITIONS: &str = r#"# vaultform definitions
#
# Resources are applied in file order. String values of the form
# ${<type>.<name>.<field>} are replaced by attributes of resources
# applied earlier in the file.

[provider]
# address = "https://127.0.0.1:8200"   # default: $VAULT_ADDR
# token = "..."                        # default: $VAULT_TOKEN
# namespace = "admin"                  # default: $VAULT_NAMESPACE
# timeout_secs = 30

[[resource]]
type = "vault_sys_init"
name = "cluster"

[resource.config]
secret_shares = 5
secret_threshold = 3

[[resource]]
type = "vault_sys_unseal"
name = "cluster"

[resource.config]
keys = ["${vault_sys_init.cluster.keys}"]

# [[resource]]
# type = "vault_sys_plugin"
# name = "kv"
#
# [resource.config]
# name = "my-kv"
# type = "secret"
# sha256value = "<sha256 of the plugin binary>"
# command = "vault-plugin-kv"

# [[resource]]
# type = "vault_pki_ca_cert_pem"
# name = "root"
#
# [resource.config]
# path = "pki"
"#;

#[derive(Debug, Parser)]
#[command(name = "vaultform", version, about = "Declarative bootstrap of Vault clusters")]
struct Cli {
    /// Definitions file.
    #[arg(long, short = 'f', default_value = "vaultform.toml")]
    file: PathBuf,

    /// State file.
    #[arg(long, default_value = "vaultform.state.json")]
    state: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create, update, or delete resources to match the definitions file.
    Apply,
    /// Delete every resource recorded in state.
    Destroy,
    /// Re-read every resource in state from Vault.
    Refresh,
    /// Adopt an existing Vault object into state.
    Import {
        /// Resource address, e.g. vault_sys_plugin.kv
        address: String,
        /// Remote id, e.g. secret/my-kv
        id: String,
    },
    /// Print the state file.
    Show {
        /// Print sensitive values instead of [REDACTED].
        #[arg(long, default_value_t = false)]
        show_sensitive: bool,
    },
    /// Print resource schemas as JSON.
    Schema {
        /// Only this resource type.
        #[arg(value_name = "TYPE")]
        type_name: Option<String>,
    },
    /// Write a sample definitions file.
    Init {
        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Client(#[from] VaultApiError),

    #[error("{} already exists (use --force to overwrite)", .0.display())]
    Exists(PathBuf),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Err(e) => {
            eprintln!("vaultform: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<String, CliError> {
    match cli.cmd {
        // Commands that need no Vault connection.
        Cmd::Show { show_sensitive } => show_state(&cli.state, show_sensitive),
        Cmd::Schema { type_name } => print_schemas(type_name.as_deref()),
        Cmd::Init { force } => write_sample(&cli.file, force),

        Cmd::Apply => {
            let (defs, mut engine) = open(&cli.file, &cli.state)?;
            let summary = engine.apply(&defs.resources).await?;
            if summary.changed() == 0 {
                return Ok(format!("No changes. {summary}."));
            }
            Ok(format!("Apply complete: {summary}."))
        }
        Cmd::Destroy => {
            let (_, mut engine) = open(&cli.file, &cli.state)?;
            let summary = engine.destroy().await?;
            Ok(format!("Destroy complete: {summary}."))
        }
        Cmd::Refresh => {
            let (_, mut engine) = open(&cli.file, &cli.state)?;
            let summary = engine.refresh().await?;
            Ok(format!(
                "Refresh complete: {summary}. {} resources in state.",
                engine.state().resources.len()
            ))
        }
        Cmd::Import { address, id } => {
            let address: Address = address.parse()?;
            let (defs, mut engine) = open(&cli.file, &cli.state)?;
            let config = defs
                .resources
                .iter()
                .find(|def| def.address() == address)
                .map(|def| &def.config);
            engine.import(&address, &id, config).await?;
            Ok(format!("Imported {address} (id {id})."))
        }
    }
}

/// Load definitions and build an engine over the state file.
fn open(file: &Path, state: &Path) -> Result<(Definitions, Engine), CliError> {
    let defs = Definitions::load(file)?;
    let settings = defs.provider.resolve();
    debug!(address = %settings.address, "connecting to Vault");

    let provider = Provider::new(VaultClient::new(settings)?);
    defs.check_types(&provider)?;
    let engine = Engine::new(provider, state)?;
    Ok((defs, engine))
}

fn builtin_schemas() -> Vec<ResourceSchema> {
    let mut schemas: Vec<_> = resources::builtin()
        .iter()
        .map(|h| h.schema().clone())
        .collect();
    schemas.sort_by_key(|s| s.type_name);
    schemas
}

fn show_state(path: &Path, show_sensitive: bool) -> Result<String, CliError> {
    let mut state = StateFile::load(path)?;
    if !show_sensitive {
        let schemas = builtin_schemas();
        for resource in &mut state.resources {
            match schemas.iter().find(|s| s.type_name == resource.type_name) {
                Some(schema) => resource.attributes = schema.redact(&resource.attributes),
                // Unknown type: nothing says which values are safe.
                None => {
                    for value in resource.attributes.values_mut() {
                        *value = Value::String(vaultform_core::schema::REDACTED.to_owned());
                    }
                }
            }
        }
    }
    Ok(serde_json::to_string_pretty(&state)?)
}

fn print_schemas(type_name: Option<&str>) -> Result<String, CliError> {
    let schemas = builtin_schemas();
    let out = match type_name {
        Some(name) => {
            let schema = schemas
                .iter()
                .find(|s| s.type_name == name)
                .ok_or_else(|| RegistryError::UnknownType(name.to_owned()))?;
            serde_json::to_value(schema)?
        }
        None => json!(schemas),
    };
    Ok(serde_json::to_string_pretty(&out)?)
}

fn write_sample(path: &Path, force: bool) -> Result<String, CliError> {
    if path.exists() && !force {
        return Err(CliError::Exists(path.to_owned()));
    }
    std::fs::write(path, SAMPLE_DEFINITIONS).map_err(|source| CliError::Write {
        path: path.to_owned(),
        source,
    })?;
    Ok(format!("Wrote {}", path.display()))
}
