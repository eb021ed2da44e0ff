//! Definitions file: provider connection settings plus the declared resources.
//!
//! ```toml
//! [provider]
//! address = "https://vault.internal:8200"
//!
//! [[resource]]
//! type = "vault_sys_init"
//! name = "cluster"
//!
//! [resource.config]
//! secret_shares = 5
//! secret_threshold = 3
//! ```
//!
//! Provider settings fall back to `VAULT_ADDR`, `VAULT_TOKEN` and
//! `VAULT_NAMESPACE` when not set in the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;
use vaultform_core::state::Address;

use crate::client::{ClientSettings, DEFAULT_ADDRESS, DEFAULT_TIMEOUT};
use crate::provider::Provider;
use crate::secret::VaultToken;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read definitions file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse definitions file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("resource {0} is declared more than once")]
    DuplicateAddress(Address),

    #[error("resource {0} has an unknown type")]
    UnknownType(Address),

    #[error("resource {0} has an empty name")]
    EmptyName(String),
}

/// `[provider]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub address: Option<String>,
    pub token: Option<VaultToken>,
    pub namespace: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    /// Client settings from this table, with the process environment filling
    /// in unset values.
    pub fn resolve(&self) -> ClientSettings {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Same as [`resolve`](Self::resolve) with an explicit environment lookup.
    pub fn resolve_with(&self, env: impl Fn(&str) -> Option<String>) -> ClientSettings {
        let non_empty = |key: &str| env(key).filter(|v| !v.is_empty());

        ClientSettings {
            address: self
                .address
                .clone()
                .or_else(|| non_empty("VAULT_ADDR"))
                .unwrap_or_else(|| DEFAULT_ADDRESS.to_owned()),
            token: self
                .token
                .clone()
                .or_else(|| non_empty("VAULT_TOKEN").map(VaultToken::new)),
            namespace: self
                .namespace
                .clone()
                .or_else(|| non_empty("VAULT_NAMESPACE")),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
        }
    }
}

/// One `[[resource]]` entry. Resource fields live in its `config` table,
/// apart from the address, since some resources have `name` or `type`
/// fields of their own.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDef {
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ResourceDef {
    pub fn address(&self) -> Address {
        Address::new(&self.type_name, &self.name)
    }
}

/// A parsed definitions file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceDef>,
}

impl Definitions {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let defs = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        defs.check_addresses()?;
        info!(
            "loaded {} resource definitions from {}",
            defs.resources.len(),
            path.display()
        );
        Ok(defs)
    }

    pub fn parse(contents: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(contents)
    }

    /// Reject empty names and duplicate `type.name` pairs.
    pub fn check_addresses(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for def in &self.resources {
            if def.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(def.type_name.clone()));
            }
            let address = def.address();
            if !seen.insert(address.clone()) {
                return Err(ConfigError::DuplicateAddress(address));
            }
        }
        Ok(())
    }

    /// Reject resource types the provider does not serve.
    pub fn check_types(&self, provider: &Provider) -> Result<(), ConfigError> {
        match self
            .resources
            .iter()
            .find(|def| provider.handler(&def.type_name).is_err())
        {
            Some(def) => Err(ConfigError::UnknownType(def.address())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::VaultClient;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
[provider]
address = "https://vault.internal:8200"
token = "s.root"
timeout_secs = 5

[[resource]]
type = "vault_sys_init"
name = "cluster"

[resource.config]
secret_shares = 5
secret_threshold = 3

[[resource]]
type = "vault_sys_unseal"
name = "cluster"
config = { keys = ["${vault_sys_init.cluster.keys}"] }

[[resource]]
type = "vault_sys_plugin"
name = "kv"

[resource.config]
name = "my-kv"
type = "secret"
sha256value = "abc"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parses_provider_and_resources() {
        let defs = Definitions::parse(SAMPLE).unwrap();
        assert_eq!(
            defs.provider.address.as_deref(),
            Some("https://vault.internal:8200")
        );
        assert_eq!(defs.provider.timeout_secs, Some(5));
        assert_eq!(defs.resources.len(), 3);

        let init = &defs.resources[0];
        assert_eq!(init.address().to_string(), "vault_sys_init.cluster");
        assert_eq!(init.config.get("secret_shares"), Some(&json!(5)));
        assert!(!init.config.contains_key("type"));

        let unseal = &defs.resources[1];
        assert_eq!(
            unseal.config.get("keys"),
            Some(&json!(["${vault_sys_init.cluster.keys}"]))
        );

        let plugin = &defs.resources[2];
        assert_eq!(plugin.address().to_string(), "vault_sys_plugin.kv");
        assert_eq!(plugin.config.get("name"), Some(&json!("my-kv")));
        assert_eq!(plugin.config.get("type"), Some(&json!("secret")));
    }

    #[test]
    fn resource_without_config_table() {
        let defs = Definitions::parse(
            "[[resource]]\ntype = \"vault_sys_unseal\"\nname = \"x\"\n",
        )
        .unwrap();
        assert!(defs.resources[0].config.is_empty());
    }

    #[test]
    fn stray_resource_key_rejected() {
        let err = Definitions::parse(
            "[[resource]]\ntype = \"vault_sys_init\"\nname = \"x\"\nsecret_shares = 1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("secret_shares"));
    }

    #[test]
    fn token_is_redacted_in_debug() {
        let defs = Definitions::parse(SAMPLE).unwrap();
        let dbg = format!("{:?}", defs.provider);
        assert!(!dbg.contains("s.root"));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[test]
    fn file_values_win_over_env() {
        let defs = Definitions::parse(SAMPLE).unwrap();
        let settings = defs.provider.resolve_with(env(&[
            ("VAULT_ADDR", "https://other:8200"),
            ("VAULT_TOKEN", "s.env"),
        ]));
        assert_eq!(settings.address, "https://vault.internal:8200");
        assert_eq!(settings.token.unwrap().expose(), "s.root");
        assert_eq!(settings.timeout, Duration::from_secs(5));
    }

    #[test]
    fn env_fills_unset_values() {
        let settings = ProviderConfig::default().resolve_with(env(&[
            ("VAULT_ADDR", "https://vault.env:8200"),
            ("VAULT_TOKEN", "s.env"),
            ("VAULT_NAMESPACE", "admin"),
        ]));
        assert_eq!(settings.address, "https://vault.env:8200");
        assert_eq!(settings.token.unwrap().expose(), "s.env");
        assert_eq!(settings.namespace.as_deref(), Some("admin"));
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn defaults_without_file_or_env() {
        let settings = ProviderConfig::default().resolve_with(env(&[("VAULT_TOKEN", "")]));
        assert_eq!(settings.address, DEFAULT_ADDRESS);
        assert!(settings.token.is_none());
        assert!(settings.namespace.is_none());
    }

    #[test]
    fn empty_file_is_valid() {
        let defs = Definitions::parse("").unwrap();
        assert!(defs.resources.is_empty());
        assert!(defs.provider.address.is_none());
    }

    #[test]
    fn unknown_provider_key_rejected() {
        let err = Definitions::parse("[provider]\nadress = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("adress"));
    }

    #[test]
    fn duplicate_address_rejected() {
        let defs = Definitions::parse(
            r#"
[[resource]]
type = "vault_sys_plugin"
name = "kv"

[[resource]]
type = "vault_sys_plugin"
name = "kv"
"#,
        )
        .unwrap();
        let err = defs.check_addresses().unwrap_err();
        assert_eq!(
            err.to_string(),
            "resource vault_sys_plugin.kv is declared more than once"
        );
    }

    #[test]
    fn same_name_different_type_allowed() {
        let defs = Definitions::parse(SAMPLE).unwrap();
        defs.check_addresses().unwrap();
    }

    #[test]
    fn unknown_type_rejected() {
        let defs = Definitions::parse("[[resource]]\ntype = \"vault_nope\"\nname = \"x\"\n").unwrap();
        let provider = Provider::new(VaultClient::with_base_url(
            "http://127.0.0.1:1".into(),
            None,
        ));
        let err = defs.check_types(&provider).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let defs = Definitions::load(file.path()).unwrap();
        assert_eq!(defs.resources.len(), 3);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Definitions::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[resource]]\ntype = \n").unwrap();
        let err = Definitions::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
