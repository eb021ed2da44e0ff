//! `vault_sys_plugin`: a plugin registered in the Vault plugin catalog.
//!
//! The resource id is `<type>/<name>`, which is also the import format.

use tracing::debug;
use vaultform_core::schema::{FieldSchema, FieldType, ResourceKind, ResourceSchema};
use vaultform_core::state::ResourceData;

use crate::client::{PluginType, RegisterPluginInput, VaultApiError, VaultClient};
use crate::provider::{HandlerFuture, ResourceError, ResourceHandler};

#[derive(Debug)]
pub struct SysPlugin {
    schema: ResourceSchema,
}

impl SysPlugin {
    pub fn new() -> Self {
        Self {
            schema: ResourceSchema {
                type_name: "vault_sys_plugin",
                kind: ResourceKind::Managed,
                importable: true,
                description: "Registers a plugin in the Vault plugin catalog.",
                fields: vec![
                    FieldSchema::required(
                        "name",
                        FieldType::String,
                        "The name of the plugin to register.",
                    )
                    .force_new(),
                    FieldSchema::required(
                        "type",
                        FieldType::String,
                        "Specifies the type of this plugin. May be \"auth\", \"database\", or \"secret\".",
                    )
                    .force_new(),
                    FieldSchema::required(
                        "sha256value",
                        FieldType::String,
                        "SHA256 sum of the plugin's binary. Vault checks the binary against \
                         this value before running it.",
                    ),
                    FieldSchema::optional_computed(
                        "command",
                        FieldType::String,
                        "Command used to execute the plugin, relative to the plugin directory. \
                         Defaults to the plugin name.",
                    ),
                    FieldSchema::optional(
                        "args",
                        FieldType::StringList,
                        "Arguments passed to the plugin command.",
                    ),
                ],
            },
        }
    }
}

impl Default for SysPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn plugin_type(data: &ResourceData) -> Result<PluginType, ResourceError> {
    data.require_str("type")?
        .parse()
        .map_err(|e: crate::client::UnknownPluginType| ResourceError::Invalid(e.to_string()))
}

fn validate_sha256(value: &str) -> Result<(), ResourceError> {
    if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ResourceError::Invalid(
            "sha256value must be a 64 character hex SHA256 sum".into(),
        ))
    }
}

/// Split an id or import id of the form `<type>/<name>`.
fn parse_id(id: &str) -> Result<(PluginType, &str), ResourceError> {
    let invalid = || {
        ResourceError::Invalid(format!(
            "invalid plugin id '{id}' (expected <type>/<name>)"
        ))
    };
    let (ty, name) = id.split_once('/').ok_or_else(invalid)?;
    if name.is_empty() {
        return Err(invalid());
    }
    let ty = ty
        .parse()
        .map_err(|e: crate::client::UnknownPluginType| ResourceError::Invalid(e.to_string()))?;
    Ok((ty, name))
}

impl ResourceHandler for SysPlugin {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn create<'a>(
        &'a self,
        client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let name = data.require_str("name")?.to_owned();
            let plugin_type = plugin_type(data)?;
            let sha256 = data.require_str("sha256value")?.to_ascii_lowercase();
            validate_sha256(&sha256)?;
            if data.get_str("command") == Some("") {
                return Err(ResourceError::Invalid("command must not be empty".into()));
            }
            let command = data
                .get_non_zero("command")
                .and_then(|v| v.as_str())
                .unwrap_or(name.as_str())
                .to_owned();
            let args = data.get_string_list("args").unwrap_or_default();

            debug!("registering {plugin_type} plugin {name}");
            client
                .register_plugin(&RegisterPluginInput {
                    name: name.clone(),
                    plugin_type,
                    command: command.clone(),
                    sha256,
                    args,
                })
                .await
                .map_err(ResourceError::api("error registering plugin"))?;

            data.set("command", command);
            data.set_id(format!("{plugin_type}/{name}"));
            Ok(())
        })
    }

    fn read<'a>(&'a self, client: &'a VaultClient, data: &'a mut ResourceData) -> HandlerFuture<'a> {
        Box::pin(async move {
            let Some(id) = data.id().map(str::to_owned) else {
                return Ok(());
            };
            let (plugin_type, name) = parse_id(&id)?;

            debug!("reading {plugin_type} plugin {name}");
            let info = match client.get_plugin(plugin_type, name).await {
                Ok(info) => info,
                Err(VaultApiError::NotFound(_)) => {
                    debug!("{plugin_type} plugin {name} is no longer registered");
                    data.clear_id();
                    return Ok(());
                }
                Err(e) => return Err(ResourceError::api("error reading plugin")(e)),
            };

            if info.builtin {
                debug!("{plugin_type} plugin {name} is a builtin");
            }
            data.set("name", if info.name.is_empty() { name } else { info.name.as_str() });
            // Types parse case-insensitively; keep the declared spelling.
            let declared_type = data
                .get_str("type")
                .filter(|prior| prior.parse::<PluginType>().ok() == Some(plugin_type))
                .map(str::to_owned);
            data.set(
                "type",
                declared_type.unwrap_or_else(|| plugin_type.as_str().to_owned()),
            );
            // Vault reports lowercase hex; keep the declared spelling when it
            // names the same sum.
            let sha256 = match data.get_str("sha256value") {
                Some(prior) if prior.eq_ignore_ascii_case(&info.sha256) => prior.to_owned(),
                _ => info.sha256,
            };
            data.set("sha256value", sha256);
            data.set("command", info.command);
            if info.args.is_empty() {
                data.set("args", serde_json::Value::Null);
            } else {
                data.set("args", info.args);
            }
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let name = data.require_str("name")?.to_owned();
            let plugin_type = plugin_type(data)?;

            debug!("deregistering {plugin_type} plugin {name}");
            client
                .deregister_plugin(plugin_type, &name)
                .await
                .map_err(ResourceError::api("error deregistering plugin"))?;

            data.clear_id();
            Ok(())
        })
    }
}
