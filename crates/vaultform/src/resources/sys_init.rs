//! `vault_sys_init`: initialize a cluster and keep the generated key shares.
//!
//! Initialization happens once per cluster. Delete only forgets the
//! resource; Vault has no way to un-initialize.

use tracing::{debug, info};
use vaultform_core::schema::{FieldSchema, FieldType, ResourceKind, ResourceSchema};
use vaultform_core::state::ResourceData;

use crate::client::{InitRequest, VaultClient};
use crate::provider::{HandlerFuture, ResourceError, ResourceHandler};

#[derive(Debug)]
pub struct SysInit {
    schema: ResourceSchema,
}

impl SysInit {
    pub fn new() -> Self {
        Self {
            schema: ResourceSchema {
                type_name: "vault_sys_init",
                kind: ResourceKind::Managed,
                importable: true,
                description: "Initializes a Vault cluster, generating and splitting the master key.",
                fields: vec![
                    FieldSchema::required(
                        "secret_shares",
                        FieldType::Int,
                        "Number of key shares to split the generated master key into. \
                         This is the number of \"unseal keys\" to generate.",
                    ),
                    FieldSchema::required(
                        "secret_threshold",
                        FieldType::Int,
                        "Number of key shares required to reconstruct the master key. \
                         Must be less than or equal to secret_shares.",
                    ),
                    FieldSchema::optional_computed(
                        "stored_shares",
                        FieldType::Int,
                        "Number of unseal keys to store on an HSM. Must equal secret_shares.",
                    ),
                    FieldSchema::optional_computed(
                        "pgp_keys",
                        FieldType::StringList,
                        "Public PGP keys or keybase:<username> entries used to encrypt the \
                         generated unseal keys, in order. Must match secret_shares unless \
                         stored_shares is used.",
                    ),
                    FieldSchema::optional_computed(
                        "recovery_shares",
                        FieldType::Int,
                        "Number of key shares to split the recovery key into. \
                         Only used with auto-unseal seals (HSM, KMS and Transit).",
                    ),
                    FieldSchema::optional_computed(
                        "recovery_threshold",
                        FieldType::Int,
                        "Number of key shares required to reconstruct the recovery key. \
                         Only used with auto-unseal seals (HSM, KMS and Transit).",
                    ),
                    FieldSchema::optional_computed(
                        "recovery_pgp_keys",
                        FieldType::StringList,
                        "Like pgp_keys, but for the recovery key shares.",
                    ),
                    FieldSchema::optional_computed(
                        "root_token_pgp_key",
                        FieldType::String,
                        "Public PGP key or keybase:<username> used to encrypt the generated \
                         root token.",
                    ),
                    FieldSchema::computed(
                        "keys",
                        FieldType::StringList,
                        "Key shares the generated master key is split into. These are the \
                         \"unseal keys\".",
                    )
                    .sensitive(),
                    FieldSchema::computed("keys_base64", FieldType::StringList, "Key shares in base64.")
                        .sensitive(),
                    FieldSchema::computed(
                        "recovery_keys",
                        FieldType::StringList,
                        "Key shares the recovery key is split into. \
                         Only used with auto-unseal seals.",
                    )
                    .sensitive(),
                    FieldSchema::computed(
                        "recovery_keys_base64",
                        FieldType::StringList,
                        "Recovery key shares in base64.",
                    )
                    .sensitive(),
                    FieldSchema::computed("root_token", FieldType::String, "The generated root token.")
                        .sensitive(),
                ],
            },
        }
    }
}

impl Default for SysInit {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the init request; options are sent only when set to a non-zero
/// value.
fn init_request(data: &ResourceData) -> Result<InitRequest, ResourceError> {
    let non_zero_int = |name: &str| data.get_non_zero(name).and_then(|v| v.as_i64());
    let non_zero_list = |name: &str| {
        data.get_non_zero(name)
            .and(data.get_string_list(name))
            .unwrap_or_default()
    };

    let request = InitRequest {
        secret_shares: data.require_int("secret_shares")?,
        secret_threshold: data.require_int("secret_threshold")?,
        stored_shares: non_zero_int("stored_shares"),
        pgp_keys: non_zero_list("pgp_keys"),
        recovery_shares: non_zero_int("recovery_shares"),
        recovery_threshold: non_zero_int("recovery_threshold"),
        recovery_pgp_keys: non_zero_list("recovery_pgp_keys"),
        root_token_pgp_key: data
            .get_non_zero("root_token_pgp_key")
            .and_then(|v| v.as_str())
            .map(str::to_owned),
    };

    if request.secret_shares < 1 {
        return Err(ResourceError::Invalid(
            "secret_shares must be at least 1".into(),
        ));
    }
    if request.secret_threshold < 1 || request.secret_threshold > request.secret_shares {
        return Err(ResourceError::Invalid(format!(
            "secret_threshold must be between 1 and secret_shares ({})",
            request.secret_shares
        )));
    }
    Ok(request)
}

impl ResourceHandler for SysInit {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn create<'a>(
        &'a self,
        client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let request = init_request(data)?;
            debug!(
                "initializing vault with {} secret shares and a {} secret threshold",
                request.secret_shares, request.secret_threshold
            );

            let result = client
                .init(&request)
                .await
                .map_err(ResourceError::api("error initializing vault"))?;

            data.set_id(uuid::Uuid::new_v4().to_string());
            data.set("keys", result.keys);
            data.set("keys_base64", result.keys_base64);
            data.set("recovery_keys", result.recovery_keys);
            data.set("recovery_keys_base64", result.recovery_keys_base64);
            data.set("root_token", result.root_token);
            info!("vault initialized");
            Ok(())
        })
    }

    fn read<'a>(&'a self, client: &'a VaultClient, data: &'a mut ResourceData) -> HandlerFuture<'a> {
        Box::pin(async move {
            let status = client
                .init_status()
                .await
                .map_err(ResourceError::api("error reading vault init status"))?;
            if !status.initialized {
                debug!("vault reports not initialized; dropping resource");
                data.clear_id();
            }
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        _client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            debug!("vault cannot be un-initialized; forgetting init resource");
            data.clear_id();
            Ok(())
        })
    }
}
