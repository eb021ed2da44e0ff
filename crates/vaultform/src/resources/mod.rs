//! Built-in resource types.
//!
//! - `vault_pki_ca_cert_pem`: read a PKI mount's CA certificate (data source)
//! - `vault_sys_init`: initialize the cluster and capture its key shares
//! - `vault_sys_plugin`: register a plugin in the catalog
//! - `vault_sys_unseal`: submit unseal key shares until the cluster opens

pub mod ca_cert;
pub mod sys_init;
pub mod sys_plugin;
pub mod sys_unseal;

use std::sync::Arc;

use crate::provider::ResourceHandler;

/// One instance of every built-in handler.
pub fn builtin() -> Vec<Arc<dyn ResourceHandler>> {
    vec![
        Arc::new(ca_cert::CaCertPem::new()),
        Arc::new(sys_init::SysInit::new()),
        Arc::new(sys_plugin::SysPlugin::new()),
        Arc::new(sys_unseal::SysUnseal::new()),
    ]
}

/// Resource data built from a JSON object literal.
#[cfg(test)]
pub(crate) fn data_from(value: serde_json::Value) -> vaultform_core::state::ResourceData {
    vaultform_core::state::ResourceData::new(value.as_object().cloned().unwrap_or_default())
}
