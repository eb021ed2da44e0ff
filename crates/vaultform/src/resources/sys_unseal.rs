//! `vault_sys_unseal`: submit unseal key shares until the cluster opens.

use tracing::{debug, info};
use vaultform_core::schema::{FieldSchema, FieldType, ResourceKind, ResourceSchema};
use vaultform_core::state::ResourceData;

use crate::client::{SealStatus, VaultClient};
use crate::provider::{HandlerFuture, ResourceError, ResourceHandler};

#[derive(Debug)]
pub struct SysUnseal {
    schema: ResourceSchema,
}

impl SysUnseal {
    pub fn new() -> Self {
        Self {
            schema: ResourceSchema {
                type_name: "vault_sys_unseal",
                kind: ResourceKind::Managed,
                importable: false,
                description: "Unseals a Vault cluster by submitting key shares.",
                fields: vec![
                    FieldSchema::required("keys", FieldType::StringList, "Unseal keys.")
                        .sensitive(),
                    FieldSchema::computed(
                        "sealed",
                        FieldType::Bool,
                        "Seal status of the vault cluster.",
                    ),
                    FieldSchema::computed(
                        "threshold",
                        FieldType::Int,
                        "Total number of keys required to unseal.",
                    ),
                    FieldSchema::computed(
                        "number_of_shares",
                        FieldType::Int,
                        "Total number of keys the vault cluster was initialized with.",
                    ),
                    FieldSchema::computed(
                        "progress",
                        FieldType::Int,
                        "Number of keys submitted toward the current unseal attempt.",
                    ),
                    FieldSchema::computed(
                        "version",
                        FieldType::String,
                        "Vault version number of the cluster.",
                    ),
                ],
            },
        }
    }
}

impl Default for SysUnseal {
    fn default() -> Self {
        Self::new()
    }
}

fn store_status(data: &mut ResourceData, status: &SealStatus) {
    data.set("sealed", status.sealed);
    data.set("threshold", status.t);
    data.set("number_of_shares", status.n);
    data.set("progress", status.progress);
    data.set("version", status.version.as_str());
}

/// Submit shares in order until the cluster reports unsealed.
///
/// Stops at the first API error. Fails early when the shares left cannot
/// reach the threshold, and fails if the cluster is still sealed once every
/// share has been submitted.
async fn unseal(client: &VaultClient, keys: &[String]) -> Result<SealStatus, ResourceError> {
    let (first, rest) = keys
        .split_first()
        .ok_or_else(|| ResourceError::Invalid("at least one unseal key is required".into()))?;

    let mut status = client
        .unseal(first)
        .await
        .map_err(ResourceError::api("error unsealing vault"))?;

    let outstanding = status.t - status.progress;
    if status.sealed && outstanding > rest.len() as i64 {
        return Err(ResourceError::InsufficientKeys {
            needed: status.t,
            have: keys.len(),
        });
    }

    for (i, key) in rest.iter().enumerate() {
        if !status.sealed {
            break;
        }
        debug!(
            "submitting unseal key {} of {} (progress {}/{})",
            i + 2,
            keys.len(),
            status.progress,
            status.t
        );
        status = client
            .unseal(key)
            .await
            .map_err(ResourceError::api("error unsealing vault"))?;
    }

    if status.sealed {
        return Err(ResourceError::StillSealed {
            threshold: status.t,
            shares: status.n,
            progress: status.progress,
        });
    }
    Ok(status)
}

impl ResourceHandler for SysUnseal {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn create<'a>(
        &'a self,
        client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let keys = data.require_string_list("keys")?;
            debug!("unsealing vault");

            let status = unseal(client, &keys).await?;

            data.set_id(uuid::Uuid::new_v4().to_string());
            store_status(data, &status);
            info!(version = %status.version, "vault unsealed");
            Ok(())
        })
    }

    fn read<'a>(&'a self, client: &'a VaultClient, data: &'a mut ResourceData) -> HandlerFuture<'a> {
        Box::pin(async move {
            let status = client
                .seal_status()
                .await
                .map_err(ResourceError::api("error reading vault seal status"))?;
            store_status(data, &status);
            if status.sealed || status.initialized == Some(false) {
                debug!("vault is sealed again; dropping unseal resource");
                data.clear_id();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::data_from;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn status(sealed: bool, t: i64, n: i64, progress: i64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "type": "shamir",
            "initialized": true,
            "sealed": sealed,
            "t": t,
            "n": n,
            "progress": progress,
            "version": "1.15.2"
        }))
    }

    async fn mount_key(server: &MockServer, key: &str, response: ResponseTemplate, times: u64) {
        Mock::given(method("PUT"))
            .and(path("/v1/sys/unseal"))
            .and(body_json(json!({ "key": key })))
            .respond_with(response)
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn create_submits_until_unsealed() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        mount_key(&server, "k1", status(true, 2, 3, 1), 1).await;
        mount_key(&server, "k2", status(false, 2, 3, 0), 1).await;
        // Never submitted: the cluster is already open.
        mount_key(&server, "k3", status(false, 2, 3, 0), 0).await;

        let mut data = data_from(json!({ "keys": ["k1", "k2", "k3"] }));
        SysUnseal::new().create(&client, &mut data).await.unwrap();

        assert!(uuid::Uuid::parse_str(data.id().unwrap()).is_ok());
        assert_eq!(data.get_bool("sealed"), Some(false));
        assert_eq!(data.get_int("threshold"), Some(2));
        assert_eq!(data.get_int("number_of_shares"), Some(3));
        assert_eq!(data.get_int("progress"), Some(0));
        assert_eq!(data.get_str("version"), Some("1.15.2"));
    }

    #[tokio::test]
    async fn create_with_single_share() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        mount_key(&server, "only", status(false, 1, 1, 0), 1).await;

        let mut data = data_from(json!({ "keys": ["only"] }));
        SysUnseal::new().create(&client, &mut data).await.unwrap();
        assert_eq!(data.get_bool("sealed"), Some(false));
    }

    #[tokio::test]
    async fn create_with_exactly_threshold_keys() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        mount_key(&server, "k1", status(true, 3, 5, 1), 1).await;
        mount_key(&server, "k2", status(true, 3, 5, 2), 1).await;
        mount_key(&server, "k3", status(false, 3, 5, 0), 1).await;

        let mut data = data_from(json!({ "keys": ["k1", "k2", "k3"] }));
        SysUnseal::new().create(&client, &mut data).await.unwrap();
        assert_eq!(data.get_bool("sealed"), Some(false));
    }

    #[tokio::test]
    async fn create_fails_early_with_too_few_keys() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        mount_key(&server, "k1", status(true, 3, 5, 1), 1).await;
        mount_key(&server, "k2", status(true, 3, 5, 2), 0).await;

        let mut data = data_from(json!({ "keys": ["k1", "k2"] }));
        let err = SysUnseal::new().create(&client, &mut data).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "can't unseal vault, need: 3 keys but only have 2"
        );
        assert!(data.id().is_none());
    }

    #[tokio::test]
    async fn create_reports_still_sealed() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        // A wrong share resets progress, so the cluster stays sealed.
        mount_key(&server, "k1", status(true, 2, 3, 1), 1).await;
        mount_key(&server, "bad", status(true, 2, 3, 0), 1).await;

        let mut data = data_from(json!({ "keys": ["k1", "bad"] }));
        let err = SysUnseal::new().create(&client, &mut data).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error unsealing vault threshold: 2, number of shares: 3, progress: 0"
        );
    }

    #[tokio::test]
    async fn create_surfaces_first_api_error() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        mount_key(&server, "k1", status(true, 2, 3, 1), 1).await;
        mount_key(
            &server,
            "k2",
            ResponseTemplate::new(400).set_body_json(json!({ "errors": ["invalid key"] })),
            1,
        )
        .await;
        mount_key(&server, "k3", status(false, 2, 3, 0), 0).await;

        let mut data = data_from(json!({ "keys": ["k1", "k2", "k3"] }));
        let err = SysUnseal::new().create(&client, &mut data).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error unsealing vault: Vault rejected the request: invalid key"
        );
    }

    #[tokio::test]
    async fn create_rejects_empty_keys() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        let mut data = data_from(json!({ "keys": [] }));
        let err = SysUnseal::new().create(&client, &mut data).await.unwrap_err();
        assert!(matches!(err, ResourceError::Invalid(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_refreshes_status() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        Mock::given(method("GET"))
            .and(path("/v1/sys/seal-status"))
            .respond_with(status(false, 3, 5, 0))
            .mount(&server)
            .await;

        let mut data = data_from(json!({ "keys": ["k1"] }));
        data.set_id("abc");
        SysUnseal::new().read(&client, &mut data).await.unwrap();
        assert_eq!(data.id(), Some("abc"));
        assert_eq!(data.get_int("threshold"), Some(3));
        assert_eq!(data.get_int("number_of_shares"), Some(5));
    }

    #[tokio::test]
    async fn read_drops_resealed_cluster() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        Mock::given(method("GET"))
            .and(path("/v1/sys/seal-status"))
            .respond_with(status(true, 3, 5, 0))
            .mount(&server)
            .await;

        let mut data = ResourceData::with_id("abc");
        SysUnseal::new().read(&client, &mut data).await.unwrap();
        assert!(data.id().is_none());
        assert_eq!(data.get_bool("sealed"), Some(true));
    }

    #[tokio::test]
    async fn read_drops_uninitialized_cluster() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        Mock::given(method("GET"))
            .and(path("/v1/sys/seal-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "initialized": false,
                "sealed": false,
                "t": 0,
                "n": 0,
                "progress": 0,
                "version": "1.15.2"
            })))
            .mount(&server)
            .await;

        let mut data = ResourceData::with_id("abc");
        SysUnseal::new().read(&client, &mut data).await.unwrap();
        assert!(data.id().is_none());
    }

    #[tokio::test]
    async fn read_keeps_id_when_initialized_is_unreported() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        Mock::given(method("GET"))
            .and(path("/v1/sys/seal-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sealed": false,
                "t": 3,
                "n": 5,
                "progress": 0,
                "version": "0.9.0"
            })))
            .mount(&server)
            .await;

        let mut data = ResourceData::with_id("abc");
        SysUnseal::new().read(&client, &mut data).await.unwrap();
        assert_eq!(data.id(), Some("abc"));
        assert_eq!(data.get_bool("sealed"), Some(false));
    }

    #[test]
    fn keys_are_sensitive() {
        let unseal = SysUnseal::new();
        assert_eq!(unseal.schema().sensitive_fields().collect::<Vec<_>>(), vec!["keys"]);
    }
}
