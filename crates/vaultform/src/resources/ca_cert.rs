//! `vault_pki_ca_cert_pem`: PEM-encoded CA certificate of a PKI mount.

use tracing::debug;
use vaultform_core::schema::{FieldSchema, FieldType, ResourceKind, ResourceSchema};
use vaultform_core::state::ResourceData;

use crate::client::VaultClient;
use crate::provider::{HandlerFuture, ResourceError, ResourceHandler};

#[derive(Debug)]
pub struct CaCertPem {
    schema: ResourceSchema,
}

impl CaCertPem {
    pub fn new() -> Self {
        Self {
            schema: ResourceSchema {
                type_name: "vault_pki_ca_cert_pem",
                kind: ResourceKind::Data,
                importable: false,
                description: "Reads the CA certificate of a PKI secrets engine mount.",
                fields: vec![
                    FieldSchema::required(
                        "path",
                        FieldType::String,
                        "Qualifying path from which the CA certificate will be read.",
                    ),
                    FieldSchema::computed("pem", FieldType::String, "PEM encoded CA Certificate."),
                ],
            },
        }
    }
}

impl Default for CaCertPem {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceHandler for CaCertPem {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn create<'a>(
        &'a self,
        client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        self.read(client, data)
    }

    fn read<'a>(&'a self, client: &'a VaultClient, data: &'a mut ResourceData) -> HandlerFuture<'a> {
        Box::pin(async move {
            let mount = data.require_str("path")?.trim_matches('/').to_owned();
            if mount.is_empty() {
                return Err(ResourceError::Invalid("path must not be empty".into()));
            }

            let path = format!("{mount}/ca/pem");
            debug!("reading {path} from Vault");
            let pem = client
                .read_raw(&path)
                .await
                .map_err(ResourceError::api("error reading from Vault"))?;
            debug!(bytes = pem.len(), "CA certificate read from {path}");

            data.set("pem", pem);
            data.set_id(mount);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::data_from;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    #[tokio::test]
    async fn read_sets_pem_and_id() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        Mock::given(method("GET"))
            .and(path("/v1/pki/ca/pem"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PEM))
            .expect(1)
            .mount(&server)
            .await;

        let mut data = data_from(json!({ "path": "/pki/" }));
        CaCertPem::new().read(&client, &mut data).await.unwrap();
        assert_eq!(data.get_str("pem"), Some(PEM));
        assert_eq!(data.id(), Some("pki"));
    }

    #[tokio::test]
    async fn create_reads() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        Mock::given(method("GET"))
            .and(path("/v1/pki_int/ca/pem"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PEM))
            .mount(&server)
            .await;

        let mut data = data_from(json!({ "path": "pki_int" }));
        CaCertPem::new().create(&client, &mut data).await.unwrap();
        assert_eq!(data.get_str("pem"), Some(PEM));
    }

    #[tokio::test]
    async fn read_wraps_api_errors() {
        let server = MockServer::start().await;
        let client = VaultClient::with_base_url(server.uri(), None);

        Mock::given(method("GET"))
            .and(path("/v1/nope/ca/pem"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut data = data_from(json!({ "path": "nope" }));
        let err = CaCertPem::new().read(&client, &mut data).await.unwrap_err();
        assert!(err.to_string().starts_with("error reading from Vault: "));
        assert!(data.get("pem").is_none());
        assert!(data.id().is_none());
    }

    #[tokio::test]
    async fn read_rejects_empty_path() {
        let client = VaultClient::with_base_url("http://127.0.0.1:1".into(), None);
        let mut data = data_from(json!({ "path": "/" }));
        let err = CaCertPem::new().read(&client, &mut data).await.unwrap_err();
        assert!(matches!(err, ResourceError::Invalid(_)));
    }

    #[tokio::test]
    async fn read_requires_path() {
        let client = VaultClient::with_base_url("http://127.0.0.1:1".into(), None);
        let mut data = data_from(json!({}));
        let err = CaCertPem::new().read(&client, &mut data).await.unwrap_err();
        assert!(matches!(err, ResourceError::State(_)));
    }
}
