//! HashiCorp Vault HTTP client for the system backend.
//!
//! Covers the administrative endpoints the resources need:
//! - `GET /v1/sys/init`, `PUT /v1/sys/init`
//! - `GET /v1/sys/seal-status`, `PUT /v1/sys/unseal`
//! - `GET|PUT|DELETE /v1/sys/plugins/catalog/:type/:name`
//! - raw `GET /v1/<path>` for PEM bodies
//!
//! Init and unseal are unauthenticated in Vault; the token is attached to
//! every request when configured and ignored by those endpoints.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::secret::VaultToken;

/// Vault API base URL used when neither config nor `VAULT_ADDR` set one.
pub const DEFAULT_ADDRESS: &str = "http://127.0.0.1:8200";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Vault API error types.
#[derive(Debug, thiserror::Error)]
pub enum VaultApiError {
    #[error("invalid Vault address: {0}")]
    InvalidAddress(String),

    #[error("failed to build HTTP client")]
    Build(#[source] reqwest::Error),

    #[error("network error communicating with Vault: {0}")]
    Network(#[source] reqwest::Error),

    #[error("malformed response from Vault: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("Vault rejected the request{}", fmt_messages(.0))]
    BadRequest(Vec<String>),

    #[error("Vault authentication failed (check token permissions)")]
    Unauthorized,

    #[error("Vault resource not found: {0}")]
    NotFound(String),

    #[error("Vault API rate limit exceeded")]
    RateLimited,

    #[error("Vault is sealed or in standby")]
    Unavailable,

    #[error("Vault API server error: status {code}{msgs}", code = .0, msgs = fmt_messages(.1))]
    ServerError(u16, Vec<String>),

    #[error("unexpected Vault API response: status {0}")]
    UnexpectedStatus(u16),
}

fn fmt_messages(messages: &[String]) -> String {
    if messages.is_empty() {
        String::new()
    } else {
        format!(": {}", messages.join("; "))
    }
}

// ---------------------------------------------------------------------------
// Address and path helpers
// ---------------------------------------------------------------------------

/// Accept `https://`, and `http://` only for localhost.
fn validate_address(url: &str) -> Result<(), VaultApiError> {
    if url.starts_with("https://") {
        return Ok(());
    }
    if let Some(host_part) = url.strip_prefix("http://") {
        let host = host_part.split('/').next().unwrap_or("");
        let host_no_port = host.split(':').next().unwrap_or("");
        if host_no_port == "localhost" || host_no_port == "127.0.0.1" {
            return Ok(());
        }
        return Err(VaultApiError::InvalidAddress(format!(
            "insecure HTTP URL rejected: {url} (http:// is permitted for localhost/127.0.0.1 only)"
        )));
    }
    Err(VaultApiError::InvalidAddress(format!(
        "unsupported URL scheme: {url}"
    )))
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Percent-encode a single URL path component.
fn percent_encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

/// Percent-encode each segment of a slash-delimited Vault path.
fn encode_vault_path(path: &str) -> String {
    path.trim_matches('/')
        .split('/')
        .map(percent_encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Body of `PUT /v1/sys/init`. Unset options are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InitRequest {
    pub secret_shares: i64,
    pub secret_threshold: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_shares: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pgp_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_shares: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_threshold: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery_pgp_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_token_pgp_key: Option<String>,
}

/// Key material returned by `PUT /v1/sys/init`.
#[derive(Clone, Default, Deserialize)]
pub struct InitResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    #[serde(default)]
    pub recovery_keys: Vec<String>,
    #[serde(default)]
    pub recovery_keys_base64: Vec<String>,
    #[serde(default)]
    pub root_token: String,
}

impl fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys", &self.keys.len())
            .field("recovery_keys", &self.recovery_keys.len())
            .field("root_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InitStatus {
    pub initialized: bool,
}

/// Seal status as reported by `sys/seal-status` and `sys/unseal`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SealStatus {
    pub sealed: bool,
    /// Threshold of shares required to unseal.
    pub t: i64,
    /// Total number of shares.
    pub n: i64,
    /// Shares submitted toward the current unseal attempt.
    pub progress: i64,
    #[serde(default)]
    pub version: String,
    /// Absent from responses of older servers.
    #[serde(default)]
    pub initialized: Option<bool>,
}

#[derive(Serialize)]
struct UnsealPayload<'a> {
    key: &'a str,
}

/// Plugin catalog category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    Auth,
    Database,
    Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported plugin type '{0}' (expected auth, database, or secret)")]
pub struct UnknownPluginType(pub String);

impl PluginType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Database => "database",
            Self::Secret => "secret",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = UnknownPluginType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auth" => Ok(Self::Auth),
            "database" => Ok(Self::Database),
            "secret" => Ok(Self::Secret),
            _ => Err(UnknownPluginType(s.to_owned())),
        }
    }
}

/// Catalog registration input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPluginInput {
    pub name: String,
    pub plugin_type: PluginType,
    pub command: String,
    pub sha256: String,
    pub args: Vec<String>,
}

#[derive(Serialize)]
struct RegisterPluginPayload<'a> {
    sha256: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    args: &'a [String],
}

/// Catalog entry returned by `GET /v1/sys/plugins/catalog/:type/:name`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub builtin: bool,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Connection settings for [`VaultClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub address: String,
    pub token: Option<VaultToken>,
    pub namespace: Option<String>,
    pub timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_owned(),
            token: None,
            namespace: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Vault REST API client.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<VaultToken>,
    namespace: Option<String>,
}

impl VaultClient {
    /// Build the user-agent string from crate version.
    fn user_agent() -> String {
        format!("vaultform/{}", env!("CARGO_PKG_VERSION"))
    }

    pub fn new(settings: ClientSettings) -> Result<Self, VaultApiError> {
        validate_address(&settings.address)?;
        let http = reqwest::Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(VaultApiError::Build)?;

        Ok(Self {
            http,
            base_url: settings.address.trim_end_matches('/').to_owned(),
            token: settings.token,
            namespace: settings.namespace.filter(|ns| !ns.is_empty()),
        })
    }

    /// Client against a mock server, optionally authenticated (for tests).
    #[cfg(test)]
    pub fn with_base_url(base_url: String, token: Option<&str>) -> Self {
        Self::new(ClientSettings {
            address: base_url,
            token: token.map(|t| VaultToken::new(t.to_owned())),
            ..ClientSettings::default()
        })
        .expect("mock server address is valid")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/{path}", self.base_url);
        debug!(%method, %url, "vault request");
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.token {
            req = req.header("X-Vault-Token", token.expose());
        }
        if let Some(ns) = &self.namespace {
            req = req.header("X-Vault-Namespace", ns);
        }
        req
    }

    /// Send and map non-success statuses to errors.
    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, VaultApiError> {
        let resp = req.send().await.map_err(VaultApiError::Network)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let code = status.as_u16();
        let messages = resp
            .json::<ErrorBody>()
            .await
            .map(|b| b.errors)
            .unwrap_or_default();
        debug!(status = code, "vault request failed for {what}");

        Err(match code {
            400 => VaultApiError::BadRequest(messages),
            401 | 403 => VaultApiError::Unauthorized,
            404 => VaultApiError::NotFound(what.to_owned()),
            429 => VaultApiError::RateLimited,
            503 => VaultApiError::Unavailable,
            500..=599 => VaultApiError::ServerError(code, messages),
            other => VaultApiError::UnexpectedStatus(other),
        })
    }

    /// Read the raw response body at `path`, e.g. `pki/ca/pem`.
    pub async fn read_raw(&self, path: &str) -> Result<String, VaultApiError> {
        let encoded = encode_vault_path(path);
        let resp = self
            .send(self.request(reqwest::Method::GET, &encoded), path)
            .await?;
        resp.text().await.map_err(VaultApiError::Decode)
    }

    pub async fn init_status(&self) -> Result<InitStatus, VaultApiError> {
        let resp = self
            .send(self.request(reqwest::Method::GET, "sys/init"), "sys/init")
            .await?;
        resp.json().await.map_err(VaultApiError::Decode)
    }

    /// Initialize the cluster. Fails if it is already initialized.
    pub async fn init(&self, request: &InitRequest) -> Result<InitResponse, VaultApiError> {
        let resp = self
            .send(
                self.request(reqwest::Method::PUT, "sys/init").json(request),
                "sys/init",
            )
            .await?;
        resp.json().await.map_err(VaultApiError::Decode)
    }

    pub async fn seal_status(&self) -> Result<SealStatus, VaultApiError> {
        let resp = self
            .send(
                self.request(reqwest::Method::GET, "sys/seal-status"),
                "sys/seal-status",
            )
            .await?;
        resp.json().await.map_err(VaultApiError::Decode)
    }

    /// Submit one unseal key share.
    pub async fn unseal(&self, key: &str) -> Result<SealStatus, VaultApiError> {
        let resp = self
            .send(
                self.request(reqwest::Method::PUT, "sys/unseal")
                    .json(&UnsealPayload { key }),
                "sys/unseal",
            )
            .await?;
        resp.json().await.map_err(VaultApiError::Decode)
    }

    fn catalog_path(plugin_type: PluginType, name: &str) -> String {
        format!(
            "sys/plugins/catalog/{plugin_type}/{}",
            percent_encode_component(name)
        )
    }

    pub async fn register_plugin(&self, input: &RegisterPluginInput) -> Result<(), VaultApiError> {
        let path = Self::catalog_path(input.plugin_type, &input.name);
        let payload = RegisterPluginPayload {
            sha256: &input.sha256,
            command: &input.command,
            args: &input.args,
        };
        self.send(
            self.request(reqwest::Method::PUT, &path).json(&payload),
            &path,
        )
        .await?;
        Ok(())
    }

    pub async fn get_plugin(
        &self,
        plugin_type: PluginType,
        name: &str,
    ) -> Result<PluginInfo, VaultApiError> {
        let path = Self::catalog_path(plugin_type, name);
        let resp = self
            .send(self.request(reqwest::Method::GET, &path), &path)
            .await?;
        let envelope: DataEnvelope<PluginInfo> =
            resp.json().await.map_err(VaultApiError::Decode)?;
        Ok(envelope.data)
    }

    pub async fn deregister_plugin(
        &self,
        plugin_type: PluginType,
        name: &str,
    ) -> Result<(), VaultApiError> {
        let path = Self::catalog_path(plugin_type, name);
        self.send(self.request(reqwest::Method::DELETE, &path), &path)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
