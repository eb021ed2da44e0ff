//! Resource state: the attribute bag handlers read and write, and the
//! on-disk state file that persists it between runs.
//!
//! Attributes hold unseal keys and root tokens, so the state file is written
//! with owner-only permissions and replaced atomically.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current state file format version.
pub const STATE_VERSION: u32 = 1;

/// Errors from state access and persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("missing required attribute '{0}'")]
    MissingAttribute(String),

    #[error("attribute '{field}' is not a {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("invalid resource address '{0}' (expected <type>.<name>)")]
    InvalidAddress(String),

    #[error("failed to access state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported state file version {0} (expected {STATE_VERSION})")]
    UnsupportedVersion(u32),
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// `type.name` identifying one declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub type_name: String,
    pub name: String,
}

impl Address {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.name)
    }
}

impl FromStr for Address {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((type_name, name))
                if !type_name.is_empty() && !name.is_empty() && !name.contains('.') =>
            {
                Ok(Self::new(type_name, name))
            }
            _ => Err(StateError::InvalidAddress(s.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceData
// ---------------------------------------------------------------------------

/// Attribute bag for one resource instance.
///
/// Handlers read configuration from it and write computed values back. A
/// resource exists remotely exactly when it carries an id.
#[derive(Clone, Default, PartialEq)]
pub struct ResourceData {
    id: Option<String>,
    attributes: Map<String, Value>,
}

// Attribute values may be key material; only the field names are shown.
impl fmt::Debug for ResourceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceData")
            .field("id", &self.id)
            .field("fields", &self.attributes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceData {
    /// Fresh data from user configuration, no id yet.
    pub fn new(config: Map<String, Value>) -> Self {
        Self {
            id: None,
            attributes: config,
        }
    }

    /// Empty data carrying only an id (used by import).
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            attributes: Map::new(),
        }
    }

    pub fn from_state(state: &ResourceState) -> Self {
        Self {
            id: state.id.clone(),
            attributes: state.attributes.clone(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Mark the remote object as gone.
    pub fn clear_id(&mut self) {
        self.id = None;
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn into_parts(self) -> (Option<String>, Map<String, Value>) {
        (self.id, self.attributes)
    }

    /// Raw attribute value; `null` reads as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    /// Attribute value unless it is absent or the zero value of its type
    /// (`0`, `""`, `false`, `[]`).
    pub fn get_non_zero(&self, name: &str) -> Option<&Value> {
        self.get(name).filter(|v| match v {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64() != Some(0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Null => false,
        })
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// List of strings; non-string elements make the whole value unreadable.
    pub fn get_string_list(&self, name: &str) -> Option<Vec<String>> {
        self.get(name)?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect()
    }

    pub fn require_str(&self, name: &str) -> Result<&str, StateError> {
        match self.get(name) {
            None => Err(StateError::MissingAttribute(name.to_owned())),
            Some(v) => v.as_str().ok_or_else(|| StateError::WrongType {
                field: name.to_owned(),
                expected: "string",
            }),
        }
    }

    pub fn require_int(&self, name: &str) -> Result<i64, StateError> {
        match self.get(name) {
            None => Err(StateError::MissingAttribute(name.to_owned())),
            Some(v) => v.as_i64().ok_or_else(|| StateError::WrongType {
                field: name.to_owned(),
                expected: "integer",
            }),
        }
    }

    pub fn require_string_list(&self, name: &str) -> Result<Vec<String>, StateError> {
        if self.get(name).is_none() {
            return Err(StateError::MissingAttribute(name.to_owned()));
        }
        self.get_string_list(name)
            .ok_or_else(|| StateError::WrongType {
                field: name.to_owned(),
                expected: "list of strings",
            })
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_owned(), value.into());
    }

    /// Overlay configuration onto existing attributes. Null config values
    /// leave the prior attribute in place.
    pub fn merge_config(&mut self, config: &Map<String, Value>) {
        for (key, value) in config {
            if !value.is_null() {
                self.attributes.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

/// One resource as stored in the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ResourceState {
    pub fn from_data(address: &Address, data: ResourceData) -> Self {
        let (id, attributes) = data.into_parts();
        Self {
            type_name: address.type_name.clone(),
            name: address.name.clone(),
            id,
            attributes,
        }
    }

    pub fn address(&self) -> Address {
        Address::new(&self.type_name, &self.name)
    }
}

/// The state file: every resource the tool manages, in apply order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub resources: Vec<ResourceState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            resources: Vec::new(),
        }
    }
}

impl StateFile {
    /// Load state from `path`. A missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no state file at {}, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        let state: Self = serde_json::from_str(&contents).map_err(|source| StateError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if state.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }

    /// Write state to `path` via a temp file and rename, bumping the serial.
    pub fn save(&mut self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.display().to_string(),
            source,
        };

        self.serial += 1;
        let json = serde_json::to_string_pretty(self).map_err(|source| StateError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        // Owner-only (0600 on unix) from creation, under a random name.
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        tracing::debug!(serial = self.serial, "state saved to {}", path.display());
        Ok(())
    }

    pub fn get(&self, address: &Address) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| r.type_name == address.type_name && r.name == address.name)
    }

    /// Replace the entry at the same address, or append.
    pub fn upsert(&mut self, resource: ResourceState) {
        match self
            .resources
            .iter_mut()
            .find(|r| r.type_name == resource.type_name && r.name == resource.name)
        {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
    }

    pub fn position(&self, address: &Address) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.type_name == address.type_name && r.name == address.name)
    }

    /// Insert at `index` (clamped to the end), replacing any entry at the
    /// same address.
    pub fn insert_at(&mut self, index: usize, resource: ResourceState) {
        self.remove(&resource.address());
        let index = index.min(self.resources.len());
        self.resources.insert(index, resource);
    }

    pub fn remove(&mut self, address: &Address) -> Option<ResourceState> {
        let idx = self.position(address)?;
        Some(self.resources.remove(idx))
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.resources.iter().map(ResourceState::address).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
