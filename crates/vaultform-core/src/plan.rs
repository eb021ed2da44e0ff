//! Per-resource planning: decide what the engine must do to bring one
//! resource from its prior state to its declared configuration.

use std::fmt;

use serde_json::{Map, Value};

use crate::schema::{Presence, ResourceKind, ResourceSchema};
use crate::state::ResourceState;

/// Action the engine takes for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    /// Data source lookup.
    Read,
    Update { changed: Vec<String> },
    /// Delete then create, because a force-new field changed.
    Replace { changed: Vec<String> },
    NoOp,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Read => write!(f, "read"),
            Self::Update { .. } => write!(f, "update"),
            Self::Replace { .. } => write!(f, "replace"),
            Self::NoOp => write!(f, "no-op"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Configurable fields whose declared value differs from the prior state.
pub fn changed_fields(
    schema: &ResourceSchema,
    config: &Map<String, Value>,
    prior: &Map<String, Value>,
) -> Vec<String> {
    let present = |m: &Map<String, Value>, name: &str| m.get(name).filter(|v| !v.is_null()).cloned();

    schema
        .fields
        .iter()
        .filter(|f| f.presence.is_configurable())
        .filter(|f| {
            let want = present(config, f.name);
            let have = present(prior, f.name);
            match (want, f.presence) {
                // Left to the handler; whatever it computed stands.
                (None, Presence::OptionalComputed) => false,
                (want, _) => want != have,
            }
        })
        .map(|f| f.name.to_owned())
        .collect()
}

/// Plan one declared resource against its prior state.
pub fn plan_resource(
    schema: &ResourceSchema,
    config: &Map<String, Value>,
    prior: Option<&ResourceState>,
) -> Action {
    if schema.kind == ResourceKind::Data {
        return Action::Read;
    }

    let Some(prior) = prior.filter(|p| p.id.is_some()) else {
        return Action::Create;
    };

    let changed = changed_fields(schema, config, &prior.attributes);
    if changed.is_empty() {
        return Action::NoOp;
    }

    let force_new = changed
        .iter()
        .any(|name| schema.field(name).is_some_and(|f| f.force_new));
    if force_new {
        Action::Replace { changed }
    } else {
        Action::Update { changed }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
