//! `${type.name.field}` references between resources.
//!
//! A definition can feed one resource's computed attribute into another's
//! configuration, e.g. unseal keys produced by an init:
//!
//! ```toml
//! keys = ["${vault_sys_init.cluster.keys}"]
//! ```
//!
//! Only whole-string references are recognised. A list-valued attribute
//! referenced from a list element is spliced into the surrounding list.

use serde_json::{Map, Value};

use crate::state::{Address, StateFile};

/// Errors returned while resolving references.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("malformed reference '{0}' (expected ${{<type>.<name>.<field>}})")]
    Malformed(String),

    #[error("reference '{0}' points to a resource that has not been applied")]
    UnknownResource(String),

    #[error("reference '{0}' points to an attribute that is not set")]
    UnknownAttribute(String),
}

/// Parsed reference target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub address: Address,
    pub field: String,
}

/// Parse `s` if it is a reference. `Ok(None)` means a plain string.
pub fn parse(s: &str) -> Result<Option<Reference>, ReferenceError> {
    let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) else {
        return Ok(None);
    };

    let mut parts = inner.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(t), Some(n), Some(f), None) if !t.is_empty() && !n.is_empty() && !f.is_empty() => {
            Ok(Some(Reference {
                address: Address::new(t, n),
                field: f.to_owned(),
            }))
        }
        _ => Err(ReferenceError::Malformed(s.to_owned())),
    }
}

fn lookup<'a>(state: &'a StateFile, raw: &str, r: &Reference) -> Result<&'a Value, ReferenceError> {
    let resource = state
        .get(&r.address)
        .filter(|res| res.id.is_some())
        .ok_or_else(|| ReferenceError::UnknownResource(raw.to_owned()))?;
    resource
        .attributes
        .get(&r.field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ReferenceError::UnknownAttribute(raw.to_owned()))
}

/// Return `config` with every reference replaced by the current value from
/// `state`. Nested objects are not searched.
pub fn resolve(
    config: &Map<String, Value>,
    state: &StateFile,
) -> Result<Map<String, Value>, ReferenceError> {
    let mut out = Map::with_capacity(config.len());
    for (key, value) in config {
        let resolved = match value {
            Value::String(s) => match parse(s)? {
                Some(r) => lookup(state, s, &r)?.clone(),
                None => value.clone(),
            },
            Value::Array(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    let Some(s) = item.as_str() else {
                        list.push(item.clone());
                        continue;
                    };
                    match parse(s)? {
                        Some(r) => match lookup(state, s, &r)? {
                            Value::Array(inner) => list.extend(inner.iter().cloned()),
                            other => list.push(other.clone()),
                        },
                        None => list.push(item.clone()),
                    }
                }
                Value::Array(list)
            }
            other => other.clone(),
        };
        out.insert(key.clone(), resolved);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ResourceData, ResourceState};
    use serde_json::json;

    fn state() -> StateFile {
        let mut state = StateFile::default();
        let mut init = ResourceData::new(
            json!({ "keys": ["k1", "k2"], "root_token": "s.root", "secret_shares": 2 })
                .as_object()
                .cloned()
                .unwrap(),
        );
        init.set_id("id-1");
        state.upsert(ResourceState::from_data(
            &Address::new("vault_sys_init", "cluster"),
            init,
        ));
        // Present in state but never created remotely.
        state.upsert(ResourceState::from_data(
            &Address::new("vault_sys_init", "pending"),
            ResourceData::default(),
        ));
        state
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parse_plain_string() {
        assert_eq!(parse("hello").unwrap(), None);
        assert_eq!(parse("${not closed").unwrap(), None);
    }

    #[test]
    fn parse_reference() {
        let r = parse("${vault_sys_init.cluster.keys}").unwrap().unwrap();
        assert_eq!(r.address, Address::new("vault_sys_init", "cluster"));
        assert_eq!(r.field, "keys");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(parse("${a.b}"), Err(ReferenceError::Malformed(_))));
        assert!(matches!(parse("${a.b.c.d}"), Err(ReferenceError::Malformed(_))));
        assert!(matches!(parse("${a..c}"), Err(ReferenceError::Malformed(_))));
    }

    #[test]
    fn resolve_scalar_reference() {
        let out = resolve(
            &config(json!({ "token": "${vault_sys_init.cluster.root_token}", "n": 3 })),
            &state(),
        )
        .unwrap();
        assert_eq!(out["token"], json!("s.root"));
        assert_eq!(out["n"], json!(3));
    }

    #[test]
    fn resolve_whole_list_reference() {
        let out = resolve(
            &config(json!({ "keys": "${vault_sys_init.cluster.keys}" })),
            &state(),
        )
        .unwrap();
        assert_eq!(out["keys"], json!(["k1", "k2"]));
    }

    #[test]
    fn resolve_splices_list_elements() {
        let out = resolve(
            &config(json!({ "keys": ["k0", "${vault_sys_init.cluster.keys}"] })),
            &state(),
        )
        .unwrap();
        assert_eq!(out["keys"], json!(["k0", "k1", "k2"]));
    }

    #[test]
    fn resolve_unknown_resource() {
        let err = resolve(
            &config(json!({ "keys": "${vault_sys_init.other.keys}" })),
            &state(),
        )
        .unwrap_err();
        assert!(matches!(err, ReferenceError::UnknownResource(_)));
    }

    #[test]
    fn resolve_resource_without_id_is_unknown() {
        let err = resolve(
            &config(json!({ "keys": "${vault_sys_init.pending.keys}" })),
            &state(),
        )
        .unwrap_err();
        assert!(matches!(err, ReferenceError::UnknownResource(_)));
    }

    #[test]
    fn resolve_unknown_attribute() {
        let err = resolve(
            &config(json!({ "x": "${vault_sys_init.cluster.nope}" })),
            &state(),
        )
        .unwrap_err();
        assert!(matches!(err, ReferenceError::UnknownAttribute(_)));
        assert!(err.to_string().contains("${vault_sys_init.cluster.nope}"));
    }
}
