//! Sequential driver that reconciles declared resources with the state file.
//!
//! Every step that changes remote or local state is followed by a state
//! save, so key material returned by an init survives a failure further
//! down the list.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use vaultform_core::plan::{self, Action};
use vaultform_core::reference::{self, ReferenceError};
use vaultform_core::schema::{Presence, ResourceKind, ResourceSchema, SchemaError};
use vaultform_core::state::{Address, ResourceData, ResourceState, StateError, StateFile};

use crate::config::ResourceDef;
use crate::provider::{Provider, RegistryError, ResourceError, ResourceHandler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("{address}: {source}")]
    Reference {
        address: Address,
        #[source]
        source: ReferenceError,
    },

    #[error("{address}: {source}")]
    Resource {
        address: Address,
        #[source]
        source: ResourceError,
    },

    #[error("{0}: handler finished without setting an id")]
    MissingId(Address),

    #[error("resource type {0} does not support import")]
    NotImportable(String),

    #[error("{0} is already managed; destroy or remove it from state first")]
    AlreadyManaged(Address),

    #[error("{address}: no remote object found for id '{id}'")]
    ImportNotFound { address: Address, id: String },
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Counts of the actions taken during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub read: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ApplySummary {
    fn record(&mut self, action: &Action) {
        match action {
            Action::Create => self.created += 1,
            Action::Read => self.read += 1,
            Action::Update { .. } => self.updated += 1,
            Action::Replace { .. } => self.replaced += 1,
            Action::NoOp => self.unchanged += 1,
            Action::Delete => self.deleted += 1,
        }
    }

    pub fn changed(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} read, {} updated, {} replaced, {} deleted, {} unchanged",
            self.created, self.read, self.updated, self.replaced, self.deleted, self.unchanged
        )
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    provider: Provider,
    state: StateFile,
    state_path: PathBuf,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("provider", &self.provider)
            .field("state_path", &self.state_path)
            .field("resources", &self.state.resources.len())
            .finish()
    }
}

impl Engine {
    /// Engine over the state file at `state_path` (created on first save).
    pub fn new(provider: Provider, state_path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let state_path = state_path.into();
        let state = StateFile::load(&state_path)?;
        Ok(Self {
            provider,
            state,
            state_path,
        })
    }

    pub fn state(&self) -> &StateFile {
        &self.state
    }

    fn save(&mut self) -> Result<(), EngineError> {
        self.state.save(&self.state_path)?;
        Ok(())
    }

    fn store(&mut self, address: &Address, data: ResourceData) -> Result<(), EngineError> {
        self.state.upsert(ResourceState::from_data(address, data));
        self.save()
    }

    /// Like `store`, but at a fixed position in the state order.
    fn store_at(
        &mut self,
        index: usize,
        address: &Address,
        data: ResourceData,
    ) -> Result<(), EngineError> {
        self.state.insert_at(index, ResourceState::from_data(address, data));
        self.save()
    }

    fn forget(&mut self, address: &Address) -> Result<(), EngineError> {
        self.state.remove(address);
        self.save()
    }

    /// Bring every declared resource to its configuration, then delete
    /// resources that are no longer declared.
    pub async fn apply(&mut self, defs: &[ResourceDef]) -> Result<ApplySummary, EngineError> {
        let mut summary = ApplySummary::default();

        for def in defs {
            let action = self.apply_one(def).await?;
            summary.record(&action);
        }

        let declared: HashSet<Address> = defs.iter().map(ResourceDef::address).collect();
        let orphaned: Vec<Address> = self
            .state
            .addresses()
            .into_iter()
            .rev()
            .filter(|a| !declared.contains(a))
            .collect();
        for address in orphaned {
            self.delete_one(&address).await?;
            summary.record(&Action::Delete);
        }

        info!("apply complete: {summary}");
        Ok(summary)
    }

    async fn apply_one(&mut self, def: &ResourceDef) -> Result<Action, EngineError> {
        let address = def.address();
        let handler = self.provider.handler(&def.type_name)?.clone();
        let schema = handler.schema();

        let config = reference::resolve(&def.config, &self.state).map_err(|source| {
            EngineError::Reference {
                address: address.clone(),
                source,
            }
        })?;
        schema.validate_config(&config)?;

        let prior = match self.state.get(&address).cloned() {
            Some(prior) if schema.kind == ResourceKind::Managed && prior.id.is_some() => {
                self.refresh_one(handler.as_ref(), &address, &prior).await?
            }
            other => other,
        };

        let action = plan::plan_resource(schema, &config, prior.as_ref());
        debug!("{address}: planned {action}");

        match (&action, prior) {
            (Action::Create | Action::Read, _) | (_, None) => {
                let data = self.create(handler.as_ref(), &address, config, &action).await?;
                self.store(&address, data)?;
            }
            (Action::Update { changed }, Some(prior)) => {
                debug!("{address}: changed fields {changed:?}");
                let mut data = ResourceData::from_state(&prior);
                data.merge_config(&config);
                clear_removed_optionals(schema, &config, &mut data);
                handler
                    .update(self.provider.client(), &mut data)
                    .await
                    .map_err(resource_err(&address))?;
                if data.id().is_none() {
                    return Err(EngineError::MissingId(address));
                }
                self.store(&address, data)?;
            }
            (Action::Replace { changed }, Some(prior)) => {
                debug!("{address}: force-new fields changed {changed:?}");
                let index = self.state.position(&address);
                let mut data = ResourceData::from_state(&prior);
                handler
                    .delete(self.provider.client(), &mut data)
                    .await
                    .map_err(resource_err(&address))?;
                self.forget(&address)?;
                // Keep the slot so reverse-order deletes still see
                // dependents first.
                let data = self.create(handler.as_ref(), &address, config, &action).await?;
                match index {
                    Some(index) => self.store_at(index, &address, data)?,
                    None => self.store(&address, data)?,
                }
            }
            (Action::NoOp | Action::Delete, Some(_)) => {}
        }

        info!("{address}: {action}");
        Ok(action)
    }

    /// Read a managed resource's remote object. Returns the refreshed state,
    /// or `None` after dropping it when the object is gone.
    async fn refresh_one(
        &mut self,
        handler: &dyn ResourceHandler,
        address: &Address,
        prior: &ResourceState,
    ) -> Result<Option<ResourceState>, EngineError> {
        let mut data = ResourceData::from_state(prior);
        handler
            .read(self.provider.client(), &mut data)
            .await
            .map_err(resource_err(address))?;

        if data.id().is_none() {
            warn!("{address}: remote object is gone, dropping it from state");
            self.forget(address)?;
            return Ok(None);
        }

        let refreshed = ResourceState::from_data(address, data);
        self.state.upsert(refreshed.clone());
        self.save()?;
        Ok(Some(refreshed))
    }

    async fn create(
        &mut self,
        handler: &dyn ResourceHandler,
        address: &Address,
        config: Map<String, Value>,
        action: &Action,
    ) -> Result<ResourceData, EngineError> {
        let mut data = ResourceData::new(config);
        let client = self.provider.client();
        let result = if *action == Action::Read {
            handler.read(client, &mut data).await
        } else {
            handler.create(client, &mut data).await
        };
        result.map_err(resource_err(address))?;

        if data.id().is_none() {
            return Err(EngineError::MissingId(address.clone()));
        }
        Ok(data)
    }

    async fn delete_one(&mut self, address: &Address) -> Result<(), EngineError> {
        let Some(prior) = self.state.get(address).cloned() else {
            return Ok(());
        };
        let handler = self.provider.handler(&address.type_name)?.clone();

        let mut data = ResourceData::from_state(&prior);
        if data.id().is_some() {
            handler
                .delete(self.provider.client(), &mut data)
                .await
                .map_err(resource_err(address))?;
        }
        self.forget(address)?;
        info!("{address}: {}", Action::Delete);
        Ok(())
    }

    /// Delete every resource in state, last applied first.
    pub async fn destroy(&mut self) -> Result<ApplySummary, EngineError> {
        let mut summary = ApplySummary::default();
        let addresses: Vec<Address> = self.state.addresses().into_iter().rev().collect();
        for address in addresses {
            self.delete_one(&address).await?;
            summary.record(&Action::Delete);
        }
        info!("destroy complete: {summary}");
        Ok(summary)
    }

    /// Re-read every resource in state. Resources whose remote object is
    /// gone are dropped and counted as deleted.
    pub async fn refresh(&mut self) -> Result<ApplySummary, EngineError> {
        let mut summary = ApplySummary::default();
        for prior in self.state.resources.clone() {
            let address = prior.address();
            let handler = self.provider.handler(&prior.type_name)?.clone();

            if prior.id.is_none() {
                warn!("{address}: no id in state, dropping it");
                self.forget(&address)?;
                summary.record(&Action::Delete);
                continue;
            }
            match self.refresh_one(handler.as_ref(), &address, &prior).await? {
                Some(_) => summary.record(&Action::Read),
                None => summary.record(&Action::Delete),
            }
        }
        info!("refresh complete: {summary}");
        Ok(summary)
    }

    /// Adopt an existing remote object into state.
    ///
    /// When the resource is also declared, its configuration is recorded
    /// alongside the remote attributes so the next apply plans against it.
    pub async fn import(
        &mut self,
        address: &Address,
        id: &str,
        config: Option<&Map<String, Value>>,
    ) -> Result<(), EngineError> {
        let handler = self.provider.handler(&address.type_name)?.clone();
        let schema = handler.schema();
        if !schema.importable {
            return Err(EngineError::NotImportable(address.type_name.clone()));
        }
        if self.state.get(address).is_some_and(|r| r.id.is_some()) {
            return Err(EngineError::AlreadyManaged(address.clone()));
        }

        let mut data = ResourceData::with_id(id);
        if let Some(config) = config {
            let config = reference::resolve(config, &self.state).map_err(|source| {
                EngineError::Reference {
                    address: address.clone(),
                    source,
                }
            })?;
            schema.validate_config(&config)?;
            data.merge_config(&config);
        }

        handler
            .read(self.provider.client(), &mut data)
            .await
            .map_err(resource_err(address))?;
        if data.id().is_none() {
            return Err(EngineError::ImportNotFound {
                address: address.clone(),
                id: id.to_owned(),
            });
        }

        self.store(address, data)?;
        info!("{address}: imported with id {id}");
        Ok(())
    }
}

fn resource_err(address: &Address) -> impl FnOnce(ResourceError) -> EngineError + '_ {
    move |source| EngineError::Resource {
        address: address.clone(),
        source,
    }
}

/// Optional fields dropped from the configuration must not linger from the
/// prior state.
fn clear_removed_optionals(
    schema: &ResourceSchema,
    config: &Map<String, Value>,
    data: &mut ResourceData,
) {
    for field in &schema.fields {
        if field.presence == Presence::Optional && !config.contains_key(field.name) {
            data.set(field.name, Value::Null);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
