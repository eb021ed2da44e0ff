//! Resource handler trait and the provider registry.
//!
//! Every resource type is served by exactly one [`ResourceHandler`]. The
//! provider owns the Vault client and the handler registry; the engine looks
//! handlers up by type name and drives their lifecycle operations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use vaultform_core::schema::ResourceSchema;
use vaultform_core::state::{ResourceData, StateError};

use crate::client::{VaultApiError, VaultClient};
use crate::resources;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by handler operations.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// Remote call failed; `context` says what the handler was doing.
    #[error("{context}: {source}")]
    Api {
        context: &'static str,
        #[source]
        source: VaultApiError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{0}")]
    Invalid(String),

    #[error("can't unseal vault, need: {needed} keys but only have {have}")]
    InsufficientKeys { needed: i64, have: usize },

    #[error(
        "error unsealing vault threshold: {threshold}, number of shares: {shares}, progress: {progress}"
    )]
    StillSealed {
        threshold: i64,
        shares: i64,
        progress: i64,
    },
}

impl ResourceError {
    /// Wrap a client error with a short description of the failed step.
    pub fn api(context: &'static str) -> impl FnOnce(VaultApiError) -> Self {
        move |source| Self::Api { context, source }
    }
}

/// Error returned by [`Provider`] registry methods.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("resource type already registered: {0}")]
    AlreadyRegistered(String),

    #[error("unknown resource type: {0}")]
    UnknownType(String),
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Boxed future returned by handler operations.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ResourceError>> + Send + 'a>>;

/// Lifecycle operations for one resource type.
///
/// Operations read configuration from `data` and write computed attributes
/// back into it. `create` must set an id; `read` clears the id when the
/// remote object no longer exists; `delete` clears the id when done.
pub trait ResourceHandler: Send + Sync + fmt::Debug {
    fn schema(&self) -> &ResourceSchema;

    fn create<'a>(&'a self, client: &'a VaultClient, data: &'a mut ResourceData)
    -> HandlerFuture<'a>;

    fn read<'a>(&'a self, client: &'a VaultClient, data: &'a mut ResourceData) -> HandlerFuture<'a>;

    fn update<'a>(
        &'a self,
        client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        self.create(client, data)
    }

    fn delete<'a>(
        &'a self,
        _client: &'a VaultClient,
        data: &'a mut ResourceData,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            data.clear_id();
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Vault client plus the registry of resource handlers.
pub struct Provider {
    client: VaultClient,
    handlers: HashMap<&'static str, Arc<dyn ResourceHandler>>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("Provider")
            .field("address", &self.client.base_url())
            .field("types", &types)
            .finish()
    }
}

impl Provider {
    /// Provider with no handlers registered.
    pub fn empty(client: VaultClient) -> Self {
        Self {
            client,
            handlers: HashMap::new(),
        }
    }

    /// Provider with every built-in resource type registered.
    pub fn new(client: VaultClient) -> Self {
        let mut provider = Self::empty(client);
        for handler in resources::builtin() {
            // Built-in type names are distinct.
            let _ = provider.register(handler);
        }
        provider
    }

    pub fn register(&mut self, handler: Arc<dyn ResourceHandler>) -> Result<(), RegistryError> {
        let type_name = handler.schema().type_name;
        if self.handlers.contains_key(type_name) {
            return Err(RegistryError::AlreadyRegistered(type_name.to_owned()));
        }
        self.handlers.insert(type_name, handler);
        Ok(())
    }

    pub fn handler(&self, type_name: &str) -> Result<&Arc<dyn ResourceHandler>, RegistryError> {
        self.handlers
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_owned()))
    }

    pub fn client(&self) -> &VaultClient {
        &self.client
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
