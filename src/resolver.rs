//! Model resolution: caller-supplied identifier to one concrete [`ModelDescriptor`].
//!
//! Lookup order is the internal catalog (by id, then slug), then the caller's own external
//! catalog (by id, then model name). The first hit wins. Internal hits are cached; external
//! models are always read fresh so owner edits apply immediately.

use crate::catalog::{Capability, InternalModel, ModelDescriptor};
use crate::store::{ModelCatalog, StoreError};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("model '{0}' not found")]
    NotFound(String),
    #[error("model '{model}' does not support {capability}")]
    CapabilityMismatch { model: String, capability: Capability },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct ModelResolver {
    catalog: Arc<dyn ModelCatalog>,
    internal_cache: Cache<String, Arc<InternalModel>>,
}

impl ModelResolver {
    pub fn new(catalog: Arc<dyn ModelCatalog>, cache_ttl: Duration) -> Self {
        let internal_cache = Cache::builder()
            .time_to_live(cache_ttl)
            .max_capacity(10_000)
            .build();
        Self {
            catalog,
            internal_cache,
        }
    }

    /// Resolve `model` for `caller_id` and check it supports `capability`.
    ///
    /// `byom_enabled` gates the external catalog: without it only internal models resolve.
    pub async fn resolve(
        &self,
        model: &str,
        caller_id: &str,
        byom_enabled: bool,
        capability: Capability,
    ) -> Result<ModelDescriptor, ResolveError> {
        let descriptor = self
            .lookup(model, caller_id, byom_enabled)
            .await?
            .ok_or_else(|| ResolveError::NotFound(model.to_string()))?;

        if !descriptor.supports(capability) {
            return Err(ResolveError::CapabilityMismatch {
                model: model.to_string(),
                capability,
            });
        }
        Ok(descriptor)
    }

    async fn lookup(
        &self,
        model: &str,
        caller_id: &str,
        byom_enabled: bool,
    ) -> Result<Option<ModelDescriptor>, StoreError> {
        if let Some(hit) = self.internal_cache.get(model).await {
            return Ok(Some(ModelDescriptor::Internal((*hit).clone())));
        }

        if let Some(internal) = self.catalog.find_internal_model(model).await? {
            self.internal_cache
                .insert(model.to_string(), Arc::new(internal.clone()))
                .await;
            return Ok(Some(ModelDescriptor::Internal(internal)));
        }

        if !byom_enabled {
            return Ok(None);
        }

        Ok(self
            .catalog
            .find_external_model(model, caller_id)
            .await?
            .map(ModelDescriptor::External))
    }

    /// Drop all cached internal entries, e.g. after an admin catalog edit.
    pub fn invalidate(&self) {
        self.internal_cache.invalidate_all();
    }
}
