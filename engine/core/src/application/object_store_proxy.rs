// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Object-Store Proxy Application Service
//!
//! Answers the backup tool's repository requests for one volume without
//! holding object-store credentials: reads resolve to presigned GET URLs,
//! uploads stream through presigned PUTs, listings and deletes go through
//! the remote API.
//!
//! The bucket listing is cached per proxy instance and invalidated on every
//! successful write or delete. A listing fetched while a write was in
//! flight is discarded instead of installed.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::domain::object_store::{
    ByteStream, ObjectEntry, ObjectKind, ObjectStoreError, ObjectStoreGateway,
};

// ============================================================================
// Listing Cache
// ============================================================================

#[derive(Default)]
struct CacheState {
    generation: u64,
    entries: Option<Arc<Vec<ObjectEntry>>>,
}

/// Generation-counted listing cache
#[derive(Default)]
pub struct ListingCache {
    state: Mutex<CacheState>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entries and the generation a fresh fetch must be tagged with
    fn lookup(&self) -> (u64, Option<Arc<Vec<ObjectEntry>>>) {
        let state = self.state.lock();
        (state.generation, state.entries.clone())
    }

    /// Install a listing fetched at `generation`; refused if the cache was
    /// invalidated since
    fn install(&self, generation: u64, entries: Arc<Vec<ObjectEntry>>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.entries = Some(entries);
        true
    }

    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.entries = None;
    }

    pub fn is_populated(&self) -> bool {
        self.state.lock().entries.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

// ============================================================================
// Proxy Service
// ============================================================================

/// One entry of a type listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedObject {
    pub name: String,
    pub size: u64,
}

pub struct ObjectStoreProxy {
    gateway: Arc<dyn ObjectStoreGateway>,
    cache: ListingCache,
}

impl ObjectStoreProxy {
    pub fn new(gateway: Arc<dyn ObjectStoreGateway>) -> Self {
        Self {
            gateway,
            cache: ListingCache::new(),
        }
    }

    pub fn cache(&self) -> &ListingCache {
        &self.cache
    }

    async fn listing(&self) -> Result<Arc<Vec<ObjectEntry>>, ObjectStoreError> {
        let (generation, cached) = self.cache.lookup();
        if let Some(entries) = cached {
            return Ok(entries);
        }
        let entries = Arc::new(self.gateway.list().await?);
        if !self.cache.install(generation, entries.clone()) {
            debug!("Listing raced a write, not caching it");
        }
        Ok(entries)
    }

    /// Objects of one type, by name
    pub async fn list(&self, kind: ObjectKind) -> Result<Vec<ListedObject>, ObjectStoreError> {
        let listing = self.listing().await?;
        Ok(listing
            .iter()
            .filter_map(|entry| {
                kind.name_from_key(&entry.key).map(|name| ListedObject {
                    name: name.to_string(),
                    size: entry.size,
                })
            })
            .collect())
    }

    /// Size of an object, answered from the listing
    pub async fn head(&self, kind: ObjectKind, name: &str) -> Result<u64, ObjectStoreError> {
        let key = kind.key(name)?;
        self.listing()
            .await?
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.size)
            .ok_or(ObjectStoreError::NotFound(key))
    }

    /// Presigned URL the client is redirected to for reading
    pub async fn read_url(&self, kind: ObjectKind, name: &str) -> Result<String, ObjectStoreError> {
        let key = kind.key(name)?;
        self.gateway.presign_get(&key).await
    }

    pub async fn upload(
        &self,
        kind: ObjectKind,
        name: &str,
        content_length: Option<u64>,
        body: ByteStream,
    ) -> Result<(), ObjectStoreError> {
        let key = kind.key(name)?;
        let length = content_length.ok_or(ObjectStoreError::LengthRequired)?;
        let result = self.gateway.put(&key, length, body).await;
        // a failed upload may still have landed partially upstream
        self.cache.invalidate();
        result?;
        debug!(key = %key, bytes = length, "Object uploaded");
        Ok(())
    }

    pub async fn delete(&self, kind: ObjectKind, name: &str) -> Result<(), ObjectStoreError> {
        let key = kind.key(name)?;
        self.gateway.delete(&key).await?;
        self.cache.invalidate();
        debug!(key = %key, "Object deleted");
        Ok(())
    }
}
