// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory object store gateway
//!
//! Presigned URLs point at `base_url` and are not served; uploads are kept
//! in memory. Counts listing calls so cache behaviour can be asserted.

use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::domain::object_store::{ByteStream, ObjectEntry, ObjectStoreError, ObjectStoreGateway};

#[derive(Clone)]
pub struct InMemoryObjectStoreGateway {
    base_url: String,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    list_calls: Arc<AtomicUsize>,
}

impl InMemoryObjectStoreGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            list_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn insert(&self, key: &str, content: impl Into<Vec<u8>>) {
        self.objects.lock().insert(key.to_string(), content.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn url(&self, method: &str, key: &str) -> String {
        format!("{}/{}?method={}", self.base_url, key, method)
    }
}

#[async_trait]
impl ObjectStoreGateway for InMemoryObjectStoreGateway {
    async fn presign_get(&self, key: &str) -> Result<String, ObjectStoreError> {
        if !self.objects.lock().contains_key(key) {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        Ok(self.url("GET", key))
    }

    async fn presign_put(&self, key: &str) -> Result<String, ObjectStoreError> {
        Ok(self.url("PUT", key))
    }

    async fn put(
        &self,
        key: &str,
        content_length: u64,
        body: ByteStream,
    ) -> Result<(), ObjectStoreError> {
        let chunks: Vec<bytes::Bytes> = body
            .try_collect()
            .await
            .map_err(|e| ObjectStoreError::Upstream(e.to_string()))?;
        let content = chunks.concat();
        if content.len() as u64 != content_length {
            return Err(ObjectStoreError::Upstream(format!(
                "short upload: expected {} bytes, got {}",
                content_length,
                content.len()
            )));
        }
        self.objects.lock().insert(key.to_string(), content);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ObjectEntry>, ObjectStoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .lock()
            .iter()
            .map(|(key, content)| ObjectEntry {
                key: key.clone(),
                size: content.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        match self.objects.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(ObjectStoreError::NotFound(key.to_string())),
        }
    }
}
