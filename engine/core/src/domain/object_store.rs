// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Object store gateway and the backup repository's object layout
//!
//! Nodes never hold object-store credentials. Every read or write goes
//! through short-lived presigned URLs handed out by the remote API, and
//! deletes and listings are performed by the API on the node's behalf.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request body handed from the proxy to the gateway without buffering
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Object types of the backup repository layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Config,
    Data,
    Keys,
    Locks,
    Snapshots,
    Index,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 6] = [
        ObjectKind::Config,
        ObjectKind::Data,
        ObjectKind::Keys,
        ObjectKind::Locks,
        ObjectKind::Snapshots,
        ObjectKind::Index,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Data => "data",
            Self::Keys => "keys",
            Self::Locks => "locks",
            Self::Snapshots => "snapshots",
            Self::Index => "index",
        }
    }

    /// Key prefix under which objects of this kind are stored
    pub fn prefix(&self) -> String {
        match self {
            Self::Config => "config".to_string(),
            other => format!("{}/", other.as_str()),
        }
    }

    /// Object key for `name`. `data` objects are sharded by the first two
    /// characters of their name.
    pub fn key(&self, name: &str) -> Result<String, ObjectStoreError> {
        match self {
            Self::Config => Ok("config".to_string()),
            Self::Data => {
                validate_name(name)?;
                if name.len() < 2 {
                    return Err(ObjectStoreError::InvalidName(name.to_string()));
                }
                Ok(format!("data/{}/{}", &name[..2], name))
            }
            other => {
                validate_name(name)?;
                Ok(format!("{}/{}", other.as_str(), name))
            }
        }
    }

    /// Recover the object name from a key under this kind's prefix
    pub fn name_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        match self {
            Self::Config => (key == "config").then_some("config"),
            other => {
                let rest = key.strip_prefix(other.as_str())?.strip_prefix('/')?;
                let name = rest.rsplit('/').next()?;
                (!name.is_empty()).then_some(name)
            }
        }
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = ObjectStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ObjectStoreError::UnknownKind(s.to_string()))
    }
}

/// Object names are content hashes or similar tokens; refuse anything that
/// could escape the key layout.
fn validate_name(name: &str) -> Result<(), ObjectStoreError> {
    if name.is_empty()
        || name.len() > 128
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ObjectStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStoreGateway: Send + Sync {
    /// Time-limited URL for reading `key`
    async fn presign_get(&self, key: &str) -> Result<String, ObjectStoreError>;

    /// Time-limited URL for writing `key`
    async fn presign_put(&self, key: &str) -> Result<String, ObjectStoreError>;

    /// Stream `content_length` bytes to `key` through a presigned PUT
    async fn put(
        &self,
        key: &str,
        content_length: u64,
        body: ByteStream,
    ) -> Result<(), ObjectStoreError>;

    /// Every object under the repository root
    async fn list(&self) -> Result<Vec<ObjectEntry>, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Unknown object type: {0}")]
    UnknownKind(String),

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Content-Length is required for uploads")]
    LengthRequired,

    #[error("Object store upstream error: {0}")]
    Upstream(String),
}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(err: reqwest::Error) -> Self {
        ObjectStoreError::Upstream(err.to_string())
    }
}
