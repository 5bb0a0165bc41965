// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Volume Registry Client
//!
//! Consumes the remote volume API. All calls carry the node's bearer token
//! and return the volume's current record alongside lease state.
//!
//! # API Endpoints
//!
//! - `POST /v1/volumes/{id}/mounts` - Acquire a lease
//! - `POST /v1/mounts/{mount}/refresh` - Extend a lease
//! - `POST /v1/mounts/{mount}/release` - Hand a lease back
//! - `POST /v1/mounts/{mount}/snapshots` - Record a completed backup
//! - `POST /v1/volumes/{id}/force-release` - Drop whatever lease is held
//! - `POST /v1/volumes/{id}/force-unlock` - Clear stale backup repository locks
//! - `GET /v1/volumes/{id}/snapshots/{snap}` - Snapshot metadata
//! - `GET /v1/volumes/{id}` - Volume record

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::registry::{MountGrant, RegistryError, SnapshotRecord, VolumeRegistry};
use crate::domain::volume::{MountId, SnapshotId, VolumeId, VolumeRecord};

#[derive(Debug, Serialize)]
struct MountRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    box_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RecordSnapshotRequest<'a> {
    snapshot_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ConflictBody {
    #[serde(default)]
    mount_id: Option<String>,
    #[serde(default)]
    lease_expires_at: Option<DateTime<Utc>>,
}

/// What a 404 means for the call being made
enum Missing<'a> {
    Lease(&'a MountId),
    Resource(String),
}

pub struct HttpVolumeRegistry {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpVolumeRegistry {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Shares the HTTP client and credentials with an object-store gateway
    pub fn client_parts(&self) -> (Client, String, String) {
        (self.client.clone(), self.base_url.clone(), self.token.clone())
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        missing: Missing<'_>,
        volume: Option<&VolumeId>,
    ) -> Result<T, RegistryError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let response = check_status(response, missing, volume).await?;
        Ok(response.json::<T>().await?)
    }
}

async fn check_status(
    response: Response,
    missing: Missing<'_>,
    volume: Option<&VolumeId>,
) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(%status, body = %body, "Registry call failed");

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Unauthorized(
            if body.is_empty() { status.to_string() } else { body },
        )),
        StatusCode::CONFLICT => {
            let parsed: ConflictBody = serde_json::from_str(&body).unwrap_or_default();
            match volume {
                Some(volume) => Err(RegistryError::Conflict {
                    volume: volume.clone(),
                    holder: parsed.mount_id.unwrap_or_else(|| "unknown".to_string()),
                    expires_at: parsed.lease_expires_at,
                }),
                None => Err(RegistryError::Protocol(format!("unexpected conflict: {}", body))),
            }
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => match missing {
            Missing::Lease(mount) => Err(RegistryError::UnknownLease(mount.clone())),
            Missing::Resource(what) => Err(RegistryError::NotFound(what)),
        },
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Err(RegistryError::Transport(format!("HTTP {}: {}", s, body)))
        }
        s => Err(RegistryError::Protocol(format!("HTTP {}: {}", s, body))),
    }
}

#[async_trait]
impl VolumeRegistry for HttpVolumeRegistry {
    async fn mount(
        &self,
        volume: &VolumeId,
        box_id: Option<&str>,
    ) -> Result<MountGrant, RegistryError> {
        let url = self.build_url(&format!("/v1/volumes/{}/mounts", volume));
        self.send(
            self.client.post(url).json(&MountRequest { box_id }),
            Missing::Resource(format!("volume {}", volume)),
            Some(volume),
        )
        .await
    }

    async fn refresh_mount(&self, mount: &MountId) -> Result<VolumeRecord, RegistryError> {
        let url = self.build_url(&format!("/v1/mounts/{}/refresh", mount));
        self.send(self.client.post(url), Missing::Lease(mount), None).await
    }

    async fn release_mount(&self, mount: &MountId) -> Result<VolumeRecord, RegistryError> {
        let url = self.build_url(&format!("/v1/mounts/{}/release", mount));
        self.send(self.client.post(url), Missing::Lease(mount), None).await
    }

    async fn record_snapshot(
        &self,
        mount: &MountId,
        snapshot: &SnapshotId,
    ) -> Result<VolumeRecord, RegistryError> {
        let url = self.build_url(&format!("/v1/mounts/{}/snapshots", mount));
        self.send(
            self.client.post(url).json(&RecordSnapshotRequest {
                snapshot_id: snapshot.as_str(),
            }),
            Missing::Lease(mount),
            None,
        )
        .await
    }

    async fn force_release_mount(&self, volume: &VolumeId) -> Result<VolumeRecord, RegistryError> {
        let url = self.build_url(&format!("/v1/volumes/{}/force-release", volume));
        self.send(
            self.client.post(url),
            Missing::Resource(format!("volume {}", volume)),
            Some(volume),
        )
        .await
    }

    async fn force_unlock(&self, volume: &VolumeId) -> Result<(), RegistryError> {
        let url = self.build_url(&format!("/v1/volumes/{}/force-unlock", volume));
        let response = self.client.post(url).bearer_auth(&self.token).send().await?;
        check_status(response, Missing::Resource(format!("volume {}", volume)), Some(volume))
            .await?;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        volume: &VolumeId,
        snapshot: &SnapshotId,
    ) -> Result<SnapshotRecord, RegistryError> {
        let url = self.build_url(&format!("/v1/volumes/{}/snapshots/{}", volume, snapshot));
        self.send(
            self.client.get(url),
            Missing::Resource(format!("snapshot {} of volume {}", snapshot, volume)),
            None,
        )
        .await
    }

    async fn get_volume(&self, volume: &VolumeId) -> Result<VolumeRecord, RegistryError> {
        let url = self.build_url(&format!("/v1/volumes/{}", volume));
        self.send(
            self.client.get(url),
            Missing::Resource(format!("volume {}", volume)),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const VOLUME_JSON: &str = r#"{
        "id": "v1",
        "uuid": "123e4567-e89b-12d3-a456-426614174000",
        "size_bytes": 1073741824,
        "fs_type": "ext4",
        "backup_password": "pw",
        "mount_id": "m-1",
        "lease_expires_at": "2026-01-01T00:00:30Z",
        "latest_snapshot_id": null
    }"#;

    fn registry(server: &mockito::Server) -> HttpVolumeRegistry {
        HttpVolumeRegistry::new(server.url(), "tok", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_mount_sends_bearer_and_box() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/volumes/v1/mounts")
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::Json(serde_json::json!({"box_id": "box-9"})))
            .with_status(201)
            .with_body(format!(r#"{{"mount_id":"m-1","volume":{}}}"#, VOLUME_JSON))
            .create_async()
            .await;

        let grant = registry(&server)
            .mount(&VolumeId::new("v1").unwrap(), Some("box-9"))
            .await
            .unwrap();
        assert_eq!(grant.mount_id.as_str(), "m-1");
        assert_eq!(grant.volume.size_bytes, 1 << 30);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_mount_conflict() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/volumes/v1/mounts")
            .with_status(409)
            .with_body(r#"{"mount_id":"m-other","lease_expires_at":"2026-01-01T00:00:30Z"}"#)
            .create_async()
            .await;

        let err = registry(&server)
            .mount(&VolumeId::new("v1").unwrap(), None)
            .await
            .unwrap_err();
        match err {
            RegistryError::Conflict { holder, expires_at, .. } => {
                assert_eq!(holder, "m-other");
                assert!(expires_at.is_some());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_of_expired_lease_is_unknown() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/mounts/m-1/refresh")
            .with_status(410)
            .create_async()
            .await;

        let err = registry(&server)
            .refresh_mount(&MountId("m-1".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownLease(m) if m.as_str() == "m-1"));
    }

    #[tokio::test]
    async fn test_record_snapshot_and_auth_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/mounts/m-1/snapshots")
            .match_body(Matcher::Json(serde_json::json!({"snapshot_id": "s-1"})))
            .with_status(200)
            .with_body(VOLUME_JSON)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/volumes/v1")
            .with_status(403)
            .create_async()
            .await;

        let registry = registry(&server);
        registry
            .record_snapshot(&MountId("m-1".to_string()), &SnapshotId("s-1".to_string()))
            .await
            .unwrap();
        let err = registry.get_volume(&VolumeId::new("v1").unwrap()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/volumes/v1/force-unlock")
            .with_status(503)
            .create_async()
            .await;
        let err = registry(&server)
            .force_unlock(&VolumeId::new("v1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
