// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Presigned-URL object store gateway
//!
//! Talks to the object plane of the remote API for one volume's backup
//! repository:
//!
//! - `POST /v1/volumes/{id}/objects/presign` `{method, key}` -> `{url}`
//! - `GET /v1/volumes/{id}/objects?prefix=` -> `[{key, size}]`
//! - `DELETE /v1/volumes/{id}/objects?key=`

use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::object_store::{ByteStream, ObjectEntry, ObjectStoreError, ObjectStoreGateway};
use crate::domain::volume::VolumeId;

#[derive(Debug, Serialize)]
struct PresignRequest<'a> {
    method: &'a str,
    key: &'a str,
}

#[derive(Debug, Deserialize)]
struct PresignResponse {
    url: String,
}

pub struct HttpObjectStoreGateway {
    client: Client,
    base_url: String,
    token: String,
    volume_id: VolumeId,
}

impl HttpObjectStoreGateway {
    pub fn new(client: Client, base_url: String, token: String, volume_id: VolumeId) -> Self {
        Self {
            client,
            base_url,
            token,
            volume_id,
        }
    }

    fn objects_url(&self, suffix: &str) -> String {
        format!("{}/v1/volumes/{}/objects{}", self.base_url, self.volume_id, suffix)
    }

    async fn presign(&self, method: &str, key: &str) -> Result<String, ObjectStoreError> {
        let response = self
            .client
            .post(self.objects_url("/presign"))
            .bearer_auth(&self.token)
            .json(&PresignRequest { method, key })
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(response.json::<PresignResponse>().await?.url),
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound(key.to_string())),
            status => Err(upstream(status, response).await),
        }
    }
}

async fn upstream(status: StatusCode, response: reqwest::Response) -> ObjectStoreError {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| format!("HTTP {}", status));
    ObjectStoreError::Upstream(format!("HTTP {}: {}", status, body))
}

#[async_trait]
impl ObjectStoreGateway for HttpObjectStoreGateway {
    async fn presign_get(&self, key: &str) -> Result<String, ObjectStoreError> {
        self.presign("GET", key).await
    }

    async fn presign_put(&self, key: &str) -> Result<String, ObjectStoreError> {
        self.presign("PUT", key).await
    }

    async fn put(
        &self,
        key: &str,
        content_length: u64,
        body: ByteStream,
    ) -> Result<(), ObjectStoreError> {
        let url = self.presign_put(key).await?;
        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, content_length)
            .body(Body::wrap_stream(body))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream(status, response).await);
        }
        debug!(key, content_length, "Uploaded object");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ObjectEntry>, ObjectStoreError> {
        let response = self
            .client
            .get(self.objects_url(""))
            .bearer_auth(&self.token)
            .query(&[("prefix", "")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream(status, response).await);
        }
        Ok(response.json().await?)
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let response = self
            .client
            .delete(self.objects_url(""))
            .bearer_auth(&self.token)
            .query(&[("key", key)])
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound(key.to_string())),
            status => Err(upstream(status, response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mockito::Matcher;

    fn gateway(server: &mockito::Server) -> HttpObjectStoreGateway {
        HttpObjectStoreGateway::new(
            Client::new(),
            server.url(),
            "tok".to_string(),
            VolumeId::new("v1").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_put_uploads_to_presigned_url() {
        let mut server = mockito::Server::new_async().await;
        let presigned = format!("{}/bucket/data/ab/abcd?sig=1", server.url());
        server
            .mock("POST", "/v1/volumes/v1/objects/presign")
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::Json(serde_json::json!({"method": "PUT", "key": "data/ab/abcd"})))
            .with_body(serde_json::json!({ "url": presigned }).to_string())
            .create_async()
            .await;
        let upload = server
            .mock("PUT", "/bucket/data/ab/abcd")
            .match_query(Matcher::UrlEncoded("sig".into(), "1".into()))
            .match_header("content-length", "5")
            .match_body("hello")
            .with_status(200)
            .create_async()
            .await;

        let body = futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"hel")),
            Ok(bytes::Bytes::from_static(b"lo")),
        ])
        .boxed();
        gateway(&server).put("data/ab/abcd", 5, body).await.unwrap();
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/volumes/v1/objects")
            .match_query(Matcher::Any)
            .with_body(r#"[{"key":"config","size":155},{"key":"keys/k1","size":460}]"#)
            .create_async()
            .await;
        server
            .mock("DELETE", "/v1/volumes/v1/objects")
            .match_query(Matcher::UrlEncoded("key".into(), "locks/l1".into()))
            .with_status(404)
            .create_async()
            .await;

        let gateway = gateway(&server);
        let entries = gateway.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].size, 460);
        assert!(matches!(
            gateway.delete("locks/l1").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }
}
