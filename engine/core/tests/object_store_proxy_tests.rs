// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Object-store proxy HTTP behaviour: restic REST layout, presigned
//! redirects, streamed uploads and listing cache invalidation.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use boxvol_core::application::ObjectStoreProxy;
use boxvol_core::domain::volume::VolumeId;
use boxvol_core::infrastructure::object_store::{HttpObjectStoreGateway, InMemoryObjectStoreGateway};
use boxvol_core::presentation::proxy_api::{app, REST_V2_MEDIA_TYPE};

const HASH: &str = "3f2a9c0d1e4b5a6978877665544332211ffeeddccbbaa00998877665544332211";

fn router(gateway: &InMemoryObjectStoreGateway) -> axum::Router {
    app(Arc::new(ObjectStoreProxy::new(Arc::new(gateway.clone()))))
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_data_objects_are_sharded() {
    let gateway = InMemoryObjectStoreGateway::new("https://bucket.example");
    let app = router(&gateway);

    let response = app
        .oneshot(
            Request::post(format!("/data/{}", HASH))
                .header(header::CONTENT_LENGTH, "5")
                .body(Body::from("chunk"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        gateway.object(&format!("data/3f/{}", HASH)),
        Some(b"chunk".to_vec())
    );
}

#[tokio::test]
async fn test_upload_without_length_is_refused() {
    let gateway = InMemoryObjectStoreGateway::new("https://bucket.example");
    let response = router(&gateway)
        .oneshot(
            Request::post("/keys/k1")
                .body(Body::from("secret"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
    assert_eq!(gateway.object("keys/k1"), None);
}

#[tokio::test]
async fn test_listing_formats() {
    let gateway = InMemoryObjectStoreGateway::new("https://bucket.example");
    gateway.insert("snapshots/s1", b"abc".to_vec());
    gateway.insert("snapshots/s2", b"abcdef".to_vec());
    gateway.insert("index/i1", b"x".to_vec());
    let app = router(&gateway);

    let v1 = app
        .clone()
        .oneshot(Request::get("/snapshots/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(v1.status(), StatusCode::OK);
    let names: Vec<String> = serde_json::from_slice(&body_bytes(v1).await).unwrap();
    assert_eq!(names, vec!["s1", "s2"]);

    let v2 = app
        .oneshot(
            Request::get("/snapshots/")
                .header(header::ACCEPT, REST_V2_MEDIA_TYPE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(v2.headers()[header::CONTENT_TYPE], REST_V2_MEDIA_TYPE);
    let entries: serde_json::Value = serde_json::from_slice(&body_bytes(v2).await).unwrap();
    assert_eq!(
        entries,
        serde_json::json!([{"name": "s1", "size": 3}, {"name": "s2", "size": 6}])
    );
    // both requests were answered from one upstream listing
    assert_eq!(gateway.list_calls(), 1);
}

#[tokio::test]
async fn test_head_uses_cache_and_sees_own_writes() {
    let gateway = InMemoryObjectStoreGateway::new("https://bucket.example");
    gateway.insert("locks/l1", b"lock".to_vec());
    let app = router(&gateway);

    let head = |path: &str| Request::head(path.to_string()).body(Body::empty()).unwrap();

    let response = app.clone().oneshot(head("/locks/l1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");

    let response = app.clone().oneshot(head("/locks/l2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(gateway.list_calls(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::post("/locks/l2")
                .header(header::CONTENT_LENGTH, "2")
                .body(Body::from("ok"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(head("/locks/l2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gateway.list_calls(), 2);

    let response = app
        .clone()
        .oneshot(Request::delete("/locks/l2").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(head("/locks/l2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(gateway.list_calls(), 3);
}

#[tokio::test]
async fn test_config_round_trip() {
    let gateway = InMemoryObjectStoreGateway::new("https://bucket.example");
    let app = router(&gateway);

    let response = app
        .clone()
        .oneshot(Request::head("/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(
            Request::post("/config")
                .header(header::CONTENT_LENGTH, "3")
                .body(Body::from("cfg"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gateway.object("config"), Some(b"cfg".to_vec()));

    let response = app
        .oneshot(Request::get("/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
}

#[tokio::test]
async fn test_http_gateway_behind_proxy() {
    let mut server = mockito::Server::new_async().await;
    let listing = server
        .mock("GET", "/v1/volumes/v1/objects")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"key":"keys/k1","size":42}]"#)
        .expect(1)
        .create_async()
        .await;

    let gateway = HttpObjectStoreGateway::new(
        reqwest::Client::new(),
        server.url(),
        "token".to_string(),
        VolumeId::new("v1").unwrap(),
    );
    let app = app(Arc::new(ObjectStoreProxy::new(Arc::new(gateway))));

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(Request::head("/keys/k1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "42");
    }
    listing.assert_async().await;
}
