//! Dispatch, routing and server-level endpoints over real HTTP.

use reqwest::StatusCode;
use serde_json::json;

mod common;

#[tokio::test]
async fn test_welcome() {
    let listener = common::start_listener(common::config_with(&[])).await;

    let response = listener.client.get(listener.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers()["server"]
        .to_str()
        .unwrap()
        .starts_with("CouchLite/"));
    assert_eq!(response.headers()["content-type"], "application/json");
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["couchdb"], "Welcome");
    assert!(body["version"].is_string());

    listener.stop().await;
}

#[tokio::test]
async fn test_not_found_vs_method_not_allowed() {
    let listener = common::start_listener(common::config_with(&["db"])).await;

    let (status, body) = listener.get_json("/_nothing_here").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");

    // `/_all_dbs` exists for GET only.
    let response = listener
        .client
        .delete(listener.url("/_all_dbs"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    // No table at all for PATCH.
    let response = listener
        .client
        .patch(listener.url("/db"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    listener.stop().await;
}

#[tokio::test]
async fn test_database_lifecycle() {
    let listener = common::start_listener(common::config_with(&[])).await;

    let response = listener.client.put(listener.url("/notes")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["location"], "/notes");

    let response = listener.client.put(listener.url("/notes")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    let (status, dbs) = listener.get_json("/_all_dbs").await;
    assert_eq!(status, 200);
    assert_eq!(dbs, json!(["notes"]));

    let (status, info) = listener.get_json("/notes").await;
    assert_eq!(status, 200);
    assert_eq!(info["db_name"], "notes");

    let response = listener
        .client
        .delete(listener.url("/notes?rev=1-abc"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = listener.client.delete(listener.url("/notes")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (status, _) = listener.get_json("/notes").await;
    assert_eq!(status, 404);

    listener.stop().await;
}

#[tokio::test]
async fn test_uuids() {
    let listener = common::start_listener(common::config_with(&[])).await;

    let (status, body) = listener.get_json("/_uuids?count=3").await;
    assert_eq!(status, 200);
    let uuids = body["uuids"].as_array().unwrap();
    assert_eq!(uuids.len(), 3);
    assert_ne!(uuids[0], uuids[1]);

    let (status, _) = listener.get_json("/_uuids?count=5000").await;
    assert_eq!(status, 403);

    listener.stop().await;
}

#[tokio::test]
async fn test_not_acceptable() {
    let listener = common::start_listener(common::config_with(&[])).await;

    let response = listener
        .client
        .get(listener.url("/"))
        .header("accept", "image/png")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

    let response = listener
        .client
        .get(listener.url("/"))
        .header("accept", "text/plain")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    listener.stop().await;
}

#[tokio::test]
async fn test_read_only_listener() {
    let mut config = common::config_with(&["db"]);
    config.access.read_only = true;
    let listener = common::start_listener(config).await;

    let (status, body) = listener.put_json("/db/doc", json!({"a": 1})).await;
    assert_eq!(status, 403);
    assert_eq!(body["error"], "forbidden");

    let (status, _) = listener.post_json("/db/_revs_diff", json!({})).await;
    assert_eq!(status, 200);

    let (status, _) = listener.get_json("/db").await;
    assert_eq!(status, 200);

    listener.stop().await;
}

#[tokio::test]
async fn test_bad_json_body() {
    let listener = common::start_listener(common::config_with(&["db"])).await;

    let response = listener
        .client
        .put(listener.url("/db/doc"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    listener.stop().await;
}
