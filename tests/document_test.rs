//! Documents, local documents and attachments over real HTTP.

use reqwest::StatusCode;
use serde_json::{json, Value};

mod common;

#[tokio::test]
async fn test_document_revisions_and_etag() {
    let listener = common::start_listener(common::config_with(&["db"])).await;

    let (status, created) = listener.put_json("/db/doc1", json!({"title": "one"})).await;
    assert_eq!(status, 201);
    assert_eq!(created["ok"], true);
    let rev1 = created["rev"].as_str().unwrap().to_string();
    assert!(rev1.starts_with("1-"));

    let response = listener.client.get(listener.url("/db/doc1")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers()["etag"].to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{}\"", rev1));
    let doc: Value = response.json().await.unwrap();
    assert_eq!(doc["_id"], "doc1");
    assert_eq!(doc["title"], "one");

    let response = listener
        .client
        .get(listener.url("/db/doc1"))
        .header("if-none-match", etag)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    // Stale revision.
    let (status, _) = listener.put_json("/db/doc1", json!({"title": "x"})).await;
    assert_eq!(status, 409);

    let (status, updated) = listener
        .put_json("/db/doc1", json!({"_rev": rev1, "title": "two"}))
        .await;
    assert_eq!(status, 201);
    let rev2 = updated["rev"].as_str().unwrap().to_string();

    let (_, doc) = listener.get_json("/db/doc1?revs=true").await;
    assert_eq!(doc["title"], "two");
    assert_eq!(doc["_revisions"]["start"], 2);
    assert_eq!(doc["_revisions"]["ids"].as_array().unwrap().len(), 2);

    let response = listener
        .client
        .delete(listener.url("/db/doc1"))
        .header("if-match", format!("\"{}\"", rev2))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = listener.get_json("/db/doc1").await;
    assert_eq!(status, 404);
    assert_eq!(body["reason"], "deleted");

    listener.stop().await;
}

#[tokio::test]
async fn test_open_revs() {
    let listener = common::start_listener(common::config_with(&["db"])).await;
    let (_, created) = listener.put_json("/db/doc", json!({"n": 1})).await;
    let rev = created["rev"].as_str().unwrap().to_string();

    let (status, body) = listener.get_json("/db/doc?open_revs=all").await;
    assert_eq!(status, 200);
    assert_eq!(body[0]["ok"]["_rev"], rev.as_str());

    let wanted = format!("[\"{}\",\"9-zzz\"]", rev);
    let url = format!("/db/doc?open_revs={}", urlencode(&wanted));
    let (status, body) = listener.get_json(&url).await;
    assert_eq!(status, 200);
    assert_eq!(body[0]["ok"]["n"], 1);
    assert_eq!(body[1]["missing"], "9-zzz");

    listener.stop().await;
}

#[tokio::test]
async fn test_design_and_local_documents() {
    let listener = common::start_listener(common::config_with(&["db"])).await;

    let (status, body) = listener
        .put_json("/db/_design/app", json!({"language": "javascript"}))
        .await;
    assert_eq!(status, 201);
    assert_eq!(body["id"], "_design/app");
    let (status, doc) = listener.get_json("/db/_design/app").await;
    assert_eq!(status, 200);
    assert_eq!(doc["_id"], "_design/app");

    let (status, body) = listener
        .put_json("/db/_local/checkpoint", json!({"seq": 4}))
        .await;
    assert_eq!(status, 201);
    assert_eq!(body["id"], "_local/checkpoint");
    let (status, doc) = listener.get_json("/db/_local/checkpoint").await;
    assert_eq!(status, 200);
    assert_eq!(doc["seq"], 4);

    // Local docs stay out of the changes feed.
    let (_, changes) = listener.get_json("/db/_changes").await;
    let ids: Vec<&str> = changes["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["_design/app"]);

    listener.stop().await;
}

#[tokio::test]
async fn test_attachment_upload_and_download() {
    let listener = common::start_listener(common::config_with(&["db"])).await;

    let response = listener
        .client
        .put(listener.url("/db/doc/notes/hello.txt"))
        .header("content-type", "text/plain")
        .body("hello world")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    let rev = body["rev"].as_str().unwrap().to_string();

    let response = listener
        .client
        .get(listener.url("/db/doc/notes/hello.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert_eq!(response.headers()["etag"], format!("\"{}\"", rev).as_str());
    assert_eq!(response.text().await.unwrap(), "hello world");

    let response = listener
        .client
        .get(listener.url("/db/doc/notes/hello.txt"))
        .header("range", "bytes=0-4")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-range"], "bytes 0-4/11");
    assert_eq!(response.text().await.unwrap(), "hello");

    let response = listener
        .client
        .get(listener.url("/db/doc/notes/hello.txt"))
        .header("range", "bytes=50-60")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = listener
        .client
        .head(listener.url("/db/doc/notes/hello.txt"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "11");

    let (_, doc) = listener.get_json("/db/doc").await;
    assert_eq!(doc["_attachments"]["notes/hello.txt"]["stub"], true);
    assert_eq!(doc["_attachments"]["notes/hello.txt"]["length"], 11);

    let response = listener
        .client
        .delete(listener.url(&format!("/db/doc/notes/hello.txt?rev={}", rev)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (status, _) = listener.get_json("/db/doc/notes/hello.txt").await;
    assert_eq!(status, 404);

    listener.stop().await;
}

#[tokio::test]
async fn test_empty_attachment_is_rejected() {
    let listener = common::start_listener(common::config_with(&["db"])).await;

    let response = listener
        .client
        .put(listener.url("/db/doc/empty.bin"))
        .body(Vec::<u8>::new())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "bad_attachment");

    listener.stop().await;
}

#[tokio::test]
async fn test_attachments_multipart_or_inline() {
    let listener = common::start_listener(common::config_with(&["db"])).await;
    let response = listener
        .client
        .put(listener.url("/db/doc/a.txt"))
        .header("content-type", "text/plain")
        .body("abc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = listener
        .client
        .get(listener.url("/db/doc?attachments=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("multipart/related; boundary="));
    let text = response.text().await.unwrap();
    assert!(text.contains("\"follows\":true"));
    assert!(text.contains("abc"));

    let response = listener
        .client
        .get(listener.url("/db/doc?attachments=true"))
        .header("accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["content-type"], "application/json");
    let doc: Value = response.json().await.unwrap();
    assert_eq!(doc["_attachments"]["a.txt"]["data"], "YWJj");

    listener.stop().await;
}

#[tokio::test]
async fn test_bulk_docs_and_all_docs() {
    let listener = common::start_listener(common::config_with(&["db"])).await;

    let (status, results) = listener
        .post_json(
            "/db/_bulk_docs",
            json!({"docs": [{"_id": "b", "v": 2}, {"_id": "a", "v": 1}]}),
        )
        .await;
    assert_eq!(status, 201);
    assert_eq!(results.as_array().unwrap().len(), 2);

    let (status, all) = listener.get_json("/db/_all_docs?include_docs=true").await;
    assert_eq!(status, 200);
    assert_eq!(all["total_rows"], 2);
    assert_eq!(all["rows"][0]["id"], "a");
    assert_eq!(all["rows"][1]["doc"]["v"], 2);

    let (status, keyed) = listener
        .post_json("/db/_all_docs", json!({"keys": ["b", "nope"]}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(keyed["rows"][0]["id"], "b");
    assert_eq!(keyed["rows"][1]["error"], "not_found");

    let (status, _) = listener
        .post_json(
            "/db/_bulk_docs",
            json!({"new_edits": false, "docs": [{"_id": "c", "_rev": "3-abc", "v": 3}]}),
        )
        .await;
    assert_eq!(status, 201);
    let (_, doc) = listener.get_json("/db/c").await;
    assert_eq!(doc["_rev"], "3-abc");

    let (status, diff) = listener
        .post_json("/db/_revs_diff", json!({"c": ["3-abc", "4-def"]}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(diff["c"]["missing"], json!(["4-def"]));

    listener.stop().await;
}

#[tokio::test]
async fn test_compact_and_purge() {
    let listener = common::start_listener(common::config_with(&["db"])).await;
    let (_, first) = listener.put_json("/db/doc", json!({"v": 1})).await;
    let rev1 = first["rev"].as_str().unwrap().to_string();
    let (_, second) = listener
        .put_json("/db/doc", json!({"_rev": rev1, "v": 2}))
        .await;
    let rev2 = second["rev"].as_str().unwrap().to_string();
    listener.put_json("/db/other", json!({"v": 3})).await;

    let (status, body) = listener.post_json("/db/_compact", json!({})).await;
    assert_eq!(status, 202);
    assert_eq!(body["ok"], true);
    let (status, _) = listener.get_json(&format!("/db/doc?rev={}", rev1)).await;
    assert_eq!(status, 404);

    let (status, body) = listener
        .post_json("/db/_purge", json!({"doc": [rev2], "missing": ["1-x"]}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["purged"]["doc"], json!([rev2]));
    assert!(body["purged"].get("missing").is_none());

    let (status, _) = listener.get_json("/db/doc").await;
    assert_eq!(status, 404);
    let (_, info) = listener.get_json("/db").await;
    assert_eq!(info["doc_count"], 1);
    assert_eq!(info["purge_seq"], 1);

    let (status, _) = listener.post_json("/db/_purge", json!(["doc"])).await;
    assert_eq!(status, 400);

    listener.stop().await;
}

#[tokio::test]
async fn test_compact_and_purge_refused_when_read_only() {
    let mut config = common::config_with(&["db"]);
    config.access.read_only = true;
    let listener = common::start_listener(config).await;

    let (status, _) = listener.post_json("/db/_compact", json!({})).await;
    assert_eq!(status, 403);
    let (status, _) = listener.post_json("/db/_purge", json!({})).await;
    assert_eq!(status, 403);

    listener.stop().await;
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
