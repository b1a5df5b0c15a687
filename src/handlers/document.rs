//! Document, local document and attachment endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::{ListenerError, ListenerResult};
use crate::handlers::database::saved;
use crate::http::multipart::MultipartWriter;
use crate::http::request::RequestContext;
use crate::http::response::explicitly_accepts_json;
use crate::lifecycle::ResponseState;
use crate::store::{AttachmentStyle, Database, DocumentUpdate, Revision};

const DESIGN_PREFIX: &str = "_design";

/// Document id from the path: `/{db}/{id}` or `/{db}/_design/{name}`.
fn doc_id(ctx: &RequestContext) -> ListenerResult<String> {
    match (ctx.segment(1), ctx.segment(2)) {
        (Some(DESIGN_PREFIX), Some(name)) => Ok(format!("{}/{}", DESIGN_PREFIX, name)),
        (Some(id), _) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(ListenerError::BadId("missing document id".to_string())),
    }
}

/// Attachment name: everything after the document id.
fn attachment_name(ctx: &RequestContext) -> String {
    match ctx.segment(1) {
        Some(DESIGN_PREFIX) => ctx.rest_of_path(3),
        _ => ctx.rest_of_path(2),
    }
}

/// `GET /{db}/{id}`, `GET /{db}/_design/{name}`
pub fn get(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let doc_id = doc_id(ctx)?;

    if let Some(open_revs) = ctx.query("open_revs") {
        let body = open_revs_body(ctx, db.as_ref(), &doc_id, open_revs)?;
        let mut response = ctx.response();
        response.set_json(body);
        return Ok(response.into());
    }

    let revision = db.get_document(&doc_id, ctx.query("rev"))?;
    let mut response = ctx.response();
    if response.cache_with_etag(&revision.rev_id) {
        return Ok(response.into());
    }

    let multipart = ctx.query_bool("attachments")
        && !revision.attachments.is_empty()
        && !explicitly_accepts_json(ctx.header("accept"));
    let style = match (ctx.query_bool("attachments"), multipart) {
        (true, true) => AttachmentStyle::Follows,
        (true, false) => AttachmentStyle::Inline,
        _ => AttachmentStyle::Stub,
    };

    let mut body = revision.to_json_with(style);
    decorate(ctx, db.as_ref(), &revision, &mut body);

    if multipart {
        let mut writer = MultipartWriter::new("related");
        writer.add_json(&body);
        for (name, attachment) in &revision.attachments {
            writer.add_attachment(name, &attachment.content_type, attachment.data.clone());
        }
        response.set_multipart(writer);
    } else {
        response.set_json(body);
    }
    Ok(response.into())
}

/// `open_revs=all` or `open_revs=["1-a",...]`
fn open_revs_body(
    ctx: &RequestContext,
    db: &dyn Database,
    doc_id: &str,
    open_revs: &str,
) -> ListenerResult<Value> {
    let entries: Vec<Value> = if open_revs == "all" {
        let leaves = db.leaf_revisions(doc_id);
        if leaves.is_empty() {
            return Err(ListenerError::missing());
        }
        leaves
            .iter()
            .map(|rev| {
                let mut doc = rev.to_json();
                decorate(ctx, db, rev, &mut doc);
                json!({ "ok": doc })
            })
            .collect()
    } else {
        let wanted: Vec<String> = serde_json::from_str(open_revs)?;
        wanted
            .iter()
            .map(|rev_id| match db.get_document(doc_id, Some(rev_id)) {
                Ok(rev) => {
                    let mut doc = rev.to_json();
                    decorate(ctx, db, &rev, &mut doc);
                    json!({ "ok": doc })
                }
                Err(_) => json!({ "missing": rev_id }),
            })
            .collect()
    };
    Ok(Value::Array(entries))
}

/// Add `_revisions` (`revs=true`) and `_conflicts` (`conflicts=true`).
fn decorate(ctx: &RequestContext, db: &dyn Database, revision: &Revision, body: &mut Value) {
    if ctx.query_bool("revs") {
        let ids: Vec<String> = db
            .revision_history(&revision.doc_id, &revision.rev_id)
            .iter()
            .filter_map(|rev| rev.split_once('-').map(|(_, digest)| digest.to_string()))
            .collect();
        body["_revisions"] = json!({ "start": revision.generation(), "ids": ids });
    }
    if ctx.query_bool("conflicts") {
        let conflicts: Vec<String> = db
            .leaf_revisions(&revision.doc_id)
            .into_iter()
            .filter(|leaf| !leaf.deleted && leaf.rev_id != revision.rev_id)
            .map(|leaf| leaf.rev_id)
            .collect();
        if !conflicts.is_empty() {
            body["_conflicts"] = json!(conflicts);
        }
    }
}

/// `PUT /{db}/{id}`, `PUT /{db}/_design/{name}`
pub fn put(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let doc_id = doc_id(ctx)?;
    let mut update = DocumentUpdate::from_json(ctx.body_json()?)?;
    if update.rev.is_none() {
        update.rev = ctx.requested_rev();
    }

    if ctx.query("new_edits") == Some("false") {
        let rev = update
            .rev
            .clone()
            .ok_or_else(|| ListenerError::BadRequest("new_edits=false requires _rev".to_string()))?;
        db.force_insert(&doc_id, update)?;
        return Ok(saved(ctx, StatusCode::CREATED, &doc_id, &rev));
    }

    let revision = db.put_document(&doc_id, update)?;
    Ok(saved(ctx, StatusCode::CREATED, &revision.doc_id, &revision.rev_id))
}

/// `DELETE /{db}/{id}`, `DELETE /{db}/_design/{name}`
pub fn delete(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let doc_id = doc_id(ctx)?;
    let revision = db.put_document(&doc_id, DocumentUpdate::deletion(ctx.requested_rev()))?;
    Ok(saved(ctx, StatusCode::OK, &revision.doc_id, &revision.rev_id))
}

/// `GET /{db}/_local/{id}`
pub fn get_local(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let id = ctx.segment(2).ok_or_else(ListenerError::missing)?;
    let doc = db.get_local(id)?;
    let mut response = ctx.response();
    if let Some(rev) = doc.get("_rev").and_then(Value::as_str) {
        if response.cache_with_etag(rev) {
            return Ok(response.into());
        }
    }
    response.set_json(doc);
    Ok(response.into())
}

/// `PUT /{db}/_local/{id}`
pub fn put_local(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let id = ctx.segment(2).ok_or_else(ListenerError::missing)?;
    let rev = db.put_local(id, ctx.body_json()?, ctx.requested_rev().as_deref())?;
    Ok(saved(ctx, StatusCode::CREATED, &format!("_local/{}", id), &rev))
}

/// `DELETE /{db}/_local/{id}`
pub fn delete_local(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let id = ctx.segment(2).ok_or_else(ListenerError::missing)?;
    let rev = db.delete_local(id, ctx.requested_rev().as_deref())?;
    Ok(saved(ctx, StatusCode::OK, &format!("_local/{}", id), &rev))
}

/// `GET|HEAD /{db}/{id}/{attachment...}`
pub fn get_attachment(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let doc_id = doc_id(ctx)?;
    let name = attachment_name(ctx);
    let (revision, attachment) = db.get_attachment(&doc_id, &name, ctx.query("rev"))?;

    let mut response = ctx.response();
    if response.cache_with_etag(&revision.rev_id) {
        return Ok(response.into());
    }
    response.set_binary(attachment.data, &attachment.content_type);
    Ok(response.into())
}

/// `PUT /{db}/{id}/{attachment...}`
///
/// The body is read after the handler returns, as a one-shot reply.
pub fn put_attachment(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let doc_id = doc_id(ctx)?;
    let name = attachment_name(ctx);
    let content_type = ctx
        .header("content-type")
        .unwrap_or("application/octet-stream")
        .to_string();
    let rev = ctx.requested_rev();
    let limit = ctx.config().limits.max_body_size;
    let body = ctx.take_body_stream().unwrap_or_else(Body::empty);
    let mut response = ctx.response();

    let label = format!("attachment {}/{}/{}", db.name(), doc_id, name);
    Ok(ResponseState::one_shot(label, async move {
        let outcome = read_body(body, limit).await.and_then(|data| {
            if data.is_empty() {
                return Err(ListenerError::BadAttachment(
                    "attachment body is empty".to_string(),
                ));
            }
            store_attachment(&db, &doc_id, &name, &content_type, data, rev.as_deref())
        });
        match outcome {
            Ok(revision) => {
                response.set_status(StatusCode::CREATED);
                response.set_header("Etag", format!("\"{}\"", revision.rev_id));
                response.set_json(json!({
                    "ok": true,
                    "id": revision.doc_id,
                    "rev": revision.rev_id,
                }));
            }
            Err(err) => response.set_error(&err),
        }
        response
    }))
}

fn store_attachment(
    db: &Arc<dyn Database>,
    doc_id: &str,
    name: &str,
    content_type: &str,
    data: Bytes,
    rev: Option<&str>,
) -> ListenerResult<Revision> {
    let revision = db.put_attachment(doc_id, name, content_type, data, rev)?;
    tracing::debug!(
        db = %db.name(),
        doc_id = %doc_id,
        attachment = %name,
        rev = %revision.rev_id,
        "Attachment stored"
    );
    Ok(revision)
}

/// Collect a request body, refusing more than `limit` bytes.
async fn read_body(body: Body, limit: usize) -> ListenerResult<Bytes> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            ListenerError::BadAttachment(format!("could not read attachment body: {}", e))
        })?;
        if buf.len() + chunk.len() > limit {
            return Err(ListenerError::RequestTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// `DELETE /{db}/{id}/{attachment...}`
pub fn delete_attachment(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let doc_id = doc_id(ctx)?;
    let name = attachment_name(ctx);
    let revision = db.delete_attachment(&doc_id, &name, ctx.requested_rev().as_deref())?;
    Ok(saved(ctx, StatusCode::OK, &revision.doc_id, &revision.rev_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_body_limit() {
        let data = read_body(Body::from("hello"), 16).await.unwrap();
        assert_eq!(&data[..], b"hello");

        let err = read_body(Body::from(vec![0u8; 32]), 16).await.unwrap_err();
        assert!(matches!(err, ListenerError::RequestTooLarge));
    }
}
