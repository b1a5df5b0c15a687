//! Database-level endpoints.

use std::collections::{BTreeMap, HashMap};

use axum::http::{Method, StatusCode};
use serde_json::{json, Map, Value};

use crate::error::{ListenerError, ListenerResult};
use crate::feed::{results_body, ChangeSubscription, ChangesOptions, FeedMode, FeedSource};
use crate::http::request::RequestContext;
use crate::lifecycle::ResponseState;
use crate::store::{Database, DocumentUpdate, Revision};

/// `GET /{db}`
pub fn info(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let mut response = ctx.response();
    response.set_json(db.info());
    Ok(response.into())
}

/// `PUT /{db}`
pub fn create(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let name = ctx.segment(0).ok_or_else(ListenerError::missing)?;
    ctx.state().manager.create_database(name)?;
    tracing::debug!(request_id = %ctx.request_id, db = %name, "Database created");

    let mut response = ctx.response();
    response.set_status(StatusCode::CREATED);
    response.set_header("Location", format!("/{}", name));
    Ok(response.into())
}

/// `DELETE /{db}`
pub fn delete(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    if ctx.query("rev").is_some() {
        return Err(ListenerError::BadRequest(
            "You tried to DELETE a database with a ?rev= parameter. \
             Did you mean to DELETE a document instead?"
                .to_string(),
        ));
    }
    let name = ctx.segment(0).ok_or_else(ListenerError::missing)?;
    ctx.state().manager.delete_database(name)?;
    tracing::debug!(request_id = %ctx.request_id, db = %name, "Database deleted");
    Ok(ctx.response().into())
}

/// `POST /{db}`: new document, id from `_id` or generated.
pub fn post_document(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let update = DocumentUpdate::from_json(ctx.body_json()?)?;
    let doc_id = update
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let revision = db.put_document(&doc_id, update)?;
    Ok(saved(ctx, StatusCode::CREATED, &revision.doc_id, &revision.rev_id))
}

/// `{"ok":true,"id":..,"rev":..}`
pub(crate) fn saved(ctx: &RequestContext, status: StatusCode, id: &str, rev: &str) -> ResponseState {
    let mut response = ctx.response();
    response.set_status(status);
    response.set_header("Etag", format!("\"{}\"", rev));
    response.set_json(json!({ "ok": true, "id": id, "rev": rev }));
    response.into()
}

/// `GET|POST /{db}/_all_docs`
pub fn all_docs(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let include_docs = ctx.query_bool("include_docs");
    let descending = ctx.query_bool("descending");
    let skip = ctx.query_int("skip", 0) as usize;
    let limit = ctx.query("limit").and_then(|l| l.parse::<usize>().ok());

    let keys = if ctx.method == Method::POST {
        let body = ctx.body_json()?;
        Some(string_list(body.get("keys"))?)
    } else {
        ctx.query_json("keys")?
            .map(|k| string_list(Some(&k)))
            .transpose()?
    };

    let total_rows = db.document_count();
    let mut rows: Vec<Value> = match keys {
        Some(keys) => keys.iter().map(|key| keyed_row(db.as_ref(), key, include_docs)).collect(),
        None => db
            .all_documents()
            .iter()
            .map(|rev| doc_row(rev, include_docs))
            .collect(),
    };
    if descending {
        rows.reverse();
    }
    let rows: Vec<Value> = rows
        .into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    let mut response = ctx.response();
    response.set_json(json!({ "total_rows": total_rows, "offset": skip, "rows": rows }));
    Ok(response.into())
}

fn doc_row(revision: &Revision, include_docs: bool) -> Value {
    let mut row = json!({
        "id": revision.doc_id,
        "key": revision.doc_id,
        "value": { "rev": revision.rev_id },
    });
    if include_docs {
        row["doc"] = revision.to_json();
    }
    row
}

fn keyed_row(db: &dyn Database, key: &str, include_docs: bool) -> Value {
    match db.get_document(key, None) {
        Ok(revision) => doc_row(&revision, include_docs),
        Err(ListenerError::Deleted) => {
            let rev = db
                .leaf_revisions(key)
                .first()
                .map(|r| r.rev_id.clone())
                .unwrap_or_default();
            let mut row = json!({
                "id": key,
                "key": key,
                "value": { "rev": rev, "deleted": true },
            });
            if include_docs {
                row["doc"] = Value::Null;
            }
            row
        }
        Err(_) => json!({ "key": key, "error": "not_found" }),
    }
}

fn string_list(value: Option<&Value>) -> ListenerResult<Vec<String>> {
    let items = value
        .and_then(Value::as_array)
        .ok_or_else(|| ListenerError::BadRequest("`keys` must be an array".to_string()))?;
    Ok(items
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect())
}

/// `POST /{db}/_bulk_docs`
pub fn bulk_docs(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let body = ctx.body_json()?;
    let docs = body
        .get("docs")
        .and_then(Value::as_array)
        .ok_or_else(|| ListenerError::BadRequest("`docs` must be an array".to_string()))?;
    let new_edits = body.get("new_edits").and_then(Value::as_bool).unwrap_or(true);

    let mut results = Vec::new();
    for doc in docs {
        let update = DocumentUpdate::from_json(doc.clone())?;
        let doc_id = update
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        if !new_edits {
            db.force_insert(&doc_id, update)?;
            continue;
        }
        match db.put_document(&doc_id, update) {
            Ok(revision) => results.push(json!({ "id": doc_id, "rev": revision.rev_id })),
            Err(err) => results.push(json!({
                "id": doc_id,
                "error": err.error_name(),
                "reason": err.reason(),
            })),
        }
    }
    tracing::debug!(
        request_id = %ctx.request_id,
        db = %db.name(),
        docs = docs.len(),
        new_edits,
        "Bulk docs applied"
    );

    let mut response = ctx.response();
    response.set_status(StatusCode::CREATED);
    response.set_json(Value::Array(results));
    Ok(response.into())
}

/// `POST /{db}/_revs_diff`
pub fn revs_diff(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let body = ctx.body_json()?;
    let Value::Object(map) = body else {
        return Err(ListenerError::BadRequest(
            "_revs_diff body must be an object".to_string(),
        ));
    };
    let mut wanted = BTreeMap::new();
    for (doc_id, revs) in map {
        wanted.insert(doc_id, string_list(Some(&revs))?);
    }

    let diff: Map<String, Value> = db
        .revs_diff(&wanted)
        .into_iter()
        .map(|(doc_id, missing)| (doc_id, json!({ "missing": missing })))
        .collect();

    let mut response = ctx.response();
    response.set_json(Value::Object(diff));
    Ok(response.into())
}

/// `POST /{db}/_compact`
pub fn compact(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    db.compact()?;
    let mut response = ctx.response();
    response.set_status(StatusCode::ACCEPTED);
    Ok(response.into())
}

/// `POST /{db}/_purge`: `{docid: [revs]}` → `{"purged": {docid: [revs]}}`
pub fn purge(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let Value::Object(map) = ctx.body_json()? else {
        return Err(ListenerError::BadRequest(
            "_purge body must be an object".to_string(),
        ));
    };
    let mut wanted = BTreeMap::new();
    for (doc_id, revs) in map {
        let revs = revs
            .as_array()
            .ok_or_else(|| {
                ListenerError::BadRequest(format!("revisions for `{}` must be an array", doc_id))
            })?
            .iter()
            .map(|r| r.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ListenerError::BadRequest("revision ids must be strings".to_string()))?;
        wanted.insert(doc_id, revs);
    }

    let purged = db.purge(&wanted)?;
    tracing::debug!(request_id = %ctx.request_id, db = %db.name(), docs = purged.len(), "Purge applied");
    let mut response = ctx.response();
    response.set_json(json!({ "purged": purged }));
    Ok(response.into())
}

/// `GET|POST /{db}/_changes`
pub fn changes(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let db = ctx.database()?;
    let params = changes_params(ctx)?;
    let options = ChangesOptions::from_params(&params)?;

    let filter = match &options.filter {
        Some(name) => Some(
            db.filter(name)
                .ok_or_else(|| ListenerError::NotFound(format!("filter `{}` not found", name)))?,
        ),
        None => None,
    };

    let mut response = ctx.response();
    if options.mode < FeedMode::Continuous
        && response.cache_with_etag(&db.last_sequence().to_string())
    {
        return Ok(response.into());
    }

    let mode = options.mode;
    let since = options.since;
    let source = FeedSource::new(db, options, filter);
    tracing::debug!(
        request_id = %ctx.request_id,
        db = %source.db().name(),
        feed = %mode,
        since,
        "Changes requested"
    );

    match mode {
        FeedMode::Normal => {
            let (rows, last_seq) = source.collect(since);
            response.set_json(results_body(rows, last_seq));
            Ok(response.into())
        }
        FeedMode::LongPoll => {
            // Subscribed before looking, so nothing committed in between is lost.
            let subscription = ChangeSubscription::new(response, source);
            let (rows, last_seq) = subscription.source().collect(since);
            if rows.is_empty() {
                return Ok(ResponseState::Feed(subscription));
            }
            let mut response = subscription.into_response();
            response.set_json(results_body(rows, last_seq));
            Ok(response.into())
        }
        FeedMode::Continuous | FeedMode::EventSource => {
            Ok(ResponseState::Feed(ChangeSubscription::new(response, source)))
        }
    }
}

/// Query parameters, with a POSTed JSON object merged over them.
fn changes_params(ctx: &RequestContext) -> ListenerResult<HashMap<String, String>> {
    let mut params = ctx.query.clone();
    if ctx.method != Method::POST || ctx.body_bytes().is_empty() {
        return Ok(params);
    }
    let Value::Object(body) = ctx.body_json()? else {
        return Err(ListenerError::BadRequest(
            "_changes body must be an object".to_string(),
        ));
    };
    for (key, value) in body {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        params.insert(key, value);
    }
    Ok(params)
}
