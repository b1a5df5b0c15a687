//! Server-level endpoints: welcome, database list, session, UUIDs, replication.

use axum::http::StatusCode;
use serde_json::{json, Value};

use crate::error::{ListenerError, ListenerResult};
use crate::http::request::RequestContext;
use crate::lifecycle::ResponseState;
use crate::store::ReplicationRequest;

/// `GET /`
pub fn welcome(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let version = env!("CARGO_PKG_VERSION");
    let mut response = ctx.response();
    response.set_json(json!({
        "couchdb": "Welcome",
        "CouchLite": "Welcome",
        "version": version,
        "vendor": {
            "name": "CouchLite (Rust)",
            "version": version,
        },
    }));
    Ok(response.into())
}

/// `GET /_all_dbs`
pub fn all_dbs(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let mut names = ctx.state().manager.database_names();
    names.sort();
    let mut response = ctx.response();
    response.set_json(json!(names));
    Ok(response.into())
}

/// `GET /_session`: everyone is admin on a local listener.
pub fn session(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let mut response = ctx.response();
    response.set_json(json!({
        "ok": true,
        "userCtx": { "name": Value::Null, "roles": ["_admin"] },
    }));
    Ok(response.into())
}

/// `GET /_uuids?count=N`
pub fn uuids(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let count = ctx.query_int("count", 1);
    let max = ctx.config().limits.max_uuids as u64;
    if count > max {
        return Err(ListenerError::Forbidden(format!(
            "count parameter too large (max {})",
            max
        )));
    }
    let uuids: Vec<String> = (0..count)
        .map(|_| uuid::Uuid::new_v4().simple().to_string())
        .collect();
    let mut response = ctx.response();
    response.set_json(json!({ "uuids": uuids }));
    Ok(response.into())
}

/// `POST /_replicate`
///
/// One-shot replications answer when they finish; continuous or `async`
/// ones answer with their session id right away.
pub fn replicate(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
    let request: ReplicationRequest = serde_json::from_value(ctx.body_json()?)?;
    let replicator = ctx.state().replicator.clone();
    let mut response = ctx.response();

    if request.cancel {
        replicator.cancel(&request)?;
        response.set_json(json!({ "ok": true }));
        return Ok(response.into());
    }

    let session = replicator.start(&request)?;
    tracing::info!(
        request_id = %ctx.request_id,
        session_id = %session.session_id,
        source = %request.source,
        target = %request.target,
        continuous = session.continuous,
        "Replication started"
    );

    if session.continuous || request.run_async {
        response.set_json(json!({ "ok": true, "session_id": session.session_id }));
        return Ok(response.into());
    }

    let label = format!("replicate {} -> {}", request.source, request.target);
    Ok(ResponseState::one_shot(label, async move {
        match session.outcome.await {
            Ok(Ok(stats)) => response.set_json(json!({
                "ok": true,
                "session_id": session.session_id,
                "docs_read": stats.docs_read,
                "docs_written": stats.docs_written,
            })),
            Ok(Err(err)) => response.set_error(&err),
            // The replication task went away without reporting.
            Err(_) => response.set_error_status(StatusCode::INTERNAL_SERVER_ERROR),
        }
        response
    }))
}
