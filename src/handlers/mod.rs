//! Endpoint handlers and the route list that wires them up.
//!
//! # Responsibilities
//! - Declare every route the listener answers
//! - Turn request contexts into [`ResponseState`](crate::lifecycle::ResponseState)s
//!
//! Handlers are synchronous. Anything that has to wait (replication,
//! attachment uploads, long-poll and continuous feeds) is returned as a
//! deferred state and finished by the lifecycle layer.

pub mod database;
pub mod document;
pub mod server;

use axum::http::Method;

use crate::routing::{Route, RouteDef};

/// The full route list.
///
/// A database name never starts with `_`, so `{[^_].*}` keeps server-level
/// endpoints like `/_all_dbs` out of the database routes.
pub fn routes() -> Vec<RouteDef<Route>> {
    vec![
        // GET (HEAD shares these)
        RouteDef::new(Method::GET, "/", Route::new("welcome", server::welcome)),
        RouteDef::new(Method::GET, "/_all_dbs", Route::new("all_dbs", server::all_dbs)),
        RouteDef::new(Method::GET, "/_session", Route::new("session", server::session)),
        RouteDef::new(Method::GET, "/_uuids", Route::new("uuids", server::uuids)),
        RouteDef::new(Method::GET, "/{[^_].*}", Route::new("db_info", database::info)),
        RouteDef::new(Method::GET, "/{[^_].*}/_all_docs", Route::new("all_docs", database::all_docs)),
        RouteDef::new(Method::GET, "/{[^_].*}/_changes", Route::new("changes", database::changes)),
        RouteDef::new(Method::GET, "/{[^_].*}/*", Route::new("get_doc", document::get)),
        RouteDef::new(Method::GET, "/{[^_].*}/_design/*", Route::new("get_design", document::get)),
        RouteDef::new(Method::GET, "/{[^_].*}/_local/*", Route::new("get_local", document::get_local)),
        RouteDef::new(Method::GET, "/{[^_].*}/*/**", Route::new("get_attachment", document::get_attachment)),
        RouteDef::new(
            Method::GET,
            "/{[^_].*}/_design/*/**",
            Route::new("get_design_attachment", document::get_attachment),
        ),
        // POST
        RouteDef::new(Method::POST, "/_replicate", Route::new("replicate", server::replicate)),
        RouteDef::new(Method::POST, "/{[^_].*}", Route::new("post_doc", database::post_document)),
        RouteDef::new(Method::POST, "/{[^_].*}/_revs_diff", Route::new("revs_diff", database::revs_diff)),
        RouteDef::new(Method::POST, "/{[^_].*}/_all_docs", Route::new("all_docs_keys", database::all_docs)),
        RouteDef::new(Method::POST, "/{[^_].*}/_bulk_docs", Route::new("bulk_docs", database::bulk_docs)),
        RouteDef::new(Method::POST, "/{[^_].*}/_changes", Route::new("changes_post", database::changes)),
        RouteDef::new(Method::POST, "/{[^_].*}/_compact", Route::new("compact", database::compact)),
        RouteDef::new(Method::POST, "/{[^_].*}/_purge", Route::new("purge", database::purge)),
        // PUT
        RouteDef::new(Method::PUT, "/{[^_].*}", Route::new("create_db", database::create)),
        RouteDef::new(Method::PUT, "/{[^_].*}/*", Route::new("put_doc", document::put)),
        RouteDef::new(Method::PUT, "/{[^_].*}/_design/*", Route::new("put_design", document::put)),
        RouteDef::new(Method::PUT, "/{[^_].*}/_local/*", Route::new("put_local", document::put_local)),
        RouteDef::new(
            Method::PUT,
            "/{[^_].*}/*/**",
            Route::streamed("put_attachment", document::put_attachment),
        ),
        RouteDef::new(
            Method::PUT,
            "/{[^_].*}/_design/*/**",
            Route::streamed("put_design_attachment", document::put_attachment),
        ),
        // DELETE
        RouteDef::new(Method::DELETE, "/{[^_].*}", Route::new("delete_db", database::delete)),
        RouteDef::new(Method::DELETE, "/{[^_].*}/*", Route::new("delete_doc", document::delete)),
        RouteDef::new(Method::DELETE, "/{[^_].*}/_design/*", Route::new("delete_design", document::delete)),
        RouteDef::new(Method::DELETE, "/{[^_].*}/_local/*", Route::new("delete_local", document::delete_local)),
        RouteDef::new(
            Method::DELETE,
            "/{[^_].*}/*/**",
            Route::new("delete_attachment", document::delete_attachment),
        ),
        RouteDef::new(
            Method::DELETE,
            "/{[^_].*}/_design/*/**",
            Route::new("delete_design_attachment", document::delete_attachment),
        ),
    ]
}
