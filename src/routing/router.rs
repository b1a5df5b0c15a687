//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for request
//! - Run the access check, then the handler
//! - Turn a missing route into 405 or 404
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Handler errors and panics become replies; nothing reaches the transport
//! - Explicit NoMatch rather than silent default

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::http::{Method, StatusCode};

use crate::error::{ListenerError, ListenerResult};
use crate::http::request::RequestContext;
use crate::lifecycle::ResponseState;
use crate::routing::pattern::RouteError;
use crate::routing::table::{RouteDef, RouteTable};
use crate::security::AccessCheck;

/// A route handler. Runs synchronously; deferred work goes into the
/// returned [`ResponseState`].
pub type Handler = fn(&mut RequestContext) -> ListenerResult<ResponseState>;

/// How the request body reaches the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// Read fully (up to the configured limit) before the handler runs.
    Buffered,
    /// Left unread; the handler consumes it.
    Streamed,
}

/// A resolved route.
#[derive(Clone, Copy)]
pub struct Route {
    pub name: &'static str,
    pub handler: Handler,
    pub body: BodyMode,
}

impl Route {
    pub fn new(name: &'static str, handler: Handler) -> Self {
        Self {
            name,
            handler,
            body: BodyMode::Buffered,
        }
    }

    pub fn streamed(name: &'static str, handler: Handler) -> Self {
        Self {
            name,
            handler,
            body: BodyMode::Streamed,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("body", &self.body)
            .finish()
    }
}

/// Immutable router built once at startup.
pub struct Router {
    table: RouteTable<Route>,
    access: Option<Arc<dyn AccessCheck>>,
}

impl Router {
    pub fn new(
        defs: impl IntoIterator<Item = RouteDef<Route>>,
        access: Option<Arc<dyn AccessCheck>>,
    ) -> Result<Self, RouteError> {
        Ok(Self {
            table: RouteTable::build(defs)?,
            access,
        })
    }

    pub fn resolve(&self, method: &Method, segments: &[String]) -> Option<Route> {
        self.table.resolve(method, segments).copied()
    }

    pub fn has_route(&self, method: &Method, segments: &[String]) -> bool {
        self.table.has_route(method, segments)
    }

    /// Produce the reply for a request whose route was already resolved.
    pub fn dispatch(&self, route: Option<Route>, ctx: &mut RequestContext) -> ResponseState {
        if let Some(access) = &self.access {
            if let Err(err) = access.check(&ctx.method, &ctx.segments) {
                return error_state(ctx, &err);
            }
        }

        let Some(route) = route else {
            return self.not_found(ctx);
        };

        match catch_unwind(AssertUnwindSafe(|| (route.handler)(ctx))) {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                if err.status().is_server_error() {
                    tracing::error!(
                        request_id = %ctx.request_id,
                        route = route.name,
                        error = %err,
                        "Handler failed"
                    );
                } else {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        route = route.name,
                        status = err.status().as_u16(),
                        error = %err,
                        "Handler returned error"
                    );
                }
                error_state(ctx, &err)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    request_id = %ctx.request_id,
                    route = route.name,
                    panic = %message,
                    "Handler panicked"
                );
                error_state(ctx, &ListenerError::Internal(message))
            }
        }
    }

    fn not_found(&self, ctx: &RequestContext) -> ResponseState {
        let mut response = ctx.response();
        if self.table.has_other_method(&ctx.method, &ctx.segments) {
            response.set_error_status(StatusCode::METHOD_NOT_ALLOWED);
        } else {
            response.set_error(&ListenerError::missing());
        }
        ResponseState::Immediate(response)
    }
}

fn error_state(ctx: &RequestContext, err: &ListenerError) -> ResponseState {
    let mut response = ctx.response();
    response.set_error(err);
    ResponseState::Immediate(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::http::request::RequestBody;
    use crate::http::server::ListenerState;
    use crate::http::response::ResponseBody;
    use axum::http::HeaderMap;
    use bytes::Bytes;
    use serde_json::json;

    fn ok(ctx: &mut RequestContext) -> ListenerResult<ResponseState> {
        let mut response = ctx.response();
        response.set_json(json!({"route": "ok"}));
        Ok(response.into())
    }

    fn conflict(_: &mut RequestContext) -> ListenerResult<ResponseState> {
        Err(ListenerError::Conflict)
    }

    fn boom(_: &mut RequestContext) -> ListenerResult<ResponseState> {
        panic!("handler exploded")
    }

    fn router() -> Router {
        Router::new(
            [
                RouteDef::new(Method::POST, "/widgets", Route::new("widgets", ok)),
                RouteDef::new(Method::GET, "/conflict", Route::new("conflict", conflict)),
                RouteDef::new(Method::GET, "/boom", Route::new("boom", boom)),
            ],
            None,
        )
        .unwrap()
    }

    fn context(method: Method, path: &str) -> RequestContext {
        let state = ListenerState::in_memory(ServerConfig::default()).unwrap();
        RequestContext::new(
            method,
            path,
            None,
            HeaderMap::new(),
            RequestBody::Buffered(Bytes::new()),
            state,
        )
    }

    fn status_of(state: ResponseState) -> StatusCode {
        match state {
            ResponseState::Immediate(r) => r.status(),
            _ => panic!("expected an immediate reply"),
        }
    }

    fn run(router: &Router, method: Method, path: &str) -> ResponseState {
        let mut ctx = context(method, path);
        let route = router.resolve(&ctx.method, &ctx.segments);
        router.dispatch(route, &mut ctx)
    }

    #[test]
    fn test_405_vs_404() {
        let r = router();
        assert_eq!(status_of(run(&r, Method::GET, "/widgets")), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(status_of(run(&r, Method::GET, "/nonexistent")), StatusCode::NOT_FOUND);
        assert_eq!(status_of(run(&r, Method::PATCH, "/widgets")), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(status_of(run(&r, Method::POST, "/widgets")), StatusCode::OK);
    }

    #[test]
    fn test_head_uses_get_routes() {
        let r = router();
        assert_eq!(status_of(run(&r, Method::HEAD, "/conflict")), StatusCode::CONFLICT);
    }

    #[test]
    fn test_handler_error_becomes_reply() {
        let state = run(&router(), Method::GET, "/conflict");
        let ResponseState::Immediate(response) = state else {
            panic!("expected an immediate reply");
        };
        assert_eq!(response.status(), StatusCode::CONFLICT);
        match response.body() {
            ResponseBody::Json(body) => assert_eq!(body["error"], "conflict"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_panic_becomes_500() {
        assert_eq!(
            status_of(run(&router(), Method::GET, "/boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_access_check_runs_first() {
        struct DenyAll;
        impl AccessCheck for DenyAll {
            fn check(&self, _: &Method, _: &[String]) -> ListenerResult<()> {
                Err(ListenerError::Forbidden("no".to_string()))
            }
        }
        let r = Router::new(
            [RouteDef::new(Method::GET, "/boom", Route::new("boom", boom))],
            Some(Arc::new(DenyAll)),
        )
        .unwrap();
        assert_eq!(status_of(run(&r, Method::GET, "/boom")), StatusCode::FORBIDDEN);
    }
}
