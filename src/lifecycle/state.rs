//! How a handler's reply is completed.
//!
//! # State Machine
//! ```text
//! Immediate ──start──▶ head + body written ──▶ closed
//! OneShot   ──start──▶ registered ──(future resolves)──▶ sent ──▶ unregistered
//! Feed      ──start──▶ registered ──(subscription task)──▶ closed ──▶ unregistered
//! ```
//!
//! # Design Decisions
//! - Handlers never see the transport; the writer is attached here
//! - Deferred replies are always in the pending registry while running

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::feed::ChangeSubscription;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::lifecycle::registry::{PendingKind, PendingResponses};
use crate::lifecycle::Shutdown;

/// Future that produces a finished reply.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// What a handler hands back to the dispatcher.
pub enum ResponseState {
    /// Complete now.
    Immediate(Response),
    /// Complete when the future resolves.
    OneShot { label: String, future: ResponseFuture },
    /// Stay open and follow a database.
    Feed(ChangeSubscription),
}

impl ResponseState {
    pub fn one_shot<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Response> + Send + 'static,
    {
        ResponseState::OneShot {
            label: label.into(),
            future: Box::pin(future),
        }
    }

    pub fn is_deferred(&self) -> bool {
        !matches!(self, ResponseState::Immediate(_))
    }

    /// Attach the transport and complete the reply.
    ///
    /// Immediate replies are written before this returns. Deferred replies
    /// run on their own task, whose handle is returned.
    pub fn start(
        self,
        writer: Box<dyn ResponseWriter>,
        registry: &Arc<PendingResponses>,
        shutdown: &Shutdown,
    ) -> Option<JoinHandle<()>> {
        match self {
            ResponseState::Immediate(mut response) => {
                response.attach(writer);
                if !response.send() {
                    tracing::debug!(status = %response.status(), "Client went away before reply");
                }
                None
            }
            ResponseState::OneShot { label, future } => {
                let mut registration = registry.register(PendingKind::OneShot, label);
                Some(tokio::spawn(async move {
                    let mut response = future.await;
                    response.attach(writer);
                    response.send();
                    registration.finish();
                }))
            }
            ResponseState::Feed(subscription) => Some(subscription.spawn(writer, registry, shutdown)),
        }
    }
}

impl From<Response> for ResponseState {
    fn from(response: Response) -> Self {
        ResponseState::Immediate(response)
    }
}
