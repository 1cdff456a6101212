//! Local handler contract and the dispatch boundary.
//!
//! # Responsibilities
//! - Define what a route handler is and what it may return
//! - Normalize every return shape into an `OutgoingResponse` in one place
//! - Catch handler failures (errors and panics) and turn them into a 500
//!
//! # Design Decisions
//! - Handlers are plain async closures; no reflection or registration macros
//! - A failing handler only affects its own request

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::http::request::IncomingRequest;
use crate::http::response::OutgoingResponse;
use crate::routing::Params;

/// What a handler hands back. Normalized by [`Reply::into_response`].
#[derive(Debug, Clone)]
pub enum Reply {
    /// Served as `text/html; charset=utf-8` with status 200.
    Text(String),
    /// Serialized as `application/json` with status 200.
    Json(serde_json::Value),
    /// Any other reply with its status replaced.
    WithStatus(Box<Reply>, StatusCode),
    /// Sent as-is.
    Response(OutgoingResponse),
}

impl Reply {
    pub fn text(body: impl Into<String>) -> Self {
        Reply::Text(body.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Reply::Json(value)
    }

    pub fn with_status(self, status: StatusCode) -> Self {
        Reply::WithStatus(Box::new(self), status)
    }

    pub fn into_response(self) -> OutgoingResponse {
        match self {
            Reply::Text(body) => OutgoingResponse::new(StatusCode::OK)
                .with_mimetype("text/html; charset=utf-8")
                .with_body(body),
            Reply::Json(value) => match serde_json::to_vec(&value) {
                Ok(body) => OutgoingResponse::new(StatusCode::OK)
                    .with_mimetype("application/json")
                    .with_body(body),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize JSON reply");
                    OutgoingResponse::internal_error()
                }
            },
            Reply::WithStatus(inner, status) => inner.into_response().with_status(status),
            Reply::Response(response) => response,
        }
    }
}

impl From<&str> for Reply {
    fn from(body: &str) -> Self {
        Reply::Text(body.to_string())
    }
}

impl From<String> for Reply {
    fn from(body: String) -> Self {
        Reply::Text(body)
    }
}

impl From<serde_json::Value> for Reply {
    fn from(value: serde_json::Value) -> Self {
        Reply::Json(value)
    }
}

impl From<OutgoingResponse> for Reply {
    fn from(response: OutgoingResponse) -> Self {
        Reply::Response(response)
    }
}

/// `(data, status)`; an out-of-range status becomes a 500.
impl<T: Into<Reply>> From<(T, u16)> for Reply {
    fn from((data, status): (T, u16)) -> Self {
        match StatusCode::from_u16(status) {
            Ok(status) => data.into().with_status(status),
            Err(_) => {
                tracing::error!(status, "Handler returned an invalid status code");
                Reply::Response(OutgoingResponse::internal_error())
            }
        }
    }
}

/// An error returned by a handler. Converts from any `std::error::Error`.
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerError").field(&self.message).finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type HandlerResult = Result<Reply, HandlerError>;

/// A local route handler.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: IncomingRequest, params: Params) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(IncomingRequest, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, request: IncomingRequest, params: Params) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(request, params))
    }
}

/// Run a handler and always come back with a response.
///
/// Errors and panics, including panics raised while building the future,
/// become a 500 with a generic body.
pub async fn dispatch(
    handler: &dyn Handler,
    request: IncomingRequest,
    params: Params,
) -> OutgoingResponse {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(request, params))) {
        Ok(future) => future,
        Err(panic) => {
            tracing::error!(panic = %panic_message(&*panic), "Handler panicked");
            return OutgoingResponse::internal_error();
        }
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(reply)) => reply.into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Handler returned an error");
            OutgoingResponse::internal_error()
        }
        Err(panic) => {
            tracing::error!(panic = %panic_message(&*panic), "Handler panicked");
            OutgoingResponse::internal_error()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
