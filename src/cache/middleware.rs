//! axum middleware serving routes through the revalidation handler.
//!
//! GET and HEAD requests are keyed by path and query and go through
//! [`IsrHandler::handle`]; every other method is passed to the origin via
//! [`IsrHandler::bypass`].

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{error, instrument};

use super::{expire::Expirer, handler::IsrHandler};

/// Shared cache state for middleware and application handlers.
#[derive(Clone)]
pub struct IsrState {
    pub handler: IsrHandler,
    pub expirer: Expirer,
}

impl IsrState {
    pub fn new(handler: IsrHandler) -> Self {
        let expirer = Expirer::new(handler.store().clone());
        Self { handler, expirer }
    }
}

/// Middleware for incremental revalidation, for use with
/// `axum::middleware::from_fn_with_state`.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn isr_layer(
    State(state): State<IsrState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let result = if is_cacheable_method(request.method()) {
        let key = cache_key(request.uri());
        state.handler.handle(&key, request, next).await
    } else {
        state.handler.bypass(request, next).await
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "origin failed to render");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn is_cacheable_method(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Cache key for a request URI: the path plus the query string, if any.
pub fn cache_key(uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{query}", uri.path()),
        None => uri.path().to_string(),
    }
}
