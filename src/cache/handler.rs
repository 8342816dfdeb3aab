//! Revalidation handler.
//!
//! Decides per request whether the cached copy of a key is served as is
//! (`HIT`), served while a background render refreshes it (`STALE`), or
//! replaced by a fresh render (`MISS`). Renders for one key are coalesced:
//! at most one runs at a time and every caller interested in its result
//! awaits the same shared future.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::middleware::Next;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use http_body_util::BodyExt;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::clock::Clock;
use super::codec::CacheEntry;
use super::config::{CacheConfig, route_matches};
use super::policy::{CACHE_STATUS_HEADER, CacheState, CacheStatus, Freshness, apply_image_override};
use super::store::CacheStore;

const METRIC_RESPONSES: &str = "isr_handler_responses_total";
const METRIC_RENDERS: &str = "isr_handler_renders_total";
const METRIC_RENDER_FAILURES: &str = "isr_handler_render_failures_total";

/// Failure to obtain a response from the origin.
///
/// Cloneable so that every caller coalesced onto one render observes it.
#[derive(Debug, Clone, Error)]
pub enum OriginError {
    #[error("origin render failed: {0}")]
    Render(String),
    #[error("failed to buffer origin response body: {0}")]
    Body(String),
    #[error("render task ended before producing a response: {0}")]
    Aborted(String),
}

/// Produces the authoritative response for a request.
#[async_trait]
pub trait Origin: Send + Sync + 'static {
    async fn render(&self, request: Request<Body>) -> Result<Response<Body>, OriginError>;
}

#[async_trait]
impl<F, Fut> Origin for F
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, OriginError>> + Send + 'static,
{
    async fn render(&self, request: Request<Body>) -> Result<Response<Body>, OriginError> {
        (self)(request).await
    }
}

#[async_trait]
impl Origin for Next {
    async fn render(&self, request: Request<Body>) -> Result<Response<Body>, OriginError> {
        Ok(self.clone().run(request).await)
    }
}

/// Handler settings taken from the cache configuration.
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    pub image_route: Option<String>,
    pub image_swr_secs: u64,
}

impl From<&CacheConfig> for HandlerConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            image_route: config.image_route.clone(),
            image_swr_secs: config.image_swr_secs,
        }
    }
}

impl HandlerConfig {
    fn is_image_route(&self, path: &str) -> bool {
        route_matches(self.image_route.as_deref(), path)
    }
}

/// A fully buffered origin response.
#[derive(Debug)]
struct Rendered {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    freshness: Option<Freshness>,
}

impl Rendered {
    fn to_response(&self, status: CacheStatus) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        tag(&mut response, status);
        response
    }

    fn to_entry(&self, freshness: Freshness, cached_at_ms: u64) -> CacheEntry {
        CacheEntry {
            body: self.body.clone(),
            headers: self
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        Bytes::copy_from_slice(value.as_bytes()),
                    )
                })
                .collect(),
            status: self.status.as_u16(),
            cached_at_ms,
            s_maxage: freshness.s_maxage,
            swr: freshness.swr,
        }
    }
}

/// Why a render was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderKind {
    /// No usable entry; `purge` drops an expired one before rendering.
    Miss { purge: bool },
    /// Background refresh of a stale entry.
    Revalidate,
}

type RenderResult = Result<Arc<Rendered>, OriginError>;
type RenderFuture = Shared<BoxFuture<'static, RenderResult>>;

/// Serves requests from a [`CacheStore`], rendering through an [`Origin`]
/// when needed. Clones share the same store and render registry.
#[derive(Clone)]
pub struct IsrHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    store: CacheStore,
    config: HandlerConfig,
    clock: Arc<dyn Clock>,
    /// key -> in-flight render, tagged with its registration id.
    renders: DashMap<String, (u64, RenderFuture)>,
    render_seq: AtomicU64,
}

/// Frees a render's registry slot when the render task ends, including when
/// the origin panics and the task unwinds.
struct RenderSlot {
    inner: Arc<HandlerInner>,
    key: String,
    id: u64,
}

impl Drop for RenderSlot {
    fn drop(&mut self) {
        let id = self.id;
        self.inner
            .renders
            .remove_if(&self.key, |_, (registered, _)| *registered == id);
    }
}

impl IsrHandler {
    pub fn new(store: CacheStore, config: HandlerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                store,
                config,
                clock,
                renders: DashMap::new(),
                render_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Number of renders currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.renders.len()
    }

    /// Serves `request` under `key`.
    ///
    /// Only origin failures are returned as errors; every cache-side failure
    /// degrades to a render.
    #[instrument(skip(self, request, origin), fields(key = %key))]
    pub async fn handle<O: Origin>(
        &self,
        key: &str,
        request: Request<Body>,
        origin: O,
    ) -> Result<Response<Body>, OriginError> {
        let mut purge = false;

        if let Some(entry) = self.inner.store.get(key).await {
            match CacheState::classify(&entry, self.inner.clock.now_ms()) {
                CacheState::Fresh => {
                    debug!(outcome = "hit", "serving cached response");
                    return Ok(self.respond_cached(&entry, CacheStatus::Hit));
                }
                CacheState::Stale => {
                    debug!(outcome = "stale", "serving stale response");
                    self.revalidate(key, request, origin);
                    return Ok(self.respond_cached(&entry, CacheStatus::Stale));
                }
                CacheState::Expired => {
                    debug!(outcome = "expired", "cached response past its stale window");
                    purge = true;
                }
            }
        }

        let rendered = self
            .render_shared(key, request, origin, RenderKind::Miss { purge })
            .await?;
        let status = if rendered.freshness.is_some() {
            CacheStatus::Miss
        } else {
            CacheStatus::Bypass
        };
        counter!(METRIC_RESPONSES, "status" => status.as_str()).increment(1);
        Ok(rendered.to_response(status))
    }

    /// Renders `request` without consulting or updating the cache.
    pub async fn bypass<O: Origin>(
        &self,
        request: Request<Body>,
        origin: O,
    ) -> Result<Response<Body>, OriginError> {
        let mut response = origin.render(request).await?;
        tag(&mut response, CacheStatus::Bypass);
        counter!(METRIC_RESPONSES, "status" => CacheStatus::Bypass.as_str()).increment(1);
        Ok(response)
    }

    /// Waits for pending disk work and writes the index.
    pub async fn flush(&self) {
        self.inner.store.save().await;
    }

    fn respond_cached(&self, entry: &CacheEntry, status: CacheStatus) -> Response<Body> {
        counter!(METRIC_RESPONSES, "status" => status.as_str()).increment(1);
        let mut response = Response::new(Body::from(entry.body.clone()));
        *response.status_mut() = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        for (name, value) in &entry.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) else {
                continue;
            };
            headers.append(name, value);
        }
        tag(&mut response, status);
        response
    }

    /// Starts a background refresh unless one is already running for `key`.
    fn revalidate<O: Origin>(&self, key: &str, request: Request<Body>, origin: O) {
        if self.inner.renders.contains_key(key) {
            debug!(key, "revalidation already in flight");
            return;
        }
        // The render runs on its own task; the handle is only kept alive by
        // the registry until it settles.
        drop(self.render_shared(key, request, origin, RenderKind::Revalidate));
    }

    /// Joins the in-flight render for `key`, or registers and spawns a new one.
    fn render_shared<O: Origin>(
        &self,
        key: &str,
        request: Request<Body>,
        origin: O,
        kind: RenderKind,
    ) -> RenderFuture {
        match self.inner.renders.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                debug!(key, "joining in-flight render");
                existing.get().1.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.inner.render_seq.fetch_add(1, Ordering::AcqRel);
                let task = tokio::spawn(run_render(
                    Arc::clone(&self.inner),
                    key.to_string(),
                    id,
                    request,
                    origin,
                    kind,
                ));
                let render = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) => Err(OriginError::Aborted(err.to_string())),
                    }
                }
                .boxed()
                .shared();
                slot.insert((id, render.clone()));
                render
            }
        }
    }
}

async fn run_render<O: Origin>(
    inner: Arc<HandlerInner>,
    key: String,
    id: u64,
    request: Request<Body>,
    origin: O,
    kind: RenderKind,
) -> RenderResult {
    let _slot = RenderSlot {
        inner: Arc::clone(&inner),
        key: key.clone(),
        id,
    };
    counter!(METRIC_RENDERS).increment(1);
    if kind == (RenderKind::Miss { purge: true }) {
        inner.store.delete(&key).await;
    }

    let is_image = inner.config.is_image_route(request.uri().path());
    let result = render_buffered(&origin, request, is_image, inner.config.image_swr_secs).await;

    match &result {
        Ok(rendered) => match rendered.freshness {
            Some(freshness) => {
                let entry = rendered.to_entry(freshness, inner.clock.now_ms());
                inner.store.set(&key, entry);
            }
            None if kind == RenderKind::Revalidate => {
                debug!(key = %key, "revalidated response is no longer cacheable; dropping entry");
                inner.store.delete(&key).await;
            }
            None => {}
        },
        Err(err) => {
            counter!(METRIC_RENDER_FAILURES).increment(1);
            if kind == RenderKind::Revalidate {
                warn!(key = %key, error = %err, "background revalidation failed; keeping stale entry");
            } else {
                debug!(key = %key, error = %err, "render failed");
            }
        }
    }

    result.map(Arc::new)
}

async fn render_buffered<O: Origin>(
    origin: &O,
    request: Request<Body>,
    is_image: bool,
    image_swr_secs: u64,
) -> Result<Rendered, OriginError> {
    let response = origin.render(request).await?;
    let (mut parts, body) = response.into_parts();
    let body = BodyExt::collect(body)
        .await
        .map_err(|err| OriginError::Body(err.to_string()))?
        .to_bytes();

    if is_image && apply_image_override(&mut parts.headers, image_swr_secs) {
        debug!("applied image cache-control override");
    }
    parts.headers.remove(CACHE_STATUS_HEADER);

    Ok(Rendered {
        freshness: Freshness::from_headers(&parts.headers),
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

fn tag(response: &mut Response<Body>, status: CacheStatus) {
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, status.header_value());
}
