//! Revalidation handler behavior over a real on-disk store.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode, header},
};
use http_body_util::BodyExt;
use isr_cache::cache::{
    CACHE_STATUS_HEADER, CacheConfig, CacheStore, HandlerConfig, IsrHandler, ManualClock, Origin,
    OriginError,
};
use tokio::sync::Semaphore;

async fn open_handler(root: &Path, clock: Arc<ManualClock>) -> IsrHandler {
    let config = CacheConfig {
        root_dir: root.to_path_buf(),
        generation: "build-1".to_string(),
        index_flush_debounce_ms: 10,
        ..CacheConfig::default()
    };
    let handler_config = HandlerConfig::from(&config);
    let store = CacheStore::open(config).await.expect("store opens");
    IsrHandler::new(store, handler_config, clock)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

fn cache_status(response: &Response<Body>) -> String {
    response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

/// Origin that counts calls and answers `render <n>` with the given header.
fn counting(calls: &Arc<AtomicUsize>, cache_control: &'static str) -> impl Origin + Clone {
    let calls = Arc::clone(calls);
    move |_request: Request<Body>| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, OriginError>(
                Response::builder()
                    .header(header::CACHE_CONTROL, cache_control)
                    .body(Body::from(format!("render {n}")))
                    .expect("response should build"),
            )
        }
    }
}

/// Like [`counting`], but every render waits for a permit from `gate`.
fn gated(
    calls: &Arc<AtomicUsize>,
    gate: &Arc<Semaphore>,
    cache_control: &'static str,
) -> impl Origin + Clone {
    let calls = Arc::clone(calls);
    let gate = Arc::clone(gate);
    move |_request: Request<Body>| {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            gate.acquire()
                .await
                .map_err(|err| OriginError::Render(err.to_string()))?
                .forget();
            Ok::<_, OriginError>(
                Response::builder()
                    .header(header::CACHE_CONTROL, cache_control)
                    .body(Body::from(format!("render {n}")))
                    .expect("response should build"),
            )
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn freshness_walks_hit_then_stale_with_one_revalidation() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let handler = open_handler(dir.path(), Arc::clone(&clock)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));
    let origin = gated(&calls, &gate, "s-maxage=1, stale-while-revalidate=10");

    gate.add_permits(1);
    let miss = handler.handle("/post", get("/post"), origin.clone()).await.unwrap();
    assert_eq!(cache_status(&miss), "MISS");
    assert_eq!(body_string(miss).await, "render 1");

    clock.set(500);
    let hit = handler.handle("/post", get("/post"), origin.clone()).await.unwrap();
    assert_eq!(cache_status(&hit), "HIT");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.set(1_500);
    for _ in 0..5 {
        let stale = handler.handle("/post", get("/post"), origin.clone()).await.unwrap();
        assert_eq!(cache_status(&stale), "STALE");
        assert_eq!(body_string(stale).await, "render 1");
    }
    wait_for(|| calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(handler.in_flight(), 1);

    gate.add_permits(1);
    wait_for(|| handler.in_flight() == 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let refreshed = handler.handle("/post", get("/post"), origin).await.unwrap();
    assert_eq!(cache_status(&refreshed), "HIT");
    assert_eq!(body_string(refreshed).await, "render 2");
}

#[tokio::test]
async fn past_stale_window_renders_again() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let handler = open_handler(dir.path(), Arc::clone(&clock)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counting(&calls, "s-maxage=1, stale-while-revalidate=10");

    handler.handle("/e", get("/e"), origin.clone()).await.unwrap();

    clock.set(11_000);
    let response = handler.handle("/e", get("/e"), origin).await.unwrap();
    assert_eq!(cache_status(&response), "MISS");
    assert_eq!(body_string(response).await, "render 2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_misses_share_one_render() {
    let dir = tempfile::tempdir().unwrap();
    let handler = open_handler(dir.path(), Arc::new(ManualClock::new(0))).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));
    let origin = gated(&calls, &gate, "s-maxage=60");

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let handler = handler.clone();
        let origin = origin.clone();
        tasks.push(tokio::spawn(async move {
            let response = handler.handle("/hot", get("/hot"), origin).await.unwrap();
            body_string(response).await
        }));
    }

    wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(1);

    for task in tasks {
        assert_eq!(task.await.unwrap(), "render 1");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn coalesced_waiters_all_observe_origin_failure() {
    let dir = tempfile::tempdir().unwrap();
    let handler = open_handler(dir.path(), Arc::new(ManualClock::new(0))).await;
    let gate = Arc::new(Semaphore::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = {
        let gate = Arc::clone(&gate);
        let calls = Arc::clone(&calls);
        move |_request: Request<Body>| {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                Err::<Response<Body>, _>(OriginError::Render("upstream down".into()))
            }
        }
    };

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let handler = handler.clone();
        let failing = failing.clone();
        tasks.push(tokio::spawn(async move {
            handler.handle("/down", get("/down"), failing).await
        }));
    }

    wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(1);

    for task in tasks {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(OriginError::Render(_))));
    }
    assert_eq!(handler.in_flight(), 0);
}

#[tokio::test]
async fn cacheability_follows_s_maxage() {
    let dir = tempfile::tempdir().unwrap();
    let handler = open_handler(dir.path(), Arc::new(ManualClock::new(0))).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let zero = handler
        .handle("/zero", get("/zero"), counting(&calls, "s-maxage=0"))
        .await
        .unwrap();
    assert_eq!(cache_status(&zero), "BYPASS");
    assert!(!handler.store().contains("/zero"));

    let absent = handler
        .handle("/absent", get("/absent"), counting(&calls, "public, max-age=600"))
        .await
        .unwrap();
    assert_eq!(cache_status(&absent), "BYPASS");
    assert!(!handler.store().contains("/absent"));

    let cached = handler
        .handle("/sixty", get("/sixty"), counting(&calls, "s-maxage=60"))
        .await
        .unwrap();
    assert_eq!(cache_status(&cached), "MISS");
    let entry = handler.store().get("/sixty").await.expect("entry stored");
    assert_eq!(entry.s_maxage, 60);
    assert_eq!(entry.swr, 0);
}

#[tokio::test]
async fn image_route_max_age_becomes_cacheable() {
    let dir = tempfile::tempdir().unwrap();
    let handler = open_handler(dir.path(), Arc::new(ManualClock::new(0))).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let origin = counting(&calls, "public, max-age=31536000");
    let key = "/_image?href=/hero.png&w=640";

    let first = handler.handle(key, get(key), origin.clone()).await.unwrap();
    assert_eq!(cache_status(&first), "MISS");
    assert_eq!(
        first.headers().get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=31536000, s-maxage=31536000, stale-while-revalidate=86400"
    );

    let second = handler.handle(key, get(key), origin).await.unwrap();
    assert_eq!(cache_status(&second), "HIT");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_image_route_max_age_is_not_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let handler = open_handler(dir.path(), Arc::new(ManualClock::new(0))).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let response = handler
        .handle("/page", get("/page"), counting(&calls, "max-age=600"))
        .await
        .unwrap();
    assert_eq!(cache_status(&response), "BYPASS");
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "max-age=600");
}

#[tokio::test]
async fn cached_entries_survive_restart_through_flush() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let handler = open_handler(dir.path(), Arc::new(ManualClock::new(0))).await;
        handler
            .handle("/kept", get("/kept"), counting(&calls, "s-maxage=60"))
            .await
            .unwrap();
        handler.flush().await;
    }

    let handler = open_handler(dir.path(), Arc::new(ManualClock::new(1_000))).await;
    let response = handler
        .handle("/kept", get("/kept"), counting(&calls, "s-maxage=60"))
        .await
        .unwrap();
    assert_eq!(cache_status(&response), "HIT");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "render 1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
