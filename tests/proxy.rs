//! End-to-end tests of the request lifecycle engine against mock hooks.
//!
//! Everything goes through `Proxy::handle`, the same seam the HTTP gateway
//! uses, with counting mocks standing in for the source and transform
//! capabilities so the tests can assert exactly how often each was invoked.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use reframe::config::ProxyConfig;
use reframe::geometry::{Dimensions, GeometryPlan, ResizeRequest};
use reframe::hooks::{ByteStream, Dest, Hooks, Source, SourceBody, Through};
use reframe::pipeline::{Proxy, ResponseBody, ServeError, ServedImage};
use reframe::transform::{ImageTransform, TransformError};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWrite;

const SOURCE_MTIME_SECS: u64 = 1_700_000_000;

fn mtime() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(SOURCE_MTIME_SECS)
}

// =========================================================================
// Mock hooks
// =========================================================================

struct MockSource {
    bytes: Bytes,
    last_modified: SystemTime,
    found: bool,
    /// Number of leading calls that fail with an upstream error.
    fail_first: usize,
    /// Simulated fetch latency, so coalescing tests have a window to queue.
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockSource {
    fn new() -> Self {
        Self {
            bytes: Bytes::from_static(b"source image"),
            last_modified: mtime(),
            found: true,
            fail_first: 0,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MockSource {
    async fn fetch(
        &self,
        _request: &ResizeRequest,
    ) -> anyhow::Result<Option<(SourceBody, SystemTime)>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call <= self.fail_first {
            anyhow::bail!("source exploded on call {call}");
        }
        if !self.found {
            return Ok(None);
        }
        Ok(Some((SourceBody::Buffer(self.bytes.clone()), self.last_modified)))
    }
}

struct MockTransform {
    dims: Dimensions,
    probes: AtomicUsize,
    applies: AtomicUsize,
}

impl MockTransform {
    fn new(dims: Dimensions) -> Self {
        Self {
            dims,
            probes: AtomicUsize::new(0),
            applies: AtomicUsize::new(0),
        }
    }

    fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }
}

impl ImageTransform for MockTransform {
    fn probe(&self, _bytes: &[u8], _extension: &str) -> Result<Dimensions, TransformError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.dims)
    }

    fn apply(
        &self,
        _bytes: &[u8],
        _request: &ResizeRequest,
        _plan: &GeometryPlan,
    ) -> Result<Vec<u8>, TransformError> {
        // Output is numbered per render, so byte-identical responses prove
        // a cache hit rather than a lucky re-render.
        let n = self.applies.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("render-{n}").into_bytes())
    }
}

/// Through hook that appends a marker and records the `cropped` flag.
struct TagThrough {
    cropped_seen: Mutex<Option<bool>>,
}

impl TagThrough {
    fn new() -> Self {
        Self {
            cropped_seen: Mutex::new(None),
        }
    }
}

impl Through for TagThrough {
    fn attach(&self, request: &ResizeRequest, stream: ByteStream) -> ByteStream {
        *self.cropped_seen.lock().unwrap() = Some(request.cropped);
        stream
            .chain(stream::once(std::future::ready(Ok(Bytes::from_static(
                b"+through",
            )))))
            .boxed()
    }
}

/// Dest hook teeing the final bytes into a shared buffer.
struct BufferDest {
    written: Arc<Mutex<Vec<u8>>>,
    fail_open: bool,
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SharedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Dest for BufferDest {
    async fn open(
        &self,
        _request: &ResizeRequest,
    ) -> anyhow::Result<Option<Box<dyn AsyncWrite + Send + Unpin>>> {
        if self.fail_open {
            anyhow::bail!("dest refused to open");
        }
        Ok(Some(Box::new(SharedWriter(Arc::clone(&self.written)))))
    }
}

// =========================================================================
// Helpers
// =========================================================================

fn square_source_config() -> ProxyConfig {
    ProxyConfig {
        memory_cache_ttl: Duration::from_secs(60),
        ..ProxyConfig::default()
    }
}

fn build_proxy(
    config: ProxyConfig,
    source: Arc<MockSource>,
    transform: Arc<MockTransform>,
) -> Arc<Proxy> {
    let hooks = Hooks::new(source).with_transform(transform);
    Arc::new(Proxy::new(config, hooks))
}

async fn body_bytes(served: ServedImage) -> Bytes {
    match served.body {
        ResponseBody::Full(bytes) => bytes,
        ResponseBody::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk.expect("stream chunk"));
            }
            Bytes::from(out)
        }
    }
}

// =========================================================================
// Single-request pipeline outcomes
// =========================================================================

#[tokio::test]
async fn renders_and_serves_with_headers() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), Arc::clone(&source), transform);

    let served = proxy.handle("/a/250x300.jpg", None).await.unwrap();
    assert_eq!(served.content_type, "image/jpeg");
    assert_eq!(
        served.cache_control,
        "public, s-maxage=2628000, max-age=3600"
    );
    assert_eq!(served.last_modified, mtime());
    assert_eq!(body_bytes(served).await, Bytes::from_static(b"render-1"));
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn unsupported_extension_rejected_before_any_hook() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), Arc::clone(&source), transform);

    let err = proxy.handle("/a/100x100.svg", None).await.unwrap_err();
    assert!(matches!(&err, ServeError::UnsupportedExtension(_)));
    assert_eq!(err.status(), 400);
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn missing_source_is_404() {
    let mut mock = MockSource::new();
    mock.found = false;
    let source = Arc::new(mock);
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), source, Arc::clone(&transform));

    let err = proxy.handle("/a/100x100.jpg", None).await.unwrap_err();
    assert!(matches!(err, ServeError::NotFound));
    assert_eq!(transform.applies(), 0);
}

#[tokio::test]
async fn upscale_target_is_404() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 100, height: 100 }));
    let proxy = build_proxy(square_source_config(), source, Arc::clone(&transform));

    let err = proxy.handle("/a/200x200.jpg", None).await.unwrap_err();
    assert!(matches!(&err, ServeError::NotFound));
    assert_eq!(err.status(), 404);
    assert_eq!(transform.applies(), 0);
}

#[tokio::test]
async fn source_error_is_500() {
    let mut mock = MockSource::new();
    mock.fail_first = 1;
    let source = Arc::new(mock);
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), source, transform);

    let err = proxy.handle("/a/100x100.jpg", None).await.unwrap_err();
    assert!(matches!(&err, ServeError::Upstream(_)));
    assert_eq!(err.status(), 500);
}

#[tokio::test]
async fn stream_source_body_is_collected() {
    struct StreamingSource;

    #[async_trait]
    impl Source for StreamingSource {
        async fn fetch(
            &self,
            _request: &ResizeRequest,
        ) -> anyhow::Result<Option<(SourceBody, SystemTime)>> {
            let chunks: Vec<io::Result<Bytes>> = vec![
                Ok(Bytes::from_static(b"part one ")),
                Ok(Bytes::from_static(b"part two")),
            ];
            Ok(Some((
                SourceBody::Stream(stream::iter(chunks).boxed()),
                mtime(),
            )))
        }
    }

    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let hooks = Hooks::new(Arc::new(StreamingSource)).with_transform(transform);
    let proxy = Proxy::new(square_source_config(), hooks);

    let served = proxy.handle("/a/100x100.jpg", None).await.unwrap();
    assert_eq!(body_bytes(served).await, Bytes::from_static(b"render-1"));
}

// =========================================================================
// Conditional requests
// =========================================================================

#[tokio::test]
async fn conditional_request_against_live_source_is_304() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(
        square_source_config(),
        Arc::clone(&source),
        Arc::clone(&transform),
    );

    let err = proxy
        .handle("/a/100x100.jpg", Some(mtime()))
        .await
        .unwrap_err();
    assert!(matches!(&err, ServeError::NotModified));
    assert_eq!(err.status(), 304);
    // Fetched once for the timestamp, but never probed or transformed.
    assert_eq!(source.calls(), 1);
    assert_eq!(transform.applies(), 0);
}

#[tokio::test]
async fn conditional_request_served_from_cache_without_hooks() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), Arc::clone(&source), transform);

    let served = proxy.handle("/a/100x100.jpg", None).await.unwrap();
    body_bytes(served).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(source.calls(), 1);

    let err = proxy
        .handle("/a/100x100.jpg", Some(mtime() + Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServeError::NotModified));
    // The 304 came straight out of the cache.
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn subsecond_mtime_still_returns_304() {
    // Filesystem sources report nanosecond mtimes, but the Last-Modified a
    // client echoes back is whole seconds. The echo must still match.
    let mut mock = MockSource::new();
    mock.last_modified = mtime() + Duration::from_millis(500);
    let source = Arc::new(mock);
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), source, transform);

    let err = proxy
        .handle("/a/100x100.jpg", Some(mtime()))
        .await
        .unwrap_err();
    assert!(matches!(&err, ServeError::NotModified));
}

#[tokio::test]
async fn subsecond_mtime_is_truncated_in_served_headers() {
    let mut mock = MockSource::new();
    mock.last_modified = mtime() + Duration::from_millis(500);
    let source = Arc::new(mock);
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), source, transform);

    let served = proxy.handle("/a/100x100.jpg", None).await.unwrap();
    assert_eq!(served.last_modified, mtime());
}

#[tokio::test]
async fn oversized_dimension_is_404_not_a_partial_resize() {
    // A width beyond u32 must not degrade into a height-only request.
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), source, Arc::clone(&transform));

    let err = proxy
        .handle("/a/4294967296x100.jpg", None)
        .await
        .unwrap_err();
    assert!(matches!(&err, ServeError::NotFound));
    assert_eq!(transform.applies(), 0);
}

#[tokio::test]
async fn stale_conditional_timestamp_renders_normally() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), source, transform);

    let served = proxy
        .handle("/a/100x100.jpg", Some(mtime() - Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(body_bytes(served).await, Bytes::from_static(b"render-1"));
}

// =========================================================================
// Caching
// =========================================================================

#[tokio::test]
async fn cache_round_trip_is_byte_identical_and_skips_hooks() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(
        square_source_config(),
        Arc::clone(&source),
        Arc::clone(&transform),
    );

    let first = body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    // The pump populates the cache after the last byte is delivered.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    assert_eq!(first, second);
    assert_eq!(first, Bytes::from_static(b"render-1"));
    assert_eq!(source.calls(), 1);
    assert_eq!(transform.applies(), 1);
}

#[tokio::test]
async fn expired_cache_entry_triggers_rerender() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let config = ProxyConfig {
        memory_cache_ttl: Duration::ZERO,
        ..ProxyConfig::default()
    };
    let proxy = build_proxy(config, Arc::clone(&source), transform);

    let first = body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;

    assert_eq!(first, Bytes::from_static(b"render-1"));
    assert_eq!(second, Bytes::from_static(b"render-2"));
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn disabled_cache_renders_every_request() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let config = ProxyConfig {
        memory_cache: false,
        ..ProxyConfig::default()
    };
    let proxy = build_proxy(config, Arc::clone(&source), transform);

    body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    assert_eq!(source.calls(), 2);
}

// =========================================================================
// Coalescing
// =========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_coalesce_into_one_render() {
    let mut mock = MockSource::new();
    mock.delay = Some(Duration::from_millis(150));
    let source = Arc::new(mock);
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(
        square_source_config(),
        Arc::clone(&source),
        Arc::clone(&transform),
    );

    let first = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await
        })
    };
    // Hold long enough for the first request to win admission.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut rest = Vec::new();
    for _ in 0..7 {
        let proxy = Arc::clone(&proxy);
        rest.push(tokio::spawn(async move {
            body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await
        }));
    }

    let first = first.await.unwrap();
    for task in rest {
        assert_eq!(task.await.unwrap(), Bytes::from_static(b"render-1"));
    }
    assert_eq!(first, Bytes::from_static(b"render-1"));
    assert_eq!(source.calls(), 1);
    assert_eq!(transform.applies(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn waiter_renders_independently_after_failed_render() {
    let mut mock = MockSource::new();
    mock.delay = Some(Duration::from_millis(100));
    mock.fail_first = 1;
    let source = Arc::new(mock);
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let proxy = build_proxy(square_source_config(), Arc::clone(&source), transform);

    let admitted = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.handle("/a/100x100.jpg", None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let waiter = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.handle("/a/100x100.jpg", None).await })
    };

    // The admitted render hits the failing first fetch.
    let err = admitted.await.unwrap().unwrap_err();
    assert!(matches!(err, ServeError::Upstream(_)));

    // The waiter wakes to a cache miss and renders on its own.
    let served = waiter.await.unwrap().unwrap();
    assert_eq!(body_bytes(served).await, Bytes::from_static(b"render-1"));
    assert_eq!(source.calls(), 2);
}

// =========================================================================
// Through and dest hooks
// =========================================================================

#[tokio::test]
async fn through_hook_wraps_output_and_result_is_cached() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let through = Arc::new(TagThrough::new());
    let hooks = Hooks::new(Arc::clone(&source) as Arc<dyn Source>)
        .with_transform(Arc::clone(&transform) as Arc<dyn ImageTransform>)
        .with_through(Arc::clone(&through) as Arc<dyn Through>);
    let proxy = Proxy::new(square_source_config(), hooks);

    let first = body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    assert_eq!(first, Bytes::from_static(b"render-1+through"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    assert_eq!(second, first);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn cropped_flag_reaches_hooks() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let through = Arc::new(TagThrough::new());
    let hooks = Hooks::new(Arc::clone(&source) as Arc<dyn Source>)
        .with_transform(Arc::clone(&transform) as Arc<dyn ImageTransform>)
        .with_through(Arc::clone(&through) as Arc<dyn Through>);
    let proxy = Proxy::new(square_source_config(), hooks);

    // 250x300 from a 500x500 source needs a horizontal crop.
    body_bytes(proxy.handle("/a/250x300.jpg", None).await.unwrap()).await;
    assert_eq!(*through.cropped_seen.lock().unwrap(), Some(true));

    // 250x250 from a 500x500 source is a straight resize.
    body_bytes(proxy.handle("/b/250x250.jpg", None).await.unwrap()).await;
    assert_eq!(*through.cropped_seen.lock().unwrap(), Some(false));
}

#[tokio::test]
async fn dest_sink_receives_a_copy_of_the_delivered_bytes() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let written = Arc::new(Mutex::new(Vec::new()));
    let dest = Arc::new(BufferDest {
        written: Arc::clone(&written),
        fail_open: false,
    });
    let hooks = Hooks::new(Arc::clone(&source) as Arc<dyn Source>)
        .with_transform(Arc::clone(&transform) as Arc<dyn ImageTransform>)
        .with_dest(dest as Arc<dyn Dest>);
    let proxy = Proxy::new(square_source_config(), hooks);

    let body = body_bytes(proxy.handle("/a/100x100.jpg", None).await.unwrap()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(&written.lock().unwrap()[..], &body[..]);
}

#[tokio::test]
async fn dest_open_failure_is_500() {
    let source = Arc::new(MockSource::new());
    let transform = Arc::new(MockTransform::new(Dimensions { width: 500, height: 500 }));
    let dest = Arc::new(BufferDest {
        written: Arc::new(Mutex::new(Vec::new())),
        fail_open: true,
    });
    let hooks = Hooks::new(Arc::clone(&source) as Arc<dyn Source>)
        .with_transform(Arc::clone(&transform) as Arc<dyn ImageTransform>)
        .with_dest(dest as Arc<dyn Dest>);
    let proxy = Proxy::new(square_source_config(), hooks);

    let err = proxy.handle("/a/100x100.jpg", None).await.unwrap_err();
    assert!(matches!(&err, ServeError::Upstream(_)));
    assert_eq!(err.status(), 500);
}
