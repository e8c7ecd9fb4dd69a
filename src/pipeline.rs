//! The per-request render pipeline and the [`Proxy`] that drives it.
//!
//! Every request runs the same five stages, in order, each able to abort
//! the rest:
//!
//! ```text
//! FETCH_SOURCE → CHECK_MODIFIED → PROBE_DIMENSIONS → TRANSFORM → DELIVER
//! ```
//!
//! | Stage | Failure | Status |
//! |---|---|---|
//! | fetch source | hook error / missing image | 500 / 404 |
//! | check modified | client already has it (not a true failure) | 304 |
//! | probe dimensions | transform error | 500 |
//! | transform | upscale required / transform error | 404 / 500 |
//! | deliver | dest-sink open error | 500 |
//!
//! The pipeline is an explicit `Result` state machine: every fault is a
//! value, so a failing request can never corrupt another request's state.
//! Hook calls are single-attempt — no retries live at this layer, and no
//! timeouts either (deployments wrap their hooks if they need them).
//!
//! # Caching and coalescing
//!
//! With the memory cache enabled, a cache hit is served directly — the
//! conditional check runs against the stored timestamp, so even a 304 costs
//! no hook calls. On a miss, admission goes through the
//! [`Coalescer`](crate::coalesce::Coalescer): one render per key, everyone
//! else waits and re-checks. Delivery streams through a pump task that tees
//! bytes into a buffer and populates the cache once the last byte is out;
//! the in-flight marker is released when the pump finishes or the client
//! disconnects, whichever comes first.

use crate::cache::{CachedResponse, ResponseCache};
use crate::coalesce::{Admission, Coalescer, RenderGuard};
use crate::config::ProxyConfig;
use crate::geometry::{ResizeRequest, parse_request, plan_geometry};
use crate::hooks::{ByteStream, Dest, Hooks, Source, SourceBody, Through};
use crate::imaging::RasterTransform;
use crate::transform::ImageTransform;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, warn};

/// Everything that can end a request without a 200.
///
/// `NotModified` rides the error path for convenience — it short-circuits
/// the remaining stages exactly like a failure and, like one, must ship no
/// entity headers — but it is a successful outcome.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("unsupported extension `{0}`")]
    UnsupportedExtension(String),
    #[error("not modified")]
    NotModified,
    #[error("source image not found or target not satisfiable")]
    NotFound,
    #[error("upstream failure: {0}")]
    Upstream(#[source] anyhow::Error),
}

impl ServeError {
    /// The HTTP status this outcome maps to.
    pub fn status(&self) -> u16 {
        match self {
            ServeError::UnsupportedExtension(_) => 400,
            ServeError::NotModified => 304,
            ServeError::NotFound => 404,
            ServeError::Upstream(_) => 500,
        }
    }
}

/// Body of a successful response.
pub enum ResponseBody {
    /// Served from cache: the whole payload up front.
    Full(Bytes),
    /// Freshly rendered: chunks arrive from the delivery pump as they are
    /// teed into the cache buffer.
    Stream(mpsc::Receiver<io::Result<Bytes>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A successful render or cache hit, plus everything the gateway needs to
/// write headers.
#[derive(Debug)]
pub struct ServedImage {
    pub body: ResponseBody,
    pub content_type: &'static str,
    pub cache_control: String,
    pub last_modified: SystemTime,
}

/// The request lifecycle engine. One per process, shared across requests.
pub struct Proxy {
    config: ProxyConfig,
    cache: Arc<ResponseCache>,
    coalescer: Arc<Coalescer>,
    source: Arc<dyn Source>,
    transform: Arc<dyn ImageTransform>,
    through: Option<Arc<dyn Through>>,
    dest: Option<Arc<dyn Dest>>,
}

impl Proxy {
    /// Build a proxy from configuration and capability hooks. A missing
    /// transform hook means the built-in [`RasterTransform`].
    pub fn new(config: ProxyConfig, hooks: Hooks) -> Self {
        let cache = Arc::new(ResponseCache::new(config.memory_cache_ttl));
        Self {
            config,
            cache,
            coalescer: Arc::new(Coalescer::new()),
            source: hooks.source,
            transform: hooks
                .transform
                .unwrap_or_else(|| Arc::new(RasterTransform::new())),
            through: hooks.through,
            dest: hooks.dest,
        }
    }

    /// Serve one request.
    ///
    /// `path` is the raw request path (query string already excluded) and
    /// doubles as the cache key. `modified_since` is the parsed
    /// `If-Modified-Since` header, if the client sent one.
    pub async fn handle(
        &self,
        path: &str,
        modified_since: Option<SystemTime>,
    ) -> Result<ServedImage, ServeError> {
        let mut request = parse_request(path);
        request.modified_since = modified_since;
        request.server_cache_duration = self.config.server_cache_duration;
        request.client_cache_duration = self.config.client_cache_duration;

        // The allow-list gate runs before any coalescing or pipeline work.
        if !self.config.allows_extension(&request.extension) {
            return Err(ServeError::UnsupportedExtension(request.extension));
        }

        if !self.config.memory_cache {
            // No cache means nothing for a waiter to pick up, so no
            // coalescing either: every request renders independently.
            return self.render(path, request, None).await;
        }

        if let Some(cached) = self.cache.get(path) {
            debug!(path, "cache hit");
            return serve_cached(&request, cached);
        }

        loop {
            match self.coalescer.begin(path) {
                Admission::Admitted(guard) => {
                    debug!(path, "admitted for render");
                    return self.render(path, request, Some(guard)).await;
                }
                Admission::Wait(handle) => {
                    debug!(path, "render in flight, waiting");
                    handle.wait().await;
                    if let Some(cached) = self.cache.get(path) {
                        debug!(path, "cache hit after wait");
                        return serve_cached(&request, cached);
                    }
                    // The admitted render failed, skipped population, or
                    // the entry already expired. Try for admission again.
                }
            }
        }
    }

    /// Run the five pipeline stages for one request.
    ///
    /// `guard` is the in-flight marker when this render was admitted
    /// through the coalescer; it travels into the delivery pump so the
    /// marker is held until the response is fully delivered or aborted.
    async fn render(
        &self,
        key: &str,
        mut request: ResizeRequest,
        guard: Option<RenderGuard>,
    ) -> Result<ServedImage, ServeError> {
        // FETCH_SOURCE
        debug!(key, "fetching source");
        let fetched = self
            .source
            .fetch(&request)
            .await
            .map_err(ServeError::Upstream)?;
        let Some((body, last_modified)) = fetched else {
            return Err(ServeError::NotFound);
        };
        let last_modified = truncate_to_seconds(last_modified);

        // CHECK_MODIFIED
        if not_modified(request.modified_since, last_modified) {
            return Err(ServeError::NotModified);
        }
        let source_bytes = collect_body(body).await?;

        // PROBE_DIMENSIONS
        let dimensions = {
            let transform = Arc::clone(&self.transform);
            let bytes = source_bytes.clone();
            let extension = request.extension.clone();
            task::spawn_blocking(move || transform.probe(&bytes, &extension))
                .await
                .map_err(|e| ServeError::Upstream(anyhow::Error::new(e)))?
                .map_err(|e| ServeError::Upstream(anyhow::Error::new(e)))?
        };
        debug!(
            key,
            width = dimensions.width,
            height = dimensions.height,
            "probed source"
        );

        // TRANSFORM
        let Some(plan) = plan_geometry(dimensions, &request) else {
            // Satisfying the target would require upscaling.
            return Err(ServeError::NotFound);
        };
        request.cropped = plan.crop.is_some();
        let output = {
            let transform = Arc::clone(&self.transform);
            let bytes = source_bytes.clone();
            let request = request.clone();
            task::spawn_blocking(move || transform.apply(&bytes, &request, &plan))
                .await
                .map_err(|e| ServeError::Upstream(anyhow::Error::new(e)))?
                .map_err(|e| ServeError::Upstream(anyhow::Error::new(e)))?
        };

        // DELIVER
        let mut output_stream: ByteStream =
            stream::once(std::future::ready(Ok(Bytes::from(output)))).boxed();
        if let Some(through) = &self.through {
            output_stream = through.attach(&request, output_stream);
        }
        let dest = match &self.dest {
            Some(dest) => dest.open(&request).await.map_err(ServeError::Upstream)?,
            None => None,
        };

        let (tx, rx) = mpsc::channel(16);
        let fill = self.config.memory_cache.then(|| CacheFill {
            cache: Arc::clone(&self.cache),
            template: CachedResponse {
                payload: Bytes::new(),
                last_modified,
                server_cache_duration: request.server_cache_duration,
                client_cache_duration: request.client_cache_duration,
            },
        });
        tokio::spawn(pump(
            output_stream,
            dest,
            tx,
            fill,
            key.to_string(),
            guard,
        ));

        Ok(ServedImage {
            body: ResponseBody::Stream(rx),
            content_type: mime_type(&request.extension),
            cache_control: cache_control(
                request.server_cache_duration,
                request.client_cache_duration,
            ),
            last_modified,
        })
    }
}

/// Serve a cache hit, honoring the conditional check against the stored
/// timestamp. No hooks are invoked on this path.
fn serve_cached(
    request: &ResizeRequest,
    cached: CachedResponse,
) -> Result<ServedImage, ServeError> {
    if not_modified(request.modified_since, cached.last_modified) {
        return Err(ServeError::NotModified);
    }
    Ok(ServedImage {
        content_type: mime_type(&request.extension),
        cache_control: cache_control(
            cached.server_cache_duration,
            cached.client_cache_duration,
        ),
        last_modified: cached.last_modified,
        body: ResponseBody::Full(cached.payload),
    })
}

/// Cache-population context carried by the delivery pump.
struct CacheFill {
    cache: Arc<ResponseCache>,
    /// Entry to store once the payload is complete.
    template: CachedResponse,
}

/// Drive the output stream to the client, teeing bytes into the dest sink
/// and the cache buffer.
///
/// Owns the render's in-flight marker: whenever this task ends — complete
/// delivery, stream fault, or the client hanging up — the marker drops and
/// waiters wake. A disconnect is observed as a failed channel send and
/// stops the pull immediately; nothing more is read from the stream chain.
async fn pump(
    mut output_stream: ByteStream,
    mut dest: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    fill: Option<CacheFill>,
    key: String,
    guard: Option<RenderGuard>,
) {
    let mut collected: Vec<u8> = Vec::new();

    while let Some(item) = output_stream.next().await {
        match item {
            Ok(chunk) => {
                if let Some(writer) = dest.as_mut()
                    && let Err(e) = writer.write_all(&chunk).await
                {
                    // Delivery to the client is already under way; the
                    // secondary sink just stops receiving.
                    warn!(key, error = %e, "dest sink write failed, dropping sink");
                    dest = None;
                }
                collected.extend_from_slice(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!(key, "client disconnected mid-stream");
                    return;
                }
            }
            Err(e) => {
                debug!(key, error = %e, "output stream failed mid-delivery");
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    if let Some(mut writer) = dest
        && let Err(e) = writer.shutdown().await
    {
        warn!(key, error = %e, "dest sink close failed");
    }

    if let Some(fill) = fill {
        // Another render may have populated the key while we streamed;
        // first writer stays, content is deterministic per key anyway.
        if fill.cache.get(&key).is_none() {
            let mut entry = fill.template;
            entry.payload = Bytes::from(collected);
            fill.cache.put(&key, entry);
        }
    }

    drop(guard);
}

/// `If-Modified-Since` comparison: at-or-after the last modification means
/// the client's copy is current.
fn not_modified(modified_since: Option<SystemTime>, last_modified: SystemTime) -> bool {
    modified_since.is_some_and(|since| since >= last_modified)
}

/// `Last-Modified` goes over the wire at whole-second granularity, so the
/// pipeline holds the timestamp at the same precision. A client echoing the
/// header back would otherwise always compare behind a nanosecond mtime.
fn truncate_to_seconds(timestamp: SystemTime) -> SystemTime {
    match timestamp.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()),
        Err(_) => timestamp,
    }
}

/// Collect a source body into contiguous bytes for probing and transform.
async fn collect_body(body: SourceBody) -> Result<Bytes, ServeError> {
    match body {
        SourceBody::Buffer(bytes) => Ok(bytes),
        SourceBody::Stream(mut stream) => {
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| ServeError::Upstream(anyhow::Error::new(e)))?;
                buf.extend_from_slice(&chunk);
            }
            Ok(Bytes::from(buf))
        }
    }
}

fn mime_type(extension: &str) -> &'static str {
    match extension {
        ".png" => "image/png",
        ".jpg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn cache_control(server_cache_duration: u64, client_cache_duration: u64) -> String {
    format!("public, s-maxage={server_cache_duration}, max-age={client_cache_duration}")
}
