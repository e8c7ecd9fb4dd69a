//! External capability hooks consumed by the pipeline.
//!
//! The proxy core knows nothing about where images come from or where copies
//! go. Deployments wire in:
//!
//! - [`Source`] (required) — fetches the original image bytes for a request.
//! - [`Through`] (optional) — a post-processing stage spliced into the
//!   output stream before delivery.
//! - [`Dest`] (optional) — a secondary sink that receives a copy of the
//!   final bytes (e.g. an upload to blob storage).
//!
//! Hook errors are opaque [`anyhow`] errors; the pipeline maps every one of
//! them to an upstream failure (HTTP 500) and never retries. Timeouts are a
//! deployment concern: wrap your hook in one if the backing store needs it.

use crate::geometry::ResizeRequest;
use crate::transform::ImageTransform;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWrite;

/// Byte stream flowing through the delivery stages.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// What a source hands back: either the whole image up front or a stream
/// the pipeline collects before probing.
pub enum SourceBody {
    Buffer(Bytes),
    Stream(ByteStream),
}

/// The byte source capability.
#[async_trait]
pub trait Source: Send + Sync {
    /// Fetch the source image for a request.
    ///
    /// `Ok(None)` means the image does not exist (HTTP 404). The timestamp
    /// is the source's last-modified time, used for conditional requests
    /// and the `Last-Modified` response header.
    async fn fetch(&self, request: &ResizeRequest)
    -> anyhow::Result<Option<(SourceBody, SystemTime)>>;
}

/// Optional post-processing stage over the output stream.
pub trait Through: Send + Sync {
    /// Wrap the output stream. Return `stream` unchanged to pass through.
    ///
    /// The request is fully processed by the time this runs: `cropped` is
    /// set and the cache durations are stamped.
    fn attach(&self, request: &ResizeRequest, stream: ByteStream) -> ByteStream;
}

/// Optional secondary output sink.
#[async_trait]
pub trait Dest: Send + Sync {
    /// Open a writer that will receive a copy of the final bytes, or
    /// `Ok(None)` to decline this request.
    ///
    /// An open failure fails the whole request (HTTP 500). A write failure
    /// after streaming has begun only drops the sink — the client response
    /// is already under way.
    async fn open(
        &self,
        request: &ResizeRequest,
    ) -> anyhow::Result<Option<Box<dyn AsyncWrite + Send + Unpin>>>;
}

/// The capability bundle handed to [`Proxy::new`](crate::pipeline::Proxy::new).
///
/// Only the source is mandatory. The transform slot exists so tests can
/// substitute a fake; when `None`, the proxy uses the built-in
/// [`RasterTransform`](crate::imaging::RasterTransform).
pub struct Hooks {
    pub source: Arc<dyn Source>,
    pub transform: Option<Arc<dyn ImageTransform>>,
    pub through: Option<Arc<dyn Through>>,
    pub dest: Option<Arc<dyn Dest>>,
}

impl Hooks {
    pub fn new(source: Arc<dyn Source>) -> Self {
        Self {
            source,
            transform: None,
            through: None,
            dest: None,
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn ImageTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_through(mut self, through: Arc<dyn Through>) -> Self {
        self.through = Some(through);
        self
    }

    pub fn with_dest(mut self, dest: Arc<dyn Dest>) -> Self {
        self.dest = Some(dest);
        self
    }
}
