//! # Reframe
//!
//! An HTTP image-resizing proxy. A request path encodes the target size
//! (`/photos/dog/200x300.jpg`); reframe fetches the original through a
//! pluggable source, computes the resize/crop geometry, streams the derived
//! image to the client, and caches the result in memory so repeated
//! requests never recompute it.
//!
//! # Architecture: Request Lifecycle Engine
//!
//! Every request runs a five-stage pipeline with a cache and a
//! single-flight admission gate in front of it:
//!
//! ```text
//! request path
//!   │  allow-list gate (400 before any work)
//!   ├─ cache hit ──────────────→ conditional check → 304 or cached bytes
//!   └─ cache miss → coalescer ─→ admitted: FETCH → CHECK_MODIFIED →
//!                     │            PROBE → TRANSFORM → DELIVER (tee → cache)
//!                     └─ waiter: wait for in-flight render, re-check cache
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`geometry`] | Pure path parsing and resize/crop planning — no I/O |
//! | [`cache`] | TTL-bounded in-memory store of rendered responses |
//! | [`coalesce`] | One in-flight render per cache key; RAII release |
//! | [`pipeline`] | The five-stage state machine and the [`Proxy`](pipeline::Proxy) |
//! | [`hooks`] | Capability traits a deployment wires in: source, through, dest |
//! | [`transform`] | The transform seam and its fixed quality policy |
//! | [`imaging`] | Default transform backend on the `image` crate |
//! | [`config`] | Explicit configuration structure with deployment defaults |
//! | [`server`] | Thin axum gateway: path → cache key → status/headers |
//!
//! # Design Decisions
//!
//! ## The path is the cache key
//!
//! The raw request path keys both the response cache and the coalescer's
//! in-flight table; query strings and headers never vary a derived image.
//! One render per path, everyone else waits or reads the cache.
//!
//! ## Errors are values, faults are per-request
//!
//! The pipeline is an explicit `Result` state machine mapped onto a small
//! taxonomy (400/304/404/500). Nothing a single request does — a hook
//! failure, a decode error, a client hanging up mid-stream — can leak into
//! another request's state. In-flight markers are released by RAII, so an
//! aborted connection can never strand the requests coalesced behind it.
//!
//! ## No upscaling, no retries, no timeouts
//!
//! A target larger than the source is a 404, not a blurry upscale. Hook
//! calls are single-attempt; retry and timeout policy belong to the
//! deployment wrapping its hooks, not to this engine.

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod geometry;
pub mod hooks;
pub mod imaging;
pub mod pipeline;
pub mod server;
pub mod transform;
