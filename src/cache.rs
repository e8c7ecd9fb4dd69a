//! In-memory response cache for rendered images.
//!
//! Rendering is the expensive part of serving a derived image — a source
//! fetch plus a decode/resize/encode round trip. This module keeps the final
//! response bytes in memory so repeated requests for the same derived image
//! are answered without touching the source or transform capabilities.
//!
//! # Design
//!
//! Keys are raw request paths (query string excluded), the same key the
//! [coalescer](crate::coalesce) uses for its in-flight table. Two logically
//! different deployments serving the same path would collide, but per-request
//! variation does not exist in this system, so the path is the full identity
//! of a derived image.
//!
//! Entries carry the rendered payload plus the header-relevant metadata
//! (last-modified timestamp, server/client cache durations). The entry TTL is
//! an independent, cache-internal expiry: it bounds how long a render is
//! reused in-process and has nothing to do with the `Cache-Control` durations
//! sent to clients.
//!
//! Expiry is check-on-read: an expired entry is treated as absent and removed
//! by the `get` that observes it. There is no background sweep. Once absent,
//! an entry never resurrects — `put` always stores a fresh render wholesale.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// A fully rendered response, ready to serve.
///
/// Returned by value from [`ResponseCache::get`]; the payload is [`Bytes`]
/// so the clone is a refcount bump, and callers can never mutate the stored
/// entry in place.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// The rendered image bytes.
    pub payload: Bytes,
    /// Last-modified timestamp of the source at render time.
    pub last_modified: SystemTime,
    /// `s-maxage` seconds the response was rendered with.
    pub server_cache_duration: u64,
    /// `max-age` seconds the response was rendered with.
    pub client_cache_duration: u64,
}

struct StoredEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// Key → rendered-response store with per-entry TTL.
///
/// Safe to share across request tasks: the map sits behind a [`Mutex`] and
/// both operations hold it only for the lookup/insert itself.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, StoredEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    /// Create a cache whose entries expire `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a rendered response. Expired entries are treated as absent
    /// and evicted on the spot.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.response.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a rendered response, replacing any previous entry wholesale.
    pub fn put(&self, key: &str, response: CachedResponse) {
        let entry = StoredEntry {
            response,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().unwrap().insert(key.to_string(), entry);
    }

    /// Number of entries currently held, live or expired. Test support.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
