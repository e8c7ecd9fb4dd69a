//! Proxy configuration.
//!
//! An explicit structure, not an option bag: every knob the proxy honors is
//! a named field with a default matching a conventional deployment. The
//! external capability hooks travel separately in
//! [`Hooks`](crate::hooks::Hooks) — they are wiring, not tuning.

use std::time::Duration;

/// Construction-time configuration for [`Proxy`](crate::pipeline::Proxy).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Extensions the proxy will serve, lower-cased with leading dot.
    /// Requests for anything else are rejected with 400 before any
    /// coalescing or pipeline work.
    pub allowed_extensions: Vec<String>,
    /// `s-maxage` seconds advertised to shared caches. Default one month.
    pub server_cache_duration: u64,
    /// `max-age` seconds advertised to clients. Default one hour.
    pub client_cache_duration: u64,
    /// Whether rendered responses are kept in the in-memory cache. With
    /// this off, every request renders independently (no coalescing
    /// either — there is no cached result for a waiter to pick up).
    pub memory_cache: bool,
    /// How long a cached render is reused before it expires. Independent
    /// of the HTTP cache durations above.
    pub memory_cache_ttl: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: vec![".png".to_string(), ".jpg".to_string()],
            server_cache_duration: 2_628_000,
            client_cache_duration: 3_600,
            memory_cache: true,
            memory_cache_ttl: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    /// True if the extension (lower-cased, with dot) is on the allow-list.
    pub fn allows_extension(&self, extension: &str) -> bool {
        self.allowed_extensions.iter().any(|e| e == extension)
    }
}
