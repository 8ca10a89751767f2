//! Read-through proxy: request router, upstream adapters, retry engine,
//! upstream health, fallbacks, and single-flight coalescing.

pub mod fallback;
pub mod health;
pub mod retry;
pub mod router;
pub mod singleflight;
pub mod upstream;

pub use fallback::{BackupUpstreamFallback, FallbackStrategy, StaleCacheFallback};
pub use health::{HealthMonitor, UpstreamHealth, UpstreamStatus};
pub use retry::{ErrorClass, FetchFailure, RetryPolicy};
pub use router::{LocalArtifactSource, ProxyRouter};
pub use singleflight::{Flight, FlightGroup};
pub use upstream::{AdapterRegistry, UpstreamAdapter, UpstreamResponse};

use bytes::Bytes;

use crate::cache::CacheSource;

/// Final result of a routed request.
#[derive(Debug, Clone)]
pub struct ProxyOutcome {
    pub bytes: Bytes,
    pub source: CacheSource,
    pub content_type: Option<String>,
    /// Served past its TTL by the stale-cache fallback.
    pub stale: bool,
}
