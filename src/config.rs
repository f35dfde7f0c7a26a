//! Configuration for the crawl engine, with various scheduling and politeness settings
//!
//! Use [`EngineConfig::builder`] to construct one.
//!
//! ```
//! # use trustlookup::config::EngineConfig;
//! let settings = EngineConfig::builder()
//!     .domain("lookup.example".to_string())
//!     .build()
//!     .unwrap();
//! ```

use derive_builder::Builder;
use reqwest_middleware::ClientWithMiddleware;
use std::time::Duration;

/// Configuration for the crawl engine, shared by the fetch workers, scheduler and
/// object handler.
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct EngineConfig {
    /// Local domain this Lookup instance runs under. Used to decide whether a
    /// discovered URI refers to ourselves.
    #[builder(setter(into))]
    pub domain: String,
    /// Allow `http://` URIs and loopback/localhost hosts. Never set in production.
    #[builder(default = "false")]
    pub debug: bool,
    /// HTTP client shared by the Fetcher and WebFinger resolver. Middleware can add
    /// retries or tracing.
    #[builder(default = "reqwest::Client::default().into()")]
    pub client: ClientWithMiddleware,
    /// Minimum time between two requests to the same domain (the politeness window).
    #[builder(default = "Duration::from_secs(2)")]
    pub domain_request_period: Duration,
    /// Total request timeout for a single fetch.
    #[builder(default = "Duration::from_secs(20)")]
    pub request_timeout: Duration,
    /// Connect timeout for a single fetch.
    #[builder(default = "Duration::from_secs(5)")]
    pub connect_timeout: Duration,
    /// Global cap on parallel outbound connections.
    #[builder(default = "100")]
    pub connection_limit: usize,
    /// Number of parallel fetch workers the crawler spawns.
    #[builder(default = "100")]
    pub parallel_fetches: usize,
    /// Maximum number of items held in the in-memory ready queue at once.
    #[builder(default = "10_000")]
    pub max_queue_size: usize,
    /// Maximum number of in-memory ready-queue items per domain.
    #[builder(default = "5")]
    pub max_in_queue_per_domain: usize,
    /// Number of rows fetched from storage in one random-sample admission batch.
    #[builder(default = "1_000")]
    pub scheduler_chunk: usize,
    /// Number of distinct domains considered in one domain-biased admission batch.
    #[builder(default = "100")]
    pub domain_chunk: usize,
    /// Number of rows fetched per domain in a domain-biased admission batch.
    #[builder(default = "5")]
    pub choose_from_domain_queue: usize,
    /// Probability that the scheduler admits from `not_scheduled_domains` rather
    /// than the global random sample.
    #[builder(default = "0.6")]
    pub prob_choose_from_domains: f64,
    /// Minimum time between two successive refetches of the same object.
    #[builder(default = "Duration::from_secs(3600 * 24)")]
    pub min_update_period: Duration,
    /// Maximum time between two successive refetches of the same object.
    #[builder(default = "Duration::from_secs(3600 * 24 * 10)")]
    pub max_update_period: Duration,
    /// If true, persist every received `Note`.
    #[builder(default = "false")]
    pub archive_notes: bool,
    /// If true, persist every received collection and collection page.
    #[builder(default = "false")]
    pub archive_collections: bool,
    /// Period between internet-connectivity probes. `None` disables the probe
    /// (liveness is assumed).
    #[builder(default = "Some(Duration::from_secs(10))")]
    pub check_for_internet_access: Option<Duration>,
    /// Number of worker threads in the signing/verification offload pool.
    #[builder(default = "4")]
    pub sign_worker_count: usize,
}

impl EngineConfig {
    /// Returns a new config builder with default values.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Returns true if `uri`'s host equals our configured domain.
    pub fn is_local(&self, uri: &url::Url) -> bool {
        uri.host_str() == Some(self.domain.as_str())
    }
}

impl EngineConfigBuilder {
    /// Constructs a new config instance with the values supplied to the builder.
    pub fn build(&mut self) -> Result<EngineConfig, EngineConfigBuilderError> {
        self.partial_build()
    }
}

/// Exponential backoff timers for domain-level temporary-failure retries.
///
/// `retry_timers()[i] = min(10 * 5^i, 86400)` for `i` in `[0, 56)`, giving a
/// cumulative envelope of about 50 days before a domain is marked `Unreachable`.
pub fn retry_timers() -> Vec<Duration> {
    (0..56)
        .map(|i: u32| {
            let secs = 10_u64.saturating_mul(5_u64.saturating_pow(i));
            Duration::from_secs(secs.min(86_400))
        })
        .collect()
}
