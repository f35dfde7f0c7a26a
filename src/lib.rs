#![doc = include_str!("../README.md")]

/// Engine-wide configuration and the domain retry-timer table
pub mod config;
/// Crawler orchestration: fetch workers, scheduler promoter, update sweeper
pub mod crawler;
/// Per-domain reachability, backoff and blocking state
pub mod domain;
/// Error messages returned by this library
pub mod error;
/// Performs a single HTTPS JSON-LD fetch and classifies the outcome
pub mod fetcher;
/// Interprets fetched ActivityStreams documents and drives discovery/scheduling
pub mod handler;
/// HTTP surface for the Lookup service
pub mod lookup;
/// In-memory reference storage backend used by the CLI binaries
pub mod memstore;
/// Persisted URI queue rows and states
pub mod queue;
/// In-memory two-level ready queue built on top of the persistent [`queue`] store
pub mod scheduler;
/// Canonical actor envelope and the RSA-SHA256 sign/verify worker pool
pub mod signatures;
/// Process-wide event counters backing the `/status` endpoints
pub mod stats;
/// Typed storage contract the core consumes; no concrete SQL backend is provided
pub mod storage;
/// Worker loop that re-fetches, compares, signs and submits actor records to a Lookup
pub mod verifier;
/// Resolves `acct:user@host` identifiers via WebFinger, with host-meta fallback
pub mod webfinger;

/// Mime type for ActivityPub JSON-LD documents, advertised in `Accept` headers
pub static AS_JSON_CONTENT_TYPE: &str =
    r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams""#;

/// Mime type used for `Accept` headers alongside [`AS_JSON_CONTENT_TYPE`]
pub static ACTIVITY_JSON_CONTENT_TYPE: &str = "application/activity+json";
