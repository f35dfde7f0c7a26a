//! Typed storage contracts the core consumes
//!
//! No SQL backend ships in this crate; a concrete implementation (Postgres,
//! SQLite, ...) lives outside it and implements these traits.

use crate::domain::DomainState;
use async_trait::async_trait;
use serde_json::Value;

/// The kind of object an archived document represents, used only to decide
/// which archival table a row belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A `Person`/`Application`/`Group`/`Service` actor document.
    Actor,
    /// A collection or collection page, archived only when
    /// [`crate::config::EngineConfig::archive_collections`] is set.
    Feed,
    /// Anything else archived (e.g. a `Note`), gated by
    /// [`crate::config::EngineConfig::archive_notes`].
    Other,
}

/// Persisted per-domain reachability row.
#[derive(Debug, Clone)]
pub struct DomainRow {
    /// The domain name (host).
    pub domain: String,
    /// Epoch seconds before which no request may be issued.
    pub next_req: f64,
    /// Consecutive temporary-failure count.
    pub fail_streak: u32,
    /// Current reachability state.
    pub state: DomainState,
}

/// Per-domain reachability persistence, read once at crawler startup and
/// written whenever a domain's backoff state changes.
#[async_trait]
pub trait DomainStorage: Send + Sync {
    /// Load every known domain row, used to seed the in-memory domain table
    /// at startup.
    async fn get_all(&self) -> anyhow::Result<Vec<DomainRow>>;

    /// Persist an updated backoff state for `domain`.
    async fn update(&self, domain: &str, fail_streak: u32, next_req: f64) -> anyhow::Result<()>;

    /// Persist a domain's reachability state transition.
    async fn update_state(&self, domain: &str, state: DomainState) -> anyhow::Result<()>;
}

/// Archival storage for fetched documents. Gated entirely behind
/// [`crate::config::EngineConfig::archive_notes`] /
/// [`crate::config::EngineConfig::archive_collections`]; actors are archived
/// unconditionally since they carry the signable envelope.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Archive `value` under `oid`, tagged with `kind` and, for actors, the
    /// resolved WebFinger aux payload.
    async fn insert(
        &self,
        oid: &str,
        value: &Value,
        kind: ObjectKind,
        aux: Option<&Value>,
    ) -> anyhow::Result<()>;

    /// Look up a previously archived document by id and its aux payload
    /// (e.g. `{"webfinger": ...}` for actors), used by the Lookup `/get`
    /// and `/actors*` endpoints.
    async fn get(&self, oid: &str) -> anyhow::Result<Option<(Value, Option<Value>)>>;
}

/// Maps resolved WebFinger `acct:` identifiers to the actor id they point at.
#[async_trait]
pub trait AliasStorage: Send + Sync {
    /// Record that `webfinger` resolves to `oid`.
    async fn insert(&self, webfinger: &str, oid: &str) -> anyhow::Result<()>;

    /// Look up the actor id `webfinger` was last recorded as resolving to.
    async fn resolve(&self, webfinger: &str) -> anyhow::Result<Option<String>>;
}

/// A verifier-submitted signature over an actor's canonical envelope,
/// attached to the actor in storage and surfaced by `/get`.
#[derive(Debug, Clone)]
pub struct KeySignature {
    /// The verifier's actor uri.
    pub signed_by: String,
    /// Base64-encoded RSA-SHA256 signature.
    pub signature: String,
    /// Epoch seconds the signature was produced at.
    pub signature_time: i64,
}

/// Tracks which actors each registered verifier has and hasn't signed yet,
/// and stores submitted signatures idempotently per (verifier, actor)
/// (the `/actors/to_sign` and `/actors/sign` endpoints).
#[async_trait]
pub trait SignatureStorage: Send + Sync {
    /// Get or create a verifier id for `uri`.
    async fn register_verifier(&self, uri: &str) -> anyhow::Result<i64>;

    /// Resolve a verifier id back to its uri.
    async fn verifier_uri(&self, verifier_id: i64) -> anyhow::Result<Option<String>>;

    /// Up to `limit` actor uris `verifier_id` has not yet signed.
    async fn unsigned_for_verifier(&self, verifier_id: i64, limit: usize) -> anyhow::Result<Vec<String>>;

    /// Record a signature. Idempotent: resubmitting the same
    /// (verifier_id, uri) pair overwrites rather than duplicates.
    async fn record_signature(
        &self,
        verifier_id: i64,
        uri: &str,
        signature: &str,
        signature_time: i64,
    ) -> anyhow::Result<()>;

    /// All signatures recorded against `uri`, for embedding in `/get`
    /// responses.
    async fn signatures_for(&self, uri: &str) -> anyhow::Result<Vec<KeySignature>>;
}

/// Aggregate storage contract the Lookup crawler consumes: the URI queue plus
/// domain, object, alias and signature bookkeeping.
pub trait LookupStorage:
    crate::queue::QueueStorage + DomainStorage + ObjectStorage + AliasStorage + SignatureStorage
{
}

impl<T> LookupStorage for T where
    T: crate::queue::QueueStorage + DomainStorage + ObjectStorage + AliasStorage + SignatureStorage
{
}

/// A candidate actor pulled from the verifier's local re-check queue or from
/// a Lookup's `/actors` feed, carrying whatever the verifier already knows
/// about it.
#[derive(Debug, Clone)]
pub struct VerifyCandidate {
    /// The actor's id (also its fetch URI).
    pub uri: String,
    /// The page this candidate came from, if discovered via `/actors?page=N`.
    pub page: Option<u64>,
    /// The actor JSON as last reported by the Lookup, if already fetched.
    pub json: Option<Value>,
    /// The aux payload (e.g. `{"webfinger": ...}`) associated with `json`.
    pub aux: Option<Value>,
    /// Consecutive fetch-failure count for this candidate.
    pub fails: u32,
}

/// A discrepancy recorded between a Lookup's cached copy of an actor and what
/// the verifier observed on re-fetch. Kept as a durable audit trail distinct
/// from the immediate sign-or-reject decision (spec supplemented feature).
#[derive(Debug, Clone)]
pub struct Difference {
    /// The Lookup instance the cached copy came from.
    pub lookup: String,
    /// The actor's id.
    pub uri: String,
    /// The Lookup's cached JSON.
    pub cached: Value,
    /// The freshly re-fetched JSON.
    pub observed: Value,
    /// Epoch seconds the discrepancy was recorded at.
    pub recorded_at: f64,
}

/// Per-(lookup, domain) fetch bookkeeping the verifier's [`crate::verifier`]
/// bounded fetcher persists across restarts.
#[derive(Debug, Clone, Default)]
pub struct VerifierDomainRow {
    /// Consecutive fetch-failure count.
    pub fails: u32,
    /// Epoch seconds before which this domain should not be retried.
    pub next_try: f64,
}

/// Storage contract the Verifier worker consumes: its local re-check queue,
/// per-lookup pagination cursor, per-domain backoff, and the differences
/// audit trail.
#[async_trait]
pub trait VerifierStorage: Send + Sync {
    /// Add or refresh a candidate in the local re-check queue for `lookup`.
    #[allow(clippy::too_many_arguments)]
    async fn add_to_queue(
        &self,
        lookup: &str,
        uri: &str,
        next_fetch: f64,
        fails: u32,
        json: Option<&Value>,
        aux: Option<&Value>,
    ) -> anyhow::Result<()>;

    /// Pull up to `limit` candidates due at or before `now` from the local
    /// re-check queue for `lookup`.
    async fn get_from_queue(
        &self,
        lookup: &str,
        now: f64,
        limit: usize,
    ) -> anyhow::Result<Vec<VerifyCandidate>>;

    /// Remove a candidate from the local re-check queue once it's been
    /// resolved (signed, permanently failed, or handed back to a page).
    async fn remove_from_queue(&self, lookup: &str, uri: &str) -> anyhow::Result<()>;

    /// Mark a candidate as actively being processed, so a concurrent sweep
    /// doesn't re-dispatch it.
    async fn set_active(&self, lookup: &str, uri: &str) -> anyhow::Result<()>;

    /// The `/actors?page=N` cursor to resume from for `lookup`.
    async fn get_next_page(&self, lookup: &str) -> anyhow::Result<u64>;

    /// Persist an updated `/actors?page=N` cursor for `lookup`.
    async fn set_next_page(&self, lookup: &str, page: u64) -> anyhow::Result<()>;

    /// Load the bounded fetcher's per-domain backoff table.
    async fn get_domains_dict(&self) -> anyhow::Result<std::collections::HashMap<String, VerifierDomainRow>>;

    /// Persist an updated per-domain backoff state.
    async fn set_domain_state(&self, domain: &str, next_try: f64, fails: u32) -> anyhow::Result<()>;

    /// Append a recorded discrepancy to the audit trail.
    async fn insert_difference(&self, difference: Difference) -> anyhow::Result<()>;
}
