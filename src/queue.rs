//! Persisted URI queue rows and states
//!
//! The core never speaks SQL directly; it consumes [`QueueStorage`], a typed
//! async contract a concrete backend implements. No backend ships in this
//! crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Lifecycle state of a single queued URI. Numeric discriminants are stable
/// and stored verbatim by backends that persist the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum QueueState {
    /// Discovered via a priority source (e.g. an explicit `--from` seed); admitted
    /// ahead of plain `Waiting` rows.
    WaitingPriority = 2,
    /// Discovered and awaiting a free scheduler slot.
    Waiting = 1,
    /// Claimed by a fetch worker; in flight.
    Processing = -1,
    /// Claimed by a fetch worker from a priority source; in flight.
    ProcessingPriority = -2,
    /// Most recent fetch attempt was terminal.
    Failed = -3,
    /// Most recent fetch attempt succeeded.
    Fetched = -4,
    /// The object has moved; `aux` carries the new location.
    Redirected = -5,
    /// Excluded from scheduling, either by operator action or auto-block.
    Blocked = -6,
}

impl QueueState {
    /// True for the two `Processing*` variants, used at startup to find rows
    /// left in flight by an unclean shutdown.
    pub fn is_processing(self) -> bool {
        matches!(self, QueueState::Processing | QueueState::ProcessingPriority)
    }

    /// True for the two `Waiting*` variants.
    pub fn is_waiting(self) -> bool {
        matches!(self, QueueState::Waiting | QueueState::WaitingPriority)
    }

    /// The `Waiting*` counterpart of a `Processing*` state, used when rewriting
    /// in-flight rows back to schedulable ones after a crash.
    pub fn rewound(self) -> QueueState {
        match self {
            QueueState::Processing => QueueState::Waiting,
            QueueState::ProcessingPriority => QueueState::WaitingPriority,
            other => other,
        }
    }

    /// The `Processing*` counterpart of a `Waiting*` state, used when a
    /// scheduler slot claims a row.
    pub fn claimed(self) -> QueueState {
        match self {
            QueueState::Waiting => QueueState::Processing,
            QueueState::WaitingPriority => QueueState::ProcessingPriority,
            other => other,
        }
    }
}

/// A single row of the persisted URI queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRow {
    /// Opaque row identifier assigned by storage.
    pub queue_id: i64,
    /// The URI to fetch.
    pub uri: String,
    /// `uri`'s host, denormalized for domain-scoped queries.
    pub domain: String,
    /// The URI that referenced `uri` when it was first discovered, if any.
    pub found_in: Option<String>,
    /// Current lifecycle state.
    pub state: QueueState,
    /// Epoch seconds after which this row becomes eligible for refetch.
    pub next_update: f64,
    /// Epoch seconds of the most recent state transition.
    pub update_time: f64,
    /// Digest of the last successfully fetched body, used to detect
    /// unchanged content across refetches.
    pub hash: Option<String>,
    /// State-specific payload: the new location for `Redirected` rows, the
    /// failure message for `Failed` rows.
    pub aux: Option<String>,
}

impl QueueRow {
    /// Parses [`QueueRow::domain`] back into a [`url::Host`]-bearing [`Url`],
    /// falling back to re-parsing [`QueueRow::uri`] if `domain` was stored
    /// without a scheme.
    pub fn parsed_uri(&self) -> Option<Url> {
        Url::parse(&self.uri).ok()
    }
}

/// Async storage contract the crawler and scheduler consume. Implementations
/// own all persistence and MUST make state transitions atomic with respect to
/// concurrent callers.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Insert `uri` in `Waiting` (or `WaitingPriority` if `priority`) state if
    /// it is not already present; a no-op (not a downgrade) if a row for `uri`
    /// already exists, regardless of its current state: never downgrades an
    /// existing `Blocked` row back to `Waiting`.
    async fn add_if_not_visited(
        &self,
        uri: &str,
        found_in: Option<&str>,
        priority: bool,
    ) -> anyhow::Result<()>;

    /// Insert `uri` directly in `Blocked` state, used when the owning domain
    /// already forbids scheduling at discovery time.
    async fn add_blocked(&self, uri: &str, found_in: Option<&str>) -> anyhow::Result<()>;

    /// Atomically claim up to `limit` `Waiting*` rows for `domain`, flipping
    /// each to its `claimed()` counterpart, and return them.
    async fn claim_from_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<QueueRow>>;

    /// Atomically claim up to `limit` `Waiting*` rows chosen at random across
    /// all domains, flipping each to its `claimed()` counterpart.
    async fn claim_random(&self, limit: usize) -> anyhow::Result<Vec<QueueRow>>;

    /// List domains that currently have at least one `Waiting*` row, up to
    /// `limit` domains.
    async fn waiting_domains(&self, limit: usize) -> anyhow::Result<Vec<String>>;

    /// Rewrite `uri`'s state, keeping its current `next_update`/`hash`/`aux`.
    async fn update_state(&self, uri: &str, state: QueueState) -> anyhow::Result<()>;

    /// Rewrite `uri`'s state together with its next scheduled update time and
    /// content hash, used when a refetch confirms or updates an archivable
    /// object.
    async fn update_state_time_and_hash(
        &self,
        uri: &str,
        state: QueueState,
        next_update_in: f64,
        hash: &str,
    ) -> anyhow::Result<()>;

    /// Insert a row directly in `Fetched` state for an object discovered by
    /// reference from a trusted document, rather than via the normal
    /// discover-then-fetch path (the "fetched by redirect" case).
    async fn insert_fetched(
        &self,
        uri: &str,
        found_in: Option<&str>,
        next_update_in: f64,
    ) -> anyhow::Result<()>;

    /// Record a terminal or retriable outcome for `uri`, with the next
    /// eligible retry time and an optional aux payload (failure message or
    /// redirect target).
    async fn update_state_with_retry(
        &self,
        uri: &str,
        state: QueueState,
        next_update: f64,
        aux: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Fetch a single row by uri, used by the Lookup HTTP surface's `/get`
    /// endpoint and by tests.
    async fn get_by_uri(&self, uri: &str) -> anyhow::Result<Option<QueueRow>>;

    /// Fetch the element currently cached for `uri` without claiming it,
    /// used purely to check existence and current hash/update_time.
    async fn get_element(&self, uri: &str) -> anyhow::Result<Option<QueueRow>> {
        self.get_by_uri(uri).await
    }

    /// Find every row currently in a `Processing*` state, used at startup to
    /// rewind rows an unclean shutdown left in flight.
    async fn processing_rows(&self) -> anyhow::Result<Vec<QueueRow>>;

    /// Rewrite a row's state by uri without touching `next_update`, used for
    /// the startup rewind above and for operator-driven blocking.
    async fn set_state(&self, uri: &str, state: QueueState) -> anyhow::Result<()>;

    /// Flip every `Fetched` row whose `next_update` has passed back to
    /// `WaitingPriority`, making it due for refetch.
    async fn set_next_to_update(&self) -> anyhow::Result<()>;

    /// Return the `page`-th page (0-indexed, `page_size` rows per page) of
    /// `Fetched` actor rows in stable `queue_id` order, backing the Lookup
    /// `/actors` pagination.
    async fn page_fetched(&self, page: u64, page_size: usize) -> anyhow::Result<Vec<QueueRow>>;

    /// Total number of `Fetched` actor rows, used to compute `page_count`.
    async fn fetched_count(&self) -> anyhow::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewound_only_affects_processing() {
        assert_eq!(QueueState::Processing.rewound(), QueueState::Waiting);
        assert_eq!(
            QueueState::ProcessingPriority.rewound(),
            QueueState::WaitingPriority
        );
        assert_eq!(QueueState::Failed.rewound(), QueueState::Failed);
    }

    #[test]
    fn claimed_only_affects_waiting() {
        assert_eq!(QueueState::Waiting.claimed(), QueueState::Processing);
        assert_eq!(
            QueueState::WaitingPriority.claimed(),
            QueueState::ProcessingPriority
        );
        assert_eq!(QueueState::Blocked.claimed(), QueueState::Blocked);
    }

    #[test]
    fn discriminant_values_match_spec() {
        assert_eq!(QueueState::WaitingPriority as i32, 2);
        assert_eq!(QueueState::Waiting as i32, 1);
        assert_eq!(QueueState::Processing as i32, -1);
        assert_eq!(QueueState::ProcessingPriority as i32, -2);
        assert_eq!(QueueState::Failed as i32, -3);
        assert_eq!(QueueState::Fetched as i32, -4);
        assert_eq!(QueueState::Redirected as i32, -5);
        assert_eq!(QueueState::Blocked as i32, -6);
    }
}
