//! Process-wide event counters backing the `/status` endpoints

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single named counter, safe to increment from any number of concurrent
/// fetch workers without locking.
#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Event counters maintained by the Lookup crawler for the duration of the
/// process. Reset only by restarting the process; nothing here is persisted.
#[derive(Default)]
pub struct LookupStats {
    fetched: Counter,
    failed: Counter,
    temporary_failures: Counter,
    redirected: Counter,
    domains_auto_blocked: Counter,
    domains_marked_unreachable: Counter,
    queue_inserts: Counter,
}

impl LookupStats {
    /// Record a successful fetch.
    pub fn record_fetched(&self) {
        self.fetched.inc();
    }

    /// Record a terminal fetch failure.
    pub fn record_failed(&self) {
        self.failed.inc();
    }

    /// Record a retriable fetch failure.
    pub fn record_temporary_failure(&self) {
        self.temporary_failures.inc();
    }

    /// Record that a fetched object pointed elsewhere.
    pub fn record_redirected(&self) {
        self.redirected.inc();
    }

    /// Record a domain crossing into `AutoBlocked`.
    pub fn record_domain_auto_blocked(&self) {
        self.domains_auto_blocked.inc();
    }

    /// Record a domain crossing into `Unreachable`.
    pub fn record_domain_unreachable(&self) {
        self.domains_marked_unreachable.inc();
    }

    /// Record a newly discovered URI being queued.
    pub fn record_queue_insert(&self) {
        self.queue_inserts.inc();
    }

    /// Snapshot the current counter values for serialization.
    pub fn snapshot(&self) -> LookupStatsSnapshot {
        LookupStatsSnapshot {
            fetched: self.fetched.get(),
            failed: self.failed.get(),
            temporary_failures: self.temporary_failures.get(),
            redirected: self.redirected.get(),
            domains_auto_blocked: self.domains_auto_blocked.get(),
            domains_marked_unreachable: self.domains_marked_unreachable.get(),
            queue_inserts: self.queue_inserts.get(),
        }
    }
}

/// A point-in-time copy of [`LookupStats`], returned by the `/status` endpoint.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct LookupStatsSnapshot {
    /// Successful fetches since process start.
    pub fetched: u64,
    /// Terminal fetch failures since process start.
    pub failed: u64,
    /// Retriable fetch failures since process start.
    pub temporary_failures: u64,
    /// Redirects observed since process start.
    pub redirected: u64,
    /// Domains auto-blocked since process start.
    pub domains_auto_blocked: u64,
    /// Domains marked unreachable since process start.
    pub domains_marked_unreachable: u64,
    /// URIs newly queued since process start.
    pub queue_inserts: u64,
}

/// Event counters maintained by the Verifier worker loop.
#[derive(Default)]
pub struct VerifierStats {
    signed: Counter,
    rejected: Counter,
    fetch_failures: Counter,
    pushed: Counter,
}

impl VerifierStats {
    /// Record a signature produced and queued for submission.
    pub fn record_signed(&self) {
        self.signed.inc();
    }

    /// Record a candidate rejected because the two fetches diverged or lacked
    /// a public key.
    pub fn record_rejected(&self) {
        self.rejected.inc();
    }

    /// Record a fetch failure while re-crawling a candidate.
    pub fn record_fetch_failure(&self) {
        self.fetch_failures.inc();
    }

    /// Record a signature successfully submitted to a Lookup instance.
    pub fn record_pushed(&self) {
        self.pushed.inc();
    }

    /// Snapshot the current counter values for serialization.
    pub fn snapshot(&self) -> VerifierStatsSnapshot {
        VerifierStatsSnapshot {
            signed: self.signed.get(),
            rejected: self.rejected.get(),
            fetch_failures: self.fetch_failures.get(),
            pushed: self.pushed.get(),
        }
    }
}

/// A point-in-time copy of [`VerifierStats`], returned by the `/status` endpoint.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct VerifierStatsSnapshot {
    /// Signatures produced since process start.
    pub signed: u64,
    /// Candidates rejected since process start.
    pub rejected: u64,
    /// Fetch failures encountered while re-crawling since process start.
    pub fetch_failures: u64,
    /// Signatures submitted to a Lookup since process start.
    pub pushed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let stats = LookupStats::default();
        assert_eq!(stats.snapshot().fetched, 0);
        stats.record_fetched();
        stats.record_fetched();
        assert_eq!(stats.snapshot().fetched, 2);
    }
}
