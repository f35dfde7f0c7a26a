//! Per-domain reachability, backoff and blocking state

use rand::seq::SliceRandom;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

/// Reachability state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum DomainState {
    /// Reachable, no known issues.
    Safe = 0,
    /// Default state for a domain we haven't formed an opinion about yet.
    Unknown = 1,
    /// Exhausted the retry timer table after repeated temporary failures.
    Unreachable = 2,
    /// Automatically blocked because most fetches to it are terminal failures.
    AutoBlocked = 3,
    /// Blocked by an operator. Out of scope for the core to set; the core only
    /// honors it once set externally.
    Blocked = 4,
}

impl DomainState {
    /// Domains at or above this state may not be scheduled, and newly discovered
    /// URIs on them are inserted directly as `Blocked`.
    pub fn forbids_scheduling(self) -> bool {
        self > DomainState::Unknown
    }
}

/// In-memory state for a single domain, seeded from persistent storage at startup
/// and mutated by the crawler's fetch workers and scheduler.
#[derive(Debug, Clone)]
pub struct Domain {
    /// Current reachability state.
    pub state: DomainState,
    /// Consecutive `TemporaryFetchError`s since the last success.
    pub fail_streak: u32,
    /// Epoch seconds before which no request may be issued to this domain.
    pub next_req: f64,
    /// Latched until `next_req` passes; sticky even across scheduler polls within
    /// the same tick so no other worker races to dispatch in the meantime.
    temp_unreachable: bool,
    /// Count of items currently held in the in-memory ready/in-flight queue.
    pub scheduled_items: u32,
    /// Count of terminal (`FailedFetch`) outcomes observed for this domain.
    pub failed_items: u32,
    /// Count of successful fetches observed for this domain.
    pub fetched_items: u32,
    /// True if storage still holds `Waiting*` rows for this domain.
    pub has_waiting_elements: bool,
    /// Membership flag for the crawler's `not_scheduled_domains` list.
    pub not_scheduled: bool,
}

impl Default for Domain {
    fn default() -> Self {
        Domain {
            state: DomainState::Unknown,
            fail_streak: 0,
            next_req: 0.0,
            temp_unreachable: false,
            scheduled_items: 0,
            failed_items: 0,
            fetched_items: 0,
            has_waiting_elements: false,
            not_scheduled: false,
        }
    }
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl Domain {
    /// Restore a domain from its persisted row.
    pub fn from_persisted(next_req: f64, fail_streak: u32, state: DomainState) -> Self {
        Domain {
            state,
            fail_streak,
            next_req,
            temp_unreachable: fail_streak > 0 && next_req > now(),
            ..Domain::default()
        }
    }

    /// Marks this domain's politeness window as passed due to an outbound failure,
    /// pushing `next_req` into the future and latching `temp_unreachable`.
    pub fn mark_backoff(&mut self, next_req: f64) {
        self.next_req = next_req;
        self.temp_unreachable = true;
    }

    /// Self-clearing check: `temp_unreachable` is latched until `next_req` passes.
    pub fn is_temp_unreachable(&mut self) -> bool {
        if self.temp_unreachable {
            if self.next_req < now() {
                self.temp_unreachable = false;
                false
            } else {
                true
            }
        } else {
            false
        }
    }

    /// Reserve the next politeness slot before yielding to I/O: advance
    /// before dispatch, not after.
    pub fn reserve_slot(&mut self, period_secs: f64) {
        self.next_req = self.next_req.max(now() + period_secs);
    }

    /// `Unknown -> Unreachable` transition: exhausted the retry timer table.
    pub fn should_become_unreachable(&self, retry_timer_count: usize) -> bool {
        self.fail_streak as usize >= retry_timer_count
    }

    /// `Unknown -> AutoBlocked` transition.
    pub fn should_auto_block(&self) -> bool {
        self.failed_items >= 50
            && (self.failed_items as f64)
                / ((self.failed_items + self.fetched_items).max(1) as f64)
                > 0.5
    }
}

/// Current epoch time in fractional seconds, used throughout the crawler and
/// scheduler for politeness bookkeeping.
pub fn now_secs() -> f64 {
    now()
}

/// Shared in-memory domain registry, seeded at startup from
/// [`crate::storage::DomainStorage::get_all`] and mutated by the crawler's
/// fetch workers and scheduler as fetches succeed, fail or back off.
///
/// Also owns the round-robin `not_scheduled_domains` list: domains known to
/// have waiting work that hasn't been admitted into the ready queue yet. The
/// list and each [`Domain::not_scheduled`] flag are kept in sync; always lock
/// `domains` before `not_scheduled` to avoid lock-order inversions.
#[derive(Default)]
pub struct DomainTable {
    domains: Mutex<HashMap<String, Domain>>,
    not_scheduled: Mutex<Vec<String>>,
}

impl DomainTable {
    /// Construct an empty registry.
    pub fn new() -> Self {
        DomainTable::default()
    }

    /// Seed a domain's state, overwriting whatever default entry scheduling
    /// may already have created for it.
    pub fn seed(&self, name: &str, domain: Domain) {
        self.lock().insert(name.to_string(), domain);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Domain>> {
        self.domains.lock().expect("domain table lock poisoned")
    }

    /// Run `f` against `name`'s entry, creating a default one first if absent.
    pub fn with<R>(&self, name: &str, f: impl FnOnce(&mut Domain) -> R) -> R {
        let mut table = self.lock();
        f(table.entry(name.to_string()).or_default())
    }

    /// The current reachability state of `name`, or `Unknown` if never seen.
    pub fn state(&self, name: &str) -> DomainState {
        self.lock().get(name).map_or(DomainState::Unknown, |d| d.state)
    }

    /// Add `name` to the round-robin admission list if it isn't already on it.
    pub fn mark_not_scheduled(&self, name: &str) {
        let mut table = self.lock();
        let d = table.entry(name.to_string()).or_default();
        if !d.not_scheduled {
            d.not_scheduled = true;
            drop(table);
            self.not_scheduled
                .lock()
                .expect("not-scheduled list lock poisoned")
                .push(name.to_string());
        }
    }

    /// Remove `name` from the round-robin admission list, if present.
    pub fn clear_not_scheduled(&self, name: &str) {
        let mut table = self.lock();
        if let Some(d) = table.get_mut(name) {
            if d.not_scheduled {
                d.not_scheduled = false;
                drop(table);
                self.not_scheduled
                    .lock()
                    .expect("not-scheduled list lock poisoned")
                    .retain(|n| n != name);
            }
        }
    }

    /// Number of domains currently on the round-robin admission list.
    pub fn not_scheduled_len(&self) -> usize {
        self.not_scheduled.lock().expect("not-scheduled list lock poisoned").len()
    }

    /// A shuffled snapshot of the round-robin admission list, so repeated
    /// admission sweeps don't always favor the same few domains.
    pub fn not_scheduled_snapshot(&self) -> Vec<String> {
        let mut names = self.not_scheduled.lock().expect("not-scheduled list lock poisoned").clone();
        names.shuffle(&mut rand::thread_rng());
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_unreachable_self_clears() {
        let mut d = Domain::default();
        d.mark_backoff(now_secs() - 1.0);
        assert!(!d.is_temp_unreachable());
    }

    #[test]
    fn temp_unreachable_latched_until_deadline() {
        let mut d = Domain::default();
        d.mark_backoff(now_secs() + 10.0);
        assert!(d.is_temp_unreachable());
    }

    #[test]
    fn auto_block_threshold() {
        let mut d = Domain::default();
        d.failed_items = 50;
        d.fetched_items = 10;
        assert!(d.should_auto_block());
        d.failed_items = 49;
        assert!(!d.should_auto_block());
    }

    #[test]
    fn unreachable_after_retry_table_exhausted() {
        let mut d = Domain::default();
        d.fail_streak = 56;
        assert!(d.should_become_unreachable(56));
        d.fail_streak = 55;
        assert!(!d.should_become_unreachable(56));
    }
}
