//! Minimal in-process storage backend used by the CLI binaries.
//!
//! No SQL backend ships in this crate; this module exists only so
//! `lookup`/`verifier` are runnable programs rather than libraries with
//! nothing to drive them. State lives entirely in memory and is lost on
//! restart — a concrete SQL-backed implementation of the same traits is the
//! intended production deployment.

use crate::{
    domain::DomainState,
    queue::{QueueRow, QueueState, QueueStorage},
    storage::{
        AliasStorage, DomainRow, DomainStorage, KeySignature, ObjectKind, ObjectStorage,
        SignatureStorage, VerifierDomainRow, VerifierStorage, VerifyCandidate,
    },
};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Mutex,
};
use url::Url;

struct VerifierQueueEntry {
    next_fetch: f64,
    active: bool,
    candidate: VerifyCandidate,
}

/// In-memory implementation of every storage contract the core consumes.
/// Not persisted; intended only to make the CLI binaries runnable.
#[derive(Default)]
pub struct MemoryStore {
    queue: Mutex<HashMap<String, QueueRow>>,
    domains: Mutex<HashMap<String, DomainRow>>,
    objects: Mutex<HashMap<String, (Value, Option<Value>, ObjectKind)>>,
    aliases: Mutex<HashMap<String, String>>,
    verifiers: Mutex<Vec<String>>,
    signatures: Mutex<HashMap<String, Vec<KeySignature>>>,
    verifier_queues: Mutex<HashMap<String, HashMap<String, VerifierQueueEntry>>>,
    verifier_pages: Mutex<HashMap<String, u64>>,
    verifier_domains: Mutex<HashMap<String, VerifierDomainRow>>,
    differences: Mutex<Vec<crate::storage::Difference>>,
}

impl MemoryStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn domain_of(uri: &str) -> String {
        Url::parse(uri)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueStorage for MemoryStore {
    async fn add_if_not_visited(&self, uri: &str, found_in: Option<&str>, priority: bool) -> anyhow::Result<()> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.entry(uri.to_string()).or_insert_with(|| QueueRow {
            queue_id: rand::thread_rng().gen_range(0..1 << 30),
            uri: uri.to_string(),
            domain: Self::domain_of(uri),
            found_in: found_in.map(str::to_string),
            state: if priority { QueueState::WaitingPriority } else { QueueState::Waiting },
            next_update: 0.0,
            update_time: 0.0,
            hash: None,
            aux: None,
        });
        Ok(())
    }

    async fn add_blocked(&self, uri: &str, found_in: Option<&str>) -> anyhow::Result<()> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.insert(uri.to_string(), QueueRow {
            queue_id: rand::thread_rng().gen_range(0..1 << 30),
            uri: uri.to_string(),
            domain: Self::domain_of(uri),
            found_in: found_in.map(str::to_string),
            state: QueueState::Blocked,
            next_update: 0.0,
            update_time: 0.0,
            hash: None,
            aux: None,
        });
        Ok(())
    }

    async fn claim_from_domain(&self, domain: &str, limit: usize) -> anyhow::Result<Vec<QueueRow>> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let mut claimed = Vec::new();
        for row in queue.values_mut() {
            if row.domain == domain && row.state.is_waiting() && claimed.len() < limit {
                row.state = row.state.claimed();
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_random(&self, limit: usize) -> anyhow::Result<Vec<QueueRow>> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let mut claimed = Vec::new();
        for row in queue.values_mut() {
            if row.state.is_waiting() && claimed.len() < limit {
                row.state = row.state.claimed();
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn waiting_domains(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        let mut domains: Vec<String> = queue
            .values()
            .filter(|r| r.state.is_waiting())
            .map(|r| r.domain.clone())
            .collect();
        domains.sort_unstable();
        domains.dedup();
        domains.truncate(limit);
        Ok(domains)
    }

    async fn update_state(&self, uri: &str, state: QueueState) -> anyhow::Result<()> {
        if let Some(row) = self.queue.lock().expect("queue lock poisoned").get_mut(uri) {
            row.state = state;
        }
        Ok(())
    }

    async fn update_state_time_and_hash(
        &self,
        uri: &str,
        state: QueueState,
        next_update_in: f64,
        hash: &str,
    ) -> anyhow::Result<()> {
        if let Some(row) = self.queue.lock().expect("queue lock poisoned").get_mut(uri) {
            row.state = state;
            row.update_time = next_update_in;
            row.next_update = crate::domain::now_secs() + next_update_in;
            row.hash = Some(hash.to_string());
        }
        Ok(())
    }

    async fn insert_fetched(&self, uri: &str, found_in: Option<&str>, next_update_in: f64) -> anyhow::Result<()> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.insert(uri.to_string(), QueueRow {
            queue_id: rand::thread_rng().gen_range(0..1 << 30),
            uri: uri.to_string(),
            domain: Self::domain_of(uri),
            found_in: found_in.map(str::to_string),
            state: QueueState::Fetched,
            next_update: crate::domain::now_secs() + next_update_in,
            update_time: next_update_in,
            hash: None,
            aux: None,
        });
        Ok(())
    }

    async fn update_state_with_retry(
        &self,
        uri: &str,
        state: QueueState,
        next_update: f64,
        aux: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some(row) = self.queue.lock().expect("queue lock poisoned").get_mut(uri) {
            row.state = state;
            row.next_update = next_update;
            row.aux = aux.map(str::to_string);
        }
        Ok(())
    }

    async fn get_by_uri(&self, uri: &str) -> anyhow::Result<Option<QueueRow>> {
        Ok(self.queue.lock().expect("queue lock poisoned").get(uri).cloned())
    }

    async fn processing_rows(&self) -> anyhow::Result<Vec<QueueRow>> {
        Ok(self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .values()
            .filter(|r| r.state.is_processing())
            .cloned()
            .collect())
    }

    async fn set_state(&self, uri: &str, state: QueueState) -> anyhow::Result<()> {
        QueueStorage::update_state(self, uri, state).await
    }

    async fn set_next_to_update(&self) -> anyhow::Result<()> {
        let now = crate::domain::now_secs();
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        for row in queue.values_mut() {
            if row.state == QueueState::Fetched && row.next_update < now {
                row.state = QueueState::WaitingPriority;
            }
        }
        Ok(())
    }

    async fn page_fetched(&self, page: u64, page_size: usize) -> anyhow::Result<Vec<QueueRow>> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        let mut rows: Vec<QueueRow> = queue.values().filter(|r| r.state == QueueState::Fetched).cloned().collect();
        rows.sort_by_key(|r| r.queue_id);
        let start = page as usize * page_size;
        Ok(rows.into_iter().skip(start).take(page_size).collect())
    }

    async fn fetched_count(&self) -> anyhow::Result<u64> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        Ok(queue.values().filter(|r| r.state == QueueState::Fetched).count() as u64)
    }
}

#[async_trait]
impl DomainStorage for MemoryStore {
    async fn get_all(&self) -> anyhow::Result<Vec<DomainRow>> {
        Ok(self.domains.lock().expect("domains lock poisoned").values().cloned().collect())
    }

    async fn update(&self, domain: &str, fail_streak: u32, next_req: f64) -> anyhow::Result<()> {
        let mut domains = self.domains.lock().expect("domains lock poisoned");
        let row = domains.entry(domain.to_string()).or_insert_with(|| DomainRow {
            domain: domain.to_string(),
            next_req: 0.0,
            fail_streak: 0,
            state: DomainState::Unknown,
        });
        row.fail_streak = fail_streak;
        row.next_req = next_req;
        Ok(())
    }

    async fn update_state(&self, domain: &str, state: DomainState) -> anyhow::Result<()> {
        let mut domains = self.domains.lock().expect("domains lock poisoned");
        let row = domains.entry(domain.to_string()).or_insert_with(|| DomainRow {
            domain: domain.to_string(),
            next_req: 0.0,
            fail_streak: 0,
            state: DomainState::Unknown,
        });
        row.state = state;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStore {
    async fn insert(&self, oid: &str, value: &Value, kind: ObjectKind, aux: Option<&Value>) -> anyhow::Result<()> {
        self.objects
            .lock()
            .expect("objects lock poisoned")
            .insert(oid.to_string(), (value.clone(), aux.cloned(), kind));
        Ok(())
    }

    async fn get(&self, oid: &str) -> anyhow::Result<Option<(Value, Option<Value>)>> {
        Ok(self
            .objects
            .lock()
            .expect("objects lock poisoned")
            .get(oid)
            .map(|(v, aux, _)| (v.clone(), aux.clone())))
    }
}

#[async_trait]
impl AliasStorage for MemoryStore {
    async fn insert(&self, webfinger: &str, oid: &str) -> anyhow::Result<()> {
        self.aliases.lock().expect("aliases lock poisoned").insert(webfinger.to_string(), oid.to_string());
        Ok(())
    }

    async fn resolve(&self, webfinger: &str) -> anyhow::Result<Option<String>> {
        Ok(self.aliases.lock().expect("aliases lock poisoned").get(webfinger).cloned())
    }
}

#[async_trait]
impl SignatureStorage for MemoryStore {
    async fn register_verifier(&self, uri: &str) -> anyhow::Result<i64> {
        let mut verifiers = self.verifiers.lock().expect("verifiers lock poisoned");
        if let Some(pos) = verifiers.iter().position(|v| v == uri) {
            return Ok(pos as i64);
        }
        verifiers.push(uri.to_string());
        Ok(verifiers.len() as i64 - 1)
    }

    async fn verifier_uri(&self, verifier_id: i64) -> anyhow::Result<Option<String>> {
        let verifiers = self.verifiers.lock().expect("verifiers lock poisoned");
        Ok(usize::try_from(verifier_id).ok().and_then(|i| verifiers.get(i).cloned()))
    }

    async fn unsigned_for_verifier(&self, verifier_id: i64, limit: usize) -> anyhow::Result<Vec<String>> {
        let Some(verifier_uri) = self.verifier_uri(verifier_id).await? else {
            return Ok(Vec::new());
        };
        let objects = self.objects.lock().expect("objects lock poisoned");
        let signatures = self.signatures.lock().expect("signatures lock poisoned");
        Ok(objects
            .iter()
            .filter(|(_, (_, _, kind))| *kind == ObjectKind::Actor)
            .filter(|(oid, _)| {
                !signatures
                    .get(oid.as_str())
                    .is_some_and(|sigs| sigs.iter().any(|s| s.signed_by == verifier_uri))
            })
            .take(limit)
            .map(|(oid, _)| oid.clone())
            .collect())
    }

    async fn record_signature(&self, verifier_id: i64, uri: &str, signature: &str, signature_time: i64) -> anyhow::Result<()> {
        let Some(signed_by) = self.verifier_uri(verifier_id).await? else {
            return Ok(());
        };
        let mut signatures = self.signatures.lock().expect("signatures lock poisoned");
        let entry = signatures.entry(uri.to_string()).or_default();
        entry.retain(|s| s.signed_by != signed_by);
        entry.push(KeySignature {
            signed_by,
            signature: signature.to_string(),
            signature_time,
        });
        Ok(())
    }

    async fn signatures_for(&self, uri: &str) -> anyhow::Result<Vec<KeySignature>> {
        Ok(self.signatures.lock().expect("signatures lock poisoned").get(uri).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl VerifierStorage for MemoryStore {
    async fn add_to_queue(
        &self,
        lookup: &str,
        uri: &str,
        next_fetch: f64,
        fails: u32,
        json: Option<&Value>,
        aux: Option<&Value>,
    ) -> anyhow::Result<()> {
        let mut queues = self.verifier_queues.lock().expect("verifier queues lock poisoned");
        let queue = queues.entry(lookup.to_string()).or_default();
        queue.insert(uri.to_string(), VerifierQueueEntry {
            next_fetch,
            active: false,
            candidate: VerifyCandidate {
                uri: uri.to_string(),
                page: None,
                json: json.cloned(),
                aux: aux.cloned(),
                fails,
            },
        });
        Ok(())
    }

    async fn get_from_queue(&self, lookup: &str, now: f64, limit: usize) -> anyhow::Result<Vec<VerifyCandidate>> {
        let mut queues = self.verifier_queues.lock().expect("verifier queues lock poisoned");
        let Some(queue) = queues.get_mut(lookup) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<VerifyCandidate> = queue
            .values_mut()
            .filter(|e| !e.active && e.next_fetch <= now)
            .take(limit)
            .map(|e| {
                e.active = true;
                e.candidate.clone()
            })
            .collect();
        due.truncate(limit);
        Ok(due)
    }

    async fn remove_from_queue(&self, lookup: &str, uri: &str) -> anyhow::Result<()> {
        if let Some(queue) = self.verifier_queues.lock().expect("verifier queues lock poisoned").get_mut(lookup) {
            queue.remove(uri);
        }
        Ok(())
    }

    async fn set_active(&self, lookup: &str, uri: &str) -> anyhow::Result<()> {
        if let Some(queue) = self.verifier_queues.lock().expect("verifier queues lock poisoned").get_mut(lookup) {
            if let Some(entry) = queue.get_mut(uri) {
                entry.active = true;
            }
        }
        Ok(())
    }

    async fn get_next_page(&self, lookup: &str) -> anyhow::Result<u64> {
        Ok(self.verifier_pages.lock().expect("pages lock poisoned").get(lookup).copied().unwrap_or(0))
    }

    async fn set_next_page(&self, lookup: &str, page: u64) -> anyhow::Result<()> {
        self.verifier_pages.lock().expect("pages lock poisoned").insert(lookup.to_string(), page);
        Ok(())
    }

    async fn get_domains_dict(&self) -> anyhow::Result<HashMap<String, VerifierDomainRow>> {
        Ok(self.verifier_domains.lock().expect("verifier domains lock poisoned").clone())
    }

    async fn set_domain_state(&self, domain: &str, next_try: f64, fails: u32) -> anyhow::Result<()> {
        self.verifier_domains
            .lock()
            .expect("verifier domains lock poisoned")
            .insert(domain.to_string(), VerifierDomainRow { fails, next_try });
        Ok(())
    }

    async fn insert_difference(&self, difference: crate::storage::Difference) -> anyhow::Result<()> {
        self.differences.lock().expect("differences lock poisoned").push(difference);
        Ok(())
    }
}
