//! Crawler orchestration: fetch workers, scheduler promoter, update sweeper

use crate::{
    config::{retry_timers, EngineConfig},
    domain::{now_secs, Domain, DomainState, DomainTable},
    fetcher::Fetcher,
    handler::{as_id_of, ObjectHandler, UriSink},
    queue::QueueState,
    scheduler::ReadyQueue,
    stats::LookupStats,
    storage::LookupStorage,
    webfinger::WebfingerResolver,
};
use std::{sync::Arc, time::Duration};
use tracing::warn;
use url::Url;

const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Owns the crawl engine's worker tasks: fetch workers pulling from the ready
/// queue, the admission loop feeding it from storage, the periodic refetch
/// sweeper, and (optionally) the connectivity prober.
pub struct Crawler<S> {
    config: EngineConfig,
    storage: Arc<S>,
    fetcher: Fetcher,
    webfinger: Arc<WebfingerResolver>,
    handler: Arc<ObjectHandler<S>>,
    domains: Arc<DomainTable>,
    ready: Arc<ReadyQueue>,
    stats: Arc<LookupStats>,
    retry_timers: Vec<Duration>,
}

impl<S: LookupStorage + 'static> Crawler<S> {
    /// Build a crawler around `storage`, ready to [`Crawler::run`].
    pub fn new(config: EngineConfig, storage: Arc<S>, stats: Arc<LookupStats>) -> Arc<Self> {
        let fetcher = Fetcher::new(
            config.client.clone(),
            config.request_timeout,
            config.connect_timeout,
            config.debug,
        );
        let webfinger = Arc::new(WebfingerResolver::new(fetcher.clone()));
        let handler = Arc::new(ObjectHandler::new(
            storage.clone(),
            webfinger.clone(),
            config.min_update_period.as_secs_f64(),
            config.max_update_period.as_secs_f64(),
            config.archive_notes,
            config.archive_collections,
        ));
        let domains = Arc::new(DomainTable::new());
        let ready = ReadyQueue::new(
            domains.clone(),
            config.max_queue_size,
            config.domain_request_period / 4,
        );
        Arc::new(Crawler {
            config,
            storage,
            fetcher,
            webfinger,
            handler,
            domains,
            ready,
            stats,
            retry_timers: retry_timers(),
        })
    }

    /// Resolve `start_uris` (via WebFinger if they aren't absolute URIs),
    /// restore domain and queue state from storage, and spawn the crawl
    /// engine's background tasks.
    pub async fn run(self: &Arc<Self>, start_uris: Vec<String>) {
        for uri in start_uris {
            let resolved = if Url::parse(&uri).is_ok() {
                Some(uri.clone())
            } else {
                self.webfinger
                    .get_actor_webfinger(&uri)
                    .await
                    .map(|(_, href)| href)
            };
            match resolved.as_deref().and_then(|u| Url::parse(u).ok()) {
                Some(url) => self.discovered(url.as_str(), None, true).await,
                None => warn!("'{uri}' isn't a valid URI nor webfinger. Skipping it."),
            }
        }

        if let Ok(rows) = crate::storage::DomainStorage::get_all(&*self.storage).await {
            for row in rows {
                self.domains
                    .seed(&row.domain, Domain::from_persisted(row.next_req, row.fail_streak, row.state));
            }
        }
        if let Ok(names) = self.storage.waiting_domains(usize::MAX).await {
            for name in names {
                let eligible = self.domains.with(&name, |d| {
                    d.has_waiting_elements = true;
                    d.scheduled_items == 0 && !d.state.forbids_scheduling()
                });
                if eligible {
                    self.domains.mark_not_scheduled(&name);
                }
            }
        }
        if let Ok(rows) = self.storage.processing_rows().await {
            for row in rows {
                let _ = self.storage.set_state(&row.uri, row.state.rewound()).await;
            }
        }

        for _ in 0..self.config.parallel_fetches {
            tokio::spawn(self.clone().fetch_loop());
        }
        tokio::spawn(self.clone().admission_loop());
        tokio::spawn(self.clone().update_sweep_loop());
        if let Some(period) = self.config.check_for_internet_access {
            tokio::spawn(self.clone().connectivity_loop(period));
        }
    }

    async fn fetch_loop(self: Arc<Self>) {
        loop {
            let row = self.ready.next().await;
            self.fetch_single(row).await;
        }
    }

    async fn admission_loop(self: Arc<Self>) {
        loop {
            let use_domain_bias = self.domains.not_scheduled_len() > 0
                && rand::random::<f64>() <= self.config.prob_choose_from_domains;
            let claimed = if use_domain_bias {
                self.claim_domain_biased().await
            } else {
                self.storage.claim_random(self.config.scheduler_chunk).await
            };
            let rows = match claimed {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("admission sweep failed: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            if rows.len() < 200.min(self.config.scheduler_chunk) {
                if rows.is_empty() {
                    warn!("admission sweep found no waiting rows");
                }
                let idle = self.config.domain_request_period / (rows.len() as u32 + 1);
                tokio::time::sleep(idle).await;
                if rows.is_empty() {
                    continue;
                }
            }
            for row in rows {
                if self.domains.state(&row.domain).forbids_scheduling() {
                    let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, QueueState::Blocked).await;
                    continue;
                }
                let admitted = self.domains.with(&row.domain, |d| {
                    if d.scheduled_items as usize >= self.config.max_in_queue_per_domain {
                        false
                    } else {
                        d.scheduled_items += 1;
                        true
                    }
                });
                if !admitted {
                    let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, row.state.rewound()).await;
                    continue;
                }
                self.domains.clear_not_scheduled(&row.domain);
                self.ready.put(row).await;
            }
        }
    }

    async fn claim_domain_biased(&self) -> anyhow::Result<Vec<crate::queue::QueueRow>> {
        let mut names = self.domains.not_scheduled_snapshot();
        names.retain(|n| !self.domains.state(n).forbids_scheduling());
        names.truncate(self.config.domain_chunk);
        if names.is_empty() {
            return self.storage.claim_random(self.config.scheduler_chunk).await;
        }
        let mut rows = Vec::new();
        for name in names {
            rows.extend(
                self.storage
                    .claim_from_domain(&name, self.config.choose_from_domain_queue)
                    .await?,
            );
        }
        Ok(rows)
    }

    async fn update_sweep_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.storage.set_next_to_update().await {
                warn!("refetch sweep failed: {e}");
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn connectivity_loop(self: Arc<Self>, period: Duration) {
        loop {
            if !self.fetcher.check_connectivity().await {
                warn!("no internet connection detected, fetch workers will stall");
            }
            tokio::time::sleep(period).await;
        }
    }

    async fn fetch_single(&self, row: crate::queue::QueueRow) {
        let domain_name = row.domain.clone();
        if self.domains.state(&domain_name).forbids_scheduling() {
            let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, QueueState::Blocked).await;
            self.fetch_complete(&domain_name);
            return;
        }
        if self.domains.with(&domain_name, Domain::is_temp_unreachable) {
            let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, row.state).await;
            self.fetch_complete(&domain_name);
            return;
        }

        let (old_next_req, old_fail_streak) =
            self.domains.with(&domain_name, |d| (d.next_req, d.fail_streak));
        self.domains
            .with(&domain_name, |d| d.reserve_slot(self.config.domain_request_period.as_secs_f64()));

        let Ok(url) = Url::parse(&row.uri) else {
            let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, QueueState::Failed).await;
            self.fetch_complete(&domain_name);
            return;
        };

        match self.fetcher.fetch(&url).await {
            Ok(obj) => self.on_fetch_success(&row, &domain_name, obj).await,
            Err(e) if e.is_temporary() => {
                self.on_temporary_failure(&row, &domain_name, old_next_req, old_fail_streak)
                    .await;
            }
            Err(_) => self.on_terminal_failure(&row, &domain_name).await,
        }
        self.fetch_complete(&domain_name);
    }

    /// Releases `domain_name`'s admission slot, re-joining the round-robin
    /// admission list if storage still holds waiting rows for it.
    fn fetch_complete(&self, domain_name: &str) {
        let still_waiting = self.domains.with(domain_name, |d| {
            d.scheduled_items = d.scheduled_items.saturating_sub(1);
            d.scheduled_items == 0 && d.has_waiting_elements
        });
        if still_waiting {
            self.domains.mark_not_scheduled(domain_name);
        }
    }

    async fn on_fetch_success(&self, row: &crate::queue::QueueRow, domain_name: &str, obj: serde_json::Value) {
        self.stats.record_fetched();
        let had_failures = self.domains.with(domain_name, |d| {
            d.fetched_items += 1;
            let had = d.fail_streak > 0;
            d.fail_streak = 0;
            had
        });
        if had_failures {
            let next_req = self.domains.with(domain_name, |d| d.next_req);
            let _ = crate::storage::DomainStorage::update(&*self.storage, domain_name, 0, next_req).await;
        }

        let priority = row.state == QueueState::WaitingPriority;
        match as_id_of(&obj) {
            Some(oid) if oid != row.uri => {
                let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, QueueState::Redirected).await;
                let oid_domain = Url::parse(&oid).ok().and_then(|u| u.host_str().map(str::to_string));
                if oid_domain.as_deref() != Some(domain_name) {
                    self.discovered(&oid, Some(domain_name), priority).await;
                    return;
                }
                let _ = crate::storage::AliasStorage::insert(&*self.storage, &row.uri, &oid).await;
            }
            _ => {}
        }
        self.handler.handle(self, &obj, Some(domain_name), priority).await;
    }

    async fn on_temporary_failure(
        &self,
        row: &crate::queue::QueueRow,
        domain_name: &str,
        old_next_req: f64,
        old_fail_streak: u32,
    ) {
        self.stats.record_temporary_failure();
        let raced = now_secs() < old_next_req
            || self.domains.with(domain_name, |d| d.fail_streak != old_fail_streak);
        if raced {
            return;
        }

        let became_unreachable = self.domains.with(domain_name, |d| {
            if d.should_become_unreachable(self.retry_timers.len()) {
                d.state = DomainState::Unreachable;
                true
            } else {
                let wait = self.retry_timers[d.fail_streak as usize];
                d.next_req = now_secs() + wait.as_secs_f64();
                d.fail_streak += 1;
                d.mark_backoff(d.next_req);
                false
            }
        });

        if became_unreachable {
            self.stats.record_domain_unreachable();
            let _ = crate::storage::DomainStorage::update_state(&*self.storage, domain_name, DomainState::Unreachable).await;
            let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, QueueState::Failed).await;
        } else {
            let (fail_streak, next_req) = self.domains.with(domain_name, |d| (d.fail_streak, d.next_req));
            let _ = crate::storage::DomainStorage::update(&*self.storage, domain_name, fail_streak, next_req).await;
            let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, row.state).await;
        }
    }

    async fn on_terminal_failure(&self, row: &crate::queue::QueueRow, domain_name: &str) {
        self.stats.record_failed();
        let _ = crate::queue::QueueStorage::update_state(&*self.storage, &row.uri, QueueState::Failed).await;

        let auto_block = self.domains.with(domain_name, |d| {
            d.failed_items += 1;
            d.should_auto_block()
        });
        if auto_block {
            self.stats.record_domain_auto_blocked();
            self.domains.with(domain_name, |d| d.state = DomainState::AutoBlocked);
            let _ = crate::storage::DomainStorage::update_state(&*self.storage, domain_name, DomainState::AutoBlocked).await;
        }
    }
}

#[async_trait::async_trait]
impl<S: LookupStorage + 'static> UriSink for Crawler<S> {
    async fn discovered(&self, uri: &str, found_in: Option<&str>, priority: bool) {
        if uri == PUBLIC_COLLECTION {
            return;
        }
        let Some(domain_name) = Url::parse(uri).ok().and_then(|u| u.host_str().map(str::to_string)) else {
            return;
        };
        if self.domains.state(&domain_name).forbids_scheduling() {
            if let Err(e) = self.storage.add_blocked(uri, found_in).await {
                warn!("failed to record blocked uri {uri}: {e}");
            }
            return;
        }
        match self.storage.add_if_not_visited(uri, found_in, priority).await {
            Ok(()) => {
                let newly_waiting = self.domains.with(&domain_name, |d| {
                    d.has_waiting_elements = true;
                    d.scheduled_items == 0
                });
                if newly_waiting {
                    self.domains.mark_not_scheduled(&domain_name);
                }
                self.stats.record_queue_insert();
            }
            Err(e) => warn!("failed to queue discovered uri {uri}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PUBLIC_COLLECTION;

    #[test]
    fn public_collection_constant_matches_spec() {
        assert_eq!(PUBLIC_COLLECTION, "https://www.w3.org/ns/activitystreams#Public");
    }
}
