//! Worker loop that re-fetches, compares, signs and submits actor records to
//! a Lookup

use crate::{
    error::Error,
    fetcher::Fetcher,
    handler::as_id_of,
    signatures::Signer,
    stats::VerifierStats,
    storage::{VerifierDomainRow, VerifierStorage},
    webfinger::WebfingerResolver,
};
use axum::{extract::State, routing::get, Json, Router};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};
use url::Url;

/// Verifier configuration. Use [`VerifierConfig::builder`] to construct one.
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct VerifierConfig {
    /// Base URL of the Lookup instance this verifier watches.
    #[builder(setter(into))]
    pub lookup_address: String,
    /// This verifier's own actor uri, advertised to the Lookup when
    /// submitting signatures.
    #[builder(setter(into))]
    pub actor_uri: String,
    /// Display name for this verifier's actor document.
    #[builder(default = "\"Lookup verifier\".to_string()", setter(into))]
    pub actor_name: String,
    /// Path the actor document is served at on this verifier's own HTTP
    /// surface. Modeled as the path string itself, not a boolean toggle, since
    /// a verifier may be reachable at any path.
    #[builder(default = "\"/actor\".to_string()", setter(into))]
    pub actor_key_path: String,
    /// Port this verifier's status/actor HTTP surface listens on.
    #[builder(default = "9123")]
    pub web_port: u16,
    /// Maximum number of concurrent outbound actor re-fetches.
    #[builder(default = "100")]
    pub parallel_fetches: usize,
    /// Maximum number of candidates tracked at once.
    #[builder(default = "400")]
    pub queue_size: usize,
    /// Minimum time between two requests to the same domain.
    #[builder(default = "Duration::from_secs(1)")]
    pub domain_request_period: Duration,
    /// Total request timeout for a single fetch.
    #[builder(default = "Duration::from_secs(20)")]
    pub request_timeout: Duration,
    /// Minimum time between two requests to the watched Lookup.
    #[builder(default = "Duration::from_millis(250)")]
    pub lookup_request_period: Duration,
    /// Maximum number of signatures submitted in a single batch.
    #[builder(default = "50")]
    pub signature_batch_size: usize,
    /// Maximum time to wait before flushing an incomplete signature batch.
    #[builder(default = "Duration::from_secs(10)")]
    pub signature_batch_timeout: Duration,
}

impl VerifierConfig {
    /// Returns a new config builder with default values.
    pub fn builder() -> VerifierConfigBuilder {
        VerifierConfigBuilder::default()
    }
}

impl VerifierConfigBuilder {
    /// Constructs a new config instance with the values supplied to the builder.
    pub fn build(&mut self) -> Result<VerifierConfig, VerifierConfigBuilderError> {
        self.partial_build()
    }
}

/// Per-candidate fetch-failure backoff timers, in ascending order.
pub fn actor_retry_timers() -> Vec<Duration> {
    vec![
        Duration::from_secs(60),
        Duration::from_secs(3600),
        Duration::from_secs(24 * 3600),
        Duration::from_secs(24 * 3600 * 20),
    ]
}

/// Per-domain backoff timers once a domain is deemed unreachable, in
/// ascending order (`sum = 10*(5^9 - 1)/2` seconds, about 56 days).
pub fn domain_retry_timers() -> Vec<Duration> {
    (0..9).map(|i: u32| Duration::from_secs(2 * 5_u64.pow(i))).collect()
}

struct DomainBackoff {
    fails: u32,
    next_try: f64,
}

/// Wraps [`Fetcher`] with per-domain circuit-breaking: a domain accumulates
/// weighted temporary-failure credit and is marked down (raising
/// [`Error::TemporaryFetchError`] immediately, without making a request) once
/// enough accrues, backing off per [`domain_retry_timers`].
pub struct BoundedFetcher {
    fetcher: Fetcher,
    semaphore: Arc<Semaphore>,
    domains: Mutex<HashMap<String, DomainBackoff>>,
    temp_fails: Mutex<HashMap<String, f64>>,
    retry_timers: Vec<Duration>,
}

impl BoundedFetcher {
    /// Construct a bounded fetcher allowing `max_connections` concurrent
    /// outbound requests.
    pub fn new(fetcher: Fetcher, max_connections: usize) -> Self {
        BoundedFetcher {
            fetcher,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            domains: Mutex::new(HashMap::new()),
            temp_fails: Mutex::new(HashMap::new()),
            retry_timers: domain_retry_timers(),
        }
    }

    /// Restore the per-domain backoff table from a prior run, so a restart
    /// doesn't forget domains that were circuit-broken before shutdown.
    pub async fn seed(&self, rows: HashMap<String, VerifierDomainRow>) {
        let mut domains = self.domains.lock().await;
        for (domain, row) in rows {
            domains.insert(domain, DomainBackoff { fails: row.fails, next_try: row.next_try });
        }
    }

    /// Snapshot the current per-domain backoff table for persistence.
    pub async fn snapshot(&self) -> HashMap<String, VerifierDomainRow> {
        self.domains
            .lock()
            .await
            .iter()
            .map(|(domain, d)| (domain.clone(), VerifierDomainRow { fails: d.fails, next_try: d.next_try }))
            .collect()
    }

    /// The epoch time a request to `domain` may next be attempted, reserving
    /// that slot (advancing it by `period`) so concurrent schedulers don't
    /// both target the same window.
    pub async fn reserve_time(&self, domain: &str, period: Duration) -> f64 {
        let mut domains = self.domains.lock().await;
        let now = crate::domain::now_secs();
        let entry = domains.entry(domain.to_string()).or_insert(DomainBackoff {
            fails: 0,
            next_try: now,
        });
        let reserved = entry.next_try.max(now);
        entry.next_try = reserved + period.as_secs_f64();
        reserved
    }

    /// Re-fetch `uri`'s ActivityStreams document, short-circuiting with
    /// [`Error::TemporaryFetchError`] if the owning domain is currently
    /// circuit-broken.
    pub async fn fetch_ap(&self, uri: &str) -> Result<Value, Error> {
        let domain = Url::parse(uri)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;

        {
            let domains = self.domains.lock().await;
            if let Some(d) = domains.get(&domain) {
                if crate::domain::now_secs() < d.next_try {
                    return Err(Error::TemporaryFetchError {
                        uri: uri.to_string(),
                        message: "domain unavailable".into(),
                    });
                }
            }
        }

        let _permit = self.semaphore.acquire().await.map_err(|_| Error::TemporaryFetchError {
            uri: uri.to_string(),
            message: "fetch pool shut down".into(),
        })?;
        let url = Url::parse(uri).map_err(|e| Error::InvalidUri(e.to_string()))?;
        match self.fetcher.fetch(&url).await {
            Ok(value) => {
                let mut domains = self.domains.lock().await;
                if let Some(d) = domains.get_mut(&domain) {
                    d.fails = 0;
                    d.next_try = 0.0;
                }
                Ok(value)
            }
            Err(e) => {
                let weight = if e.is_temporary() { 1.0 } else { 0.4 };
                let mut temp_fails = self.temp_fails.lock().await;
                let accrued = temp_fails.entry(domain.clone()).or_insert(0.0);
                *accrued += weight;
                if *accrued >= 5.0 {
                    let mut domains = self.domains.lock().await;
                    let entry = domains.entry(domain.clone()).or_insert(DomainBackoff {
                        fails: 0,
                        next_try: 0.0,
                    });
                    entry.next_try = self
                        .retry_timers
                        .get(entry.fails as usize)
                        .map(|d| crate::domain::now_secs() + d.as_secs_f64())
                        .unwrap_or(f64::MAX);
                    entry.fails += 1;
                    *accrued = 0.0;
                    warn!("'{domain}' marked as down");
                }
                Err(e)
            }
        }
    }
}

/// A signature produced by this worker, queued for submission to the
/// watched Lookup.
#[derive(Serialize, Deserialize, Clone)]
struct SignedActor {
    uri: String,
    signature: String,
    signature_time: i64,
}

#[derive(Serialize)]
struct SignBatch<'a> {
    signed_by: &'a str,
    signatures: &'a [SignedActor],
}

/// Orchestrates re-crawling candidate actors, comparing them against a
/// Lookup's cached copy, signing matches, and submitting signatures back.
pub struct Worker<S> {
    config: VerifierConfig,
    storage: Arc<S>,
    signer: Signer,
    fetcher: BoundedFetcher,
    webfinger: Arc<WebfingerResolver>,
    stats: Arc<VerifierStats>,
    client: reqwest::Client,
    pending_signatures: Mutex<Vec<SignedActor>>,
}

impl<S: VerifierStorage + 'static> Worker<S> {
    /// Construct a worker watching `config.lookup_address`.
    pub fn new(
        config: VerifierConfig,
        storage: Arc<S>,
        signer: Signer,
        fetcher: Fetcher,
        stats: Arc<VerifierStats>,
    ) -> Arc<Self> {
        let webfinger = Arc::new(WebfingerResolver::new(fetcher.clone()));
        let bounded = BoundedFetcher::new(fetcher, config.parallel_fetches);
        Arc::new(Worker {
            config,
            storage,
            signer,
            fetcher: bounded,
            webfinger,
            stats,
            client: reqwest::Client::new(),
            pending_signatures: Mutex::new(Vec::new()),
        })
    }

    /// Restore per-domain backoff state from storage, then spawn the
    /// crawl-and-sign loop, the push-signed loop, and the periodic backoff
    /// persistence sweep.
    pub async fn run(self: &Arc<Self>) {
        if let Ok(rows) = self.storage.get_domains_dict().await {
            self.fetcher.seed(rows).await;
        }
        tokio::spawn(self.clone().crawl_and_sign_loop());
        tokio::spawn(self.clone().push_signed_loop());
        tokio::spawn(self.clone().persist_domains_loop());
    }

    async fn persist_domains_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            for (domain, row) in self.fetcher.snapshot().await {
                if let Err(e) = self.storage.set_domain_state(&domain, row.next_try, row.fails).await {
                    warn!("failed to persist backoff state for '{domain}': {e}");
                }
            }
        }
    }

    async fn crawl_and_sign_loop(self: Arc<Self>) {
        let mut page = self.storage.get_next_page(&self.config.lookup_address).await.unwrap_or(0);
        loop {
            let now = crate::domain::now_secs();
            let candidates = self
                .storage
                .get_from_queue(&self.config.lookup_address, now, self.config.signature_batch_size)
                .await
                .unwrap_or_default();

            let mut batch = Vec::with_capacity(candidates.len());
            for mut candidate in candidates {
                if candidate.json.is_none() {
                    match self.fetch_cached_copy(&candidate.uri).await {
                        Ok((json, aux)) => {
                            candidate.json = Some(json);
                            candidate.aux = aux;
                        }
                        Err(e) => {
                            warn!("failed to fetch cached copy of {}: {e}", candidate.uri);
                            continue;
                        }
                    }
                }
                let _ = self.storage.set_active(&self.config.lookup_address, &candidate.uri).await;
                batch.push(candidate);
            }

            match self.fetch_lookup_page(page).await {
                Ok((mut page_actors, page_count)) => {
                    batch.append(&mut page_actors);
                    if !batch.is_empty() {
                        let worker = self.clone();
                        let fanout = tokio::spawn(async move { worker.sign_candidates(batch).await });
                        let _ = tokio::time::timeout(self.config.lookup_request_period, fanout).await;
                    } else {
                        tokio::time::sleep(self.config.lookup_request_period).await;
                    }
                    if page + 1 < page_count {
                        page += 1;
                        let _ = self.storage.set_next_page(&self.config.lookup_address, page).await;
                    } else {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
                Err(e) => {
                    warn!("failed to fetch lookup page {page}: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn fetch_cached_copy(&self, uri: &str) -> anyhow::Result<(Value, Option<Value>)> {
        #[derive(Deserialize)]
        struct GetResponse {
            #[serde(flatten)]
            json: Value,
        }
        let url = format!("{}/get/{}", self.config.lookup_address, uri);
        let resp: GetResponse = self.client.get(url).send().await?.json().await?;
        let aux = resp.json.get("webfinger").cloned().map(|w| serde_json::json!({ "webfinger": w }));
        Ok((resp.json, aux))
    }

    async fn fetch_lookup_page(
        &self,
        page: u64,
    ) -> anyhow::Result<(Vec<crate::storage::VerifyCandidate>, u64)> {
        #[derive(Deserialize)]
        struct ActorsPage {
            actors: Vec<Value>,
            page_count: u64,
        }
        let url = format!("{}/actors?page={page}", self.config.lookup_address);
        let resp: ActorsPage = self.client.get(url).send().await?.json().await?;
        self.stats.record_pushed();
        let candidates = resp
            .actors
            .into_iter()
            .filter_map(|a| {
                let uri = as_id_of(&a)?;
                Some(crate::storage::VerifyCandidate {
                    uri,
                    page: Some(page),
                    json: Some(a),
                    aux: None,
                    fails: 0,
                })
            })
            .collect();
        Ok((candidates, resp.page_count))
    }

    async fn sign_candidates(self: Arc<Self>, candidates: Vec<crate::storage::VerifyCandidate>) {
        for candidate in candidates {
            let Some(domain) = Url::parse(&candidate.uri).ok().and_then(|u| u.host_str().map(str::to_string)) else {
                continue;
            };
            let reserved = self.fetcher.reserve_time(&domain, self.config.domain_request_period).await;
            let wait = reserved - crate::domain::now_secs();
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
            self.sign_one(candidate).await;
        }
    }

    async fn sign_one(&self, candidate: crate::storage::VerifyCandidate) {
        let real_actor = match self.fetcher.fetch_ap(&candidate.uri).await {
            Ok(obj) => obj,
            Err(e) => {
                self.stats.record_fetch_failure();
                self.requeue_after_failure(candidate, &e).await;
                return;
            }
        };

        if as_id_of(&real_actor).as_deref() != Some(candidate.uri.as_str()) {
            self.stats.record_rejected();
            return;
        }

        let Some(cached) = candidate.json.clone() else {
            self.stats.record_rejected();
            return;
        };

        if let Some(webfinger) = candidate.aux.as_ref().and_then(|a| a.get("webfinger")).and_then(Value::as_str) {
            let acct = as_id_of(&real_actor).unwrap_or_default();
            let resolved = self.webfinger.resolve_actor_webfinger(webfinger, &acct).await;
            if resolved.as_deref() != Some(webfinger) {
                self.stats.record_rejected();
                self.record_difference(&candidate.uri, &cached, &real_actor).await;
                return;
            }
        }

        let sign_time = crate::domain::now_secs() as i64;
        let aux_webfinger = candidate.aux.as_ref().and_then(|a| a.get("webfinger")).and_then(Value::as_str).map(str::to_string);
        match self.signer.compare_and_sign(real_actor.clone(), cached.clone(), aux_webfinger, sign_time).await {
            Ok(Some(signature)) => {
                self.stats.record_signed();
                let mut pending = self.pending_signatures.lock().await;
                pending.push(SignedActor {
                    uri: candidate.uri.clone(),
                    signature,
                    signature_time: sign_time,
                });
            }
            _ => {
                self.stats.record_rejected();
                self.record_difference(&candidate.uri, &cached, &real_actor).await;
            }
        }

        if let Some(page) = candidate.page {
            let _ = self.storage.remove_from_queue(&self.config.lookup_address, &candidate.uri).await;
            let _ = page; // page bookkeeping beyond removal is handled by the pagination cursor sweep
        }
    }

    async fn record_difference(&self, uri: &str, cached: &Value, observed: &Value) {
        let _ = self
            .storage
            .insert_difference(crate::storage::Difference {
                lookup: self.config.lookup_address.clone(),
                uri: uri.to_string(),
                cached: cached.clone(),
                observed: observed.clone(),
                recorded_at: crate::domain::now_secs(),
            })
            .await;
    }

    async fn requeue_after_failure(&self, candidate: crate::storage::VerifyCandidate, _error: &Error) {
        let timers = actor_retry_timers();
        let next_fetch = timers
            .get(candidate.fails as usize)
            .map(|d| crate::domain::now_secs() + d.as_secs_f64())
            .unwrap_or(f64::MAX);
        let _ = self
            .storage
            .add_to_queue(
                &self.config.lookup_address,
                &candidate.uri,
                next_fetch,
                candidate.fails + 1,
                candidate.json.as_ref(),
                candidate.aux.as_ref(),
            )
            .await;
    }

    async fn push_signed_loop(self: Arc<Self>) {
        loop {
            let batch: Vec<SignedActor> = {
                let mut pending = self.pending_signatures.lock().await;
                if pending.is_empty() {
                    drop(pending);
                    tokio::time::sleep(self.config.signature_batch_timeout).await;
                    pending = self.pending_signatures.lock().await;
                }
                let take = pending.len().min(self.config.signature_batch_size);
                pending.drain(..take).collect()
            };
            if batch.is_empty() {
                continue;
            }
            let url = format!("{}/actors/sign", self.config.lookup_address);
            let body = SignBatch {
                signed_by: &self.config.actor_uri,
                signatures: &batch,
            };
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("submitted {} signatures to {}", batch.len(), self.config.lookup_address);
                }
                Ok(resp) => warn!("lookup rejected signature batch: {}", resp.status()),
                Err(e) => {
                    warn!("failed to submit signatures: {e}");
                    let mut pending = self.pending_signatures.lock().await;
                    let mut batch = batch;
                    batch.append(&mut pending);
                    *pending = batch;
                }
            }
        }
    }

    fn actor_document(&self) -> Result<Value, Error> {
        let public_key_pem = self.signer.public_key_pem()?;
        let base = Url::parse(&self.config.actor_uri)
            .ok()
            .and_then(|u| u.host_str().map(|h| format!("{}://{h}", u.scheme())))
            .unwrap_or_else(|| self.config.actor_uri.clone());
        Ok(json!({
            "id": self.config.actor_uri,
            "type": "Application",
            "name": self.config.actor_name,
            "inbox": format!("{base}/inbox"),
            "outbox": format!("{base}/outbox"),
            "publicKey": {
                "id": format!("{}#main-key", self.config.actor_uri),
                "owner": self.config.actor_uri,
                "publicKeyPem": public_key_pem,
            },
        }))
    }
}

/// Build the verifier's own axum router: its actor document (so Lookups and
/// other verifiers can resolve it) and its `/status` counters.
pub fn router<S: VerifierStorage + 'static>(worker: Arc<Worker<S>>) -> Router {
    let path = {
        let raw = worker.config.actor_key_path.clone();
        if raw.starts_with('/') {
            raw
        } else {
            format!("/{raw}")
        }
    };
    Router::new()
        .route(&path, get(verifier_actor_handler::<S>))
        .route("/status", get(verifier_status_handler::<S>))
        .with_state(worker)
}

async fn verifier_actor_handler<S: VerifierStorage + 'static>(
    State(worker): State<Arc<Worker<S>>>,
) -> Result<Json<Value>, axum::http::StatusCode> {
    worker.actor_document().map(Json).map_err(|e| {
        warn!("failed to build verifier actor document: {e}");
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn verifier_status_handler<S: VerifierStorage + 'static>(
    State(worker): State<Arc<Worker<S>>>,
) -> Json<Value> {
    Json(json!({ "current": worker.stats.snapshot() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemoryStore;
    use rsa::{pkcs8::EncodePrivateKey, RsaPrivateKey};

    #[test]
    fn actor_retry_timers_ascend() {
        let timers = actor_retry_timers();
        assert_eq!(timers[0], Duration::from_secs(60));
        assert_eq!(timers[3], Duration::from_secs(24 * 3600 * 20));
        assert!(timers.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn domain_retry_timers_match_formula() {
        let timers = domain_retry_timers();
        assert_eq!(timers.len(), 9);
        assert_eq!(timers[0], Duration::from_secs(2));
        assert_eq!(timers[8], Duration::from_secs(2 * 5_u64.pow(8)));
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(
            reqwest::Client::default().into(),
            Duration::from_secs(5),
            Duration::from_secs(2),
            true,
        )
    }

    #[tokio::test]
    async fn reserve_time_paces_same_domain() {
        let bounded = BoundedFetcher::new(fetcher(), 10);
        let period = Duration::from_secs(1);
        let first = bounded.reserve_time("example.test", period).await;
        let second = bounded.reserve_time("example.test", period).await;
        assert!(second >= first + period.as_secs_f64() - 0.01);
    }

    #[tokio::test]
    async fn seed_and_snapshot_round_trip() {
        let bounded = BoundedFetcher::new(fetcher(), 10);
        let mut rows = HashMap::new();
        rows.insert("example.test".to_string(), VerifierDomainRow { fails: 2, next_try: 12345.0 });
        bounded.seed(rows).await;
        let snapshot = bounded.snapshot().await;
        let row = snapshot.get("example.test").unwrap();
        assert_eq!(row.fails, 2);
        assert_eq!(row.next_try, 12345.0);
    }

    fn test_signer() -> Signer {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let pem = key.to_pkcs8_pem(Default::default()).unwrap().to_string();
        Signer::from_pem(&pem, 1).unwrap()
    }

    #[test]
    fn actor_document_has_public_key() {
        let config = VerifierConfig::builder()
            .lookup_address("https://lookup.example")
            .actor_uri("https://verifier.example/actor")
            .build()
            .unwrap();
        let worker = Worker::new(
            config,
            Arc::new(MemoryStore::new()),
            test_signer(),
            fetcher(),
            Arc::new(VerifierStats::default()),
        );
        let doc = worker.actor_document().unwrap();
        assert_eq!(doc["type"], "Application");
        assert!(doc["publicKey"]["publicKeyPem"].as_str().unwrap().contains("PUBLIC KEY"));
        assert_eq!(doc["inbox"], "https://verifier.example/inbox");
    }
}
