//! Interprets fetched ActivityStreams documents and drives discovery/scheduling

use crate::{
    queue::QueueState,
    storage::{LookupStorage, ObjectKind},
    webfinger::WebfingerResolver,
};
use md5::{Digest, Md5};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use url::Url;

const ACTOR_TYPES: &[&str] = &["Person", "Application", "Group", "Service"];
const COLLECTION_TYPES: &[&str] = &[
    "OrderedCollection",
    "Collection",
    "OrderedCollectionPage",
    "CollectionPage",
];

/// `10 * 365` days, used as a de-facto "never" update period for objects that
/// aren't refetched on a schedule.
pub const INFINITY_UPDATE_PERIOD: f64 = (10 * 365 * 24 * 3600) as f64;

/// Extracts an ActivityStreams object's `id`, falling back to `uri`. Exposed
/// for the crawler to detect when a fetched object's own id diverges from the
/// URI it was fetched at during redirect handling.
pub fn as_id_of(obj: &Value) -> Option<String> {
    obj.as_object().and_then(as_id)
}

fn as_id(obj: &Map<String, Value>) -> Option<String> {
    obj.get("id")
        .or_else(|| obj.get("uri"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn host_of(uri: &str) -> Option<String> {
    Url::parse(uri).ok()?.host_str().map(str::to_string)
}

/// Digest used to detect unchanged content across refetches: an md5 of the
/// object's JSON serialized with lexicographically sorted keys.
fn content_hash(obj: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sort(v))).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    let canonical = serde_json::to_string(&sort(obj)).unwrap_or_default();
    format!("{:x}", Md5::new_with_prefix(canonical.as_bytes()).finalize())
}

/// Tracks pagination progress while walking a collection's `first`/`next` (or
/// `last`/`prev`) chain, and how many consecutive empty pages have been seen.
#[derive(Debug, Clone, Default)]
struct PaginationState {
    direction: Option<Direction>,
    empty_pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Prev,
}

/// Decodes fetched ActivityStreams documents, recursing into their referenced
/// fields and feeding newly discovered URIs back to the scheduler. Only
/// objects whose `id`/`uri` is on the domain they were fetched from are
/// treated as authoritative; everything else is treated as a link to queue,
/// never as inline data.
pub struct ObjectHandler<S> {
    storage: Arc<S>,
    webfinger: Arc<WebfingerResolver>,
    min_update_period: f64,
    max_update_period: f64,
    archive_notes: bool,
    archive_collections: bool,
}

/// Callback invoked whenever the handler discovers a URI that should be
/// queued. Implemented by the crawler's `add_if_not_visited`.
#[async_trait::async_trait]
pub trait UriSink: Send + Sync {
    /// Queue `uri`, discovered while processing `found_in`.
    async fn discovered(&self, uri: &str, found_in: Option<&str>, priority: bool);
}

impl<S: LookupStorage> ObjectHandler<S> {
    /// Construct a handler backed by `storage`, consulting `webfinger` to
    /// confirm actor bindings.
    pub fn new(
        storage: Arc<S>,
        webfinger: Arc<WebfingerResolver>,
        min_update_period: f64,
        max_update_period: f64,
        archive_notes: bool,
        archive_collections: bool,
    ) -> Self {
        ObjectHandler {
            storage,
            webfinger,
            min_update_period,
            max_update_period,
            archive_notes,
            archive_collections,
        }
    }

    /// Entry point: interpret a freshly fetched document. `trust_domain` is
    /// the domain `obj` was fetched from; only objects whose own id resolves
    /// to that domain are trusted as authoritative.
    pub async fn handle(
        &self,
        sink: &dyn UriSink,
        obj: &Value,
        trust_domain: Option<&str>,
        priority: bool,
    ) {
        self.handle_inner(sink, obj, trust_domain, priority, true, &mut PaginationState::default())
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_inner(
        &self,
        sink: &dyn UriSink,
        obj: &Value,
        trust_domain: Option<&str>,
        priority: bool,
        top_level: bool,
        pagination: &mut PaginationState,
    ) {
        if let Some(uri) = obj.as_str() {
            sink.discovered(uri, trust_domain, priority).await;
            return;
        }
        let Some(map) = obj.as_object() else {
            return;
        };

        let oid = as_id(map);
        let kind = map.get("type").and_then(Value::as_str);

        if let Some(oid) = &oid {
            let oid_host = host_of(oid);
            let trusted = oid_host.as_deref() == trust_domain
                && (top_level
                    || (!kind.is_some_and(|k| ACTOR_TYPES.contains(&k))
                        && !kind.is_some_and(|k| COLLECTION_TYPES.contains(&k))));
            if !trusted {
                sink.discovered(oid, trust_domain, priority).await;
                return;
            }
            self.record_fetched(oid, obj, kind, trust_domain).await;
        }

        if kind.is_some_and(|k| ACTOR_TYPES.contains(&k)) {
            self.handle_actor(map, trust_domain).await;
        } else if kind.is_some_and(|k| COLLECTION_TYPES.contains(&k)) {
            Box::pin(self.handle_collection(sink, map, trust_domain, priority, pagination)).await;
        } else if kind == Some("Note") {
            Box::pin(self.handle_note(sink, map, trust_domain)).await;
        } else if kind == Some("Create") {
            Box::pin(self.handle_activity(sink, map, trust_domain)).await;
        } else {
            debug!("unknown activitystreams type {kind:?}");
        }
    }

    async fn record_fetched(
        &self,
        oid: &str,
        obj: &Value,
        kind: Option<&str>,
        trust_domain: Option<&str>,
    ) {
        let is_archivable = kind.is_some_and(|k| ACTOR_TYPES.contains(&k) || COLLECTION_TYPES.contains(&k));
        match self.storage.get_by_uri(oid).await {
            Ok(Some(existing)) => {
                if is_archivable {
                    let hash = content_hash(obj);
                    let mut period = (self.min_update_period * 2.0).min(self.max_update_period);
                    if let Some(old_hash) = &existing.hash {
                        if *old_hash != hash {
                            period = (existing.update_time / 2.0).max(self.min_update_period);
                        }
                    }
                    let _ = self
                        .storage
                        .update_state_time_and_hash(oid, QueueState::Fetched, period, &hash)
                        .await;
                } else {
                    let _ = crate::queue::QueueStorage::update_state(&*self.storage, oid, QueueState::Fetched).await;
                }
            }
            Ok(None) => {
                let period = if is_archivable {
                    self.min_update_period
                } else {
                    INFINITY_UPDATE_PERIOD
                };
                let _ = self
                    .storage
                    .insert_fetched(oid, trust_domain, period)
                    .await;
            }
            Err(e) => debug!("lookup of existing row for {oid} failed: {e}"),
        }
    }

    async fn handle_actor(&self, actor: &Map<String, Value>, trust_domain: Option<&str>) {
        let Some(oid) = as_id(actor) else { return };
        let Some(trust_domain) = trust_domain else {
            return;
        };
        let candidate_acct = actor_acct_guess(actor, trust_domain);
        let resolved_webfinger = match candidate_acct {
            Some(acct) => self.webfinger.resolve_actor_webfinger(&acct, &oid).await,
            None => None,
        };
        if let Some(webfinger) = &resolved_webfinger {
            let _ = crate::storage::AliasStorage::insert(&*self.storage, webfinger, &oid).await;
        }
        let aux = resolved_webfinger
            .as_ref()
            .map(|w| serde_json::json!({ "webfinger": w }));
        let _ = crate::storage::ObjectStorage::insert(
            &*self.storage,
            &oid,
            &Value::Object(actor.clone()),
            ObjectKind::Actor,
            aux.as_ref(),
        )
        .await;
    }

    async fn handle_collection(
        &self,
        sink: &dyn UriSink,
        coll: &Map<String, Value>,
        trust_domain: Option<&str>,
        priority: bool,
        pagination: &mut PaginationState,
    ) {
        if self.archive_collections && trust_domain.is_some() {
            if let Some(oid) = as_id(coll) {
                let _ = crate::storage::ObjectStorage::insert(
                    &*self.storage,
                    &oid,
                    &Value::Object(coll.clone()),
                    ObjectKind::Feed,
                    None,
                )
                .await;
            }
        }

        let direction = *pagination.direction.get_or_insert_with(|| {
            if coll.contains_key("first") || coll.contains_key("next") {
                Direction::Next
            } else {
                Direction::Prev
            }
        });
        let page_field = match direction {
            Direction::Next if coll.contains_key("first") => "first",
            Direction::Next => "next",
            Direction::Prev => "last",
        };

        let items_empty = coll
            .get("orderedItems")
            .or_else(|| coll.get("items"))
            .and_then(Value::as_array)
            .is_none_or(|items| items.is_empty());
        if items_empty {
            pagination.empty_pages += 1;
            if pagination.empty_pages > 2 {
                return;
            }
        }

        for field in ["items", "orderedItems", page_field] {
            self.recurse_field(sink, coll, field, trust_domain, priority, false, pagination)
                .await;
        }
    }

    async fn handle_note(&self, sink: &dyn UriSink, note: &Map<String, Value>, trust_domain: Option<&str>) {
        if self.archive_notes && trust_domain.is_some() {
            if let Some(oid) = as_id(note) {
                let _ = crate::storage::ObjectStorage::insert(
                    &*self.storage,
                    &oid,
                    &Value::Object(note.clone()),
                    ObjectKind::Other,
                    None,
                )
                .await;
            }
        }
        let mut pagination = PaginationState::default();
        for field in ["to", "cc", "attributedTo"] {
            self.recurse_field(sink, note, field, trust_domain, true, false, &mut pagination)
                .await;
        }
        for field in ["replies"] {
            self.recurse_field(sink, note, field, trust_domain, false, false, &mut pagination)
                .await;
        }
    }

    async fn handle_activity(&self, sink: &dyn UriSink, activity: &Map<String, Value>, trust_domain: Option<&str>) {
        let mut pagination = PaginationState::default();
        for field in ["actor", "object"] {
            self.recurse_field(sink, activity, field, trust_domain, false, false, &mut pagination)
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn recurse_field(
        &self,
        sink: &dyn UriSink,
        obj: &Map<String, Value>,
        field: &str,
        trust_domain: Option<&str>,
        priority: bool,
        top_level: bool,
        pagination: &mut PaginationState,
    ) {
        let Some(value) = obj.get(field) else { return };
        match value {
            Value::Array(items) => {
                for item in items {
                    Box::pin(self.handle_inner(sink, item, trust_domain, priority, top_level, pagination)).await;
                }
            }
            other => {
                Box::pin(self.handle_inner(sink, other, trust_domain, priority, top_level, pagination)).await;
            }
        }
    }
}

/// Best-effort `acct:user@host` guess for an actor document, used as the
/// WebFinger candidate to confirm. Prefers `preferredUsername`, falling back
/// to the last path segment of the actor id.
fn actor_acct_guess(actor: &Map<String, Value>, trust_domain: &str) -> Option<String> {
    let username = actor
        .get("preferredUsername")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            as_id(actor)
                .and_then(|id| id.rsplit('/').next().map(str::to_string))
        })?;
    Some(format!("acct:{username}@{trust_domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_id_preferring_id_over_uri() {
        let obj: Map<String, Value> = json!({"id": "https://a/x", "uri": "https://a/y"})
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(as_id(&obj).as_deref(), Some("https://a/x"));
    }

    #[test]
    fn falls_back_to_uri_field() {
        let obj: Map<String, Value> = json!({"uri": "https://a/y"}).as_object().unwrap().clone();
        assert_eq!(as_id(&obj).as_deref(), Some("https://a/y"));
    }

    #[test]
    fn content_hash_is_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn actor_acct_guess_prefers_preferred_username() {
        let actor: Map<String, Value> = json!({
            "id": "https://example.test/u/alice",
            "preferredUsername": "alice",
        })
        .as_object()
        .unwrap()
        .clone();
        assert_eq!(
            actor_acct_guess(&actor, "example.test").as_deref(),
            Some("acct:alice@example.test")
        );
    }
}
