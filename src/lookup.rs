//! HTTP surface for the Lookup service
//!
//! The HTML landing/status page is out of scope
//! here; everything else (`/get`, `/actors`, `/actors/to_sign`,
//! `/actors/sign`, `/status`) is implemented.

use crate::{signatures::Verifier, stats::LookupStats, storage::LookupStorage};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Actor documents served per `/actors` page (spec-internal choice; the
/// original's page size is configuration, ours is fixed for simplicity).
const ACTORS_PAGE_SIZE: usize = 50;

struct AppState<S> {
    storage: Arc<S>,
    sign_verifier: Verifier,
    stats: Arc<LookupStats>,
}

/// Build the Lookup service's axum router.
pub fn router<S: LookupStorage + 'static>(storage: Arc<S>, stats: Arc<LookupStats>) -> Router {
    let state = Arc::new(AppState {
        storage,
        sign_verifier: Verifier::new(1),
        stats,
    });
    Router::new()
        .route("/get/*uri", get(get_handler::<S>))
        .route("/actors", get(actors_page_handler::<S>))
        .route("/actors/to_sign", get(actors_to_sign_handler::<S>))
        .route("/actors/sign", post(sign_page_handler::<S>))
        .route("/status", get(status_handler::<S>))
        .with_state(state)
}

enum ApiError {
    NotFound,
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        }
    }
}

async fn get_handler<S: LookupStorage>(
    State(state): State<Arc<AppState<S>>>,
    Path(uri): Path<String>,
) -> Result<Response, ApiError> {
    let mut resolved = state.storage.get(&uri).await.map_err(storage_err)?;
    if resolved.is_none() {
        if let Some(oid) = crate::storage::AliasStorage::resolve(&*state.storage, &uri)
            .await
            .map_err(storage_err)?
        {
            resolved = state.storage.get(&oid).await.map_err(storage_err)?;
        }
    }
    let Some((mut object, _aux)) = resolved else {
        return Err(ApiError::NotFound);
    };

    let signatures = state.storage.signatures_for(&uri).await.map_err(storage_err)?;
    if !signatures.is_empty() {
        if let Value::Object(map) = &mut object {
            map.insert(
                "key_signatures".into(),
                json!(signatures
                    .into_iter()
                    .map(|s| json!({
                        "signed_by": s.signed_by,
                        "signature": s.signature,
                        "signature_time": s.signature_time,
                    }))
                    .collect::<Vec<_>>()),
            );
        }
    }
    Ok(Json(object).into_response())
}

#[derive(Deserialize)]
struct PageQuery {
    page: u64,
}

#[derive(Serialize)]
struct ActorsPage {
    actors: Vec<Value>,
    page_count: u64,
}

async fn actors_page_handler<S: LookupStorage>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ActorsPage>, ApiError> {
    let rows = state
        .storage
        .page_fetched(query.page, ACTORS_PAGE_SIZE)
        .await
        .map_err(storage_err)?;
    let mut actors = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some((obj, _aux)) = state.storage.get(&row.uri).await.map_err(storage_err)? {
            actors.push(obj);
        }
    }
    let total = state.storage.fetched_count().await.map_err(storage_err)?;
    let page_count = total.div_ceil(ACTORS_PAGE_SIZE as u64).max(1);
    Ok(Json(ActorsPage { actors, page_count }))
}

#[derive(Deserialize)]
struct VerifierQuery {
    verifier: String,
}

#[derive(Serialize)]
struct ActorsToSign {
    actors: Vec<Value>,
}

async fn actors_to_sign_handler<S: LookupStorage>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<VerifierQuery>,
) -> Result<Json<ActorsToSign>, ApiError> {
    let verifier_id = state
        .storage
        .register_verifier(&query.verifier)
        .await
        .map_err(storage_err)?;
    let uris = state
        .storage
        .unsigned_for_verifier(verifier_id, 100)
        .await
        .map_err(storage_err)?;
    let mut actors = Vec::with_capacity(uris.len());
    for uri in uris {
        if let Some((obj, _aux)) = state.storage.get(&uri).await.map_err(storage_err)? {
            actors.push(obj);
        }
    }
    Ok(Json(ActorsToSign { actors }))
}

#[derive(Deserialize)]
struct SignedActor {
    uri: String,
    signature: String,
    signature_time: i64,
}

#[derive(Deserialize)]
struct SignBatch {
    signed_by: String,
    signatures: Vec<SignedActor>,
}

async fn sign_page_handler<S: LookupStorage>(
    State(state): State<Arc<AppState<S>>>,
    Json(batch): Json<SignBatch>,
) -> Result<StatusCode, ApiError> {
    let verifier_id = state
        .storage
        .register_verifier(&batch.signed_by)
        .await
        .map_err(storage_err)?;

    for signed in batch.signatures {
        let Some((actor, aux)) = state.storage.get(&signed.uri).await.map_err(storage_err)? else {
            continue;
        };
        let webfinger = aux
            .as_ref()
            .and_then(|a| a.get("webfinger"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(public_key) = actor
            .get("publicKey")
            .and_then(|k| k.get("publicKeyPem"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        match state
            .sign_verifier
            .verify(
                actor.clone(),
                webfinger,
                public_key.to_string(),
                signed.signature.clone(),
                signed.signature_time,
            )
            .await
        {
            Ok(true) => {
                if let Err(e) = state
                    .storage
                    .record_signature(verifier_id, &signed.uri, &signed.signature, signed.signature_time)
                    .await
                {
                    warn!("failed to record signature for {}: {e}", signed.uri);
                }
            }
            Ok(false) => warn!("rejected invalid signature from {} for {}", batch.signed_by, signed.uri),
            Err(e) => warn!("signature verification error for {}: {e}", signed.uri),
        }
    }
    Ok(StatusCode::OK)
}

async fn status_handler<S: LookupStorage>(State(state): State<Arc<AppState<S>>>) -> Json<Value> {
    Json(json!({ "current": state.stats.snapshot() }))
}

fn storage_err(e: anyhow::Error) -> ApiError {
    warn!("storage error: {e}");
    ApiError::BadRequest("internal storage error".into())
}
