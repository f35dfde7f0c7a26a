//! Canonical actor envelope and the RSA-SHA256 sign/verify worker pool
//!
//! Signing and verification are CPU-bound and must never block the async I/O
//! loop. Both are offloaded to [`tokio::task::spawn_blocking`], admission-gated
//! by a bounded [`Semaphore`] sized to [`crate::config::EngineConfig::sign_worker_count`]
//! so a burst of requests can't spawn unbounded blocking threads.

use crate::error::Error;
use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier as _},
    RsaPrivateKey, RsaPublicKey,
};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Builds the canonical signing payload for an actor document, with a fixed
/// field list and ordering. Returns `None` if `actor` isn't an object or
/// lacks a `publicKey` object (there is nothing meaningful to sign).
///
/// The returned string is minimal-whitespace, lexicographically-sorted JSON so
/// the same logical payload serializes byte-identically on the signer and every
/// verifier, regardless of the source map's insertion order.
pub fn data_to_sign(actor: &Value, webfinger: Option<&str>, sign_time: i64) -> Option<String> {
    let actor = actor.as_object()?;
    let actor_key = actor.get("publicKey").and_then(Value::as_object)?;

    let mut to_sign = Map::new();
    for (field, key) in [
        ("actor_id", "id"),
        ("actor_uri", "uri"),
        ("actor_type", "type"),
        ("actor_following", "following"),
        ("actor_followers", "followers"),
        ("actor_inbox", "inbox"),
        ("actor_outbox", "outbox"),
        ("actor_name", "name"),
        ("actor_url", "url"),
        ("actor_published", "published"),
        ("actor_endpoints", "endpoints"),
    ] {
        to_sign.insert(
            field.to_string(),
            actor.get(key).cloned().unwrap_or(Value::Null),
        );
    }
    to_sign.insert(
        "webfinger".to_string(),
        webfinger.map_or(Value::Null, |w| Value::String(w.to_string())),
    );
    to_sign.insert("key".to_string(), Value::Object(actor_key.clone()));
    to_sign.insert("signature_time".to_string(), Value::from(sign_time));

    sorted_compact_json(&Value::Object(to_sign))
}

/// Re-serializes `value` with object keys sorted lexicographically and no
/// extraneous whitespace, matching Python's `json.dumps(sort_keys=True,
/// separators=(",", ":"))`.
fn sorted_compact_json(value: &Value) -> Option<String> {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut sorted = serde_json::Map::new();
                for (k, v) in entries {
                    sorted.insert(k.clone(), sort(v));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).ok()
}

fn verify_raw(data: &str, signer_key_pem: &str, signature_b64: &str) -> bool {
    let Ok(signature_bytes) = STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = rsa::pkcs1v15::Signature::try_from(signature_bytes.as_slice()) else {
        return false;
    };
    let public_key = RsaPublicKey::from_public_key_pem(signer_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(signer_key_pem));
    let Ok(public_key) = public_key else {
        return false;
    };
    let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);
    verifying_key.verify(data.as_bytes(), &signature).is_ok()
}

fn sign_raw(data: &str, key: &RsaPrivateKey) -> String {
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, data.as_bytes());
    STANDARD.encode(signature.to_bytes())
}

/// Offloads RSA-SHA256 verification of third-party signatures to the blocking
/// thread pool, bounded by a semaphore so concurrent verification requests
/// can't overwhelm the runtime.
#[derive(Clone)]
pub struct Verifier {
    permits: Arc<Semaphore>,
}

impl Verifier {
    /// `workers` bounds the number of signature verifications running
    /// concurrently.
    pub fn new(workers: usize) -> Self {
        Verifier {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Verify that `signature` over the canonical envelope of `actor` was
    /// produced by the holder of `signer_key_pem`. Returns `Ok(false)` (not an
    /// error) for a malformed or mismatched signature; only pool shutdown
    /// surfaces as [`Error::SigningCancelled`].
    pub async fn verify(
        &self,
        actor: Value,
        webfinger: Option<String>,
        signer_key_pem: String,
        signature: String,
        sign_time: i64,
    ) -> Result<bool, Error> {
        let Some(data) = data_to_sign(&actor, webfinger.as_deref(), sign_time) else {
            return Ok(false);
        };
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::SigningCancelled)?;
        tokio::task::spawn_blocking(move || verify_raw(&data, &signer_key_pem, &signature))
            .await
            .map_err(|_| Error::SigningCancelled)
    }
}

/// Offloads RSA-SHA256 signing to the blocking thread pool on behalf of a
/// single long-lived key, bounded by a semaphore.
#[derive(Clone)]
pub struct Signer {
    key: Arc<RsaPrivateKey>,
    permits: Arc<Semaphore>,
}

impl Signer {
    /// Load a PKCS#1 or PKCS#8 PEM-encoded RSA private key and size the
    /// concurrent-signing semaphore to `workers`.
    pub fn from_pem(key_pem: &str, workers: usize) -> Result<Self, Error> {
        let key = RsaPrivateKey::from_pkcs8_pem(key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(key_pem))
            .map_err(|e| Error::InvalidUri(format!("not a valid RSA private key: {e}")))?;
        Ok(Signer {
            key: Arc::new(key),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        })
    }

    /// PKCS#8 PEM encoding of this signer's public key, advertised in a
    /// verifier's own actor document (`publicKey.publicKeyPem`).
    pub fn public_key_pem(&self) -> Result<String, Error> {
        use rsa::pkcs8::EncodePublicKey;
        self.key
            .to_public_key()
            .to_public_key_pem(Default::default())
            .map_err(|e| Error::InvalidUri(format!("failed to encode public key: {e}")))
    }

    /// Sign the canonical envelope of `actor`. Returns `None` if `actor` has
    /// no `publicKey`, mirroring `get_data_to_sign`'s `None` case.
    pub async fn sign(
        &self,
        actor: Value,
        webfinger: Option<String>,
        sign_time: i64,
    ) -> Result<Option<String>, Error> {
        let Some(data) = data_to_sign(&actor, webfinger.as_deref(), sign_time) else {
            return Ok(None);
        };
        self.sign_raw_data(data).await.map(Some)
    }

    /// Sign only if `actor` and `actor2` (two independently fetched copies of
    /// the same document) produce byte-identical canonical envelopes. Returns
    /// `None` on mismatch without ever touching the signing thread, so a
    /// divergent re-fetch never burns a worker slot.
    pub async fn compare_and_sign(
        &self,
        actor: Value,
        actor2: Value,
        webfinger: Option<String>,
        sign_time: i64,
    ) -> Result<Option<String>, Error> {
        let data = data_to_sign(&actor, webfinger.as_deref(), sign_time);
        let data2 = data_to_sign(&actor2, webfinger.as_deref(), sign_time);
        match (data, data2) {
            (Some(a), Some(b)) if a == b => self.sign_raw_data(a).await.map(Some),
            _ => Ok(None),
        }
    }

    async fn sign_raw_data(&self, data: String) -> Result<String, Error> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::SigningCancelled)?;
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || sign_raw(&data, &key))
            .await
            .map_err(|_| Error::SigningCancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_actor() -> Value {
        json!({
            "id": "https://example.test/u/alice",
            "type": "Person",
            "inbox": "https://example.test/u/alice/inbox",
            "outbox": "https://example.test/u/alice/outbox",
            "publicKey": {"id": "https://example.test/u/alice#main-key", "publicKeyPem": "..."},
        })
    }

    #[test]
    fn missing_public_key_yields_none() {
        let actor = json!({"id": "https://example.test/u/alice", "type": "Person"});
        assert_eq!(data_to_sign(&actor, None, 0), None);
    }

    #[test]
    fn envelope_is_order_independent() {
        let a = data_to_sign(&sample_actor(), Some("acct:alice@example.test"), 100).unwrap();
        // Re-insert the same fields in a different order; the canonical
        // envelope must come out byte-identical.
        let reordered = json!({
            "outbox": "https://example.test/u/alice/outbox",
            "publicKey": {"publicKeyPem": "...", "id": "https://example.test/u/alice#main-key"},
            "inbox": "https://example.test/u/alice/inbox",
            "type": "Person",
            "id": "https://example.test/u/alice",
        });
        let b = data_to_sign(&reordered, Some("acct:alice@example.test"), 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn envelope_has_no_extraneous_whitespace() {
        let data = data_to_sign(&sample_actor(), None, 0).unwrap();
        assert!(!data.contains(", ") && !data.contains(": "));
    }

    #[tokio::test]
    async fn round_trip_sign_and_verify() {
        // 512-bit is far too weak for production use but keeps the test fast;
        // production key material is operator-supplied, never generated here.
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let pem = {
            use rsa::pkcs8::EncodePrivateKey;
            key.to_pkcs8_pem(Default::default()).unwrap().to_string()
        };
        let public_pem = {
            use rsa::pkcs8::EncodePublicKey;
            key.to_public_key()
                .to_public_key_pem(Default::default())
                .unwrap()
        };

        let signer = Signer::from_pem(&pem, 2).unwrap();
        let actor = sample_actor();
        let signature = signer
            .sign(actor.clone(), Some("acct:alice@example.test".into()), 42)
            .await
            .unwrap()
            .unwrap();

        let verifier = Verifier::new(2);
        let ok = verifier
            .verify(
                actor,
                Some("acct:alice@example.test".into()),
                public_pem,
                signature,
                42,
            )
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn compare_and_sign_rejects_divergent_copies() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let pem = {
            use rsa::pkcs8::EncodePrivateKey;
            key.to_pkcs8_pem(Default::default()).unwrap().to_string()
        };
        let signer = Signer::from_pem(&pem, 2).unwrap();
        let a = sample_actor();
        let mut b = sample_actor();
        b["name"] = json!("different on second fetch");
        let result = signer.compare_and_sign(a, b, None, 1).await.unwrap();
        assert!(result.is_none());
    }
}
