//! Resolves `acct:user@host` identifiers via WebFinger, with host-meta fallback

use crate::fetcher::Fetcher;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::OnceCell;
use url::Url;

/// A WebFinger response document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Webfinger {
    /// The canonical identifier the server resolved `resource` to.
    pub subject: String,
    /// Links advertised for `subject`.
    #[serde(default)]
    pub links: Vec<WebfingerLink>,
}

/// A single link entry in a [`Webfinger`] document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebfingerLink {
    /// Relation type, e.g. `"self"`.
    pub rel: Option<String>,
    /// Mime type of the linked resource.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// The linked URI.
    pub href: Option<String>,
}

impl Webfinger {
    fn self_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel.as_deref() == Some("self"))
            .and_then(|l| l.href.as_deref())
    }
}

fn split_acct(acct: &str) -> Option<(&str, &str)> {
    let rest = acct.strip_prefix("acct:")?;
    rest.split_once('@')
}

fn webfinger_uri(acct: &str) -> Option<Url> {
    let (_, domain) = split_acct(acct)?;
    Url::parse(&format!(
        "https://{domain}/.well-known/webfinger?resource={}",
        urlencoding_resource(acct)
    ))
    .ok()
}

fn urlencoding_resource(acct: &str) -> String {
    url::form_urlencoded::byte_serialize(acct.as_bytes()).collect()
}

fn host_meta_uri(acct: &str) -> Option<Url> {
    let (_, domain) = split_acct(acct)?;
    Url::parse(&format!("https://{domain}/.well-known/host-meta")).ok()
}

/// Resolves `acct:` identifiers to their ActivityPub actor id via WebFinger,
/// falling back to a host-meta `lrdd` template when the direct query 404s.
pub struct WebfingerResolver {
    fetcher: Fetcher,
    /// Keyed by host-meta URI. Each cell resolves exactly once: the caller
    /// that installs it runs the fetch, every other caller awaits the same
    /// cell and receives its result.
    meta_cache: Cache<String, Arc<OnceCell<Option<String>>>>,
}

impl WebfingerResolver {
    /// Construct a resolver backed by `fetcher`, with a 1 hour host-meta cache TTL.
    pub fn new(fetcher: Fetcher) -> Self {
        WebfingerResolver {
            fetcher,
            meta_cache: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .build(),
        }
    }

    async fn fetch_host_meta_template(&self, acct: &str) -> Option<String> {
        let meta_uri = host_meta_uri(acct)?;
        let key = meta_uri.to_string();
        let cell = self.meta_cache.get_with(key, || Arc::new(OnceCell::new()));
        cell.get_or_init(|| self.resolve_host_meta_xrd(&meta_uri)).await.clone()
    }

    async fn resolve_host_meta_xrd(&self, meta_uri: &Url) -> Option<String> {
        let text = self.fetcher.fetch_xrd(meta_uri).await.ok()?;
        let doc = roxmltree::Document::parse(&text).ok()?;
        doc.descendants()
            .find(|n| n.tag_name().name() == "Link" && n.attribute("rel") == Some("lrdd"))
            .and_then(|n| n.attribute("template"))
            .map(str::to_string)
    }

    async fn resolve_via_host_meta(&self, acct: &str) -> Option<Webfinger> {
        let template = self.fetch_host_meta_template(acct).await?;
        let uri = Url::parse(&template.replace("{uri}", acct)).ok()?;
        self.fetcher.fetch_webfinger_doc(&uri).await.ok()
    }

    async fn resolve(&self, acct: &str) -> Option<Webfinger> {
        let uri = webfinger_uri(acct)?;
        match self.fetcher.fetch_webfinger_doc(&uri).await {
            Ok(wf) => Some(wf),
            Err(404) => self.resolve_via_host_meta(acct).await,
            Err(_) => None,
        }
    }

    /// `get_actor_webfinger`: resolves `acct` to `(acct, self_href)`, recursing
    /// at most once if the server redirects to a different `subject` — bounded
    /// at exactly two iterations.
    pub async fn get_actor_webfinger(&self, acct: &str) -> Option<(String, String)> {
        let mut current = acct.to_string();
        for _ in 0..2 {
            let webfinger = self.resolve(&current).await?;
            if webfinger.subject == current {
                return webfinger.self_link().map(|href| (current, href.to_string()));
            }
            current = webfinger.subject;
        }
        None
    }

    /// `resolve_actor_webfinger`: confirms the mutual binding between `acct` and
    /// `expected_self`, returning `acct` iff the resolved self-href matches.
    pub async fn resolve_actor_webfinger(
        &self,
        acct: &str,
        expected_self: &str,
    ) -> Option<String> {
        let (resolved, href) = self.get_actor_webfinger(acct).await?;
        if href == expected_self {
            Some(resolved)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_acct() {
        assert_eq!(
            split_acct("acct:alice@example.test"),
            Some(("alice", "example.test"))
        );
        assert_eq!(split_acct("not-an-acct"), None);
    }

    #[test]
    fn self_link_lookup() {
        let wf = Webfinger {
            subject: "acct:alice@example.test".into(),
            links: vec![WebfingerLink {
                rel: Some("self".into()),
                kind: Some("application/activity+json".into()),
                href: Some("https://example.test/u/alice".into()),
            }],
        };
        assert_eq!(wf.self_link(), Some("https://example.test/u/alice"));
    }
}
