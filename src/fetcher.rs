//! Performs a single HTTPS JSON-LD GET and classifies the outcome

use crate::{error::Error, ACTIVITY_JSON_CONTENT_TYPE, AS_JSON_CONTENT_TYPE};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// URLs used to probe for general internet connectivity. Any one succeeding is
/// considered a liveness signal.
const RELIABLE_PROBE_SITES: &[&str] = &["https://www.google.com/", "https://www.cloudflare.com/"];

/// Performs a single HTTPS JSON-LD GET and classifies the result.
#[derive(Clone)]
pub struct Fetcher {
    client: ClientWithMiddleware,
    request_timeout: Duration,
    connect_timeout: Duration,
    debug: bool,
}

impl Fetcher {
    /// Construct a fetcher. `debug` relaxes the `https`-only and loopback-host
    /// restrictions, matching [`crate::config::EngineConfig::debug`].
    pub fn new(
        client: ClientWithMiddleware,
        request_timeout: Duration,
        connect_timeout: Duration,
        debug: bool,
    ) -> Self {
        Fetcher {
            client,
            request_timeout,
            connect_timeout,
            debug,
        }
    }

    fn validate(&self, uri: &Url) -> Result<(), Error> {
        if uri.scheme() != "https" && !self.debug {
            return Err(Error::InvalidUri("only https scheme is supported".into()));
        }
        let loopback = matches!(
            uri.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("0.0.0.0") | Some("::1")
        );
        if loopback && !self.debug {
            return Err(Error::InvalidUri("local requests aren't supported".into()));
        }
        Ok(())
    }

    /// Fetch an ActivityStreams JSON object over HTTPS, classifying the response
    /// into the crate's error classes. On success, returns the decoded JSON object.
    pub async fn fetch(&self, uri: &Url) -> Result<Value, Error> {
        self.validate(uri)?;
        let accept = format!("{ACTIVITY_JSON_CONTENT_TYPE}, {AS_JSON_CONTENT_TYPE}");
        debug!("fetching {uri}");

        let response = self
            .client
            .get(uri.as_str())
            .header("Accept", accept)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify_transport_error(uri, &e))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(terminal(uri, "private resource"));
        }
        if status.as_u16() == 404 {
            return Err(terminal(uri, "not found"));
        }
        if status.as_u16() == 429 {
            return Err(temporary(uri, "rate limit exceeded"));
        }
        if status.is_server_error() {
            return Err(temporary(uri, &format!("server error {status}")));
        }
        if !status.is_success() {
            return Err(terminal(uri, &format!("response code {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| temporary(uri, &format!("payload error: {e}")))?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| temporary(uri, &format!("can't parse returned json: {e}")))?;
        if !value.is_object() {
            return Err(terminal(uri, "expected json dictionary"));
        }
        Ok(value)
    }

    /// Fetch a small XML document (host-meta XRD) as text, without the
    /// ActivityStreams content-type/shape requirements `fetch` enforces.
    pub(crate) async fn fetch_xrd(&self, uri: &Url) -> Result<String, Error> {
        self.validate(uri)?;
        let response = self
            .client
            .get(uri.as_str())
            .header("Accept", "application/xrd+xml, application/xml, text/xml")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify_transport_error(uri, &e))?;
        if !response.status().is_success() {
            return Err(terminal(uri, &format!("response code {}", response.status())));
        }
        response
            .text()
            .await
            .map_err(|e| temporary(uri, &format!("payload error: {e}")))
    }

    /// Fetch and decode a WebFinger JRD document. Returns the plain status code
    /// on non-2xx so callers can special-case a 404 fallback to host-meta.
    pub(crate) async fn fetch_webfinger_doc(
        &self,
        uri: &Url,
    ) -> Result<crate::webfinger::Webfinger, u16> {
        self.validate(uri).map_err(|_| 0u16)?;
        let response = self
            .client
            .get(uri.as_str())
            .header("Accept", "application/jrd+json, application/json")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|_| 0u16)?;
        let status = response.status();
        if !status.is_success() {
            return Err(status.as_u16());
        }
        let body = response.bytes().await.map_err(|_| 0u16)?;
        serde_json::from_slice(&body).map_err(|_| 0u16)
    }

    /// Probe connectivity against a small hard-coded list of control URLs.
    /// Returns true iff any succeeds.
    pub async fn check_connectivity(&self) -> bool {
        for site in RELIABLE_PROBE_SITES {
            if let Ok(url) = Url::parse(site) {
                if self
                    .client
                    .get(url.as_str())
                    .timeout(self.connect_timeout)
                    .send()
                    .await
                    .is_ok()
                {
                    return true;
                }
            }
        }
        warn!("no internet connection detected");
        false
    }
}

fn terminal(uri: &Url, message: &str) -> Error {
    info!("fetch of {uri} failed terminally: {message}");
    Error::FailedFetch {
        uri: uri.to_string(),
        message: message.to_string(),
    }
}

fn temporary(uri: &Url, message: &str) -> Error {
    debug!("fetch of {uri} failed temporarily: {message}");
    Error::TemporaryFetchError {
        uri: uri.to_string(),
        message: message.to_string(),
    }
}

fn classify_transport_error(uri: &Url, e: &reqwest_middleware::Error) -> Error {
    if let reqwest_middleware::Error::Reqwest(re) = e {
        if re.is_timeout() {
            return temporary(uri, "timeout");
        }
        if re.is_connect() {
            return temporary(uri, "failed to connect");
        }
        if re.is_redirect() {
            return terminal(uri, "too many redirects");
        }
        if re.is_decode() {
            return temporary(uri, "can't parse returned json");
        }
    }
    temporary(uri, &format!("client error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(debug: bool) -> Fetcher {
        Fetcher::new(
            reqwest::Client::default().into(),
            Duration::from_secs(5),
            Duration::from_secs(2),
            debug,
        )
    }

    #[tokio::test]
    async fn success_returns_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/u/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "http://x/u/alice", "type": "Person"
            })))
            .mount(&server)
            .await;
        let url = Url::parse(&format!("{}/u/alice", server.uri())).unwrap();
        let res = fetcher(true).fetch(&url).await.unwrap();
        assert_eq!(res["type"], "Person");
    }

    #[tokio::test]
    async fn not_found_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let err = fetcher(true).fetch(&url).await.unwrap_err();
        assert!(!err.is_temporary());
    }

    #[tokio::test]
    async fn server_error_is_temporary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let url = Url::parse(&format!("{}/flaky", server.uri())).unwrap();
        let err = fetcher(true).fetch(&url).await.unwrap_err();
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn too_many_requests_is_temporary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        let url = Url::parse(&format!("{}/limited", server.uri())).unwrap();
        let err = fetcher(true).fetch(&url).await.unwrap_err();
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn rejects_http_outside_debug() {
        let url = Url::parse("http://example.test/u/alice").unwrap();
        let err = fetcher(false).fetch(&url).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[tokio::test]
    async fn rejects_loopback_outside_debug() {
        let url = Url::parse("https://localhost/u/alice").unwrap();
        let err = fetcher(false).fetch(&url).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));
    }
}
