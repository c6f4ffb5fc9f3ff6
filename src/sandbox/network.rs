//! Guarded network access.
//!
//! A plugin may reach the host's own origin and the origins listed in its
//! manifest. Anything else is refused before the transport is touched.

use crate::core::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use url::{Origin, ParseError, Url};

/// Outgoing request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// HTTP method
    pub method: String,
    /// Absolute or host-relative URL
    pub url: String,
    /// Request headers
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
}

impl NetworkRequest {
    /// GET request.
    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// POST request with a JSON body.
    pub fn post(url: &str, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Response from the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkResponse {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Value,
}

impl NetworkResponse {
    /// 200 response with a body.
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }
}

/// Host-provided transport that performs requests.
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    /// Perform a request.
    async fn send(&self, request: NetworkRequest) -> Result<NetworkResponse>;
}

/// Transport for hosts without network access.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableTransport;

#[async_trait]
impl NetworkTransport for UnavailableTransport {
    async fn send(&self, request: NetworkRequest) -> Result<NetworkResponse> {
        Err(Error::Network(format!("no transport configured for {}", request.url)))
    }
}

/// Per-plugin origin check in front of a transport.
pub struct NetworkGuard {
    plugin_id: String,
    host: Option<Url>,
    allowed: Vec<Origin>,
    transport: Arc<dyn NetworkTransport>,
}

impl NetworkGuard {
    /// Create a guard. Unparseable allow-list entries are ignored.
    pub fn new(
        plugin_id: &str,
        host_origin: Option<&str>,
        allowlist: &[String],
        transport: Arc<dyn NetworkTransport>,
    ) -> Self {
        let host = host_origin.and_then(|o| match Url::parse(o) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(plugin_id, origin = o, error = %e, "ignoring unparseable host origin");
                None
            }
        });
        let allowed = allowlist
            .iter()
            .filter_map(|entry| match Url::parse(entry) {
                Ok(url) => Some(url.origin()),
                Err(e) => {
                    warn!(plugin_id, entry = %entry, error = %e, "ignoring unparseable network allow-list entry");
                    None
                }
            })
            .collect();
        Self {
            plugin_id: plugin_id.to_string(),
            host,
            allowed,
            transport,
        }
    }

    /// Resolve a target against the host origin.
    fn resolve(&self, target: &str) -> Option<Url> {
        match Url::parse(target) {
            Ok(url) => Some(url),
            Err(ParseError::RelativeUrlWithoutBase) => self.host.as_ref()?.join(target).ok(),
            Err(_) => None,
        }
    }

    /// Whether a target URL may be requested.
    pub fn is_allowed(&self, target: &str) -> bool {
        let Some(url) = self.resolve(target) else {
            return false;
        };
        let origin = url.origin();
        if !origin.is_tuple() {
            return false;
        }
        self.host.as_ref().is_some_and(|h| h.origin() == origin) || self.allowed.contains(&origin)
    }

    /// Send a request if its target is allowed.
    pub async fn fetch(&self, mut request: NetworkRequest) -> Result<NetworkResponse> {
        let resolved = self
            .resolve(&request.url)
            .filter(|_| self.is_allowed(&request.url));
        let Some(url) = resolved else {
            warn!(plugin_id = %self.plugin_id, url = %request.url, "network request blocked");
            return Err(Error::AccessDenied {
                plugin_id: self.plugin_id.clone(),
                message: format!("network access to '{}' is not allowed", request.url),
            });
        };
        request.url = url.to_string();
        debug!(plugin_id = %self.plugin_id, method = %request.method, url = %request.url, "network request");
        self.transport.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<NetworkRequest>>,
    }

    #[async_trait]
    impl NetworkTransport for RecordingTransport {
        async fn send(&self, request: NetworkRequest) -> Result<NetworkResponse> {
            self.sent.lock().unwrap().push(request);
            Ok(NetworkResponse::ok(Value::Null))
        }
    }

    fn guard(transport: Arc<RecordingTransport>) -> NetworkGuard {
        NetworkGuard::new(
            "weather",
            Some("https://host.example.com"),
            &["https://api.weather.test".to_string(), "::bad::".to_string()],
            transport,
        )
    }

    #[test]
    fn test_origin_rules() {
        let g = guard(Arc::new(RecordingTransport::default()));
        assert!(g.is_allowed("https://host.example.com/api/x"));
        assert!(g.is_allowed("/api/relative"));
        assert!(g.is_allowed("https://api.weather.test/v1/today?q=1"));
        assert!(!g.is_allowed("http://api.weather.test/v1"));
        assert!(!g.is_allowed("https://api.weather.test:8443/v1"));
        assert!(!g.is_allowed("https://evil.example.net/"));
        assert!(!g.is_allowed("data:text/plain,hi"));
    }

    #[tokio::test]
    async fn test_cross_origin_denied_and_not_sent() {
        let transport = Arc::new(RecordingTransport::default());
        let g = guard(transport.clone());

        let err = g.fetch(NetworkRequest::get("https://evil.example.net/steal")).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied { ref plugin_id, .. } if plugin_id == "weather"));
        assert!(transport.sent.lock().unwrap().is_empty());

        g.fetch(NetworkRequest::get("/api/ping")).await.unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://host.example.com/api/ping");
    }

    #[tokio::test]
    async fn test_relative_target_without_host_denied() {
        let g = NetworkGuard::new("p", None, &[], Arc::new(UnavailableTransport));
        assert!(!g.is_allowed("/api"));
        assert!(matches!(
            g.fetch(NetworkRequest::get("/api")).await,
            Err(Error::AccessDenied { .. })
        ));
    }
}
