//! Constrained outbound HTTP for `network.fetch`.

use crate::config::NetworkConfig;
use crate::message::{ErrorCode, ErrorPayload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    /// `*.example.com`, stored as `.example.com`. Matches subdomains only.
    Suffix(String),
}

impl HostPattern {
    fn parse(raw: &str) -> Option<Self> {
        let host = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        match host.strip_prefix("*.") {
            Some("") => None,
            Some(suffix) => Some(Self::Suffix(format!(".{suffix}"))),
            None => Some(Self::Exact(host)),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(exact) => host == exact,
            Self::Suffix(suffix) => host.ends_with(suffix.as_str()) && host.len() > suffix.len(),
        }
    }
}

/// Hostname allow-list for plugin fetches. Empty means nothing is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPolicy {
    allowed: Vec<HostPattern>,
}

impl NetworkPolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: patterns
                .into_iter()
                .filter_map(|p| HostPattern::parse(p.as_ref()))
                .collect(),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(&config.allowed_hosts)
    }

    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed.iter().any(|p| p.matches(&host))
    }

    /// Parses `raw` and checks it against the allow-list.
    ///
    /// Only `http` and `https` URLs with an allowed host pass; anything
    /// else is `network-not-permitted`.
    pub fn check(&self, raw: &str) -> Result<Url, ErrorPayload> {
        let url = Url::parse(raw)
            .map_err(|e| ErrorPayload::invalid_arguments(format!("invalid URL '{raw}': {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ErrorPayload::new(
                ErrorCode::NetworkNotPermitted,
                format!("scheme '{}' is not permitted", url.scheme()),
            )
            .with_detail(json!({ "url": raw, "scheme": url.scheme() })));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ErrorPayload::invalid_arguments(format!("URL '{raw}' has no host")))?;
        if !self.allows_host(host) {
            return Err(ErrorPayload::new(
                ErrorCode::NetworkNotPermitted,
                format!("host '{host}' is not on the network allow-list"),
            )
            .with_detail(json!({ "url": raw, "host": host })));
        }
        Ok(url)
    }
}

/// Optional second argument of `network.fetch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct FetchInit {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Performs an already-authorized request.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse>;
}

/// Default fetcher over `reqwest`. Redirects are not followed, so every
/// host a plugin reaches has passed the allow-list.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(config: &NetworkConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())?;
        let mut builder = self.client.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}
