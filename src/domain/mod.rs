use std::{fmt, str::FromStr};

use reqwest::{
    Url,
    header::{self, HeaderMap, HeaderName},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_LIMIT: usize = 10;

/// Base URL of a shard server or a manager.
///
/// Always absolute `http`/`https` with a hierarchical path, so paths can be
/// appended segment by segment without string concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint(Url);

pub type ShardEndpoint = Endpoint;
pub type ManagerEndpoint = Endpoint;

impl Endpoint {
    /// Appends percent-encoded path segments to the base URL.
    pub fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.0.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str().trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEndpoint {
    pub input: String,
    pub reason: String,
}

impl fmt::Display for InvalidEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid endpoint {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for InvalidEndpoint {}

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| InvalidEndpoint {
            input: s.to_string(),
            reason,
        };
        let url = Url::parse(s.trim()).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(invalid("expected an absolute base url".to_string()));
        }
        Ok(Self(url))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsageKey {
    pub tenant: String,
    pub collection: String,
    pub operation: Operation,
}

impl UsageKey {
    pub fn new(tenant: impl Into<String>, collection: impl Into<String>, operation: Operation) -> Self {
        Self {
            tenant: tenant.into(),
            collection: collection.into(),
            operation,
        }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.tenant,
            self.collection,
            self.operation.as_str()
        )
    }
}

/// Schema blob the manager holds for a collection; posted verbatim to a
/// shard when the collection has to be created there.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionDefinition {
    pub tenant: String,
    pub collection: String,
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub tenant: String,
    pub collection: String,
    /// Raw query string without the leading `?`, forwarded to every shard.
    pub query: String,
    pub limit: usize,
    /// Client headers passed through to shards, see [`forwardable_headers`].
    pub headers: HeaderMap,
}

impl QueryRequest {
    pub fn new(
        tenant: impl Into<String>,
        collection: impl Into<String>,
        raw_query: Option<String>,
        limit: Option<&str>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            collection: collection.into(),
            query: raw_query.unwrap_or_default().trim().to_string(),
            limit: parse_limit(limit),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_forwarded_headers(mut self, inbound: &HeaderMap) -> Self {
        self.headers = forwardable_headers(inbound);
        self
    }
}

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Copies inbound client headers minus the ones that describe the client
/// connection rather than the request: `Host`, body framing, hop-by-hop
/// headers (including any named in `Connection`) and `Accept-Encoding`, since
/// shard bodies are decoded by the gateway.
pub fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let named_by_connection: Vec<String> = inbound
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        let dropped = name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::ACCEPT_ENCODING
            || HOP_BY_HOP.contains(name)
            || named_by_connection.iter().any(|n| n == name.as_str());
        if !dropped {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

pub fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_LIMIT)
}

/// One shard's answer: `count` is what the shard matched, `items` only the
/// page it returned.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShardBatch {
    pub count: u64,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordsPage {
    pub count: u64,
    pub items: Vec<Value>,
}
