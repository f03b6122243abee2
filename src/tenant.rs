use axum::http::{HeaderMap, header};
use regex::Regex;

pub const TENANT_HEADER: &str = "x-docgate-database";

/// Maps an inbound request to the tenant (database) it addresses.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    account_mapper: Regex,
}

impl TenantResolver {
    /// `account_mapper` must contain a capture group yielding the tenant.
    pub fn new(account_mapper: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            account_mapper: Regex::new(account_mapper)?,
        })
    }

    pub fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(explicit) = header_str(headers, TENANT_HEADER) {
            return Some(explicit.to_string());
        }
        let host = header_str(headers, header::HOST.as_str())?;
        self.tenant_from_host(host)
    }

    pub fn tenant_from_host(&self, host: &str) -> Option<String> {
        let host = strip_port(host);
        let caps = self.account_mapper.captures(host)?;
        caps.get(1)
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals keep their brackets; only a trailing :port is removed.
    match host.rsplit_once(':') {
        Some((name, port)) if !name.ends_with(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
