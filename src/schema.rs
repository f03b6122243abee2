use std::{fmt, future::Future, pin::Pin};

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    domain::{CollectionDefinition, ManagerEndpoint},
    internal_auth::{pick_manager, with_internal_secret},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug)]
pub enum ResolveError {
    NotFound { tenant: String, collection: String },
    NoManagers,
    Transport { manager: String, source: reqwest::Error },
    Status { manager: String, status: StatusCode },
    Body { manager: String, source: reqwest::Error },
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { tenant, collection } => {
                write!(f, "the collection \"{tenant}/{collection}\" does not exist")
            }
            Self::NoManagers => write!(f, "no managers configured to resolve collections"),
            Self::Transport { manager, source } => {
                write!(f, "manager {manager}: collection lookup failed: {source}")
            }
            Self::Status { manager, status } => {
                write!(f, "manager {manager}: collection lookup returned {status}")
            }
            Self::Body { manager, source } => {
                write!(f, "manager {manager}: invalid collection body: {source}")
            }
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } | Self::Body { source, .. } => Some(source),
            Self::NotFound { .. } | Self::NoManagers | Self::Status { .. } => None,
        }
    }
}

/// Looks up the definition of a tenant's collection.
///
/// `Ok(None)` means the collection exists but carries no schema, so a shard
/// missing it cannot be provisioned.
pub trait CollectionResolver: Send + Sync + 'static {
    fn resolve<'a>(
        &'a self,
        tenant: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<Option<CollectionDefinition>, ResolveError>>;
}

#[derive(Debug, Deserialize)]
struct ManagerCollection {
    #[serde(default)]
    schema: Option<Value>,
}

/// Resolves definitions from `GET /v1/databases/{tenant}/collections/{name}`
/// on a randomly chosen manager.
#[derive(Debug, Clone)]
pub struct ManagerCollectionResolver {
    managers: Vec<ManagerEndpoint>,
    secret: String,
    http: reqwest::Client,
}

impl ManagerCollectionResolver {
    pub fn new(managers: Vec<ManagerEndpoint>, secret: String, http: reqwest::Client) -> Self {
        Self {
            managers,
            secret,
            http,
        }
    }

    async fn fetch(
        &self,
        tenant: &str,
        collection: &str,
    ) -> Result<Option<CollectionDefinition>, ResolveError> {
        let manager = pick_manager(&self.managers).ok_or(ResolveError::NoManagers)?;
        let url = manager.url_for(&["v1", "databases", tenant, "collections", collection]);

        let resp = with_internal_secret(self.http.get(url), &self.secret)
            .send()
            .await
            .map_err(|source| ResolveError::Transport {
                manager: manager.to_string(),
                source,
            })?;

        match resp.status() {
            StatusCode::OK => {
                let body = resp.json::<ManagerCollection>().await.map_err(|source| {
                    ResolveError::Body {
                        manager: manager.to_string(),
                        source,
                    }
                })?;
                Ok(body.schema.map(|schema| CollectionDefinition {
                    tenant: tenant.to_string(),
                    collection: collection.to_string(),
                    schema,
                }))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::NOT_FOUND => Err(ResolveError::NotFound {
                tenant: tenant.to_string(),
                collection: collection.to_string(),
            }),
            status => Err(ResolveError::Status {
                manager: manager.to_string(),
                status,
            }),
        }
    }
}

impl CollectionResolver for ManagerCollectionResolver {
    fn resolve<'a>(
        &'a self,
        tenant: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<Option<CollectionDefinition>, ResolveError>> {
        Box::pin(self.fetch(tenant, collection))
    }
}
