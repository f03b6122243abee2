use std::fmt;

use reqwest::StatusCode;
use tracing::debug;

use crate::domain::{CollectionDefinition, ShardEndpoint};

#[derive(Debug)]
pub enum ProvisionError {
    Transport {
        shard: String,
        collection: String,
        source: reqwest::Error,
    },
    Status {
        shard: String,
        collection: String,
        status: StatusCode,
    },
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport {
                shard,
                collection,
                source,
            } => write!(f, "shard {shard}: create collection {collection} failed: {source}"),
            Self::Status {
                shard,
                collection,
                status,
            } => write!(
                f,
                "shard {shard}: create collection {collection} returned {status}"
            ),
        }
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            Self::Status { .. } => None,
        }
    }
}

/// Creates a collection on a shard that has not seen it yet.
///
/// Shards accept repeated create calls, so concurrent gathers provisioning
/// the same collection are harmless beyond the redundant request.
#[derive(Debug, Clone)]
pub struct CollectionProvisioner {
    http: reqwest::Client,
}

impl CollectionProvisioner {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn provision(
        &self,
        shard: &ShardEndpoint,
        definition: &CollectionDefinition,
    ) -> Result<(), ProvisionError> {
        let url = shard.url_for(&["v1", "databases", &definition.tenant, "collections"]);
        let qualified = format!("{}/{}", definition.tenant, definition.collection);

        let resp = self
            .http
            .post(url)
            .json(&definition.schema)
            .send()
            .await
            .map_err(|source| ProvisionError::Transport {
                shard: shard.to_string(),
                collection: qualified.clone(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProvisionError::Status {
                shard: shard.to_string(),
                collection: qualified,
                status,
            });
        }

        debug!(shard = %shard, collection = %qualified, "collection provisioned");
        Ok(())
    }
}
