use std::fmt;

use reqwest::StatusCode;

use crate::{
    domain::{QueryRequest, ShardBatch, ShardEndpoint},
    provision::ProvisionError,
};

#[derive(Debug)]
pub enum ShardError {
    Transport {
        shard: String,
        source: reqwest::Error,
    },
    Status {
        shard: String,
        status: StatusCode,
    },
    Body {
        shard: String,
        source: reqwest::Error,
    },
    CollectionMissing {
        shard: String,
        after_provision: bool,
    },
    Provision(ProvisionError),
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { shard, source } => write!(f, "shard {shard}: request failed: {source}"),
            Self::Status { shard, status } => write!(f, "shard {shard}: unexpected status {status}"),
            Self::Body { shard, source } => write!(f, "shard {shard}: invalid records body: {source}"),
            Self::CollectionMissing {
                shard,
                after_provision: true,
            } => write!(f, "shard {shard}: collection still missing after provisioning"),
            Self::CollectionMissing { shard, .. } => {
                write!(f, "shard {shard}: collection missing and no definition to provision")
            }
            Self::Provision(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ShardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } | Self::Body { source, .. } => Some(source),
            Self::Provision(e) => Some(e),
            Self::Status { .. } | Self::CollectionMissing { .. } => None,
        }
    }
}

impl From<ProvisionError> for ShardError {
    fn from(value: ProvisionError) -> Self {
        Self::Provision(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShardReply {
    Batch(ShardBatch),
    /// The shard has never seen this collection.
    NotFound,
}

/// Issues exactly one records read against one shard. Never retries.
#[derive(Debug, Clone)]
pub struct ShardClient {
    http: reqwest::Client,
}

impl ShardClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn query(
        &self,
        shard: &ShardEndpoint,
        request: &QueryRequest,
    ) -> Result<ShardReply, ShardError> {
        let mut url = shard.url_for(&[
            "v1",
            "databases",
            &request.tenant,
            "records",
            &request.collection,
        ]);
        if !request.query.is_empty() {
            url.set_query(Some(&request.query));
        }

        let resp = self
            .http
            .get(url)
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|source| ShardError::Transport {
                shard: shard.to_string(),
                source,
            })?;

        match resp.status() {
            StatusCode::OK => {
                let batch = resp
                    .json::<ShardBatch>()
                    .await
                    .map_err(|source| ShardError::Body {
                        shard: shard.to_string(),
                        source,
                    })?;
                Ok(ShardReply::Batch(batch))
            }
            StatusCode::NOT_FOUND => Ok(ShardReply::NotFound),
            status => Err(ShardError::Status {
                shard: shard.to_string(),
                status,
            }),
        }
    }
}
