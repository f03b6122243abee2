use std::{fmt, sync::Arc};

use futures_util::future::join_all;
use tracing::{Instrument as _, info_span, warn};

use crate::{
    domain::{CollectionDefinition, Operation, QueryRequest, RecordsPage, ShardBatch, ShardEndpoint},
    id::new_gather_id,
    merge::merge,
    provision::CollectionProvisioner,
    schema::{CollectionResolver, ResolveError},
    shard::{ShardClient, ShardError, ShardReply},
    usage::UsageHandle,
};

#[derive(Debug)]
pub enum GatherError {
    /// Tenant/collection unknown; no shard was contacted.
    Identity(ResolveError),
    /// At least one shard failed, so the whole gather failed.
    Shards(Vec<ShardError>),
}

impl fmt::Display for GatherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity(e) => write!(f, "{e}"),
            Self::Shards(errors) => {
                write!(f, "{} shard(s) failed", errors.len())?;
                for e in errors {
                    write!(f, "; {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for GatherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Identity(e) => Some(e),
            Self::Shards(errors) => errors
                .first()
                .map(|e| e as &(dyn std::error::Error + 'static)),
        }
    }
}

// Querying -> (404) Provisioning -> Retrying -> done. A 404 while Retrying is
// terminal, so a shard is provisioned at most once per gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardPhase {
    Querying,
    Provisioning,
    Retrying,
}

pub struct ScatterGather {
    shards: Vec<ShardEndpoint>,
    client: ShardClient,
    provisioner: CollectionProvisioner,
    resolver: Arc<dyn CollectionResolver>,
    usage: UsageHandle,
}

impl ScatterGather {
    pub fn new(
        shards: Vec<ShardEndpoint>,
        http: reqwest::Client,
        resolver: Arc<dyn CollectionResolver>,
        usage: UsageHandle,
    ) -> Self {
        Self {
            shards,
            client: ShardClient::new(http.clone()),
            provisioner: CollectionProvisioner::new(http),
            resolver,
            usage,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub async fn gather(&self, request: &QueryRequest) -> Result<RecordsPage, GatherError> {
        let span = info_span!(
            "gather",
            gather_id = %new_gather_id(),
            tenant = %request.tenant,
            collection = %request.collection,
        );
        self.gather_inner(request).instrument(span).await
    }

    async fn gather_inner(&self, request: &QueryRequest) -> Result<RecordsPage, GatherError> {
        let definition = self
            .resolver
            .resolve(&request.tenant, &request.collection)
            .await
            .map_err(GatherError::Identity)?;

        let outcomes = join_all(
            self.shards
                .iter()
                .map(|shard| self.query_shard(shard, request, definition.as_ref())),
        )
        .await;

        let mut batches = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(batch) => batches.push(batch),
                Err(err) => {
                    warn!(%err, "shard query failed");
                    errors.push(err);
                }
            }
        }

        if !errors.is_empty() {
            return Err(GatherError::Shards(errors));
        }

        let page = merge(batches, request.limit);
        let returned = u64::try_from(page.items.len()).unwrap_or(u64::MAX);
        self.usage.tick(
            request.tenant.as_str(),
            request.collection.as_str(),
            Operation::Read,
            returned.max(1),
        );
        Ok(page)
    }

    async fn query_shard(
        &self,
        shard: &ShardEndpoint,
        request: &QueryRequest,
        definition: Option<&CollectionDefinition>,
    ) -> Result<ShardBatch, ShardError> {
        let mut phase = ShardPhase::Querying;
        loop {
            phase = match (phase, definition) {
                (ShardPhase::Provisioning, Some(definition)) => {
                    self.provisioner.provision(shard, definition).await?;
                    ShardPhase::Retrying
                }
                (ShardPhase::Provisioning, None) => {
                    return Err(ShardError::CollectionMissing {
                        shard: shard.to_string(),
                        after_provision: false,
                    });
                }
                (ShardPhase::Querying | ShardPhase::Retrying, _) => {
                    match self.client.query(shard, request).await? {
                        ShardReply::Batch(batch) => return Ok(batch),
                        ShardReply::NotFound if phase == ShardPhase::Querying => {
                            ShardPhase::Provisioning
                        }
                        ShardReply::NotFound => {
                            return Err(ShardError::CollectionMissing {
                                shard: shard.to_string(),
                                after_provision: true,
                            });
                        }
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        schema::BoxFuture,
        usage::{UsageReport, UsageReporterConfig, spawn_usage_reporter},
    };
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    const RECORDS: &str = "/v1/databases/acme/records/users";
    const COLLECTIONS: &str = "/v1/databases/acme/collections";

    /// In-memory resolver: `Some(None)` is a known collection without schema.
    #[derive(Default)]
    struct FixedResolver {
        known: HashMap<(String, String), Option<CollectionDefinition>>,
    }

    impl FixedResolver {
        fn with_schema(tenant: &str, collection: &str) -> Self {
            let mut known = HashMap::new();
            known.insert(
                (tenant.to_string(), collection.to_string()),
                Some(CollectionDefinition {
                    tenant: tenant.to_string(),
                    collection: collection.to_string(),
                    schema: json!({"name": collection}),
                }),
            );
            Self { known }
        }

        fn without_schema(tenant: &str, collection: &str) -> Self {
            let mut known = HashMap::new();
            known.insert((tenant.to_string(), collection.to_string()), None);
            Self { known }
        }
    }

    impl CollectionResolver for FixedResolver {
        fn resolve<'a>(
            &'a self,
            tenant: &'a str,
            collection: &'a str,
        ) -> BoxFuture<'a, Result<Option<CollectionDefinition>, ResolveError>> {
            let out = match self.known.get(&(tenant.to_string(), collection.to_string())) {
                Some(def) => Ok(def.clone()),
                None => Err(ResolveError::NotFound {
                    tenant: tenant.to_string(),
                    collection: collection.to_string(),
                }),
            };
            Box::pin(async move { out })
        }
    }

    fn engine(shards: &[&MockServer], resolver: FixedResolver, usage: UsageHandle) -> ScatterGather {
        ScatterGather::new(
            shards.iter().map(|s| s.uri().parse().unwrap()).collect(),
            reqwest::Client::new(),
            Arc::new(resolver),
            usage,
        )
    }

    fn metering() -> UsageHandle {
        spawn_usage_reporter(
            UsageReporterConfig {
                managers: Vec::new(),
                secret: "s3cret".to_string(),
                flush_interval: std::time::Duration::from_secs(3600),
            },
            reqwest::Client::new(),
        )
    }

    fn request(limit: Option<&str>) -> QueryRequest {
        QueryRequest::new("acme", "users", limit.map(|l| format!("limit={l}")), limit)
    }

    async fn shard_returning(body: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    fn items(prefix: &str, n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": format!("{prefix}{i}")})).collect()
    }

    #[tokio::test]
    async fn single_shard_result_passes_through() {
        let shard = shard_returning(json!({"count": 42, "items": items("a", 5)})).await;
        let gather = engine(&[&shard], FixedResolver::with_schema("acme", "users"), UsageHandle::noop());

        let page = gather.gather(&request(Some("5"))).await.unwrap();
        assert_eq!(page, RecordsPage { count: 42, items: items("a", 5) });
    }

    #[tokio::test]
    async fn empty_shards_yield_empty_page() {
        let a = shard_returning(json!({"count": 0, "items": []})).await;
        let b = shard_returning(json!({"count": 0, "items": []})).await;
        let c = shard_returning(json!({"count": 0, "items": []})).await;
        let gather = engine(&[&a, &b, &c], FixedResolver::with_schema("acme", "users"), UsageHandle::noop());

        let page = gather.gather(&request(None)).await.unwrap();
        assert_eq!(page, RecordsPage { count: 0, items: vec![] });
    }

    #[tokio::test]
    async fn slow_shards_are_queried_concurrently() {
        let mut shards = Vec::new();
        for _ in 0..3 {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path(RECORDS))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({"count": 1, "items": [{"id": "x"}]}))
                        .set_delay(std::time::Duration::from_millis(400)),
                )
                .expect(1)
                .mount(&server)
                .await;
            shards.push(server);
        }
        let refs: Vec<&MockServer> = shards.iter().collect();
        let gather = engine(&refs, FixedResolver::with_schema("acme", "users"), UsageHandle::noop());

        let started = std::time::Instant::now();
        let page = gather.gather(&request(None)).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(page.count, 3);
        assert!(
            elapsed < std::time::Duration::from_millis(1000),
            "three 400ms shards took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn two_shards_interleave_under_limit() {
        let a = shard_returning(json!({"count": 10, "items": items("a", 10)})).await;
        let b = shard_returning(json!({"count": 10, "items": items("b", 10)})).await;
        let gather = engine(&[&a, &b], FixedResolver::with_schema("acme", "users"), UsageHandle::noop());

        let page = gather.gather(&request(Some("10"))).await.unwrap();
        assert_eq!(page.count, 20);
        let ids: Vec<&str> = page.items.iter().filter_map(|i| i["id"].as_str()).collect();
        assert_eq!(
            ids,
            vec!["a0", "b0", "a1", "b1", "a2", "b2", "a3", "b3", "a4", "b4"]
        );
    }

    #[tokio::test]
    async fn missing_collection_is_provisioned_then_retried_once() {
        let shard = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .expect(1)
            .with_priority(1)
            .mount(&shard)
            .await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"count": 1, "items": items("a", 1)})),
            )
            .expect(1)
            .with_priority(2)
            .mount(&shard)
            .await;
        Mock::given(method("POST"))
            .and(path(COLLECTIONS))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&shard)
            .await;

        let gather = engine(&[&shard], FixedResolver::with_schema("acme", "users"), UsageHandle::noop());
        let page = gather.gather(&request(None)).await.unwrap();
        assert_eq!(page, RecordsPage { count: 1, items: items("a", 1) });
    }

    #[tokio::test]
    async fn second_not_found_is_terminal() {
        let shard = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&shard)
            .await;
        Mock::given(method("POST"))
            .and(path(COLLECTIONS))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&shard)
            .await;

        let gather = engine(&[&shard], FixedResolver::with_schema("acme", "users"), UsageHandle::noop());
        let err = gather.gather(&request(None)).await.unwrap_err();
        let GatherError::Shards(errors) = err else {
            panic!("expected shard failure");
        };
        assert!(matches!(
            errors.as_slice(),
            [ShardError::CollectionMissing {
                after_provision: true,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn not_found_without_definition_fails_without_provisioning() {
        let shard = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&shard)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&shard)
            .await;

        let gather = engine(&[&shard], FixedResolver::without_schema("acme", "users"), UsageHandle::noop());
        let err = gather.gather(&request(None)).await.unwrap_err();
        assert!(matches!(
            err,
            GatherError::Shards(ref errors) if matches!(
                errors.as_slice(),
                [ShardError::CollectionMissing { after_provision: false, .. }]
            )
        ));
    }

    #[tokio::test]
    async fn provisioning_failure_fails_the_shard() {
        let shard = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RECORDS))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&shard)
            .await;
        Mock::given(method("POST"))
            .and(path(COLLECTIONS))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&shard)
            .await;

        let gather = engine(&[&shard], FixedResolver::with_schema("acme", "users"), UsageHandle::noop());
        let err = gather.gather(&request(None)).await.unwrap_err();
        assert!(matches!(
            err,
            GatherError::Shards(ref errors) if matches!(errors.as_slice(), [ShardError::Provision(_)])
        ));
    }

    #[tokio::test]
    async fn one_failed_shard_fails_the_whole_gather() {
        let a = shard_returning(json!({"count": 1, "items": items("a", 1)})).await;
        let b = shard_returning(json!({"count": 1, "items": items("b", 1)})).await;
        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&broken)
            .await;

        let usage = metering();
        let gather = engine(&[&a, &broken, &b], FixedResolver::with_schema("acme", "users"), usage.clone());
        let err = gather.gather(&request(None)).await.unwrap_err();
        let GatherError::Shards(errors) = err else {
            panic!("expected shard failure");
        };
        assert_eq!(errors.len(), 1);

        let outcome = usage.flush_now().await.unwrap();
        assert!(outcome.report.is_empty(), "failed gathers are not metered");
    }

    #[tokio::test]
    async fn unknown_collection_never_fans_out() {
        let shard = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&shard)
            .await;

        let gather = engine(&[&shard], FixedResolver::default(), UsageHandle::noop());
        let err = gather.gather(&request(None)).await.unwrap_err();
        assert!(matches!(err, GatherError::Identity(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn successful_gather_ticks_returned_items() {
        let a = shard_returning(json!({"count": 30, "items": items("a", 4)})).await;
        let b = shard_returning(json!({"count": 30, "items": items("b", 4)})).await;
        let usage = metering();
        let gather = engine(&[&a, &b], FixedResolver::with_schema("acme", "users"), usage.clone());

        let page = gather.gather(&request(Some("5"))).await.unwrap();
        assert_eq!(page.count, 60);
        assert_eq!(page.items.len(), 5);

        let outcome = usage.flush_now().await.unwrap();
        assert_eq!(outcome.report, UsageReport::from([("acme:users:read".to_string(), 5)]));
    }

    #[tokio::test]
    async fn empty_gather_still_counts_one_read() {
        let a = shard_returning(json!({"count": 0, "items": []})).await;
        let usage = metering();
        let gather = engine(&[&a], FixedResolver::with_schema("acme", "users"), usage.clone());

        gather.gather(&request(None)).await.unwrap();
        let outcome = usage.flush_now().await.unwrap();
        assert_eq!(outcome.report, UsageReport::from([("acme:users:read".to_string(), 1)]));
    }
}
