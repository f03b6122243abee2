use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};

use reqwest::StatusCode;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    domain::{ManagerEndpoint, Operation, UsageKey},
    internal_auth::{pick_manager, with_internal_secret},
};

/// Report body: `"tenant:collection:operation" -> count`.
pub type UsageReport = BTreeMap<String, u64>;

/// Per-key counters. Only `tick` and `snapshot_and_clear` mutate it.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    counters: HashMap<UsageKey, u64>,
}

impl UsageAccumulator {
    pub fn tick(&mut self, key: UsageKey, amount: u64) {
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(amount);
    }

    pub fn snapshot_and_clear(&mut self) -> UsageReport {
        std::mem::take(&mut self.counters)
            .into_iter()
            .map(|(key, count)| (key.to_string(), count))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[derive(Debug)]
pub enum ReportError {
    ConnectionRefused { manager: String },
    Transport { manager: String, source: reqwest::Error },
    Status { manager: String, status: StatusCode },
    /// The reporter task has already shut down.
    Stopped,
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused { manager } => {
                write!(f, "ECONNREFUSED while running {manager}/v1/usage-batch")
            }
            Self::Transport { manager, source } => {
                write!(f, "usage report to {manager} failed: {source}")
            }
            Self::Status { manager, status } => {
                write!(f, "usage report to {manager} returned {status}")
            }
            Self::Stopped => write!(f, "usage reporter is stopped"),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    if !err.is_connect() {
        return false;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    /// `None` when no manager was configured and the snapshot was dropped.
    pub manager: Option<String>,
    pub report: UsageReport,
}

#[derive(Debug, Clone)]
pub struct UsageReporterConfig {
    pub managers: Vec<ManagerEndpoint>,
    pub secret: String,
    pub flush_interval: Duration,
}

#[derive(Debug)]
struct UsageReporter {
    managers: Vec<ManagerEndpoint>,
    secret: String,
    http: reqwest::Client,
}

impl UsageReporter {
    async fn flush(&self, accumulator: &mut UsageAccumulator) -> Result<FlushOutcome, ReportError> {
        let report = accumulator.snapshot_and_clear();

        let Some(manager) = pick_manager(&self.managers) else {
            warn!(
                entries = report.len(),
                "usage report skipped: no managers configured"
            );
            return Ok(FlushOutcome {
                manager: None,
                report,
            });
        };
        let manager_name = manager.to_string();

        let url = manager.url_for(&["v1", "usage-batch"]);
        let resp = with_internal_secret(self.http.post(url), &self.secret)
            .json(&report)
            .send()
            .await
            .map_err(|source| {
                if is_connection_refused(&source) {
                    ReportError::ConnectionRefused {
                        manager: manager_name.clone(),
                    }
                } else {
                    ReportError::Transport {
                        manager: manager_name.clone(),
                        source,
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ReportError::Status {
                manager: manager_name,
                status,
            });
        }

        debug!(manager = %manager_name, entries = report.len(), "usage report sent");
        Ok(FlushOutcome {
            manager: Some(manager_name),
            report,
        })
    }
}

type FlushReply = oneshot::Sender<Result<FlushOutcome, ReportError>>;

#[derive(Debug)]
enum UsageCommand {
    Tick { key: UsageKey, amount: u64 },
    Flush { reply: FlushReply },
    Stop { reply: FlushReply },
}

/// Cheap handle to the usage reporter task.
#[derive(Debug, Clone)]
pub struct UsageHandle {
    tx: Option<mpsc::UnboundedSender<UsageCommand>>,
}

impl UsageHandle {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn tick(
        &self,
        tenant: impl Into<String>,
        collection: impl Into<String>,
        operation: Operation,
        amount: u64,
    ) {
        if let Some(tx) = &self.tx {
            let key = UsageKey::new(tenant, collection, operation);
            if tx.send(UsageCommand::Tick { key, amount }).is_err() {
                debug!(amount, "usage reporter stopped, tick dropped");
            }
        }
    }

    /// Flushes immediately; the result is what the manager call produced.
    pub async fn flush_now(&self) -> Result<FlushOutcome, ReportError> {
        self.request(|reply| UsageCommand::Flush { reply }).await
    }

    /// Cancels the periodic flush and performs a final one.
    pub async fn stop(&self) -> Result<FlushOutcome, ReportError> {
        self.request(|reply| UsageCommand::Stop { reply }).await
    }

    async fn request(
        &self,
        make: impl FnOnce(FlushReply) -> UsageCommand,
    ) -> Result<FlushOutcome, ReportError> {
        let Some(tx) = &self.tx else {
            return Err(ReportError::Stopped);
        };
        let (reply, rx) = oneshot::channel();
        tx.send(make(reply)).map_err(|_| ReportError::Stopped)?;
        rx.await.map_err(|_| ReportError::Stopped)?
    }
}

pub fn spawn_usage_reporter(config: UsageReporterConfig, http: reqwest::Client) -> UsageHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = UsageReporter {
        managers: config.managers,
        secret: config.secret,
        http,
    };
    tokio::spawn(usage_task(reporter, config.flush_interval, rx));
    UsageHandle { tx: Some(tx) }
}

// Owns the accumulator, so ticks and flushes are serialized: a tick queued
// while a flush is in flight lands in the next snapshot.
async fn usage_task(
    reporter: UsageReporter,
    period: Duration,
    mut rx: mpsc::UnboundedReceiver<UsageCommand>,
) {
    let mut accumulator = UsageAccumulator::default();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(UsageCommand::Tick { key, amount }) => accumulator.tick(key, amount),
                Some(UsageCommand::Flush { reply }) => {
                    let _ = reply.send(reporter.flush(&mut accumulator).await);
                }
                Some(UsageCommand::Stop { reply }) => {
                    let _ = reply.send(reporter.flush(&mut accumulator).await);
                    break;
                }
                None => {
                    if !accumulator.is_empty() {
                        if let Err(err) = reporter.flush(&mut accumulator).await {
                            warn!(%err, "final usage report failed");
                        }
                    }
                    break;
                }
            },
            _ = interval.tick() => {
                if let Err(err) = reporter.flush(&mut accumulator).await {
                    warn!(%err, "usage report failed");
                }
            }
        }
    }
    debug!("usage reporter stopped");
}
