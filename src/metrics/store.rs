//! Persistent time-series store for sampled metrics: single writer (the
//! sampler), many readers (queries), retention trimming.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: i64,
    pub timestamp: f64,
    pub metric_type: String,
    pub value: f64,
    pub metadata: Option<Value>,
}

/// One aggregated row: §4.4 "collapses to one row per metric_type".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub metric_type: String,
    pub value: f64,
}

/// Aggregation selector computed in the store rather than in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Min,
    Max,
    Avg,
    Count,
}

impl Aggregation {
    fn sql_fn(self) -> &'static str {
        match self {
            Aggregation::Min => "MIN(value)",
            Aggregation::Max => "MAX(value)",
            Aggregation::Avg => "AVG(value)",
            Aggregation::Count => "COUNT(*)",
        }
    }
}

pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                metric_type TEXT NOT NULL,
                value REAL NOT NULL,
                metadata TEXT
            );
            ",
        )
        .execute(&self.pool)
        .await
        .context("creating metrics table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp)")
            .execute(&self.pool)
            .await
            .context("creating timestamp index")?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_type_timestamp ON metrics(metric_type, timestamp)")
            .execute(&self.pool)
            .await
            .context("creating composite index")?;
        Ok(())
    }

    /// Insert one batch of samples from a single sampler tick. Callers
    /// should batch all of a tick's samples into one call to keep writer
    /// contention low.
    pub async fn record_batch(&self, samples: &[(f64, &str, f64, Option<&Value>)]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning metrics batch")?;
        for (timestamp, metric_type, value, metadata) in samples {
            let metadata_json = metadata.map(|m| m.to_string());
            sqlx::query(
                "INSERT INTO metrics (timestamp, metric_type, value, metadata) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(timestamp)
            .bind(metric_type)
            .bind(value)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .context("inserting metric sample")?;
        }
        tx.commit().await.context("committing metrics batch")?;
        Ok(())
    }

    /// Half-open `[start, end)` time-range query, optional `metric_type`
    /// filter, pagination. `limit` must be validated by the caller
    /// (`1..=1000` per the dispatcher's `invalid_argument` contract) —
    /// this layer trusts its inputs.
    pub async fn query_range(
        &self,
        start: f64,
        end: f64,
        metric_type: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<MetricSample>> {
        if end <= start {
            return Ok(Vec::new());
        }

        let rows = match metric_type {
            Some(mt) => {
                sqlx::query(
                    "SELECT id, timestamp, metric_type, value, metadata FROM metrics
                     WHERE timestamp >= ?1 AND timestamp < ?2 AND metric_type = ?3
                     ORDER BY timestamp ASC LIMIT ?4 OFFSET ?5",
                )
                .bind(start)
                .bind(end)
                .bind(mt)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, timestamp, metric_type, value, metadata FROM metrics
                     WHERE timestamp >= ?1 AND timestamp < ?2
                     ORDER BY timestamp ASC LIMIT ?3 OFFSET ?4",
                )
                .bind(start)
                .bind(end)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("querying metrics range")?;

        rows.into_iter().map(row_to_sample).collect()
    }

    /// Aggregate a time range, optionally narrowed to one `metric_type`,
    /// via `{min, max, avg, count}`. Always `GROUP BY metric_type` so a
    /// mixed range never blends unrelated series into one scalar — one
    /// row per `metric_type` per §4.4, zero or one of them when a filter
    /// is given. An empty range or no matching rows yields an empty `Vec`,
    /// never a sentinel zero.
    pub async fn aggregate(
        &self,
        start: f64,
        end: f64,
        metric_type: Option<&str>,
        aggregation: Aggregation,
    ) -> Result<Vec<MetricAggregate>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let sql_fn = aggregation.sql_fn();
        let rows = match metric_type {
            Some(mt) => {
                let query = format!(
                    "SELECT metric_type, {sql_fn} as agg FROM metrics
                     WHERE timestamp >= ?1 AND timestamp < ?2 AND metric_type = ?3
                     GROUP BY metric_type ORDER BY metric_type ASC"
                );
                sqlx::query(&query)
                    .bind(start)
                    .bind(end)
                    .bind(mt)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "SELECT metric_type, {sql_fn} as agg FROM metrics
                     WHERE timestamp >= ?1 AND timestamp < ?2
                     GROUP BY metric_type ORDER BY metric_type ASC"
                );
                sqlx::query(&query).bind(start).bind(end).fetch_all(&self.pool).await
            }
        }
        .context("aggregating metrics")?;

        rows.into_iter().map(row_to_aggregate).collect()
    }

    /// Delete rows older than `now - retention_seconds`. Returns the
    /// number of rows removed.
    pub async fn enforce_retention(&self, now: f64, retention_seconds: f64) -> Result<u64> {
        let cutoff = now - retention_seconds;
        let result = sqlx::query("DELETE FROM metrics WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("enforcing metrics retention")?;
        Ok(result.rows_affected())
    }
}

fn row_to_aggregate(row: sqlx::sqlite::SqliteRow) -> Result<MetricAggregate> {
    Ok(MetricAggregate {
        metric_type: row.try_get("metric_type").context("reading metric_type column")?,
        value: row.try_get("agg").context("reading aggregate value column")?,
    })
}

fn row_to_sample(row: sqlx::sqlite::SqliteRow) -> Result<MetricSample> {
    let metadata_str: Option<String> = row.try_get("metadata").context("reading metadata column")?;
    let metadata = metadata_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .context("parsing metric metadata json")?;
    Ok(MetricSample {
        id: row.try_get("id").context("reading id column")?,
        timestamp: row.try_get("timestamp").context("reading timestamp column")?,
        metric_type: row.try_get("metric_type").context("reading metric_type column")?,
        value: row.try_get("value").context("reading value column")?,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn make_store() -> MetricsStore {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let store = MetricsStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn records_and_queries_a_half_open_range() {
        let store = make_store().await;
        store
            .record_batch(&[
                (100.0, "cpu_percent", 10.0, None),
                (200.0, "cpu_percent", 20.0, None),
                (300.0, "cpu_percent", 30.0, None),
            ])
            .await
            .unwrap();

        let rows = store.query_range(100.0, 300.0, None, 0, 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 10.0);
        assert_eq!(rows[1].value, 20.0);
    }

    #[tokio::test]
    async fn empty_range_returns_empty_not_error() {
        let store = make_store().await;
        let rows = store.query_range(300.0, 300.0, None, 0, 100).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn metric_type_filter_narrows_results() {
        let store = make_store().await;
        store
            .record_batch(&[
                (100.0, "cpu_percent", 10.0, None),
                (100.0, "memory_percent", 55.0, None),
            ])
            .await
            .unwrap();
        let rows = store
            .query_range(0.0, 200.0, Some("memory_percent"), 0, 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric_type, "memory_percent");
    }

    #[tokio::test]
    async fn aggregation_computes_avg() {
        let store = make_store().await;
        store
            .record_batch(&[
                (100.0, "cpu_percent", 10.0, None),
                (200.0, "cpu_percent", 20.0, None),
            ])
            .await
            .unwrap();
        let rows = store
            .aggregate(0.0, 300.0, Some("cpu_percent"), Aggregation::Avg)
            .await
            .unwrap();
        assert_eq!(rows, vec![MetricAggregate { metric_type: "cpu_percent".to_string(), value: 15.0 }]);
    }

    #[tokio::test]
    async fn aggregation_without_filter_groups_by_metric_type() {
        let store = make_store().await;
        store
            .record_batch(&[
                (100.0, "cpu_percent", 10.0, None),
                (200.0, "cpu_percent", 20.0, None),
                (100.0, "memory_percent", 50.0, None),
            ])
            .await
            .unwrap();
        let mut rows = store.aggregate(0.0, 300.0, None, Aggregation::Avg).await.unwrap();
        rows.sort_by(|a, b| a.metric_type.cmp(&b.metric_type));
        assert_eq!(
            rows,
            vec![
                MetricAggregate { metric_type: "cpu_percent".to_string(), value: 15.0 },
                MetricAggregate { metric_type: "memory_percent".to_string(), value: 50.0 },
            ]
        );
    }

    #[tokio::test]
    async fn aggregation_over_empty_range_returns_no_rows() {
        let store = make_store().await;
        store.record_batch(&[(100.0, "cpu_percent", 10.0, None)]).await.unwrap();
        let rows = store.aggregate(300.0, 300.0, None, Aggregation::Avg).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn aggregation_with_no_matching_rows_returns_empty_not_zero() {
        let store = make_store().await;
        store.record_batch(&[(100.0, "cpu_percent", 10.0, None)]).await.unwrap();
        let rows = store
            .aggregate(0.0, 200.0, Some("disk_percent"), Aggregation::Count)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn retention_deletes_rows_older_than_cutoff() {
        let store = make_store().await;
        store
            .record_batch(&[(100.0, "cpu_percent", 10.0, None), (900.0, "cpu_percent", 20.0, None)])
            .await
            .unwrap();
        let deleted = store.enforce_retention(1000.0, 500.0).await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = store.query_range(0.0, 2000.0, None, 0, 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, 900.0);
    }

    #[tokio::test]
    async fn metadata_round_trips_through_json() {
        let store = make_store().await;
        store
            .record_batch(&[(100.0, "disk_percent", 42.0, Some(&json!({"mount": "/"})))])
            .await
            .unwrap();
        let rows = store.query_range(0.0, 200.0, None, 0, 10).await.unwrap();
        assert_eq!(rows[0].metadata.as_ref().unwrap()["mount"], "/");
    }
}
