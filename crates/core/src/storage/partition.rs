//! Maintains `audit_log` as a monthly range-partitioned table (§4.8).

use chrono::{DateTime, Datelike, TimeZone, Utc};
use sqlx::PgPool;

use crate::config::PartitionConfig;
use crate::error::Result;

/// Columns that get a dedicated single-column index on every partition, in
/// addition to the composite indexes built separately.
const SINGLE_COLUMN_INDEXES: &[&str] = &[
    "timestamp",
    "principal_id",
    "organization_id",
    "action",
    "status",
    "target_resource_type",
    "target_resource_id",
    "correlation_id",
    "data_classification",
    "retention_policy",
    "archived_at",
    "hash",
];

const COMPOSITE_INDEXES: &[&[&str]] = &[
    &["organization_id", "timestamp"],
    &["principal_id", "action"],
    &["data_classification", "retention_policy"],
    &["target_resource_type", "target_resource_id"],
];

pub struct PartitionManager {
    pool: PgPool,
    config: PartitionConfig,
}

impl PartitionManager {
    pub fn new(pool: PgPool, config: PartitionConfig) -> Self {
        Self { pool, config }
    }

    fn partition_name(year: i32, month: u32) -> String {
        format!("audit_log_{:04}_{:02}", year, month)
    }

    fn bounds(year: i32, month: u32) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().expect("valid partition start");
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        let end = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).single().expect("valid partition end");
        (start, end)
    }

    /// Idempotently creates the partition covering `timestamp`'s month, plus
    /// its per-partition indexes. Safe to call concurrently and repeatedly —
    /// every statement is `IF NOT EXISTS`.
    pub async fn ensure_partition_for(&self, timestamp: DateTime<Utc>) -> Result<()> {
        self.create_partition(timestamp.year(), timestamp.month()).await
    }

    pub async fn create_partition(&self, year: i32, month: u32) -> Result<()> {
        let name = Self::partition_name(year, month);
        let (start, end) = Self::bounds(year, month);
        let table = &self.config.table_name;

        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF {table} FOR VALUES FROM ('{start}') TO ('{end}')",
            name = name,
            table = table,
            start = start.to_rfc3339(),
            end = end.to_rfc3339(),
        );
        sqlx::query(&create_sql).execute(&self.pool).await?;

        for column in SINGLE_COLUMN_INDEXES {
            let index_sql = format!(
                "CREATE INDEX IF NOT EXISTS idx_{name}_{column} ON {name} ({column})",
                name = name,
                column = column
            );
            sqlx::query(&index_sql).execute(&self.pool).await?;
        }

        for columns in COMPOSITE_INDEXES {
            let index_name = format!("idx_{}_{}", name, columns.join("_"));
            let index_sql = format!(
                "CREATE INDEX IF NOT EXISTS {index_name} ON {name} ({columns})",
                index_name = index_name,
                name = name,
                columns = columns.join(", ")
            );
            sqlx::query(&index_sql).execute(&self.pool).await?;
        }

        let gin_sql = format!("CREATE INDEX IF NOT EXISTS idx_{name}_details_gin ON {name} USING GIN (details)", name = name);
        sqlx::query(&gin_sql).execute(&self.pool).await?;

        tracing::info!(partition = %name, "ensured audit log partition and indexes");
        Ok(())
    }

    /// Scheduler-tick entry point: ensures partitions exist for the current
    /// month and the next `months_ahead` months.
    pub async fn ensure_ahead(&self) -> Result<()> {
        let now = Utc::now();
        let mut year = now.year();
        let mut month = now.month();

        for _ in 0..=self.config.months_ahead {
            self.create_partition(year, month).await?;
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        Ok(())
    }

    /// Drops partitions entirely older than the most permissive retention
    /// policy among `config.retention_days`. A partition is dropped only
    /// when its *entire* range predates the cutoff — a partition straddling
    /// the cutoff is left alone rather than partially truncated.
    pub async fn drop_expired(&self) -> Result<Vec<String>> {
        let max_retention_days = self.config.retention_days.values().copied().max().unwrap_or(365 * 6);
        let cutoff = Utc::now() - chrono::Duration::days(max_retention_days);

        let partitions = self.list_partitions().await?;
        let mut dropped = Vec::new();

        for (name, _, end) in partitions {
            if end <= cutoff {
                let drop_sql = format!("DROP TABLE IF EXISTS {}", name);
                sqlx::query(&drop_sql).execute(&self.pool).await?;
                tracing::warn!(partition = %name, "dropped expired audit log partition");
                dropped.push(name);
            }
        }
        Ok(dropped)
    }

    async fn list_partitions(&self) -> Result<Vec<(String, DateTime<Utc>, DateTime<Utc>)>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT inhrelid::regclass::text FROM pg_inherits WHERE inhparent = $1::regclass",
        )
        .bind(&self.config.table_name)
        .fetch_all(&self.pool)
        .await?;

        let mut partitions = Vec::with_capacity(rows.len());
        for (name,) in rows {
            if let Some((year, month)) = Self::parse_partition_suffix(&name) {
                let (start, end) = Self::bounds(year, month);
                partitions.push((name, start, end));
            }
        }
        Ok(partitions)
    }

    fn parse_partition_suffix(name: &str) -> Option<(i32, u32)> {
        let suffix = name.strip_prefix("audit_log_")?;
        let mut parts = suffix.splitn(2, '_');
        let year: i32 = parts.next()?.parse().ok()?;
        let month: u32 = parts.next()?.parse().ok()?;
        Some((year, month))
    }

    /// Offline migration from a non-partitioned `audit_log` table. Each step
    /// is idempotent so a failed run can simply be re-invoked: renaming an
    /// already-renamed table, or creating an already-created partition, is a
    /// no-op rather than an error.
    pub async fn migrate_from_unpartitioned(&self, legacy_table: &str) -> Result<()> {
        let renamed = format!("{}_legacy", legacy_table);

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)")
            .bind(legacy_table)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", legacy_table, renamed))
                .execute(&self.pool)
                .await?;
        }

        let parent_exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)")
            .bind(&self.config.table_name)
            .fetch_one(&self.pool)
            .await?;
        if !parent_exists {
            let create_parent = format!(
                "CREATE TABLE {} (LIKE {} INCLUDING DEFAULTS) PARTITION BY RANGE (timestamp)",
                self.config.table_name, renamed
            );
            sqlx::query(&create_parent).execute(&self.pool).await?;
        }

        let row = sqlx::query_as::<_, (Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(&format!(
            "SELECT MIN(timestamp), MAX(timestamp) FROM {}",
            renamed
        ))
        .fetch_optional(&self.pool)
        .await?;
        let bounds: Option<(DateTime<Utc>, DateTime<Utc>)> = row.flatten_bounds();

        if let Some((min, max)) = bounds {
            let mut year = min.year();
            let mut month = min.month();
            loop {
                self.create_partition(year, month).await?;
                if year > max.year() || (year == max.year() && month >= max.month()) {
                    break;
                }
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
        }

        sqlx::query(&format!("INSERT INTO {} SELECT * FROM {} ON CONFLICT (hash) DO NOTHING", self.config.table_name, renamed))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", renamed)).execute(&self.pool).await?;

        tracing::info!("migrated legacy audit_log table into partitioned parent");
        Ok(())
    }

    pub fn retention_days_for(&self, classification: &str) -> i64 {
        self.config
            .retention_days
            .get(classification)
            .copied()
            .unwrap_or(365)
    }
}

trait FlattenBounds {
    fn flatten_bounds(self) -> Option<(DateTime<Utc>, DateTime<Utc>)>;
}

impl FlattenBounds for Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    fn flatten_bounds(self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            Some((Some(min), Some(max))) => Some((min, max)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_pads_month() {
        assert_eq!(PartitionManager::partition_name(2026, 1), "audit_log_2026_01");
    }

    #[test]
    fn bounds_wrap_december_into_next_year() {
        let (start, end) = PartitionManager::bounds(2026, 12);
        assert_eq!(start.year(), 2026);
        assert_eq!(end.year(), 2027);
        assert_eq!(end.month(), 1);
    }

    #[test]
    fn parses_year_month_from_partition_suffix() {
        assert_eq!(PartitionManager::parse_partition_suffix("audit_log_2026_03"), Some((2026, 3)));
        assert_eq!(PartitionManager::parse_partition_suffix("unrelated_table"), None);
    }

}
