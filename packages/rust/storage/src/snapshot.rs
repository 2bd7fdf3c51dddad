//! Append-only, date-deduplicated snapshot history.

use std::collections::HashSet;

use chrono::NaiveDate;
use libsql::{Value, params, params_from_iter};
use overview_shared::{MetricSet, Result, SNAPSHOT_METRICS, SnapshotRow};
use tracing::{info, warn};

use crate::{Storage, coerce_count, int, opt_text, storage_err, text};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Result of [`Storage::append_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The day's rows were written.
    Appended(usize),
    /// The history already holds rows for that date; nothing was written.
    DuplicateDate,
}

impl Storage {
    /// Append one day's snapshot.
    ///
    /// If any row already exists for `date` the whole append is a no-op.
    /// Within the batch the first row per entity wins, so `(entity, date)`
    /// stays unique. The date check and the inserts share one transaction.
    pub async fn append_snapshot(&self, rows: &[SnapshotRow], date: NaiveDate) -> Result<AppendOutcome> {
        self.check_writable()?;
        let day = date.format(DATE_FORMAT).to_string();

        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let mut existing = tx
            .query(
                "SELECT 1 FROM snapshot_history WHERE snapshot_date = ?1 LIMIT 1",
                params![day.as_str()],
            )
            .await
            .map_err(storage_err)?;
        if existing.next().await.map_err(storage_err)?.is_some() {
            drop(existing);
            tx.rollback().await.map_err(storage_err)?;
            warn!(date = %day, "snapshot for this date already present, skipping append");
            return Ok(AppendOutcome::DuplicateDate);
        }
        drop(existing);

        let metric_columns = SNAPSHOT_METRICS
            .iter()
            .map(|m| m.column())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=SNAPSHOT_METRICS.len() + 3)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO snapshot_history (entity_id, name, {metric_columns}, snapshot_date)
             VALUES ({placeholders})"
        );

        let mut seen = HashSet::new();
        for row in rows {
            if !seen.insert(row.entity_id.as_str()) {
                warn!(entity = %row.entity_id, "duplicate entity in snapshot batch, keeping first");
                continue;
            }

            let mut values = vec![Value::Text(row.entity_id.clone()), text(row.name.as_deref())];
            for metric in SNAPSHOT_METRICS {
                values.push(int(row.metrics.get(*metric)));
            }
            values.push(Value::Text(day.clone()));

            tx.execute(&sql, params_from_iter(values))
                .await
                .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        info!(date = %day, rows = seen.len(), "snapshot appended");
        Ok(AppendOutcome::Appended(seen.len()))
    }

    /// Whether the history holds any row for `date`.
    pub async fn has_snapshot_for(&self, date: NaiveDate) -> Result<bool> {
        let day = date.format(DATE_FORMAT).to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM snapshot_history WHERE snapshot_date = ?1 LIMIT 1",
                params![day.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(rows.next().await.map_err(storage_err)?.is_some())
    }

    /// Load the full history ordered by date then entity.
    ///
    /// Metric cells are coerced to counts; non-numeric values load as unknown.
    /// Rows with an unreadable date are skipped.
    pub async fn load_history(&self) -> Result<Vec<SnapshotRow>> {
        let metric_columns = SNAPSHOT_METRICS
            .iter()
            .map(|m| m.column())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT entity_id, name, {metric_columns}, snapshot_date
             FROM snapshot_history ORDER BY snapshot_date, entity_id"
        );

        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(storage_err)?;

        let date_idx = (SNAPSHOT_METRICS.len() + 2) as i32;
        let mut history = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let raw_date: String = row.get(date_idx).map_err(storage_err)?;
            let Ok(snapshot_date) = NaiveDate::parse_from_str(raw_date.trim(), DATE_FORMAT) else {
                warn!(date = %raw_date, "unreadable snapshot date, skipping row");
                continue;
            };

            let mut metrics = MetricSet::unknown();
            for (i, metric) in SNAPSHOT_METRICS.iter().enumerate() {
                let value = row.get_value((i + 2) as i32).map_err(storage_err)?;
                metrics.set(*metric, coerce_count(value));
            }

            history.push(SnapshotRow {
                entity_id: row.get::<String>(0).map_err(storage_err)?,
                name: opt_text(&row, 1)?,
                metrics,
                snapshot_date,
            });
        }
        Ok(history)
    }
}

// ---------------------------------------------------------------------------
// Read-side helpers
// ---------------------------------------------------------------------------

/// The most recent date in `history` and its rows.
pub fn latest(history: &[SnapshotRow]) -> Option<(NaiveDate, Vec<&SnapshotRow>)> {
    let date = history.iter().map(|r| r.snapshot_date).max()?;
    Some((date, rows_on(history, date)))
}

/// Rows of the latest date and of the date before it, for trend comparison.
///
/// The prior set is empty when the history holds a single date.
pub fn previous_two(history: &[SnapshotRow]) -> (Vec<&SnapshotRow>, Vec<&SnapshotRow>) {
    let Some((latest_date, latest_rows)) = latest(history) else {
        return (Vec::new(), Vec::new());
    };
    let prior = history
        .iter()
        .map(|r| r.snapshot_date)
        .filter(|d| *d < latest_date)
        .max()
        .map(|d| rows_on(history, d))
        .unwrap_or_default();
    (latest_rows, prior)
}

fn rows_on(history: &[SnapshotRow], date: NaiveDate) -> Vec<&SnapshotRow> {
    history.iter().filter(|r| r.snapshot_date == date).collect()
}
