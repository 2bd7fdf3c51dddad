//! libSQL storage layer (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the four pipeline
//! tables: enriched entities, datasources, capability flags and the dated
//! snapshot history.
//!
//! **Access rules:**
//! - pipeline commands: read-write via [`Storage::open`]
//! - reporting commands: read-only via [`Storage::open_readonly`]

mod migrations;
mod snapshot;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Value, params, params_from_iter};
use overview_shared::{
    CapabilityFlag, CapabilityFlags, Datasource, ENTITY_METRICS, EnrichedEntity, Entity,
    MetricSet, OverviewError, ProbeResult, Result,
};
use uuid::Uuid;

pub use snapshot::{AppendOutcome, latest, previous_two};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| OverviewError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| OverviewError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| OverviewError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(OverviewError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| OverviewError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| OverviewError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        OverviewError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(OverviewError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entity operations
    // -----------------------------------------------------------------------

    /// Overwrite the enriched-entities table with `rows`.
    ///
    /// Runs in one transaction, so a checkpoint is never observed half-written.
    pub async fn replace_entities(&self, rows: &[EnrichedEntity]) -> Result<()> {
        self.check_writable()?;

        let metric_columns: Vec<&str> = ENTITY_METRICS.iter().map(|m| m.column()).collect();
        let columns = [
            "row_key",
            "position",
            "identifier",
            "name",
            "kind",
            "registry_id",
            "parent_ids",
        ]
        .into_iter()
        .chain(metric_columns.iter().copied())
        .chain(["has_metrics", "status", "added_identifier", "error", "enriched_at"])
        .collect::<Vec<_>>();
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO entities ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM entities", params![])
            .await
            .map_err(storage_err)?;

        for row in rows {
            let parent_ids = serde_json::to_string(&row.entity.parent_ids)
                .map_err(|e| OverviewError::Storage(format!("encode parent ids: {e}")))?;

            let mut values = vec![
                Value::Text(row.row_key.clone()),
                Value::Integer(row.position as i64),
                text(row.entity.id.as_deref()),
                Value::Text(row.entity.name.clone()),
                text(row.entity.kind.as_deref()),
                text(row.entity.registry_id.as_deref()),
                Value::Text(parent_ids),
            ];
            for metric in ENTITY_METRICS {
                values.push(int(row.metrics.as_ref().and_then(|m| m.get(*metric))));
            }
            values.extend([
                Value::Integer(row.metrics.is_some() as i64),
                Value::Text(row.status.as_str().to_string()),
                Value::Integer(row.added_identifier as i64),
                text(row.error.as_deref()),
                Value::Text(row.enriched_at.to_rfc3339()),
            ]);

            tx.execute(&sql, params_from_iter(values))
                .await
                .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        tracing::debug!(rows = rows.len(), "entities table written");
        Ok(())
    }

    /// Load the enriched-entities table in input order.
    pub async fn load_entities(&self) -> Result<Vec<EnrichedEntity>> {
        let metric_columns = ENTITY_METRICS
            .iter()
            .map(|m| m.column())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT row_key, position, identifier, name, kind, registry_id, parent_ids,
                    {metric_columns}, has_metrics, status, added_identifier, error, enriched_at
             FROM entities ORDER BY position"
        );

        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_entity(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Datasource operations
    // -----------------------------------------------------------------------

    /// Overwrite the datasources table.
    ///
    /// An endpoint already stored for a datasource id survives when the new
    /// record carries none.
    pub async fn replace_datasources(&self, datasources: &[Datasource]) -> Result<()> {
        self.check_writable()?;

        let existing: HashMap<String, String> = self
            .load_datasources()
            .await?
            .into_iter()
            .filter_map(|d| d.oai_endpoint.map(|e| (d.id, e)))
            .collect();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM datasources", params![])
            .await
            .map_err(storage_err)?;

        for ds in datasources {
            let endpoint = ds
                .oai_endpoint
                .as_deref()
                .or_else(|| existing.get(&ds.id).map(String::as_str));
            tx.execute(
                "INSERT INTO datasources (id, organization_id, name, kind, website_url,
                                          oai_endpoint, compatibility, last_indexed, validated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO NOTHING",
                params_from_iter(vec![
                    Value::Text(ds.id.clone()),
                    text(ds.organization_id.as_deref()),
                    text(ds.name.as_deref()),
                    text(ds.kind.as_deref()),
                    text(ds.website_url.as_deref()),
                    text(endpoint),
                    text(ds.compatibility.as_deref()),
                    text(ds.last_indexed.as_deref()),
                    text(ds.validated_at.as_deref()),
                ]),
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Load all datasources ordered by id.
    pub async fn load_datasources(&self) -> Result<Vec<Datasource>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, organization_id, name, kind, website_url, oai_endpoint,
                        compatibility, last_indexed, validated_at
                 FROM datasources ORDER BY id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(Datasource {
                id: row.get::<String>(0).map_err(storage_err)?,
                organization_id: opt_text(&row, 1)?,
                name: opt_text(&row, 2)?,
                kind: opt_text(&row, 3)?,
                website_url: opt_text(&row, 4)?,
                oai_endpoint: opt_text(&row, 5)?,
                compatibility: opt_text(&row, 6)?,
                last_indexed: opt_text(&row, 7)?,
                validated_at: opt_text(&row, 8)?,
            });
        }
        Ok(results)
    }

    /// Set the endpoint of every datasource named in `endpoints`.
    ///
    /// Returns the number of datasources updated; unknown ids are ignored.
    pub async fn set_endpoints(&self, endpoints: &HashMap<String, String>) -> Result<usize> {
        self.check_writable()?;

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let mut updated = 0usize;
        for (id, endpoint) in endpoints {
            let affected = tx
                .execute(
                    "UPDATE datasources SET oai_endpoint = ?1 WHERE id = ?2",
                    params![endpoint.as_str(), id.as_str()],
                )
                .await
                .map_err(storage_err)?;
            updated += affected as usize;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Capability flags
    // -----------------------------------------------------------------------

    /// Overwrite the capability-flags table with one run's results.
    pub async fn replace_capability_flags(&self, results: &[ProbeResult]) -> Result<()> {
        self.check_writable()?;

        let flag_columns: Vec<&str> = CapabilityFlag::ALL.iter().map(|f| f.column()).collect();
        let columns: Vec<&str> = ["entity_id", "run_id", "status", "error", "formats_detected"]
            .into_iter()
            .chain(flag_columns.iter().copied())
            .chain(["tested_at"])
            .collect();
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO capability_flags ({}) VALUES ({placeholders})
             ON CONFLICT(entity_id) DO NOTHING",
            columns.join(", ")
        );

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM capability_flags", params![])
            .await
            .map_err(storage_err)?;

        for result in results {
            let mut values = vec![
                Value::Text(result.entity_id.clone()),
                Value::Text(result.run_id.to_string()),
                Value::Text(result.status.as_str().to_string()),
                text(result.error.as_deref()),
                text(result.formats_detected.as_deref()),
            ];
            for flag in CapabilityFlag::ALL {
                values.push(Value::Integer(result.flags.get(flag) as i64));
            }
            values.push(Value::Text(result.tested_at.to_rfc3339()));

            tx.execute(&sql, params_from_iter(values))
                .await
                .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    /// Load the most recent probe results ordered by entity id.
    pub async fn load_capability_flags(&self) -> Result<Vec<ProbeResult>> {
        let flag_columns = CapabilityFlag::ALL
            .iter()
            .map(|f| f.column())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT entity_id, run_id, status, error, formats_detected, {flag_columns}, tested_at
             FROM capability_flags ORDER BY entity_id"
        );

        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let run_id: String = row.get(1).map_err(storage_err)?;
            let status: String = row.get(2).map_err(storage_err)?;

            let mut flags = CapabilityFlags::none();
            for (i, flag) in CapabilityFlag::ALL.iter().enumerate() {
                flags.set(*flag, row.get::<i64>((5 + i) as i32).map_err(storage_err)? != 0);
            }
            let tested_at_idx = (5 + CapabilityFlag::COUNT) as i32;

            results.push(ProbeResult {
                entity_id: row.get::<String>(0).map_err(storage_err)?,
                run_id: Uuid::parse_str(&run_id)
                    .map_err(|e| OverviewError::Storage(format!("invalid run id: {e}")))?,
                status: status.parse().map_err(OverviewError::Storage)?,
                error: opt_text(&row, 3)?,
                formats_detected: opt_text(&row, 4)?,
                flags,
                tested_at: parse_timestamp(&row.get::<String>(tested_at_idx).map_err(storage_err)?)?,
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn storage_err(e: libsql::Error) -> OverviewError {
    OverviewError::Storage(e.to_string())
}

fn text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn int(value: Option<u64>) -> Value {
    value.map_or(Value::Null, |n| Value::Integer(n as i64))
}

fn opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx).map_err(storage_err)? {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        Value::Integer(i) => Ok(Some(i.to_string())),
        Value::Real(f) => Ok(Some(f.to_string())),
        Value::Blob(_) => Err(OverviewError::Storage(format!(
            "unexpected blob in column {idx}"
        ))),
    }
}

/// Coerce a stored cell into a count: integers and integral, non-negative
/// reals or numeric text. Everything else is unknown, never zero.
pub(crate) fn coerce_count(value: Value) -> Option<u64> {
    match value {
        Value::Integer(i) => u64::try_from(i).ok(),
        Value::Real(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 => Some(f as u64),
        Value::Text(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .and_then(|f| coerce_count(Value::Real(f)))
            })
        }
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OverviewError::Storage(format!("invalid timestamp: {e}")))
}

/// Convert a database row to an [`EnrichedEntity`].
fn row_to_entity(row: &libsql::Row) -> Result<EnrichedEntity> {
    let parent_ids: String = row.get(6).map_err(storage_err)?;
    let parent_ids: Vec<String> = serde_json::from_str(&parent_ids)
        .map_err(|e| OverviewError::Storage(format!("invalid parent ids: {e}")))?;

    let base = 7;
    let mut metrics = MetricSet::unknown();
    for (i, metric) in ENTITY_METRICS.iter().enumerate() {
        let value = row.get_value((base + i) as i32).map_err(storage_err)?;
        metrics.set(*metric, coerce_count(value));
    }
    let next = (base + ENTITY_METRICS.len()) as i32;
    let has_metrics = row.get::<i64>(next).map_err(storage_err)? != 0;
    let status: String = row.get(next + 1).map_err(storage_err)?;

    Ok(EnrichedEntity {
        row_key: row.get::<String>(0).map_err(storage_err)?,
        position: row.get::<i64>(1).map_err(storage_err)? as usize,
        entity: Entity {
            id: opt_text(row, 2)?,
            name: row.get::<String>(3).map_err(storage_err)?,
            kind: opt_text(row, 4)?,
            registry_id: opt_text(row, 5)?,
            parent_ids,
        },
        added_identifier: row.get::<i64>(next + 2).map_err(storage_err)? != 0,
        metrics: has_metrics.then_some(metrics),
        status: status.parse().map_err(OverviewError::Storage)?,
        error: opt_text(row, next + 3)?,
        enriched_at: parse_timestamp(&row.get::<String>(next + 4).map_err(storage_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use overview_shared::{EnrichmentStatus, Metric, ProbeStatus};

    /// Create a temp file storage for testing.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("overview_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn enriched(key: &str, position: usize, metrics: Option<MetricSet>) -> EnrichedEntity {
        EnrichedEntity {
            row_key: key.into(),
            position,
            entity: Entity {
                id: Some(format!("{key}-id")),
                name: format!("Org {key}"),
                kind: Some("university".into()),
                registry_id: Some(key.into()),
                parent_ids: vec!["parent".into()],
            },
            added_identifier: position == 0,
            metrics,
            status: EnrichmentStatus::Resolved,
            error: None,
            enriched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("overview_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.unwrap();
        drop(s1);
        let s2 = Storage::open(&tmp).await.unwrap();
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn entities_roundtrip_preserves_unknown_and_zero() {
        let storage = test_storage().await;

        let metrics = MetricSet::unknown()
            .with(Metric::FundingProjects, Some(0))
            .with(Metric::Publications, Some(12));
        let rows = vec![
            enriched("b", 1, None),
            enriched("a", 0, Some(metrics.clone())),
        ];
        storage.replace_entities(&rows).await.unwrap();

        let loaded = storage.load_entities().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].row_key, "a");
        assert_eq!(loaded[0].metrics, Some(metrics));
        assert!(loaded[0].added_identifier);
        assert_eq!(loaded[0].entity.parent_ids, vec!["parent".to_string()]);
        assert_eq!(loaded[1].metrics, None);
        assert_eq!(loaded[1].status, EnrichmentStatus::Resolved);
    }

    #[tokio::test]
    async fn replace_entities_overwrites() {
        let storage = test_storage().await;
        storage
            .replace_entities(&[enriched("a", 0, None), enriched("b", 1, None)])
            .await
            .unwrap();
        storage
            .replace_entities(&[enriched("c", 0, None)])
            .await
            .unwrap();

        let keys: Vec<_> = storage
            .load_entities()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.row_key)
            .collect();
        assert_eq!(keys, vec!["c"]);
    }

    #[tokio::test]
    async fn datasource_endpoints_survive_refresh() {
        let storage = test_storage().await;
        let ds = |id: &str| Datasource {
            id: id.into(),
            organization_id: Some("OID1".into()),
            name: Some(format!("Repo {id}")),
            ..Default::default()
        };

        storage.replace_datasources(&[ds("d1"), ds("d2")]).await.unwrap();
        let endpoints = HashMap::from([
            ("d1".to_string(), "https://d1.example.org/oai".to_string()),
            ("unknown".to_string(), "https://x.example.org/oai".to_string()),
        ]);
        assert_eq!(storage.set_endpoints(&endpoints).await.unwrap(), 1);

        // Harvest again: d1 keeps its endpoint, d2 is gone, d3 is new
        storage.replace_datasources(&[ds("d1"), ds("d3")]).await.unwrap();
        let loaded = storage.load_datasources().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded[0].oai_endpoint.as_deref(),
            Some("https://d1.example.org/oai")
        );
        assert_eq!(loaded[1].id, "d3");
        assert_eq!(loaded[1].oai_endpoint, None);
    }

    #[tokio::test]
    async fn capability_flags_replaced_per_run() {
        let storage = test_storage().await;
        let result = |id: &str, run_id: Uuid, formats: &[&str]| ProbeResult {
            entity_id: id.into(),
            run_id,
            status: if formats.is_empty() {
                ProbeStatus::Error
            } else {
                ProbeStatus::Ok
            },
            error: formats.is_empty().then(|| "Unknown error".to_string()),
            formats_detected: (!formats.is_empty()).then(|| formats.join(", ")),
            flags: CapabilityFlags::from_formats(formats),
            tested_at: Utc::now(),
        };

        let first = Uuid::now_v7();
        storage
            .replace_capability_flags(&[result("d1", first, &[]), result("d2", first, &[])])
            .await
            .unwrap();

        let second = Uuid::now_v7();
        storage
            .replace_capability_flags(&[result("d1", second, &["oai_dc", "rioxx"])])
            .await
            .unwrap();

        let loaded = storage.load_capability_flags().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_id, second);
        assert_eq!(loaded[0].status, ProbeStatus::Ok);
        assert!(loaded[0].flags.get(CapabilityFlag::Rioxx));
        assert!(!loaded[0].flags.get(CapabilityFlag::NlDidl));
    }

    #[test]
    fn count_coercion() {
        assert_eq!(coerce_count(Value::Integer(5)), Some(5));
        assert_eq!(coerce_count(Value::Integer(-1)), None);
        assert_eq!(coerce_count(Value::Real(7.0)), Some(7));
        assert_eq!(coerce_count(Value::Real(7.5)), None);
        assert_eq!(coerce_count(Value::Text(" 42 ".into())), Some(42));
        assert_eq!(coerce_count(Value::Text("3.0".into())), Some(3));
        assert_eq!(coerce_count(Value::Text("n/a".into())), None);
        assert_eq!(coerce_count(Value::Null), None);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("overview_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.replace_entities(&[enriched("a", 0, None)]).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.load_entities().await.unwrap().len(), 1);
        let result = ro.replace_entities(&[]).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
