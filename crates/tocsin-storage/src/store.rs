use crate::error::{Result, StorageError};
use crate::{DataAccess, ErrorStore, IncidentStore, MetadataStore, MetricMetadata, TagMetadata};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tocsin_common::collect::{tags, Collect};
use tocsin_common::key::{format_tags, tags_subset, AlertKey, TagSet};
use tocsin_common::types::Incident;

const KV_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const MAX_INCIDENT_ID_KEY: &str = "maxIncidentId";

fn incident_key(id: u64) -> String {
    format!("incident:{id}")
}

fn metric_meta_key(metric: &str) -> String {
    format!("metricMeta:{metric}")
}

fn tag_meta_key(tag_set: &TagSet, name: &str) -> String {
    format!("tagMeta:{}:{}", format_tags(tag_set), name)
}

fn alert_error_key(name: &str) -> String {
    format!("alertError:{name}")
}

/// Failure bookkeeping for one alert definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlertErrorRecord {
    failing: bool,
    message: String,
    count: u64,
    last: DateTime<Utc>,
}

/// Embedded SQLite key/value backend implementing every [`DataAccess`]
/// sub-interface. One `kv` table holds incidents, metadata, and error
/// counters under disjoint key prefixes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    collect: Arc<Collect>,
}

impl SqliteStore {
    pub fn open(path: &Path, collect: Arc<Collect>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(KV_SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            collect,
        })
    }

    /// In-memory backend, used by tests and by hosts that run without
    /// durable incident storage.
    pub fn open_in_memory(collect: Arc<Collect>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(KV_SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            collect,
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_raw(conn: &Connection, key: &str) -> Result<Option<String>> {
        let val = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(val)
    }

    fn put_raw(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn scan_prefix(conn: &Connection, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key LIKE ?1")?;
        let pattern = format!("{prefix}%");
        let rows = stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }
}

impl DataAccess for SqliteStore {
    fn incidents(&self) -> &dyn IncidentStore {
        self
    }

    fn metadata(&self) -> &dyn MetadataStore {
        self
    }

    fn errors(&self) -> &dyn ErrorStore {
        self
    }
}

impl IncidentStore for SqliteStore {
    fn get(&self, id: u64) -> Result<Incident> {
        let _t = self.collect.start_timer("storage", tags([("op", "GetIncident")]));
        let conn = self.lock_conn();
        let raw = Self::get_raw(&conn, &incident_key(id))?.ok_or(StorageError::NotFound {
            entity: "incident",
            id: id.to_string(),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn create(&self, ak: &AlertKey, start: DateTime<Utc>) -> Result<Incident> {
        let _t = self.collect.start_timer("storage", tags([("op", "CreateIncident")]));
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, '0')
             ON CONFLICT(key) DO NOTHING",
            params![MAX_INCIDENT_ID_KEY],
        )?;
        tx.execute(
            "UPDATE kv SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) WHERE key = ?1",
            params![MAX_INCIDENT_ID_KEY],
        )?;
        let id: i64 = tx.query_row(
            "SELECT CAST(value AS INTEGER) FROM kv WHERE key = ?1",
            params![MAX_INCIDENT_ID_KEY],
            |row| row.get(0),
        )?;
        let incident = Incident {
            id: id as u64,
            start,
            end: None,
            alert_key: ak.clone(),
        };
        let raw = serde_json::to_string(&incident)?;
        tx.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![incident_key(incident.id), raw],
        )?;
        tx.commit()?;
        Ok(incident)
    }

    fn update(&self, id: u64, incident: &Incident) -> Result<()> {
        let _t = self.collect.start_timer("storage", tags([("op", "UpdateIncident")]));
        let raw = serde_json::to_string(incident)?;
        let conn = self.lock_conn();
        Self::put_raw(&conn, &incident_key(id), &raw)
    }

    fn raise_max_id(&self, to: u64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, CAST(?2 AS TEXT))
             ON CONFLICT(key) DO UPDATE SET value = CAST(?2 AS TEXT)
             WHERE CAST(kv.value AS INTEGER) < ?2",
            params![MAX_INCIDENT_ID_KEY, to as i64],
        )?;
        Ok(())
    }
}

impl MetadataStore for SqliteStore {
    fn put_metric_metadata(&self, metric: &str, name: &str, value: &str) -> Result<()> {
        let _t = self.collect.start_timer("storage", tags([("op", "PutMetricMetadata")]));
        if metric.is_empty() {
            return Err(StorageError::InvalidMetadata(
                "desc, rate, and unit require a metric name".to_string(),
            ));
        }
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let key = metric_meta_key(metric);
        let mut meta: MetricMetadata = match Self::get_raw(&tx, &key)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => MetricMetadata::default(),
        };
        match name {
            "desc" => meta.desc = value.to_string(),
            "unit" => meta.unit = value.to_string(),
            "rate" => meta.rate = value.to_string(),
            other => {
                return Err(StorageError::InvalidMetadata(format!(
                    "unknown metric metadata field: {other}"
                )))
            }
        }
        Self::put_raw(&tx, &key, &serde_json::to_string(&meta)?)?;
        tx.commit()?;
        Ok(())
    }

    fn get_metric_metadata(&self, metric: &str) -> Result<MetricMetadata> {
        let _t = self.collect.start_timer("storage", tags([("op", "GetMetricMetadata")]));
        let conn = self.lock_conn();
        match Self::get_raw(&conn, &metric_meta_key(metric))? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(MetricMetadata::default()),
        }
    }

    fn put_tag_metadata(
        &self,
        tag_set: &TagSet,
        name: &str,
        value: &str,
        touched: DateTime<Utc>,
    ) -> Result<()> {
        let _t = self.collect.start_timer("storage", tags([("op", "PutTagMetadata")]));
        let record = TagMetadata {
            tags: tag_set.clone(),
            name: name.to_string(),
            value: value.to_string(),
            last_touched: touched,
        };
        let conn = self.lock_conn();
        Self::put_raw(
            &conn,
            &tag_meta_key(tag_set, name),
            &serde_json::to_string(&record)?,
        )
    }

    fn get_tag_metadata(&self, subset: &TagSet, name: &str) -> Result<Vec<TagMetadata>> {
        let _t = self.collect.start_timer("storage", tags([("op", "GetTagMetadata")]));
        let conn = self.lock_conn();
        let mut out = Vec::new();
        for raw in Self::scan_prefix(&conn, "tagMeta:")? {
            let record: TagMetadata = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(%err, "skipping unreadable tag metadata record");
                    continue;
                }
            };
            if !tags_subset(subset, &record.tags) {
                continue;
            }
            if !name.is_empty() && record.name != name {
                continue;
            }
            out.push(record);
        }
        out.sort_by(|a, b| format_tags(&a.tags).cmp(&format_tags(&b.tags)).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    fn delete_tag_metadata(&self, tag_set: &TagSet, name: &str) -> Result<()> {
        let _t = self.collect.start_timer("storage", tags([("op", "DeleteTagMetadata")]));
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM kv WHERE key = ?1",
            params![tag_meta_key(tag_set, name)],
        )?;
        Ok(())
    }
}

impl ErrorStore for SqliteStore {
    fn is_alert_failing(&self, name: &str) -> Result<bool> {
        let _t = self.collect.start_timer("storage", tags([("op", "IsAlertFailing")]));
        let conn = self.lock_conn();
        match Self::get_raw(&conn, &alert_error_key(name))? {
            Some(raw) => {
                let record: AlertErrorRecord = serde_json::from_str(&raw)?;
                Ok(record.failing)
            }
            None => Ok(false),
        }
    }

    fn mark_alert_failure(&self, name: &str, message: &str) -> Result<()> {
        let _t = self.collect.start_timer("storage", tags([("op", "MarkAlertFailure")]));
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let key = alert_error_key(name);
        let mut record = match Self::get_raw(&tx, &key)? {
            Some(raw) => serde_json::from_str::<AlertErrorRecord>(&raw)?,
            None => AlertErrorRecord {
                failing: false,
                message: String::new(),
                count: 0,
                last: Utc::now(),
            },
        };
        record.failing = true;
        record.message = message.to_string();
        record.count += 1;
        record.last = Utc::now();
        Self::put_raw(&tx, &key, &serde_json::to_string(&record)?)?;
        tx.commit()?;
        Ok(())
    }

    fn mark_alert_success(&self, name: &str) -> Result<()> {
        let _t = self.collect.start_timer("storage", tags([("op", "MarkAlertSuccess")]));
        let conn = self.lock_conn();
        let key = alert_error_key(name);
        if let Some(raw) = Self::get_raw(&conn, &key)? {
            let mut record: AlertErrorRecord = serde_json::from_str(&raw)?;
            record.failing = false;
            Self::put_raw(&conn, &key, &serde_json::to_string(&record)?)?;
        }
        Ok(())
    }

    fn clear_alert(&self, name: &str) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM kv WHERE key = ?1",
            params![alert_error_key(name)],
        )?;
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute("DELETE FROM kv WHERE key LIKE 'alertError:%'", [])?;
        Ok(())
    }

    fn failing_alert_counts(&self) -> Result<(usize, usize)> {
        let conn = self.lock_conn();
        let mut failing = 0;
        let mut total = 0;
        for raw in Self::scan_prefix(&conn, "alertError:")? {
            let record: AlertErrorRecord = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(%err, "skipping unreadable alert error record");
                    continue;
                }
            };
            total += 1;
            if record.failing {
                failing += 1;
            }
        }
        Ok((failing, total))
    }
}
