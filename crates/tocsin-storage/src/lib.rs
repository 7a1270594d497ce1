//! Key/value-backed persistence for incidents, metric/tag metadata, and
//! per-alert failure counters.
//!
//! The scheduler talks to this layer only through the narrow
//! sub-interfaces on [`DataAccess`]. The default implementation
//! ([`store::SqliteStore`]) is an embedded SQLite database holding one
//! `kv` table; a remote key/value backend can be slotted behind the same
//! traits at startup without the scheduler noticing.

pub mod error;
pub mod store;


use chrono::{DateTime, Utc};
use error::Result;
use tocsin_common::key::{AlertKey, TagSet};
use tocsin_common::types::Incident;

/// Access to persisted incidents, keyed `incident:<id>` with a
/// `maxIncidentId` counter incremented atomically on create.
pub trait IncidentStore: Send + Sync {
    /// Fetch one incident by id.
    fn get(&self, id: u64) -> Result<Incident>;

    /// Allocate the next id from the counter and persist a new open
    /// incident for `ak` starting at `start`.
    fn create(&self, ak: &AlertKey, start: DateTime<Utc>) -> Result<Incident>;

    /// Overwrite the stored incident under `id`.
    fn update(&self, id: u64, incident: &Incident) -> Result<()>;

    /// Raise the id counter to at least `to`, so ids handed out after a
    /// state restore or history reconstruction never collide with ids
    /// already in use.
    fn raise_max_id(&self, to: u64) -> Result<()>;
}

/// Descriptive metadata for one metric. The three core fields are the only
/// metadata stored per metric name; everything else hangs off tag sets.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricMetadata {
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub rate: String,
}

/// One named metadata value attached to a tag set.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TagMetadata {
    pub tags: TagSet,
    pub name: String,
    pub value: String,
    pub last_touched: DateTime<Utc>,
}

/// Metric and tag metadata live in disjoint namespaces: core metric
/// metadata (`desc`, `unit`, `rate`) is keyed by metric name, everything
/// else by `(tag set, name)`.
pub trait MetadataStore: Send + Sync {
    /// Store one core metadata field for a metric. `name` must be one of
    /// `desc`, `unit`, `rate`, and `metric` must be non-empty.
    fn put_metric_metadata(&self, metric: &str, name: &str, value: &str) -> Result<()>;

    fn get_metric_metadata(&self, metric: &str) -> Result<MetricMetadata>;

    fn put_tag_metadata(
        &self,
        tags: &TagSet,
        name: &str,
        value: &str,
        touched: DateTime<Utc>,
    ) -> Result<()>;

    /// All tag metadata whose tag set contains `tags` as a subset and, when
    /// `name` is non-empty, whose name matches it.
    fn get_tag_metadata(&self, tags: &TagSet, name: &str) -> Result<Vec<TagMetadata>>;

    fn delete_tag_metadata(&self, tags: &TagSet, name: &str) -> Result<()>;
}

/// Per-alert failure bookkeeping used to flag broken alert definitions in
/// operator views.
pub trait ErrorStore: Send + Sync {
    fn is_alert_failing(&self, name: &str) -> Result<bool>;

    fn mark_alert_failure(&self, name: &str, message: &str) -> Result<()>;

    fn mark_alert_success(&self, name: &str) -> Result<()>;

    fn clear_alert(&self, name: &str) -> Result<()>;

    fn clear_all(&self) -> Result<()>;

    /// `(currently failing, total alerts with any recorded error)`.
    fn failing_alert_counts(&self) -> Result<(usize, usize)>;
}

/// Façade handed to the scheduler at startup. Implementations must be
/// internally thread-safe; the scheduler does not serialize calls to them.
pub trait DataAccess: Send + Sync {
    fn incidents(&self) -> &dyn IncidentStore;
    fn metadata(&self) -> &dyn MetadataStore;
    fn errors(&self) -> &dyn ErrorStore;
}
