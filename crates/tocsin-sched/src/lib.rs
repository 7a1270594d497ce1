//! The alerting scheduler: evaluates rule outcomes into per-key state
//! machines, tracks incidents over their lifetime, handles operator
//! actions, and groups open states for display.
//!
//! One coarse mutex serializes every mutation of the state store; the
//! incident registry has its own finer lock, always taken after the
//! scheduler lock when both are needed. Lock acquisitions are instrumented
//! with wait/hold counters so contention is visible from the outside.

pub mod config;
pub mod groups;
pub mod state;

mod action;
mod incident;
mod persist;
mod probe;

#[cfg(test)]
mod tests;

pub use config::SchedConfig;
pub use groups::{StateGroup, StateGroups};
pub use state::{Attachment, Rendered, State, States};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use incident::IncidentRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tocsin_common::collect::{tags, Collect};
use tocsin_common::key::{AlertKey, TagSet};
use tocsin_common::types::Silence;
use tocsin_storage::{DataAccess, MetricMetadata};

/// Everything guarded by the scheduler mutex.
pub(crate) struct SchedState {
    pub status: States,
    pub silences: HashMap<String, Silence>,
    /// Notifications being tracked per alert key, by notification name.
    pub notifications: HashMap<AlertKey, HashMap<String, DateTime<Utc>>>,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct LockHolder {
    caller: &'static str,
    since: DateTime<Utc>,
}

pub struct Schedule {
    config: SchedConfig,
    collect: Arc<Collect>,
    data_access: Arc<dyn DataAccess>,
    state: Mutex<SchedState>,
    holder: Mutex<Option<LockHolder>>,
    pub(crate) incidents: Mutex<IncidentRegistry>,
    stop: AtomicBool,
}

impl Schedule {
    pub fn new(
        config: SchedConfig,
        data_access: Arc<dyn DataAccess>,
        collect: Arc<Collect>,
    ) -> Self {
        Schedule {
            config,
            collect,
            data_access,
            state: Mutex::new(SchedState {
                status: States::new(),
                silences: HashMap::new(),
                notifications: HashMap::new(),
                last_check: Utc::now(),
            }),
            holder: Mutex::new(None),
            incidents: Mutex::new(IncidentRegistry::default()),
            stop: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn collect(&self) -> &Arc<Collect> {
        &self.collect
    }

    pub fn data_access(&self) -> &Arc<dyn DataAccess> {
        &self.data_access
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Acquires the scheduler lock, recording wait time, hold time, and an
    /// acquisition count under the caller label when the guard drops.
    pub(crate) fn lock(&self, caller: &'static str) -> StateGuard<'_> {
        let start = Instant::now();
        let guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let wait_ms = start.elapsed().as_millis() as i64;
        *self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(LockHolder {
            caller,
            since: Utc::now(),
        });
        StateGuard {
            guard: Some(guard),
            sched: self,
            caller,
            acquired: Instant::now(),
            wait_ms,
        }
    }

    pub(crate) fn lock_incidents(&self) -> MutexGuard<'_, IncidentRegistry> {
        self.incidents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current holder of the scheduler lock, if any.
    pub fn lock_status(&self) -> Option<(&'static str, DateTime<Utc>)> {
        let holder = *self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        holder.map(|h| (h.caller, h.since))
    }

    /// Restores persisted state when a state file is configured. A present
    /// but unreadable file is fatal here; nothing else is.
    pub fn load(&self) -> anyhow::Result<()> {
        self.restore_state()
    }

    /// Runs the background workers: the periodic persistence loop on this
    /// thread, and the host prober on its own thread when enabled. Blocks
    /// until [`Schedule::close`] is called.
    pub fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.config.ping_hosts {
            let sched = Arc::clone(self);
            std::thread::Builder::new()
                .name("host-probe".into())
                .spawn(move || probe::ping_hosts(sched))?;
        }
        let interval = Duration::from_secs(self.config.save_interval_secs.max(1));
        while !self.stopped() {
            std::thread::sleep(interval);
            if self.stopped() {
                break;
            }
            if let Err(err) = self.save() {
                tracing::error!(%err, "periodic state save failed");
            }
        }
        Ok(())
    }

    /// Stops the workers and performs a final save.
    pub fn close(&self) -> anyhow::Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.save()
    }

    // --- metadata passthrough -------------------------------------------

    /// Routes a metadata write: the core fields `desc`, `unit`, and `rate`
    /// go to metric metadata and require a metric name and a string value;
    /// everything else is stored against the tag set.
    pub fn put_metadata(&self, key: &MetaKey, value: &serde_json::Value) -> anyhow::Result<()> {
        let is_core = matches!(key.name.as_str(), "desc" | "unit" | "rate");
        if !is_core {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.data_access
                .metadata()
                .put_tag_metadata(&key.tags, &key.name, &text, Utc::now())?;
            return Ok(());
        }
        if key.metric.is_empty() {
            let err = anyhow!("desc, rate, and unit require a metric name");
            tracing::error!(name = %key.name, "rejecting metric metadata without metric");
            return Err(err);
        }
        let Some(text) = value.as_str() else {
            let err = anyhow!("desc, rate, and unit require a string value");
            tracing::error!(metric = %key.metric, name = %key.name, "rejecting non-string metric metadata");
            return Err(err);
        };
        self.data_access
            .metadata()
            .put_metric_metadata(&key.metric, &key.name, text)?;
        Ok(())
    }

    pub fn delete_metadata(&self, tag_set: &TagSet, name: &str) -> anyhow::Result<()> {
        self.data_access
            .metadata()
            .delete_tag_metadata(tag_set, name)?;
        Ok(())
    }

    pub fn metadata_metrics(&self, metric: &str) -> anyhow::Result<MetricMetadata> {
        Ok(self.data_access.metadata().get_metric_metadata(metric)?)
    }

    /// Metadata entries for a metric (its non-empty core fields) or, when
    /// `metric` is empty, every tag metadata record matching the subset.
    pub fn get_metadata(&self, metric: &str, subset: &TagSet) -> anyhow::Result<Vec<MetaEntry>> {
        let mut entries = Vec::new();
        if !metric.is_empty() {
            let meta = self.metadata_metrics(metric)?;
            for (name, value) in [
                ("desc", &meta.desc),
                ("unit", &meta.unit),
                ("rate", &meta.rate),
            ] {
                if value.is_empty() {
                    continue;
                }
                entries.push(MetaEntry {
                    metric: metric.to_string(),
                    tags: None,
                    name: name.to_string(),
                    value: value.clone(),
                    time: None,
                });
            }
        } else {
            for record in self.data_access.metadata().get_tag_metadata(subset, "")? {
                entries.push(MetaEntry {
                    metric: String::new(),
                    tags: Some(record.tags),
                    name: record.name,
                    value: record.value,
                    time: Some(record.last_touched),
                });
            }
        }
        Ok(entries)
    }

    // --- alert error passthrough ----------------------------------------

    /// Whether the alert definition is currently evaluating cleanly. A
    /// backend failure reads as "not successful" so broken alerts are never
    /// hidden by a broken backend.
    pub fn alert_successful(&self, name: &str) -> bool {
        match self.data_access.errors().is_alert_failing(name) {
            Ok(failing) => !failing,
            Err(err) => {
                tracing::error!(%err, alert = name, "failed to read alert error status");
                false
            }
        }
    }

    pub fn mark_alert_error(&self, name: &str, message: &str) {
        if let Err(err) = self.data_access.errors().mark_alert_failure(name, message) {
            tracing::error!(%err, alert = name, "failed to record alert failure");
        }
    }

    pub fn mark_alert_success(&self, name: &str) {
        if let Err(err) = self.data_access.errors().mark_alert_success(name) {
            tracing::error!(%err, alert = name, "failed to record alert success");
        }
    }

    pub fn clear_errors(&self, alert: &str) -> anyhow::Result<()> {
        if alert == "all" {
            self.data_access.errors().clear_all()?;
        } else {
            self.data_access.errors().clear_alert(alert)?;
        }
        Ok(())
    }

    /// `(failing, total with recorded errors)`; logs and returns zeros on
    /// backend failure.
    pub fn get_error_counts(&self) -> (usize, usize) {
        match self.data_access.errors().failing_alert_counts() {
            Ok(counts) => counts,
            Err(err) => {
                tracing::error!(%err, "failed to read alert error counts");
                (0, 0)
            }
        }
    }
}

/// Addresses one metadata value: a metric name, a tag set, or both.
#[derive(Debug, Clone, Default)]
pub struct MetaKey {
    pub metric: String,
    pub tags: TagSet,
    pub name: String,
}

/// One metadata entry as returned by [`Schedule::get_metadata`].
#[derive(Debug, Clone, Serialize)]
pub struct MetaEntry {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub metric: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagSet>,
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// Scheduler lock guard. Dropping it releases the mutex first, then records
/// the wait/hold samples so the counters never extend the critical section.
pub(crate) struct StateGuard<'a> {
    guard: Option<MutexGuard<'a, SchedState>>,
    sched: &'a Schedule,
    caller: &'static str,
    acquired: Instant,
    wait_ms: i64,
}

impl Deref for StateGuard<'_> {
    type Target = SchedState;

    fn deref(&self) -> &SchedState {
        self.guard.as_ref().expect("guard taken before drop")
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut SchedState {
        self.guard.as_mut().expect("guard taken before drop")
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let hold_ms = self.acquired.elapsed().as_millis() as i64;
        *self
            .sched
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        drop(self.guard.take());
        let collect = &self.sched.collect;
        collect.add(
            "schedule.lock_time",
            tags([("caller", self.caller), ("op", "wait")]),
            self.wait_ms,
        );
        collect.add(
            "schedule.lock_time",
            tags([("caller", self.caller), ("op", "hold")]),
            hold_ms,
        );
        collect.add("schedule.lock_count", tags([("caller", self.caller)]), 1);
    }
}
