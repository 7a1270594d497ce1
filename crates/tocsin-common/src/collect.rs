use crate::key::TagSet;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// In-process registry of tagged counters and gauges.
///
/// Metric names are qualified with a fixed prefix at record time, so a
/// caller reporting `schedule.lock_time` under the default prefix produces
/// the external name `tocsin.schedule.lock_time`. Both record and read
/// sides take the unqualified name.
///
/// The registry is shared as an `Arc` between the scheduler and the storage
/// backend; all methods take `&self` and are safe to call concurrently.
#[derive(Debug)]
pub struct Collect {
    prefix: String,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<(String, TagSet), i64>,
    gauges: HashMap<(String, TagSet), f64>,
}

impl Default for Collect {
    fn default() -> Self {
        Collect::new("tocsin")
    }
}

impl Collect {
    pub fn new(prefix: &str) -> Self {
        Collect {
            prefix: prefix.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    /// Adds `value` to the counter `name` tagged with `tags`.
    pub fn add(&self, name: &str, tags: TagSet, value: i64) {
        let key = (self.qualify(name), tags);
        *self.lock().counters.entry(key).or_insert(0) += value;
    }

    /// Sets the gauge `name` tagged with `tags` to `value`.
    pub fn put(&self, name: &str, tags: TagSet, value: f64) {
        let key = (self.qualify(name), tags);
        self.lock().gauges.insert(key, value);
    }

    /// Current counter value, 0 if never recorded.
    pub fn counter(&self, name: &str, tags: &TagSet) -> i64 {
        let key = (self.qualify(name), tags.clone());
        self.lock().counters.get(&key).copied().unwrap_or(0)
    }

    /// Current gauge value, if ever recorded.
    pub fn gauge(&self, name: &str, tags: &TagSet) -> Option<f64> {
        let key = (self.qualify(name), tags.clone());
        self.lock().gauges.get(&key).copied()
    }

    /// Starts a scoped timer; when the guard drops, the elapsed milliseconds
    /// are added to the counter `name` with the given tags.
    pub fn start_timer<'a>(&'a self, name: &str, tags: TagSet) -> TimerGuard<'a> {
        TimerGuard {
            collect: self,
            name: name.to_string(),
            tags: Some(tags),
            start: Instant::now(),
        }
    }

    /// Snapshot of all counters with their qualified names, for exporters.
    pub fn counters(&self) -> Vec<(String, TagSet, i64)> {
        self.lock()
            .counters
            .iter()
            .map(|((name, tags), v)| (name.clone(), tags.clone(), *v))
            .collect()
    }
}

pub struct TimerGuard<'a> {
    collect: &'a Collect,
    name: String,
    tags: Option<TagSet>,
    start: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_millis() as i64;
        if let Some(tags) = self.tags.take() {
            self.collect.add(&self.name, tags, elapsed_ms);
        }
    }
}

/// Builds a tag set from literal pairs: `tags([("caller", "Action")])`.
pub fn tags<const N: usize>(pairs: [(&str, &str); N]) -> TagSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_tag_set() {
        let c = Collect::new("test");
        c.add("actions", tags([("user", "u1")]), 1);
        c.add("actions", tags([("user", "u1")]), 1);
        c.add("actions", tags([("user", "u2")]), 1);
        assert_eq!(c.counter("actions", &tags([("user", "u1")])), 2);
        assert_eq!(c.counter("actions", &tags([("user", "u2")])), 1);
        assert_eq!(c.counter("actions", &tags([("user", "u3")])), 0);
    }

    #[test]
    fn gauges_overwrite() {
        let c = Collect::new("test");
        c.put("statefile.size", TagSet::new(), 10.0);
        c.put("statefile.size", TagSet::new(), 20.0);
        assert_eq!(c.gauge("statefile.size", &TagSet::new()), Some(20.0));
    }

    #[test]
    fn names_are_prefix_qualified() {
        let c = Collect::new("test");
        c.add("schedule.lock_count", TagSet::new(), 1);
        let all = c.counters();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "test.schedule.lock_count");
    }

    #[test]
    fn timer_records_on_drop() {
        let c = Collect::new("test");
        {
            let _t = c.start_timer("storage", tags([("op", "GetIncident")]));
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(c.counter("storage", &tags([("op", "GetIncident")])) >= 5);
    }
}
