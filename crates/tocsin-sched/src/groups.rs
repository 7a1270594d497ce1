use crate::state::State;
use crate::Schedule;
use chrono::{DateTime, Utc};
use glob_match::glob_match;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tocsin_common::key::AlertKey;
use tocsin_common::types::{Silence, Status};

/// The stratification key of the grouping pipeline: states are bucketed by
/// acknowledgement, activity, worst abnormal status, and silencing before
/// any tag-based grouping happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateTuple {
    pub need_ack: bool,
    pub active: bool,
    pub status: Status,
    pub silenced: bool,
}

/// Buckets states by [`StateTuple`].
pub fn group_states<'a>(
    states: &[(&'a AlertKey, &'a State)],
    silenced: &HashMap<AlertKey, Silence>,
) -> BTreeMap<StateTuple, Vec<(&'a AlertKey, &'a State)>> {
    let mut buckets: BTreeMap<StateTuple, Vec<(&AlertKey, &State)>> = BTreeMap::new();
    for (ak, st) in states {
        let tuple = StateTuple {
            need_ack: st.need_ack,
            active: st.is_active(),
            status: st.abnormal_status(),
            silenced: silenced.contains_key(*ak),
        };
        buckets.entry(tuple).or_default().push((*ak, *st));
    }
    buckets
}

/// Partitions one bucket of states into named groups.
///
/// Groups are carved greedily by the most common `(tag, value)` pair until
/// the best remaining pair covers fewer than `min_group` states (ties go to
/// the lexicographically smallest pair so runs are reproducible). Leftover
/// states sharing an alert name form a group when the partition reaches
/// `min_group`; everything else becomes a singleton named by its key.
pub fn group_sets(states: &[(&AlertKey, &State)], min_group: usize) -> BTreeMap<String, Vec<AlertKey>> {
    let mut groups: BTreeMap<String, Vec<AlertKey>> = BTreeMap::new();
    let mut seen: HashSet<&AlertKey> = HashSet::new();
    loop {
        let mut counts: BTreeMap<(&String, &String), usize> = BTreeMap::new();
        for (ak, st) in states {
            if seen.contains(*ak) {
                continue;
            }
            for (k, v) in &st.group {
                *counts.entry((k, v)).or_insert(0) += 1;
            }
        }
        let mut best: Option<((&String, &String), usize)> = None;
        for (pair, count) in &counts {
            let better = match best {
                None => true,
                Some((best_pair, best_count)) => {
                    *count > best_count || (*count == best_count && *pair < best_pair)
                }
            };
            if better {
                best = Some((*pair, *count));
            }
        }
        let Some(((key, value), max)) = best else {
            break;
        };
        if max < min_group {
            break;
        }
        let mut group = Vec::new();
        for (ak, st) in states {
            if seen.contains(*ak) {
                continue;
            }
            if st.group.get(key).map(String::as_str) != Some(value.as_str()) {
                continue;
            }
            seen.insert(*ak);
            group.push((*ak).clone());
        }
        if !group.is_empty() {
            group.sort();
            groups.insert(format!("{{{key}={value}}}"), group);
        }
    }

    // Alert-name fallback for states no tag pair covered.
    let mut by_alert: BTreeMap<&str, Vec<&AlertKey>> = BTreeMap::new();
    for (ak, st) in states {
        if seen.contains(*ak) {
            continue;
        }
        by_alert.entry(st.alert.as_str()).or_default().push(*ak);
    }
    for (alert, keys) in &by_alert {
        if keys.len() >= min_group {
            let mut group: Vec<AlertKey> = keys.iter().map(|ak| (**ak).clone()).collect();
            group.sort();
            groups.insert((*alert).to_string(), group);
        }
    }

    // Singletons.
    for (ak, st) in states {
        if seen.contains(*ak) {
            continue;
        }
        if by_alert
            .get(st.alert.as_str())
            .map_or(false, |keys| keys.len() >= min_group)
        {
            continue;
        }
        groups.insert(ak.to_string(), vec![(*ak).clone()]);
    }
    groups
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One node of the display tree: either a named group of alert keys or a
/// leaf carrying a trimmed state snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateGroup {
    #[serde(skip_serializing_if = "is_false")]
    pub active: bool,
    pub status: Status,
    pub silenced: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alert: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_key: Option<AlertKey>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ago: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StateGroup>,
}

#[derive(Debug, Default, Serialize)]
pub struct GroupedStates {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub need_ack: Vec<StateGroup>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub acknowledged: Vec<StateGroup>,
}

/// The full display payload: grouped open states split by acknowledgement,
/// plus the error counters and the UI time configuration.
#[derive(Debug, Default, Serialize)]
pub struct StateGroups {
    pub groups: GroupedStates,
    pub time_and_date: Vec<i64>,
    pub failing_alerts: usize,
    pub unclosed_errors: usize,
}

fn marshal_time(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => t.to_rfc3339(),
        None => String::new(),
    }
}

fn group_cmp(a: &StateGroup, b: &StateGroup) -> Ordering {
    b.active
        .cmp(&a.active)
        .then_with(|| b.status.cmp(&a.status))
        .then_with(|| a.alert_key.cmp(&b.alert_key))
        .then_with(|| a.subject.cmp(&b.subject))
}

impl Schedule {
    /// Groups the open states matching `filter` (a glob over alert keys or
    /// names; empty matches all) into the display tree.
    ///
    /// Only buckets whose abnormal status is warning, critical, or unknown
    /// are rendered. Each group's children carry trimmed snapshots: the
    /// notification bodies are dropped and history/actions are cut to their
    /// most recent entry to bound the payload.
    pub fn marshal_groups(&self, filter: &str) -> anyhow::Result<StateGroups> {
        let silenced = self.silenced();
        let (failing_alerts, unclosed_errors) = self.get_error_counts();
        let mut out = StateGroups {
            groups: GroupedStates::default(),
            time_and_date: self.config().time_and_date.clone(),
            failing_alerts,
            unclosed_errors,
        };
        let guard = self.lock("MarshalGroups");
        let matched: Vec<(&AlertKey, &State)> = guard
            .status
            .iter()
            .filter(|(ak, st)| {
                st.open
                    && (filter.is_empty()
                        || glob_match(filter, ak.as_str())
                        || glob_match(filter, ak.name()))
            })
            .collect();
        let buckets = group_states(&matched, &silenced);
        for (tuple, states) in &buckets {
            match tuple.status {
                Status::Warning | Status::Critical | Status::Unknown => {}
                _ => continue,
            }
            let sets = group_sets(states, self.config().min_group_size);
            let mut grouped = Vec::new();
            for (name, keys) in sets {
                let mut parent = StateGroup {
                    active: tuple.active,
                    status: tuple.status,
                    silenced: tuple.silenced,
                    subject: format!("{} - {}", tuple.status, name),
                    ..Default::default()
                };
                for ak in keys {
                    let Some(src) = guard.status.get(&ak) else {
                        continue;
                    };
                    let mut st = src.copy();
                    // Drop the heavy rendering output and all but the
                    // latest history/action entries before shipping.
                    st.body = String::new();
                    st.email_subject = Vec::new();
                    st.email_body = Vec::new();
                    st.attachments = Vec::new();
                    if st.history.len() > 1 {
                        st.history = st.history.split_off(st.history.len() - 1);
                    }
                    if st.actions.len() > 1 {
                        st.actions = st.actions.split_off(st.actions.len() - 1);
                    }
                    let last_time = st.last().time;
                    parent.children.push(StateGroup {
                        active: tuple.active,
                        status: tuple.status,
                        silenced: tuple.silenced,
                        is_error: !self.alert_successful(ak.name()),
                        subject: st.subject.clone(),
                        alert: ak.name().to_string(),
                        alert_key: Some(ak.clone()),
                        ago: marshal_time(last_time),
                        state: Some(st),
                        children: Vec::new(),
                    });
                }
                if parent.children.len() == 1 && !parent.children[0].subject.is_empty() {
                    parent.subject = parent.children[0].subject.clone();
                }
                grouped.push(parent);
            }
            if tuple.need_ack {
                out.groups.need_ack.extend(grouped);
            } else {
                out.groups.acknowledged.extend(grouped);
            }
        }
        out.groups.need_ack.sort_by(group_cmp);
        out.groups.acknowledged.sort_by(group_cmp);
        Ok(out)
    }
}
