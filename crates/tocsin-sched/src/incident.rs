use crate::Schedule;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tocsin_common::key::AlertKey;
use tocsin_common::types::{Action, ActionType, Event, Incident, Status};

/// In-memory incident registry: the authoritative map of known incidents
/// plus the high-water mark of assigned ids. Guarded by its own mutex,
/// always taken after the scheduler lock when both are held.
#[derive(Debug, Default)]
pub(crate) struct IncidentRegistry {
    pub incidents: HashMap<u64, Incident>,
    pub max_incident_id: u64,
}

impl Schedule {
    /// Opens a new incident for `ak`. The id is allocated by the backend
    /// counter so ids stay monotone across every writer; the registry keeps
    /// its high-water mark in step.
    pub(crate) fn create_incident(
        &self,
        ak: &AlertKey,
        start: DateTime<Utc>,
    ) -> anyhow::Result<Incident> {
        let incident = self.data_access().incidents().create(ak, start)?;
        let mut reg = self.lock_incidents();
        reg.max_incident_id = reg.max_incident_id.max(incident.id);
        reg.incidents.insert(incident.id, incident.clone());
        Ok(incident)
    }

    pub fn get_incident(&self, id: u64) -> anyhow::Result<Incident> {
        let reg = self.lock_incidents();
        reg.incidents
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("incident {id} not found"))
    }

    /// Incidents whose start lies in `[from, to]`, optionally filtered to
    /// one alert name (empty matches all). Sorted by id.
    pub fn get_incidents(
        &self,
        alert: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Incident> {
        let reg = self.lock_incidents();
        let mut list: Vec<Incident> = reg
            .incidents
            .values()
            .filter(|i| alert.is_empty() || i.alert_key.name() == alert)
            .filter(|i| from <= i.start && i.start <= to)
            .cloned()
            .collect();
        list.sort_by_key(|i| i.id);
        list
    }

    /// The incident, the contiguous run of history events linked to it, and
    /// the actions that fell inside its lifetime.
    ///
    /// Boundary behavior is asymmetric on purpose: an event timestamped
    /// exactly at the incident end is not linked to it, but an action at
    /// that same instant (the close itself) is included.
    pub fn get_incident_events(
        &self,
        id: u64,
    ) -> anyhow::Result<(Incident, Vec<Event>, Vec<Action>)> {
        let incident = self.get_incident(id)?;
        let Some(state) = self.get_status(&incident.alert_key) else {
            return Ok((incident, Vec::new(), Vec::new()));
        };
        let mut events = Vec::new();
        let mut found = false;
        for ev in &state.history {
            if ev.incident_id == id {
                found = true;
                events.push(ev.clone());
            } else if found {
                break;
            }
        }
        let mut actions = Vec::new();
        for action in &state.actions {
            let after_start = action.time > incident.start;
            let before_end = match incident.end {
                None => true,
                Some(end) => action.time <= end,
            };
            if after_start && before_end {
                actions.push(action.clone());
            }
        }
        Ok((incident, events, actions))
    }

    /// Rebuilds the incident registry from the recorded histories.
    ///
    /// The registry is cleared but the id counter is not, so rebuilt
    /// incidents never reuse ids handed out earlier in the process.
    /// Each state's history is swept oldest-first: an abnormal event
    /// outside any incident starts one, the first close action after the
    /// start bounds it, and every event strictly before the end is linked
    /// to it. New incidents are sorted by `(start, alert key)` before ids
    /// are assigned. Malformed entries are skipped, never fatal.
    pub fn reconstruct(&self) {
        struct Pending {
            ak: AlertKey,
            start_idx: usize,
            incident: Incident,
        }

        let max_id;
        let rebuilt: Vec<Incident>;
        {
            let mut guard = self.lock("Reconstruct");
            let mut reg = self.lock_incidents();
            reg.incidents.clear();
            for st in guard.status.values_mut() {
                for ev in &mut st.history {
                    ev.incident_id = 0;
                }
            }

            let mut pending: Vec<Pending> = Vec::new();
            for (ak, st) in guard.status.iter() {
                let mut current: Option<usize> = None;
                for (i, ev) in st.history.iter().enumerate() {
                    let Some(time) = ev.time else {
                        // Tolerate events that lost their timestamp.
                        continue;
                    };
                    if let Some(ci) = current {
                        match pending[ci].incident.end {
                            None => continue,
                            Some(end) if time < end => continue,
                            Some(_) => current = None,
                        }
                    }
                    if ev.status == Status::Normal {
                        continue;
                    }
                    let mut incident = Incident {
                        id: 0,
                        start: time,
                        end: None,
                        alert_key: ak.clone(),
                    };
                    for action in &st.actions {
                        if action.kind == ActionType::Close && action.time > time {
                            incident.end = Some(action.time);
                            break;
                        }
                    }
                    pending.push(Pending {
                        ak: ak.clone(),
                        start_idx: i,
                        incident,
                    });
                    current = Some(pending.len() - 1);
                }
            }

            pending.sort_by(|a, b| {
                a.incident
                    .start
                    .cmp(&b.incident.start)
                    .then_with(|| a.ak.cmp(&b.ak))
            });

            for p in pending.iter_mut() {
                reg.max_incident_id += 1;
                p.incident.id = reg.max_incident_id;
                if let Some(st) = guard.status.get_mut(&p.ak) {
                    for ev in st.history[p.start_idx..].iter_mut() {
                        let inside = match (p.incident.end, ev.time) {
                            (None, _) => true,
                            (Some(end), Some(time)) => time < end,
                            (Some(_), None) => false,
                        };
                        if inside {
                            ev.incident_id = p.incident.id;
                        } else {
                            break;
                        }
                    }
                }
                reg.incidents.insert(p.incident.id, p.incident.clone());
            }

            max_id = reg.max_incident_id;
            rebuilt = pending.into_iter().map(|p| p.incident).collect();
        }

        // Write-through outside the locks; reconstruction never fails
        // startup over a backend hiccup.
        let store = self.data_access().incidents();
        if let Err(err) = store.raise_max_id(max_id) {
            tracing::warn!(%err, "failed to raise backend incident counter");
        }
        for incident in rebuilt {
            if let Err(err) = store.update(incident.id, &incident) {
                tracing::warn!(%err, incident = incident.id, "failed to persist rebuilt incident");
            }
        }
    }
}
