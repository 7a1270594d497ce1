use crate::Schedule;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tocsin_common::key::{format_tags, AlertKey, TagSet};
use tocsin_common::types::{opt_time, Action, ActionType, EvalResult, Event, Silence, Status};

/// The state store: one [`State`] per alert key. Mutable only under the
/// scheduler lock; external consumers get deep-copied snapshots.
pub type States = HashMap<AlertKey, State>;

/// A rendered notification attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub data: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

/// Rendered notification artifacts for one alert state, produced by the
/// external templating pipeline.
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub subject: String,
    pub body: String,
    pub email_subject: Vec<u8>,
    pub email_body: Vec<u8>,
    pub attachments: Vec<Attachment>,
}

/// Everything the scheduler knows about one alert key.
///
/// `history` and `actions` are chronological, most recent last. Consecutive
/// history entries always carry distinct statuses; the last entry is the
/// current status. The bulky notification fields are omitted from JSON when
/// empty, and snapshot paths clear them before serializing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EvalResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Event>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(with = "opt_time", default)]
    pub touched: Option<DateTime<Utc>>,
    /// Alert rule name, kept alongside the tag fields so states serialize
    /// without needing the key parsed back apart.
    pub alert: String,
    /// String form of `group`.
    pub tags: String,
    pub group: TagSet,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_subject: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub need_ack: bool,
    pub open: bool,
    pub forgotten: bool,
    pub unevaluated: bool,
    #[serde(with = "opt_time", default)]
    pub last_log_time: Option<DateTime<Utc>>,
}

impl State {
    pub fn new(ak: &AlertKey) -> Self {
        let group = ak.group();
        State {
            alert: ak.name().to_string(),
            tags: format_tags(&group),
            group,
            ..Default::default()
        }
    }

    /// An independent copy: scalars, a deep copy of the tag map, and
    /// history/action buffers that can be appended to on either side
    /// without the other observing the change.
    pub fn copy(&self) -> State {
        self.clone()
    }

    pub fn alert_key(&self) -> AlertKey {
        AlertKey::new(&self.alert, &self.group)
    }

    /// The most recent event, or a default (status `None`, no time) for an
    /// empty history.
    pub fn last(&self) -> Event {
        self.history.last().cloned().unwrap_or_default()
    }

    pub fn status(&self) -> Status {
        self.last().status
    }

    pub fn is_active(&self) -> bool {
        self.status() > Status::Normal
    }

    /// The most recent abnormal event, if any.
    pub fn abnormal_event(&self) -> Option<&Event> {
        self.history.iter().rev().find(|ev| ev.status > Status::Normal)
    }

    /// The most recent abnormal status, `None` if the history has none.
    pub fn abnormal_status(&self) -> Status {
        self.abnormal_event().map_or(Status::None, |ev| ev.status)
    }

    /// Appends the event if its status differs from the latest one.
    /// Returns the previous status.
    pub fn append(&mut self, event: &Event) -> Status {
        let last = self.last();
        if self.history.is_empty() || last.status != event.status {
            self.history.push(event.clone());
        }
        last.status
    }

    pub fn action(&mut self, user: &str, message: &str, kind: ActionType, time: DateTime<Utc>) {
        self.actions.push(Action {
            user: user.to_string(),
            message: message.to_string(),
            time,
            kind,
        });
    }

    pub fn touch(&mut self) {
        self.touched = Some(Utc::now());
        self.forgotten = false;
    }
}

impl Schedule {
    /// Deep-copied snapshot of one state, safe to hold without the lock.
    pub fn get_status(&self, ak: &AlertKey) -> Option<State> {
        let guard = self.lock("GetStatus");
        guard.status.get(ak).map(State::copy)
    }

    /// Deep-copied snapshot of all open states.
    pub fn get_open_states(&self) -> States {
        let guard = self.lock("GetOpenStates");
        guard
            .status
            .iter()
            .filter(|(_, st)| st.open)
            .map(|(ak, st)| (ak.clone(), st.copy()))
            .collect()
    }

    /// Records one evaluation outcome for `ak`.
    ///
    /// The event is appended only when its status differs from the latest
    /// one. An abnormal event is linked to the key's open incident, or a
    /// new incident is created at the normal-to-abnormal boundary; a normal
    /// event inside a still-open incident stays linked to it. Abnormal
    /// appends open the state and raise `need_ack`.
    pub fn apply_event(
        &self,
        ak: &AlertKey,
        mut event: Event,
        result: Option<EvalResult>,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut guard = self.lock("ApplyEvent");
        guard.last_check = now;
        let st = guard
            .status
            .entry(ak.clone())
            .or_insert_with(|| State::new(ak));
        st.touch();
        st.result = result;
        st.unevaluated = event.unevaluated;
        let prev = st.last();
        if !st.history.is_empty() && prev.status == event.status {
            return Ok(());
        }
        if event.status.is_abnormal() {
            let open_id = {
                let reg = self.lock_incidents();
                (prev.incident_id != 0
                    && reg
                        .incidents
                        .get(&prev.incident_id)
                        .is_some_and(|i| i.end.is_none()))
                .then_some(prev.incident_id)
            };
            match open_id {
                Some(id) => event.incident_id = id,
                None => {
                    // Scoped backend call; incident creation is the one
                    // write allowed under the scheduler lock.
                    let incident = self.create_incident(ak, event.time.unwrap_or(now))?;
                    event.incident_id = incident.id;
                }
            }
            st.open = true;
            st.need_ack = true;
        } else if prev.incident_id != 0 {
            let reg = self.lock_incidents();
            if reg
                .incidents
                .get(&prev.incident_id)
                .is_some_and(|i| i.end.is_none())
            {
                event.incident_id = prev.incident_id;
            }
        }
        st.append(&event);
        if st
            .last_log_time
            .map_or(true, |t| now - t > Duration::minutes(5))
        {
            tracing::info!(alert_key = %ak, status = %event.status, "alert status changed");
            st.last_log_time = Some(now);
        }
        Ok(())
    }

    /// Installs the rendered notification artifacts for a state.
    pub fn set_rendered(&self, ak: &AlertKey, rendered: Rendered) -> anyhow::Result<()> {
        let mut guard = self.lock("SetRendered");
        let st = guard
            .status
            .get_mut(ak)
            .ok_or_else(|| anyhow::anyhow!("no such alert key: {ak}"))?;
        st.subject = rendered.subject;
        st.body = rendered.body;
        st.email_subject = rendered.email_subject;
        st.email_body = rendered.email_body;
        st.attachments = rendered.attachments;
        Ok(())
    }

    /// Remembers that a notification is pending or repeating for `ak`.
    /// Acknowledging the key drops all of its tracked notifications.
    pub fn track_notification(&self, ak: &AlertKey, notification: &str, at: DateTime<Utc>) {
        let mut guard = self.lock("TrackNotification");
        guard
            .notifications
            .entry(ak.clone())
            .or_default()
            .insert(notification.to_string(), at);
    }

    /// Tracked notifications for one key, if any.
    pub fn tracked_notifications(&self, ak: &AlertKey) -> Option<HashMap<String, DateTime<Utc>>> {
        let guard = self.lock("TrackedNotifications");
        guard.notifications.get(ak).cloned()
    }

    pub fn set_silence(&self, id: &str, silence: Silence) {
        let mut guard = self.lock("SetSilence");
        guard.silences.insert(id.to_string(), silence);
    }

    pub fn clear_silence(&self, id: &str) -> bool {
        let mut guard = self.lock("ClearSilence");
        guard.silences.remove(id).is_some()
    }

    /// The currently silenced alert keys. When several silences match a
    /// key, the one ending last wins.
    pub fn silenced(&self) -> HashMap<AlertKey, Silence> {
        let now = Utc::now();
        let guard = self.lock("Silenced");
        let mut out: HashMap<AlertKey, Silence> = HashMap::new();
        for silence in guard.silences.values() {
            if !silence.active_at(now) {
                continue;
            }
            for ak in guard.status.keys() {
                if !silence.matches(ak) {
                    continue;
                }
                match out.get(ak) {
                    Some(prev) if prev.end >= silence.end => {}
                    _ => {
                        out.insert(ak.clone(), silence.clone());
                    }
                }
            }
        }
        out
    }

    /// Time of the most recent evaluation intake.
    pub fn last_check(&self) -> DateTime<Utc> {
        self.lock("LastCheck").last_check
    }
}
