use crate::{Schedule, SchedState};
use anyhow::bail;
use chrono::Utc;
use tocsin_common::collect::tags;
use tocsin_common::key::AlertKey;
use tocsin_common::types::{ActionType, Incident, Status};

impl Schedule {
    /// Applies an operator action to one alert state.
    ///
    /// Preconditions are checked before anything is mutated, so a rejected
    /// action leaves the state machine untouched. Every accepted action
    /// appends an audit entry and bumps the `actions` counter tagged with
    /// the user, alert name, and action.
    pub fn action(
        &self,
        user: &str,
        message: &str,
        kind: ActionType,
        ak: &AlertKey,
    ) -> anyhow::Result<()> {
        let timestamp = Utc::now();
        let mut ended: Option<Incident> = None;
        {
            let mut guard = self.lock("Action");
            let SchedState {
                status,
                notifications,
                ..
            } = &mut *guard;
            let Some(st) = status.get_mut(ak) else {
                bail!("no such alert key: {ak}");
            };
            let is_unknown = st.abnormal_status() == Status::Unknown;
            match kind {
                ActionType::Acknowledge => {
                    if !st.need_ack {
                        bail!("alert already acknowledged");
                    }
                    if !st.open {
                        bail!("cannot acknowledge closed alert");
                    }
                    st.need_ack = false;
                    notifications.remove(ak);
                    st.action(user, message, kind, timestamp);
                }
                ActionType::Close => {
                    if st.is_active() {
                        bail!("cannot close active alert");
                    }
                    if st.need_ack {
                        st.need_ack = false;
                        notifications.remove(ak);
                    }
                    st.open = false;
                    let last = st.last();
                    if last.incident_id != 0 {
                        let mut reg = self.lock_incidents();
                        if let Some(incident) = reg.incidents.get_mut(&last.incident_id) {
                            incident.end = Some(timestamp);
                            ended = Some(incident.clone());
                        }
                    }
                    st.action(user, message, kind, timestamp);
                }
                ActionType::Forget => {
                    if !is_unknown {
                        bail!("can only forget unknowns");
                    }
                    if st.need_ack {
                        st.need_ack = false;
                        notifications.remove(ak);
                    }
                    st.open = false;
                    st.forgotten = true;
                    st.action(user, message, kind, timestamp);
                    status.remove(ak);
                }
                ActionType::None => bail!("unknown action type: none"),
            }
            self.collect().add(
                "actions",
                tags([
                    ("user", user),
                    ("alert", ak.name()),
                    ("type", &kind.to_string()),
                ]),
                1,
            );
        }
        // Persist the closed incident outside the critical sections.
        if let Some(incident) = ended {
            if let Err(err) = self.data_access().incidents().update(incident.id, &incident) {
                tracing::error!(%err, incident = incident.id, "failed to persist incident end");
            }
        }
        Ok(())
    }
}
