use crate::state::States;
use crate::Schedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use tocsin_common::key::{AlertKey, TagSet};
use tocsin_common::types::{Incident, Silence};

/// On-disk form of the scheduler state. Everything needed to resume after
/// a restart round-trips through this struct.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    states: States,
    #[serde(default)]
    silences: HashMap<String, Silence>,
    #[serde(default)]
    notifications: HashMap<AlertKey, HashMap<String, DateTime<Utc>>>,
    #[serde(default)]
    incidents: Vec<Incident>,
    #[serde(default)]
    max_incident_id: u64,
}

impl Schedule {
    /// Writes the current state to the configured state file, atomically
    /// (temp file + rename) and owner-read/write only. A no-op when no
    /// path is configured. The resulting file size is reported on the
    /// `statefile.size` gauge.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = self.config().state_file.clone() else {
            return Ok(());
        };
        let contents = {
            let guard = self.lock("Save");
            let reg = self.lock_incidents();
            let mut incidents: Vec<Incident> = reg.incidents.values().cloned().collect();
            incidents.sort_by_key(|i| i.id);
            StateFile {
                states: guard.status.clone(),
                silences: guard.silences.clone(),
                notifications: guard.notifications.clone(),
                incidents,
                max_incident_id: reg.max_incident_id,
            }
        };
        let raw = serde_json::to_vec(&contents)?;
        let tmp = path.with_extension("tmp");
        {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut file = opts.open(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.collect()
            .put("statefile.size", TagSet::new(), raw.len() as f64);
        tracing::debug!(bytes = raw.len(), "state saved");
        Ok(())
    }

    /// Restores state from the configured state file. A missing file is a
    /// fresh start; an unreadable one is an error, which callers treat as
    /// fatal at startup. When the file predates incident tracking, the
    /// registry is rebuilt from the restored histories.
    pub(crate) fn restore_state(&self) -> anyhow::Result<()> {
        let Some(path) = self.config().state_file.clone() else {
            return Ok(());
        };
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if raw.is_empty() {
            return Ok(());
        }
        let contents: StateFile = serde_json::from_slice(&raw)?;
        let had_incidents = !contents.incidents.is_empty();
        {
            let mut guard = self.lock("RestoreState");
            let mut reg = self.lock_incidents();
            guard.status = contents.states;
            guard.silences = contents.silences;
            guard.notifications = contents.notifications;
            reg.incidents = contents
                .incidents
                .into_iter()
                .map(|i| (i.id, i))
                .collect();
            let highest = reg.incidents.keys().max().copied().unwrap_or(0);
            reg.max_incident_id = contents.max_incident_id.max(highest);
        }
        if !had_incidents {
            self.reconstruct();
        }
        let max_id = self.lock_incidents().max_incident_id;
        if let Err(err) = self.data_access().incidents().raise_max_id(max_id) {
            tracing::warn!(%err, "failed to raise backend incident counter after restore");
        }
        tracing::info!(path = %path.display(), "state restored");
        Ok(())
    }
}
