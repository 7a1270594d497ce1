use crate::key::{tags_subset, AlertKey, TagSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome severity of one rule evaluation, ordered from best to worst.
/// `None` sorts below `Normal` so a state with no history compares below
/// everything that has been evaluated at least once.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    None,
    Normal,
    Warning,
    Critical,
    Unknown,
}

impl Status {
    pub fn is_normal(self) -> bool {
        self == Status::Normal
    }

    pub fn is_warning(self) -> bool {
        self == Status::Warning
    }

    pub fn is_critical(self) -> bool {
        self == Status::Critical
    }

    pub fn is_unknown(self) -> bool {
        self == Status::Unknown
    }

    /// Anything worse than normal.
    pub fn is_abnormal(self) -> bool {
        self > Status::Normal
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Normal => write!(f, "normal"),
            Status::Warning => write!(f, "warning"),
            Status::Critical => write!(f, "critical"),
            Status::Unknown => write!(f, "unknown"),
            Status::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Status::Normal),
            "warning" => Ok(Status::Warning),
            "critical" => Ok(Status::Critical),
            "unknown" => Ok(Status::Unknown),
            "none" => Ok(Status::None),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

/// An operator command against one alert state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "Acknowledged")]
    Acknowledge,
    #[serde(rename = "Closed")]
    Close,
    #[serde(rename = "Forgotten")]
    Forget,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Acknowledge => write!(f, "Acknowledged"),
            ActionType::Close => write!(f, "Closed"),
            ActionType::Forget => write!(f, "Forgotten"),
            ActionType::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Acknowledged" => Ok(ActionType::Acknowledge),
            "Closed" => Ok(ActionType::Close),
            "Forgotten" => Ok(ActionType::Forget),
            "none" => Ok(ActionType::None),
            _ => Err(format!("unknown action type: {s}")),
        }
    }
}

/// The value an alert expression evaluated to, plus its text form.
/// The expression language itself lives outside this crate; the scheduler
/// only carries results around.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub value: f64,
    pub expr: String,
}

/// One evaluation outcome in an alert's history.
///
/// Appended to a state only when its status differs from the previous
/// event's status, so consecutive history entries always have distinct
/// statuses. `incident_id` is 0 until the event is linked to an incident.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<EvalResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crit: Option<EvalResult>,
    pub status: Status,
    #[serde(with = "opt_time", default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unevaluated: bool,
    #[serde(default)]
    pub incident_id: u64,
}

/// Audit record of one operator command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub user: String,
    pub message: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ActionType,
}

/// A maximal interval during which an alert key was abnormal. `end` stays
/// unset while the incident is open; it is set by an operator close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: u64,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    pub alert_key: AlertKey,
}

/// A user-defined suppression of alerting over a time window. `alert` is a
/// glob over alert names (empty matches all); `tags` must be a subset of a
/// key's tag set for the silence to apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Silence {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub alert: String,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub forget: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub message: String,
}

impl Silence {
    pub fn active_at(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    pub fn matches(&self, ak: &AlertKey) -> bool {
        if !self.alert.is_empty() && !glob_match::glob_match(&self.alert, ak.name()) {
            return false;
        }
        tags_subset(&self.tags, &ak.group())
    }

    pub fn silenced(&self, now: DateTime<Utc>, ak: &AlertKey) -> bool {
        self.active_at(now) && self.matches(ak)
    }
}

/// Serde helper for optional timestamps that must serialize in text form,
/// with the empty string standing in for an absent time.
pub mod opt_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        t: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&t.to_rfc3339()),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let s = String::deserialize(d)?;
        if s.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}
