use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer identifier of a job request, unique among pending requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i32);

impl JobId {
    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for JobId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// A single value inside an [`Extras`] payload.
///
/// Tagged on the wire so that an `Int` never comes back as a `Double` after
/// a trip through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExtraValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    TextList(Vec<String>),
    /// Raw bytes. Not persistable: only transient extras may carry them.
    Bytes(Vec<u8>),
}

impl ExtraValue {
    /// Whether an OS scheduler's durable storage can hold this value.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, ExtraValue::Bytes(_))
    }
}

/// Opaque key-value payload attached to a job request.
///
/// Keys are kept sorted so two payloads with equal content serialise to the
/// same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extras(BTreeMap<String, ExtraValue>);

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: ExtraValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ExtraValue) -> Option<ExtraValue> {
        self.0.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&ExtraValue> {
        self.0.get(key)
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(ExtraValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExtraValue)> {
        self.0.iter()
    }

    /// Keys whose values cannot be persisted, in sorted order.
    pub fn non_persistable_keys(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, v)| !v.is_persistable())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

impl<K: Into<String>> FromIterator<(K, ExtraValue)> for Extras {
    fn from_iter<I: IntoIterator<Item = (K, ExtraValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Network condition a job asks for before it may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// No network requirement.
    #[default]
    Any,
    Connected,
    Unmetered,
    NotRoaming,
    Metered,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkType::Any => "any",
            NetworkType::Connected => "connected",
            NetworkType::Unmetered => "unmetered",
            NetworkType::NotRoaming => "not_roaming",
            NetworkType::Metered => "metered",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "any" => Ok(NetworkType::Any),
            "connected" => Ok(NetworkType::Connected),
            "unmetered" => Ok(NetworkType::Unmetered),
            "not_roaming" => Ok(NetworkType::NotRoaming),
            "metered" => Ok(NetworkType::Metered),
            other => Err(format!("unknown network type: {other}")),
        }
    }
}

/// One concrete OS scheduling mechanism, best-first in declaration order.
///
/// The number is the first platform version that ships the mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Job scheduler with native transient-extras support.
    JobScheduler26,
    /// Job scheduler with flex windows for periodic jobs.
    JobScheduler24,
    JobScheduler21,
    /// Exact one-off alarms; periodic work is re-armed by the engine.
    ExactAlarm19,
    /// Inexact (windowed / repeating) alarms.
    Alarm14,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::JobScheduler26,
        BackendKind::JobScheduler24,
        BackendKind::JobScheduler21,
        BackendKind::ExactAlarm19,
        BackendKind::Alarm14,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::JobScheduler26 => "job_scheduler_26",
            BackendKind::JobScheduler24 => "job_scheduler_24",
            BackendKind::JobScheduler21 => "job_scheduler_21",
            BackendKind::ExactAlarm19 => "exact_alarm_19",
            BackendKind::Alarm14 => "alarm_14",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown backend: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_not_persistable() {
        let extras = Extras::new()
            .with("name", ExtraValue::Text("a".into()))
            .with("blob", ExtraValue::Bytes(vec![1, 2, 3]));
        assert_eq!(extras.non_persistable_keys(), vec!["blob"]);
    }

    #[test]
    fn int_survives_json() {
        let extras = Extras::new().with("n", ExtraValue::Int(3));
        let json = serde_json::to_string(&extras).unwrap();
        let back: Extras = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("n"), Some(&ExtraValue::Int(3)));
    }

    #[test]
    fn backend_kind_parses_its_display() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("gcm".parse::<BackendKind>().is_err());
    }

    #[test]
    fn network_type_parses_its_display() {
        for nt in [
            NetworkType::Any,
            NetworkType::Connected,
            NetworkType::Unmetered,
            NetworkType::NotRoaming,
            NetworkType::Metered,
        ] {
            assert_eq!(nt.to_string().parse::<NetworkType>().unwrap(), nt);
        }
    }
}
