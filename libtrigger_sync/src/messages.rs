//! Typed payloads of the status feed topics the controller acts on.
//!
//! Only the fields used here are declared; anything else the server adds is ignored.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// STATUS
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub nchannels: usize,
    #[serde(default)]
    pub nsamples: u32,
    #[serde(default)]
    pub npresamp: u32,
}

/// TRIGGERRATE: trigger counts per channel index over `duration` ns
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggerRate {
    pub counts_seen: Vec<u64>,
    pub duration: u64,
}

/// GROUPTRIGGER: source channel number to receiver channel numbers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupTriggerState {
    #[serde(default)]
    pub connections: BTreeMap<u32, Vec<u32>>,
}

impl GroupTriggerState {
    pub fn single(source: u32, receivers: Vec<u32>) -> Self {
        Self {
            connections: BTreeMap::from([(source, receivers)]),
        }
    }

    pub fn sources(&self) -> BTreeSet<u32> {
        self.connections.keys().copied().collect()
    }

    pub fn receivers(&self) -> BTreeSet<u32> {
        self.connections.values().flatten().copied().collect()
    }
}

/// TRIGCOUPLING: which way (if any) feedback and error channels trigger each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerCoupling {
    #[default]
    None,
    FeedbackToError,
    ErrorToFeedback,
}

impl TriggerCoupling {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::None),
            2 => Some(Self::FeedbackToError),
            3 => Some(Self::ErrorToFeedback),
            _ => None,
        }
    }
}

/// Argument of ConfigurePulseLengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PulseLengths {
    pub nsamp: u32,
    pub npre: u32,
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_trigger_keys_are_numbers() {
        let msg: GroupTriggerState =
            serde_json::from_str(r#"{"Connections": {"4": [1, 2], "1": [2, 7]}}"#).unwrap();
        assert_eq!(msg.sources().into_iter().collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(
            msg.receivers().into_iter().collect::<Vec<_>>(),
            vec![1, 2, 7]
        );
        let out = serde_json::to_value(GroupTriggerState::single(3, vec![5])).unwrap();
        assert_eq!(out, serde_json::json!({"Connections": {"3": [5]}}));
    }

    #[test]
    fn test_status_ignores_extra_fields() {
        let status: ServerStatus = serde_json::from_str(
            r#"{"Running": true, "SourceName": "SimPulses", "Nchannels": 4,
                "Nsamples": 1024, "Npresamp": 256, "ChanGroups": []}"#,
        )
        .unwrap();
        assert!(status.running);
        assert_eq!(status.nsamples, 1024);
    }
}
