//! The client-side cache of the server's per-channel trigger configuration.
//!
//! The server reports its trigger configuration as a list of [TriggerState]s, each
//! owning a set of channel indices. Commonly hundreds of channels share a handful of
//! states, and the server accepts one `ConfigureTriggers` call per state. The
//! [TriggerStateStore] keeps that sharing: editing a subset of channels splits any
//! shared record along the subset boundary, so the edit costs one RPC per distinct
//! record rather than one per channel.
use bit_set::BitSet;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The recognized trigger settings. Every field is optional: a state received from the
/// server usually has all of them, a partial update only the ones being changed.
///
/// Fields the server sends that are not listed here are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_trigger: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_trigger: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_rising: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_falling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_trigger: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_rising: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_falling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_multi: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_multi_noise: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_multi_make_short_records: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_multi_make_contaminated_records: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_multi_disable_zero_threshold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_multi_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_multi_verify_n_monotone: Option<i64>,
}

/// Names of the individual trigger settings, for per-setting queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    AutoTrigger,
    AutoDelay,
    EdgeTrigger,
    EdgeRising,
    EdgeFalling,
    EdgeLevel,
    LevelTrigger,
    LevelRising,
    LevelFalling,
    LevelLevel,
    EdgeMulti,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
}

/// Result of asking whether a group of channels agrees on one setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uniformity {
    Uniform(SettingValue),
    /// Channels disagree, or some are not yet known
    Indeterminate,
}

impl TriggerSettings {
    /// All triggers off; nothing else touched
    pub fn all_off() -> Self {
        Self {
            auto_trigger: Some(false),
            edge_trigger: Some(false),
            level_trigger: Some(false),
            edge_multi: Some(false),
            ..Default::default()
        }
    }

    pub fn get(&self, setting: Setting) -> Option<SettingValue> {
        use SettingValue::{Bool, Int};
        match setting {
            Setting::AutoTrigger => self.auto_trigger.map(Bool),
            Setting::AutoDelay => self.auto_delay.map(Int),
            Setting::EdgeTrigger => self.edge_trigger.map(Bool),
            Setting::EdgeRising => self.edge_rising.map(Bool),
            Setting::EdgeFalling => self.edge_falling.map(Bool),
            Setting::EdgeLevel => self.edge_level.map(Int),
            Setting::LevelTrigger => self.level_trigger.map(Bool),
            Setting::LevelRising => self.level_rising.map(Bool),
            Setting::LevelFalling => self.level_falling.map(Bool),
            Setting::LevelLevel => self.level_level.map(Int),
            Setting::EdgeMulti => self.edge_multi.map(Bool),
        }
    }

    /// Write every field that is set in `update` into self
    pub fn merge(&mut self, update: &TriggerSettings) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if update.$field.is_some() { self.$field = update.$field; })*
            };
        }
        take!(
            auto_trigger,
            auto_delay,
            edge_trigger,
            edge_rising,
            edge_falling,
            edge_level,
            level_trigger,
            level_rising,
            level_falling,
            level_level,
            edge_multi,
            edge_multi_noise,
            edge_multi_make_short_records,
            edge_multi_make_contaminated_records,
            edge_multi_disable_zero_threshold,
            edge_multi_level,
            edge_multi_verify_n_monotone
        );
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The wire form of a trigger record: the settings plus the channels they apply to.
///
/// This is both what the server publishes on the TRIGGER topic and the argument of
/// `ConfigureTriggers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    #[serde(rename = "ChannelIndices", default)]
    pub channel_indices: Vec<usize>,
    #[serde(flatten)]
    pub settings: TriggerSettings,
}

impl TriggerState {
    pub fn new(channel_indices: Vec<usize>, settings: TriggerSettings) -> Self {
        Self {
            channel_indices,
            settings,
        }
    }
}

/// Opaque handle to one shared record inside a [TriggerStateStore]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

#[derive(Debug, Clone)]
struct TriggerRecord {
    settings: TriggerSettings,
    owners: BTreeSet<usize>,
}

/// Per-channel trigger records with shared ownership.
///
/// Invariant: every known index maps to exactly one record, and each record's owner
/// set is exactly the set of indices mapping to it. Records with no owners are
/// removed.
#[derive(Debug, Default)]
pub struct TriggerStateStore {
    records: FxHashMap<RecordId, TriggerRecord>,
    by_index: BTreeMap<usize, RecordId>,
    next_id: u64,
}

impl TriggerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, e.g. when the channel list changes underneath us
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_index.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Number of distinct records
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn known_indices(&self) -> Vec<usize> {
        self.by_index.keys().copied().collect()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.by_index.contains_key(&index)
    }

    /// The settings currently in force for one channel
    pub fn settings_for(&self, index: usize) -> Option<&TriggerSettings> {
        self.by_index
            .get(&index)
            .and_then(|id| self.records.get(id))
            .map(|r| &r.settings)
    }

    pub fn record_of(&self, index: usize) -> Option<RecordId> {
        self.by_index.get(&index).copied()
    }

    /// Every distinct record, ordered by its lowest owning index
    pub fn states(&self) -> Vec<TriggerState> {
        let mut states: Vec<TriggerState> = self.records.values().map(Self::snapshot).collect();
        states.sort_by_key(|s| s.channel_indices.first().copied());
        states
    }

    /// Replace the records of every index mentioned by `states`.
    ///
    /// EdgeMulti is switched off before storing so it never gets echoed back to the
    /// server. States with no channel indices are ignored.
    pub fn ingest(&mut self, states: Vec<TriggerState>) {
        for state in states {
            if state.channel_indices.is_empty() {
                continue;
            }
            let mut settings = state.settings;
            settings.edge_multi = Some(false);
            let id = self.insert_record(settings);
            for index in state.channel_indices {
                self.assign(index, id);
            }
        }
    }

    /// Distinct records covering `selection`, split so that none of them also covers a
    /// channel outside of `selection`.
    ///
    /// Records come back in the order their first member is met scanning `selection`.
    /// Indices the store does not know are skipped.
    pub fn records_covering_selection(&mut self, selection: &[usize]) -> Vec<TriggerState> {
        self.split_for_selection(selection)
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(Self::snapshot)
            .collect()
    }

    /// Apply a partial update to exactly the channels of `selection`.
    ///
    /// Returns the affected records after the update; pushing each of them to the
    /// server once brings it in line with the store.
    pub fn apply_partial(
        &mut self,
        selection: &[usize],
        update: &TriggerSettings,
    ) -> Vec<TriggerState> {
        let ids = self.split_for_selection(selection);
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.records.get_mut(&id) {
                record.settings.merge(update);
                result.push(Self::snapshot(record));
            }
        }
        result
    }

    /// The value of `setting` shared by every channel of `selection`, if there is one
    pub fn value_if_uniform(&self, selection: &[usize], setting: Setting) -> Uniformity {
        let mut common: Option<SettingValue> = None;
        for index in selection {
            let value = match self.settings_for(*index).and_then(|s| s.get(setting)) {
                Some(v) => v,
                None => return Uniformity::Indeterminate,
            };
            match common {
                None => common = Some(value),
                Some(c) if c != value => return Uniformity::Indeterminate,
                Some(_) => (),
            }
        }
        match common {
            Some(value) => Uniformity::Uniform(value),
            None => Uniformity::Indeterminate,
        }
    }

    /// Give `index` its own record with every trigger off, leaving its former group
    /// untouched. Returns the new record, or None if the index is unknown.
    pub fn force_channel_off(&mut self, index: usize) -> Option<TriggerState> {
        let current = *self.by_index.get(&index)?;
        let record = self.records.get_mut(&current)?;
        if record.owners.len() == 1 {
            record.settings.merge(&TriggerSettings::all_off());
            return Some(Self::snapshot(record));
        }
        let mut settings = record.settings.clone();
        settings.merge(&TriggerSettings::all_off());
        let id = self.insert_record(settings);
        self.assign(index, id);
        self.records.get(&id).map(Self::snapshot)
    }

    /// Check the reverse-mapping invariant
    pub fn is_consistent(&self) -> bool {
        for (id, record) in self.records.iter() {
            if record.owners.is_empty() {
                return false;
            }
            for index in record.owners.iter() {
                if self.by_index.get(index) != Some(id) {
                    return false;
                }
            }
        }
        self.by_index.iter().all(|(index, id)| {
            self.records
                .get(id)
                .map(|r| r.owners.contains(index))
                .unwrap_or(false)
        })
    }

    fn split_for_selection(&mut self, selection: &[usize]) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = Vec::new();
        for index in selection {
            if let Some(id) = self.by_index.get(index) {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
        }
        if ids.is_empty() {
            return ids;
        }

        let chosen: BitSet = selection.iter().copied().collect();
        for id in ids.iter() {
            let (settings, outside) = match self.records.get(id) {
                Some(record) => {
                    let outside: Vec<usize> = record
                        .owners
                        .iter()
                        .copied()
                        .filter(|i| !chosen.contains(*i))
                        .collect();
                    (record.settings.clone(), outside)
                }
                None => continue,
            };
            if outside.is_empty() {
                continue;
            }
            // The first record keeps the in-selection members
            let split_id = self.insert_record(settings);
            for index in outside {
                self.assign(index, split_id);
            }
        }
        ids
    }

    fn insert_record(&mut self, settings: TriggerSettings) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        self.records.insert(
            id,
            TriggerRecord {
                settings,
                owners: BTreeSet::new(),
            },
        );
        id
    }

    /// Point `index` at record `id`, detaching it from its previous record
    fn assign(&mut self, index: usize, id: RecordId) {
        if let Some(previous) = self.by_index.insert(index, id) {
            if previous != id {
                let now_empty = match self.records.get_mut(&previous) {
                    Some(record) => {
                        record.owners.remove(&index);
                        record.owners.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.records.remove(&previous);
                }
            }
        }
        if let Some(record) = self.records.get_mut(&id) {
            record.owners.insert(index);
        }
    }

    fn snapshot(record: &TriggerRecord) -> TriggerState {
        TriggerState {
            channel_indices: record.owners.iter().copied().collect(),
            settings: record.settings.clone(),
        }
    }
}
