use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::block_list::ChannelBlockList;
use super::channel_registry::ChannelRegistry;
use super::constants::*;
use super::error::{ControllerError, RpcError};
use super::messages::{
    GroupTriggerState, PulseLengths, ServerStatus, TriggerCoupling, TriggerRate,
};
use super::rpc_client::RpcCaller;
use super::status_feed::{ConsoleFilter, StatusEvent};
use super::sync_state::{SyncState, SyncTracker};
use super::trigger_state::{TriggerSettings, TriggerState, TriggerStateStore};

/// The canonical trigger combinations an operator switches between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Auto triggers back to back, nothing else
    Noise,
    /// Edge triggers only
    Pulse,
    /// One auto trigger per second
    Continuous1Pps,
}

impl TriggerMode {
    pub fn settings(&self) -> TriggerSettings {
        match self {
            Self::Noise => TriggerSettings {
                auto_trigger: Some(true),
                auto_delay: Some(0),
                edge_trigger: Some(false),
                level_trigger: Some(false),
                ..Default::default()
            },
            Self::Pulse => TriggerSettings {
                auto_trigger: Some(false),
                edge_trigger: Some(true),
                level_trigger: Some(false),
                ..Default::default()
            },
            Self::Continuous1Pps => TriggerSettings {
                auto_trigger: Some(true),
                auto_delay: Some(CONTINUOUS_1PPS_DELAY_NS),
                edge_trigger: Some(false),
                level_trigger: Some(false),
                ..Default::default()
            },
        }
    }

    fn sync_state(&self) -> SyncState {
        match self {
            Self::Noise => SyncState::Noise,
            Self::Pulse => SyncState::Pulse,
            Self::Continuous1Pps => SyncState::Continuous,
        }
    }
}

impl FromStr for TriggerMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "noise" => Ok(Self::Noise),
            "pulse" => Ok(Self::Pulse),
            "auto1pps" | "1pps" => Ok(Self::Continuous1Pps),
            other => Err(format!("Unknown trigger mode {other}")),
        }
    }
}

/// What a batch of ConfigureTriggers calls did.
///
/// Server-side rejections do not stop the batch; they are collected here.
#[derive(Debug, Default)]
pub struct PushReport {
    pub calls: usize,
    pub failures: Vec<RpcError>,
}

impl PushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a multi-step workflow that ran to its end, successfully or not
#[derive(Debug)]
pub enum WorkflowOutcome<R> {
    Completed(R),
    Failed { reason: String },
}

impl<R> WorkflowOutcome<R> {
    pub fn failed(reason: &str) -> Self {
        log::error!("{reason}");
        Self::Failed {
            reason: reason.to_string(),
        }
    }
}

/// ReconciliationController keeps the client's picture of the server's trigger
/// configuration and turns operator intents into ConfigureTriggers calls.
///
/// Status events are fed in through [ReconciliationController::handle_event]; the
/// controller is the only writer of its store and block list, so all of this happens on
/// one thread.
pub struct ReconciliationController<C: RpcCaller> {
    rpc: C,
    store: TriggerStateStore,
    registry: ChannelRegistry,
    block_list: ChannelBlockList,
    selection: Vec<usize>,
    sync: SyncTracker,
    console: ConsoleFilter,
    status: Option<ServerStatus>,
    pulse_lengths: Option<PulseLengths>,
    coupling: TriggerCoupling,
    group_trigger: GroupTriggerState,
    last_rate: Option<TriggerRate>,
}

fn decode<T: DeserializeOwned>(event: &StatusEvent) -> Option<T> {
    match serde_json::from_value(event.payload.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Could not decode {} message: {e}", event.topic);
            None
        }
    }
}

impl<C: RpcCaller> ReconciliationController<C> {
    pub fn new(
        rpc: C,
        block_list: ChannelBlockList,
        console: ConsoleFilter,
        sync_grace: Duration,
    ) -> Self {
        Self {
            rpc,
            store: TriggerStateStore::new(),
            registry: ChannelRegistry::new(),
            block_list,
            selection: Vec::new(),
            sync: SyncTracker::new(sync_grace),
            console,
            status: None,
            pulse_lengths: None,
            coupling: TriggerCoupling::default(),
            group_trigger: GroupTriggerState::default(),
            last_rate: None,
        }
    }

    pub fn rpc(&self) -> &C {
        &self.rpc
    }

    pub fn store(&self) -> &TriggerStateStore {
        &self.store
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn block_list(&self) -> &ChannelBlockList {
        &self.block_list
    }

    pub fn block_list_mut(&mut self) -> &mut ChannelBlockList {
        &mut self.block_list
    }

    pub fn console(&self) -> &ConsoleFilter {
        &self.console
    }

    pub fn selection(&self) -> &[usize] {
        &self.selection
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn server_status(&self) -> Option<&ServerStatus> {
        self.status.as_ref()
    }

    pub fn pulse_lengths(&self) -> Option<PulseLengths> {
        self.pulse_lengths
    }

    pub fn coupling(&self) -> TriggerCoupling {
        self.coupling
    }

    pub fn group_trigger(&self) -> &GroupTriggerState {
        &self.group_trigger
    }

    pub fn last_trigger_rate(&self) -> Option<&TriggerRate> {
        self.last_rate.as_ref()
    }

    /// True once both the channel list and some trigger state have arrived
    pub fn is_synchronized(&self) -> bool {
        !self.registry.is_empty() && !self.store.is_empty()
    }

    /// Update local state from one status feed event
    pub fn handle_event(&mut self, event: &StatusEvent) {
        match event.topic.as_str() {
            TOPIC_CHANNEL_NAMES => {
                if let Some(names) = decode::<Vec<String>>(event) {
                    if self.registry.replace(names) {
                        log::info!("Channel list changed; {} channels", self.registry.len());
                        self.store.clear();
                        self.selection.clear();
                        self.sync.invalidate();
                    }
                }
            }
            TOPIC_TRIGGER => {
                if let Some(states) = decode::<Vec<TriggerState>>(event) {
                    self.store.ingest(states);
                    self.sync.on_trigger_message(Instant::now());
                }
            }
            TOPIC_STATUS => {
                if let Some(status) = decode::<ServerStatus>(event) {
                    let lengths = PulseLengths {
                        nsamp: status.nsamples,
                        npre: status.npresamp,
                    };
                    self.sync.on_status_lengths(lengths);
                    self.pulse_lengths = Some(lengths);
                    self.status = Some(status);
                }
            }
            TOPIC_TRIG_COUPLING => {
                if let Some(code) = decode::<i64>(event) {
                    match TriggerCoupling::from_code(code) {
                        Some(c) => self.coupling = c,
                        None => log::warn!("Unknown trigger coupling code {code}"),
                    }
                }
            }
            TOPIC_GROUP_TRIGGER => {
                if let Some(state) = decode::<GroupTriggerState>(event) {
                    self.group_trigger = state;
                }
            }
            TOPIC_TRIGGER_RATE => {
                if let Some(rate) = decode::<TriggerRate>(event) {
                    self.last_rate = Some(rate);
                }
            }
            _ => (),
        }
    }

    /// Handle every event already waiting in `events`. Returns how many there were.
    pub fn process_pending(&mut self, events: &Receiver<StatusEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_event(&event);
            count += 1;
        }
        count
    }

    /// Ask the server for everything and process events until the channel list and the
    /// trigger state are known. Returns false if `timeout` passes first.
    pub fn synchronize(
        &mut self,
        events: &Receiver<StatusEvent>,
        timeout: Duration,
    ) -> Result<bool, ControllerError> {
        self.request_all_status()?;
        let deadline = Instant::now() + timeout;
        while !self.is_synchronized() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(event) => self.handle_event(&event),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => return Err(ControllerError::Disconnected),
            }
        }
        Ok(true)
    }

    /// Make `indices` the current selection. Duplicates are dropped, order is kept.
    pub fn select(&mut self, indices: Vec<usize>) {
        let mut seen = bit_set::BitSet::new();
        self.selection = indices.into_iter().filter(|i| seen.insert(*i)).collect();
    }

    /// Select the channels named by a channel specification like "chan:1,2,3"
    pub fn select_spec(&mut self, spec: &str) {
        let selection = self.registry.parse_selection(spec);
        self.select(selection);
    }

    /// Select every signal channel that is not blocked
    pub fn select_unblocked_signals(&mut self) {
        let selection = self.registry.unblocked_signal_indices(&self.block_list);
        self.select(selection);
    }

    /// Send each state as one ConfigureTriggers call.
    ///
    /// Server errors are collected and the remaining calls still go out; a transport
    /// error ends the batch.
    pub(crate) fn push_states(
        &mut self,
        states: Vec<TriggerState>,
        report: &mut PushReport,
    ) -> Result<(), ControllerError> {
        for state in states {
            let params = serde_json::to_value(&state)?;
            match self.rpc.call(METHOD_CONFIGURE_TRIGGERS, params) {
                Ok(_) => report.calls += 1,
                Err(e) if !e.is_transport() => {
                    report.calls += 1;
                    report.failures.push(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Apply `update` to exactly `indices` in the store and push the affected records.
    ///
    /// Indices the store does not know yet are sent the bare update in one extra call;
    /// the server leaves absent settings unchanged.
    pub(crate) fn push_update(
        &mut self,
        indices: &[usize],
        update: &TriggerSettings,
        report: &mut PushReport,
    ) -> Result<(), ControllerError> {
        let mut states = self.store.apply_partial(indices, update);
        let mut unknown: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|i| !self.store.contains(*i))
            .collect();
        unknown.sort_unstable();
        unknown.dedup();
        if !unknown.is_empty() {
            states.push(TriggerState::new(unknown, update.clone()));
        }
        self.push_states(states, report)
    }

    /// Turn every trigger off on every channel. Returns false if no channels are known.
    pub fn zero_all_triggers(&mut self, report: &mut PushReport) -> Result<bool, ControllerError> {
        let indices = self.registry.all_indices();
        if indices.is_empty() {
            return Ok(false);
        }
        self.push_update(&indices, &TriggerSettings::all_off(), report)?;
        self.sync.invalidate();
        Ok(true)
    }

    /// Put the selected channels into `mode`, one call per distinct record
    pub fn go_mode(&mut self, mode: TriggerMode) -> Result<PushReport, ControllerError> {
        let mut report = PushReport::default();
        if self.selection.is_empty() {
            log::warn!("No channels selected; {mode:?} mode not sent");
            return Ok(report);
        }
        let selection = self.selection.clone();
        self.push_update(&selection, &mode.settings(), &mut report)?;
        self.sync.mark_sent(mode.sync_state(), Instant::now());
        log::info!(
            "Sent {mode:?} mode to {} channels in {} calls",
            selection.len(),
            report.calls
        );
        Ok(report)
    }

    /// Apply arbitrary settings to the selected channels
    pub fn apply_settings(
        &mut self,
        update: &TriggerSettings,
    ) -> Result<PushReport, ControllerError> {
        let mut report = PushReport::default();
        if update.is_empty() || self.selection.is_empty() {
            return Ok(report);
        }
        let selection = self.selection.clone();
        self.push_update(&selection, update, &mut report)?;
        self.sync.invalidate();
        Ok(report)
    }

    /// Silence one channel without touching the rest of its group. A signal channel is
    /// also added to the block list.
    pub fn block_channel_triggering(
        &mut self,
        index: usize,
    ) -> Result<PushReport, ControllerError> {
        let mut report = PushReport::default();
        let state = match self.store.force_channel_off(index) {
            Some(state) => state,
            None => TriggerState::new(vec![index], TriggerSettings::all_off()),
        };
        self.push_states(vec![state], &mut report)?;
        if let Some(number) = self.registry.number(index) {
            self.block_list.block(&[number])?;
        }
        Ok(report)
    }

    /// Set the record and pretrigger lengths. Nothing is sent if they are unchanged.
    pub fn configure_pulse_lengths(
        &mut self,
        nsamp: u32,
        npre: u32,
    ) -> Result<bool, ControllerError> {
        let lengths = PulseLengths { nsamp, npre };
        if self.pulse_lengths == Some(lengths) {
            return Ok(false);
        }
        self.rpc.call(
            METHOD_CONFIGURE_PULSE_LENGTHS,
            serde_json::to_value(lengths)?,
        )?;
        self.pulse_lengths = Some(lengths);
        self.sync.mark_lengths(lengths);
        Ok(true)
    }

    pub fn add_group_trigger(
        &mut self,
        source: u32,
        receivers: Vec<u32>,
    ) -> Result<(), ControllerError> {
        let params = serde_json::to_value(GroupTriggerState::single(source, receivers))?;
        self.rpc.call(METHOD_ADD_GROUP_TRIGGER, params)?;
        Ok(())
    }

    pub fn remove_group_trigger(
        &mut self,
        source: u32,
        receivers: Vec<u32>,
    ) -> Result<(), ControllerError> {
        let params = serde_json::to_value(GroupTriggerState::single(source, receivers))?;
        self.rpc.call(METHOD_DELETE_GROUP_TRIGGER, params)?;
        Ok(())
    }

    pub fn stop_trigger_coupling(&mut self) -> Result<(), ControllerError> {
        self.rpc.call(METHOD_STOP_TRIGGER_COUPLING, json!(true))?;
        self.group_trigger = GroupTriggerState::default();
        Ok(())
    }

    /// Feedback channels trigger their error channels
    pub fn couple_fb_to_err(&mut self, on: bool) -> Result<(), ControllerError> {
        self.rpc.call(METHOD_COUPLE_FB_TO_ERR, json!(on))?;
        self.coupling = match on {
            true => TriggerCoupling::FeedbackToError,
            false => TriggerCoupling::None,
        };
        Ok(())
    }

    /// Error channels trigger their feedback channels
    pub fn couple_err_to_fb(&mut self, on: bool) -> Result<(), ControllerError> {
        self.rpc.call(METHOD_COUPLE_ERR_TO_FB, json!(on))?;
        self.coupling = match on {
            true => TriggerCoupling::ErrorToFeedback,
            false => TriggerCoupling::None,
        };
        Ok(())
    }

    pub fn set_experiment_state_label(&mut self, label: &str) -> Result<(), ControllerError> {
        self.rpc
            .call(METHOD_SET_EXPERIMENT_STATE_LABEL, json!({ "Label": label }))?;
        Ok(())
    }

    pub fn pause_writing(&mut self) -> Result<(), ControllerError> {
        self.rpc
            .call(METHOD_WRITE_CONTROL, json!({ "Request": "Pause" }))?;
        Ok(())
    }

    /// Resume writing, optionally switching the experiment state label at the same time
    pub fn unpause_writing(&mut self, label: &str) -> Result<(), ControllerError> {
        let request = format!("Unpause {label}");
        self.rpc.call(
            METHOD_WRITE_CONTROL,
            json!({ "Request": request.trim_end() }),
        )?;
        Ok(())
    }

    pub fn request_all_status(&mut self) -> Result<Value, ControllerError> {
        Ok(self.rpc.call(METHOD_SEND_ALL_STATUS, json!("dummy"))?)
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger_state::{Setting, SettingValue, Uniformity};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(String, Value)>,
        reject_indices: Vec<usize>,
    }

    impl RpcCaller for Recorder {
        fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
            self.calls.push((method.to_string(), params.clone()));
            let indices = params["ChannelIndices"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let rejected = indices
                .iter()
                .filter_map(|i| i.as_u64())
                .any(|i| self.reject_indices.contains(&(i as usize)));
            if rejected {
                return Err(RpcError::Server {
                    method: method.to_string(),
                    params,
                    message: "rejected".to_string(),
                });
            }
            Ok(Value::Null)
        }
    }

    fn controller(dir: &tempfile::TempDir) -> ReconciliationController<Recorder> {
        let blocked = ChannelBlockList::new(&dir.path().join("blocked.json"));
        let console = ConsoleFilter::new(&[], 15);
        let mut c = ReconciliationController::new(
            Recorder::default(),
            blocked,
            console,
            Duration::from_millis(1500),
        );
        let names: Vec<String> = (1..=3)
            .flat_map(|n| [format!("err{n}"), format!("chan{n}")])
            .collect();
        c.handle_event(&StatusEvent::new(TOPIC_CHANNEL_NAMES, json!(names)));
        c.handle_event(&StatusEvent::new(
            TOPIC_TRIGGER,
            json!([{"ChannelIndices": [0, 1, 2, 3, 4, 5], "AutoTrigger": false,
                    "EdgeTrigger": true, "EdgeLevel": 100, "EdgeMulti": true}]),
        ));
        c
    }

    #[test]
    fn test_events_update_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(&dir);
        assert!(c.is_synchronized());
        assert_eq!(c.store().record_count(), 1);
        assert_eq!(c.store().settings_for(3).unwrap().edge_multi, Some(false));

        c.handle_event(&StatusEvent::new(TOPIC_TRIG_COUPLING, json!(3)));
        assert_eq!(c.coupling(), TriggerCoupling::ErrorToFeedback);
        c.handle_event(&StatusEvent::new(
            TOPIC_STATUS,
            json!({"Running": true, "Nsamples": 1000, "Npresamp": 250}),
        ));
        assert_eq!(
            c.pulse_lengths(),
            Some(PulseLengths {
                nsamp: 1000,
                npre: 250
            })
        );
        // Garbage payloads are dropped without disturbing anything
        c.handle_event(&StatusEvent::new(TOPIC_TRIGGER, json!("nonsense")));
        assert_eq!(c.store().record_count(), 1);

        // A new channel list invalidates the cache
        c.handle_event(&StatusEvent::new(TOPIC_CHANNEL_NAMES, json!(["chan1"])));
        assert!(c.store().is_empty());
        assert!(!c.is_synchronized());
    }

    #[test]
    fn test_apply_settings_sibling_failure_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(&dir);
        // Split into two records first
        c.select(vec![0, 1]);
        c.apply_settings(&TriggerSettings {
            edge_level: Some(50),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(c.store().record_count(), 2);
        c.rpc.calls.clear();
        c.rpc.reject_indices = vec![1];

        c.select(vec![1, 2, 1]);
        assert_eq!(c.selection(), &[1, 2]);
        let report = c
            .apply_settings(&TriggerSettings {
                edge_rising: Some(true),
                ..Default::default()
            })
            .unwrap();
        // {1} is split off {0,1} and {2} off {2..5}; the {1} call is rejected, {2} still goes
        assert_eq!(report.calls, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(c.rpc.calls[1].1["ChannelIndices"], json!([2]));
        assert_eq!(
            c.store().value_if_uniform(&[1, 2], Setting::EdgeRising),
            Uniformity::Uniform(SettingValue::Bool(true))
        );
        assert!(c.store().is_consistent());
    }

    #[test]
    fn test_server_error_collected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(&dir);
        c.rpc.reject_indices = vec![0];
        c.select_unblocked_signals();
        assert_eq!(c.selection(), &[1, 3, 5]);
        let mut report = PushReport::default();
        assert!(c.zero_all_triggers(&mut report).unwrap());
        assert_eq!(report.calls, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_block_channel_triggering() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(&dir);
        let report = c.block_channel_triggering(3).unwrap();
        assert_eq!(report.calls, 1);
        let (method, params) = &c.rpc.calls[0];
        assert_eq!(method, METHOD_CONFIGURE_TRIGGERS);
        assert_eq!(params["ChannelIndices"], json!([3]));
        assert_eq!(params["EdgeTrigger"], json!(false));
        assert_eq!(params["EdgeLevel"], json!(100));
        assert_eq!(c.block_list().blocked(), vec![2]);
        assert_eq!(c.store().record_count(), 2);
        assert_eq!(c.store().settings_for(2).unwrap().edge_trigger, Some(true));
    }

    #[test]
    fn test_pulse_lengths_sent_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(&dir);
        assert!(c.configure_pulse_lengths(1024, 256).unwrap());
        assert!(!c.configure_pulse_lengths(1024, 256).unwrap());
        assert_eq!(c.rpc.calls.len(), 1);
        assert_eq!(c.rpc.calls[0].1, json!({"Nsamp": 1024, "Npre": 256}));
    }

    #[test]
    fn test_experiment_control_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(&dir);
        c.set_experiment_state_label("calibration").unwrap();
        c.pause_writing().unwrap();
        c.unpause_writing("").unwrap();
        c.unpause_writing("beam").unwrap();
        c.add_group_trigger(1, vec![2, 3]).unwrap();
        c.couple_fb_to_err(true).unwrap();
        let params: Vec<&Value> = c.rpc.calls.iter().map(|(_, p)| p).collect();
        assert_eq!(params[0], &json!({"Label": "calibration"}));
        assert_eq!(params[1], &json!({"Request": "Pause"}));
        assert_eq!(params[2], &json!({"Request": "Unpause"}));
        assert_eq!(params[3], &json!({"Request": "Unpause beam"}));
        assert_eq!(params[4], &json!({"Connections": {"1": [2, 3]}}));
        assert_eq!(c.rpc.calls[5].0, METHOD_COUPLE_FB_TO_ERR);
        assert_eq!(c.coupling(), TriggerCoupling::FeedbackToError);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!("Pulse".parse::<TriggerMode>(), Ok(TriggerMode::Pulse));
        assert_eq!(
            "auto1pps".parse::<TriggerMode>(),
            Ok(TriggerMode::Continuous1Pps)
        );
        assert!("edge".parse::<TriggerMode>().is_err());
    }
}
