//! The two multi-step trigger workflows.
//!
//! Both zero every trigger, arm a temporary trigger on the unblocked signal channels,
//! gather data from a feed for a bounded time, and then push the final configuration.
//! A wait can be cut short by a message on the `cancel` channel; the workflow then
//! finalizes with whatever it has. A disconnected `cancel` channel just means nobody
//! can cancel any more. Once finalization starts it always runs to the end.
use crossbeam_channel::{never, select, Receiver};
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use super::baseline::BaselineFinder;
use super::config::Config;
use super::constants::{TOPIC_TRIGGER, TOPIC_TRIGGER_RATE};
use super::controller::{PushReport, ReconciliationController, WorkflowOutcome};
use super::error::ControllerError;
use super::messages::TriggerRate;
use super::record::{DataRecord, RawRecord};
use super::rpc_client::RpcCaller;
use super::status_feed::StatusEvent;
use super::trigger_state::TriggerSettings;
use super::worker_status::{WorkflowStatus, WorkflowStep};

#[derive(Debug, Clone, PartialEq)]
pub struct HyperactiveParams {
    pub threshold: i64,
    pub positive: bool,
    pub observation_window: Duration,
    pub messages_expected: usize,
    /// Channels triggering at or above this rate are hyperactive
    pub max_quiet_rate_hz: f64,
}

impl HyperactiveParams {
    pub fn from_config(config: &Config, threshold: i64, positive: bool) -> Self {
        Self {
            threshold,
            positive,
            observation_window: config.observation_window(),
            messages_expected: config.hyperactive.rate_messages_expected,
            max_quiet_rate_hz: config.hyperactive.max_quiet_rate_hz,
        }
    }
}

#[derive(Debug, Default)]
pub struct HyperactiveReport {
    pub rate_messages: usize,
    pub duration_secs: f64,
    pub total_counts: u64,
    /// Indices turned off
    pub disabled: Vec<usize>,
    /// Channel numbers added to the block list
    pub blocked_numbers: Vec<u32>,
    /// Indices left with edge triggers on
    pub enabled: Vec<usize>,
    pub cancelled: bool,
    pub pushes: PushReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelTriggerParams {
    pub threshold: i64,
    pub positive: bool,
    pub records_per_channel: usize,
    pub auto_delay_ns: i64,
    pub timeout: Duration,
}

impl LevelTriggerParams {
    pub fn from_config(config: &Config, threshold: i64, positive: bool) -> Self {
        Self {
            threshold,
            positive,
            records_per_channel: config.level_triggers.records_per_channel,
            auto_delay_ns: config.level_triggers.auto_delay_ns,
            timeout: config.collection_timeout(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LevelTriggerReport {
    /// Level sent to each channel index
    pub levels: BTreeMap<usize, i64>,
    /// Channels that saw no records at all and were left off
    pub missing: Vec<usize>,
    /// Channels that saw fewer records than asked for
    pub incomplete: Vec<usize>,
    pub cancelled: bool,
    pub pushes: PushReport,
}

fn report_progress(
    progress: Option<&Sender<WorkflowStatus>>,
    fraction: f32,
    step: WorkflowStep,
    message: String,
) {
    log::info!("{step}: {message}");
    if let Some(tx) = progress {
        // Nobody watching is not an error
        let _ = tx.send(WorkflowStatus::new(fraction.clamp(0.0, 1.0), step, message));
    }
}

fn edge_settings(threshold: i64, positive: bool) -> TriggerSettings {
    TriggerSettings {
        auto_trigger: Some(false),
        edge_trigger: Some(true),
        edge_rising: Some(positive),
        edge_falling: Some(!positive),
        edge_level: Some(threshold),
        level_trigger: Some(false),
        ..Default::default()
    }
}

/// Level for a channel: baseline plus or minus the threshold, rounded half up
fn level_from_baseline(baseline: f64, threshold: i64, positive: bool) -> i64 {
    let signed = if positive { threshold } else { -threshold };
    (0.5 + baseline + signed as f64).floor() as i64
}

impl<C: RpcCaller> ReconciliationController<C> {
    /// Find and turn off channels that trigger on noise.
    ///
    /// Edge triggers are armed on every unblocked signal channel and the TRIGGERRATE
    /// messages are summed for up to `observation_window` (or `messages_expected`
    /// messages). Channels at or above `max_quiet_rate_hz` are switched off and their
    /// numbers blocked; the rest get the edge trigger again.
    pub fn disable_hyperactive_channels(
        &mut self,
        params: &HyperactiveParams,
        events: &Receiver<StatusEvent>,
        cancel: &Receiver<()>,
        progress: Option<&Sender<WorkflowStatus>>,
    ) -> Result<WorkflowOutcome<HyperactiveReport>, ControllerError> {
        let channels = self.registry().unblocked_signal_indices(self.block_list());
        if channels.is_empty() {
            return Ok(WorkflowOutcome::failed(
                "Could not configure edge triggers; no channels are enabled for triggering",
            ));
        }
        let _quiet = self.console().quiet_while(TOPIC_TRIGGER);
        let mut report = HyperactiveReport::default();
        let direction = if params.positive { "rising" } else { "falling" };

        report_progress(
            progress,
            0.0,
            WorkflowStep::Zeroing,
            String::from("Stopping all triggers"),
        );
        if !self.zero_all_triggers(&mut report.pushes)? {
            return Ok(WorkflowOutcome::failed("No channels known"));
        }

        report_progress(
            progress,
            0.0,
            WorkflowStep::Arming,
            format!(
                "Turning on {direction} edge triggers at threshold {} on {} channels",
                params.threshold,
                channels.len()
            ),
        );
        // Rates already queued were measured before the edge triggers were armed
        self.discard_stale_rates(events);
        let edge = edge_settings(params.threshold, params.positive);
        self.push_update(&channels, &edge, &mut report.pushes)?;

        report_progress(
            progress,
            0.0,
            WorkflowStep::Observing,
            format!(
                "Collecting trigger rate data (takes up to {:.1} seconds)",
                params.observation_window.as_secs_f64()
            ),
        );
        let mut cancel_live = true;
        let mut counts: Vec<u64> = vec![0; self.registry().len()];
        let mut duration_ns: u64 = 0;
        let deadline = Instant::now() + params.observation_window;
        while report.rate_messages < params.messages_expected.max(1) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let cancel_now = if cancel_live { cancel.clone() } else { never() };
            let event = select! {
                recv(events) -> msg => match msg {
                    Ok(event) => event,
                    Err(_) => {
                        log::warn!("Status feed closed while observing trigger rates");
                        break;
                    }
                },
                recv(cancel_now) -> msg => match msg {
                    Ok(()) => {
                        report.cancelled = true;
                        // Rates already queued still count
                        let pending: Vec<StatusEvent> = events.try_iter().collect();
                        for event in pending.iter() {
                            if self.tally_rate(event, &mut counts, &mut duration_ns) {
                                report.rate_messages += 1;
                            }
                        }
                        break;
                    }
                    Err(_) => {
                        cancel_live = false;
                        continue;
                    }
                },
                default(remaining) => break,
            };
            if !self.tally_rate(&event, &mut counts, &mut duration_ns) {
                continue;
            }
            report.rate_messages += 1;
            report_progress(
                progress,
                report.rate_messages as f32 / params.messages_expected.max(1) as f32,
                WorkflowStep::Observing,
                format!("{} trigger rate messages", report.rate_messages),
            );
        }

        if duration_ns == 0 && report.cancelled {
            return Ok(WorkflowOutcome::failed(
                "Observation was cancelled before any trigger rate messages were received",
            ));
        }
        if duration_ns == 0 {
            return Ok(WorkflowOutcome::failed(&format!(
                "No trigger rate messages were received in {:.1} seconds",
                params.observation_window.as_secs_f64()
            )));
        }
        report.duration_secs = duration_ns as f64 / 1e9;
        report.total_counts = counts.iter().sum();
        log::info!(
            "{:.1} seconds of trigger counts accumulated with {} triggers",
            report.duration_secs,
            report.total_counts
        );

        for index in channels {
            let count = counts.get(index).copied().unwrap_or(0);
            if count as f64 / report.duration_secs < params.max_quiet_rate_hz {
                report.enabled.push(index);
            } else {
                report.disabled.push(index);
            }
        }

        report_progress(
            progress,
            1.0,
            WorkflowStep::Finalizing,
            format!(
                "Disabling {} channels; re-asserting edge triggers to all others",
                report.disabled.len()
            ),
        );
        if !report.disabled.is_empty() {
            let disabled = report.disabled.clone();
            self.push_update(&disabled, &TriggerSettings::all_off(), &mut report.pushes)?;
            report.blocked_numbers = disabled
                .iter()
                .filter_map(|i| self.registry().number(*i))
                .collect();
            let numbers = report.blocked_numbers.clone();
            self.block_list_mut().block(&numbers)?;
        }
        if !report.enabled.is_empty() {
            let enabled = report.enabled.clone();
            self.push_update(&enabled, &edge, &mut report.pushes)?;
        }

        report_progress(
            progress,
            1.0,
            WorkflowStep::Done,
            String::from("Hyperactive channels are disabled"),
        );
        Ok(WorkflowOutcome::Completed(report))
    }

    /// Set level triggers relative to each channel's measured baseline.
    ///
    /// Short auto triggers are armed on every unblocked signal channel and
    /// `records_per_channel` records are read per channel from the record feed. Each
    /// channel then gets its own level trigger at baseline ± threshold.
    pub fn configure_level_triggers(
        &mut self,
        params: &LevelTriggerParams,
        events: &Receiver<StatusEvent>,
        records: &Receiver<RawRecord>,
        cancel: &Receiver<()>,
        progress: Option<&Sender<WorkflowStatus>>,
    ) -> Result<WorkflowOutcome<LevelTriggerReport>, ControllerError> {
        if params.records_per_channel == 0 {
            return Ok(WorkflowOutcome::failed(
                "At least one record per channel is needed to find a baseline",
            ));
        }
        let channels = self.registry().unblocked_signal_indices(self.block_list());
        if channels.is_empty() {
            return Ok(WorkflowOutcome::failed(
                "Could not configure level triggers; no channels are enabled for triggering",
            ));
        }
        let _quiet = self.console().quiet_while(TOPIC_TRIGGER);
        let mut report = LevelTriggerReport::default();

        report_progress(
            progress,
            0.0,
            WorkflowStep::Zeroing,
            String::from("Stopping all triggers"),
        );
        if !self.zero_all_triggers(&mut report.pushes)? {
            return Ok(WorkflowOutcome::failed("No channels known"));
        }

        report_progress(
            progress,
            0.0,
            WorkflowStep::Arming,
            format!(
                "Turning on {} ms auto triggers on {} channels",
                params.auto_delay_ns / 1_000_000,
                channels.len()
            ),
        );
        let auto = TriggerSettings {
            auto_trigger: Some(true),
            auto_delay: Some(params.auto_delay_ns),
            edge_trigger: Some(false),
            level_trigger: Some(false),
            ..Default::default()
        };
        // Records already queued came from the previous trigger configuration
        let stale = records.try_iter().count();
        if stale > 0 {
            log::debug!("Discarded {stale} records from before auto triggers were armed");
        }
        self.push_update(&channels, &auto, &mut report.pushes)?;

        let mut finders: BTreeMap<usize, BaselineFinder> = channels
            .iter()
            .map(|i| {
                (
                    *i,
                    BaselineFinder::new(params.positive, params.records_per_channel),
                )
            })
            .collect();
        let mut incomplete = channels.len();
        let total = (params.records_per_channel * channels.len()).max(1);
        let mut received = 0;
        report_progress(
            progress,
            0.0,
            WorkflowStep::Collecting,
            String::from("Collecting baseline data"),
        );

        let mut cancel_live = true;
        let deadline = Instant::now() + params.timeout;
        while incomplete > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let cancel_now = if cancel_live { cancel.clone() } else { never() };
            select! {
                recv(records) -> msg => {
                    let raw = match msg {
                        Ok(raw) => raw,
                        Err(_) => {
                            log::warn!("Record feed closed while collecting baselines");
                            break;
                        }
                    };
                    let record = match DataRecord::try_from(&raw) {
                        Ok(r) => r,
                        Err(e) => {
                            log::warn!("Error processing pulse record: {e}");
                            continue;
                        }
                    };
                    let index = record.header.channel_index as usize;
                    let finder = match finders.get_mut(&index) {
                        Some(f) if !f.is_complete() => f,
                        _ => continue,
                    };
                    finder.add_record(&record.samples);
                    received += 1;
                    if finder.is_complete() {
                        incomplete -= 1;
                    }
                    report_progress(
                        progress,
                        received as f32 / total as f32,
                        WorkflowStep::Collecting,
                        format!("{received}/{total} records, {incomplete} channels to go"),
                    );
                },
                recv(events) -> msg => match msg {
                    Ok(event) => self.handle_event(&event),
                    Err(_) => {
                        log::warn!("Status feed closed while collecting baselines");
                        break;
                    }
                },
                recv(cancel_now) -> msg => match msg {
                    Ok(()) => {
                        report.cancelled = true;
                        break;
                    }
                    Err(_) => {
                        cancel_live = false;
                        continue;
                    }
                },
                default(remaining) => {
                    log::warn!(
                        "Timed out with {incomplete} channels short of {} records",
                        params.records_per_channel
                    );
                    break;
                },
            }
        }

        report_progress(
            progress,
            1.0,
            WorkflowStep::Finalizing,
            String::from("Done with baseline data; sending level triggers"),
        );
        self.zero_all_triggers(&mut report.pushes)?;
        for (index, finder) in finders.iter() {
            let baseline = match finder.baseline() {
                Some(b) => b,
                None => {
                    report.missing.push(*index);
                    continue;
                }
            };
            if !finder.is_complete() {
                report.incomplete.push(*index);
            }
            let level = level_from_baseline(baseline, params.threshold, params.positive);
            let update = TriggerSettings {
                auto_trigger: Some(false),
                edge_trigger: Some(false),
                level_trigger: Some(true),
                level_rising: Some(params.positive),
                level_falling: Some(!params.positive),
                level_level: Some(level),
                ..Default::default()
            };
            self.push_update(&[*index], &update, &mut report.pushes)?;
            report.levels.insert(*index, level);
        }

        if report.levels.is_empty() {
            return Ok(WorkflowOutcome::failed(
                "No data records were received; all triggers are left off",
            ));
        }
        if !report.missing.is_empty() {
            log::warn!(
                "{} channels produced no records and were left off",
                report.missing.len()
            );
        }
        report_progress(
            progress,
            1.0,
            WorkflowStep::Done,
            String::from("Level triggers configured"),
        );
        Ok(WorkflowOutcome::Completed(report))
    }

    /// Add a TRIGGERRATE message to the running totals. Other events are dispatched
    /// as usual. Returns whether the event was a usable rate message.
    fn tally_rate(
        &mut self,
        event: &StatusEvent,
        counts: &mut Vec<u64>,
        duration_ns: &mut u64,
    ) -> bool {
        if event.topic != TOPIC_TRIGGER_RATE {
            self.handle_event(event);
            return false;
        }
        let rate: TriggerRate = match serde_json::from_value(event.payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Ignoring malformed trigger rate message: {e}");
                return false;
            }
        };
        if counts.len() < rate.counts_seen.len() {
            counts.resize(rate.counts_seen.len(), 0);
        }
        for (total, seen) in counts.iter_mut().zip(rate.counts_seen.iter()) {
            *total += seen;
        }
        *duration_ns += rate.duration;
        self.handle_event(event);
        true
    }

    fn discard_stale_rates(&mut self, events: &Receiver<StatusEvent>) {
        while let Ok(event) = events.try_recv() {
            if event.topic != TOPIC_TRIGGER_RATE {
                self.handle_event(&event);
            }
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_rounding() {
        assert_eq!(level_from_baseline(1000.0, 20, true), 1020);
        assert_eq!(level_from_baseline(1000.5, 20, false), 981);
        assert_eq!(level_from_baseline(99.4, 0, true), 99);
    }

    #[test]
    fn test_edge_settings_polarity() {
        let s = edge_settings(-50, false);
        assert_eq!(s.edge_rising, Some(false));
        assert_eq!(s.edge_falling, Some(true));
        assert_eq!(s.edge_level, Some(-50));
        assert_eq!(s.auto_trigger, Some(false));
    }
}
