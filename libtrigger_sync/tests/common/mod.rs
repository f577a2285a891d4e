#![allow(dead_code)]
use serde_json::{json, Value};
use std::time::Duration;

use libtrigger_sync::block_list::ChannelBlockList;
use libtrigger_sync::constants::{
    METHOD_CONFIGURE_TRIGGERS, RECORD_HEADER_SIZE, TOPIC_CHANNEL_NAMES, TOPIC_TRIGGER,
};
use libtrigger_sync::controller::ReconciliationController;
use libtrigger_sync::error::RpcError;
use libtrigger_sync::rpc_client::RpcCaller;
use libtrigger_sync::status_feed::{ConsoleFilter, StatusEvent};

pub type Hook = Box<dyn FnMut(&str, &Value)>;

/// Records every call and answers null. A hook can react to calls, e.g. by feeding
/// data into a channel the way the server would.
#[derive(Default)]
pub struct MockServer {
    pub calls: Vec<(String, Value)>,
    hook: Option<Hook>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: Hook) -> Self {
        Self {
            calls: Vec::new(),
            hook: Some(hook),
        }
    }

    /// Arguments of every ConfigureTriggers call, in order
    pub fn configure_calls(&self) -> Vec<&Value> {
        self.calls
            .iter()
            .filter(|(m, _)| m == METHOD_CONFIGURE_TRIGGERS)
            .map(|(_, p)| p)
            .collect()
    }
}

impl RpcCaller for MockServer {
    fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        if let Some(hook) = self.hook.as_mut() {
            hook(method, &params);
        }
        self.calls.push((method.to_string(), params));
        Ok(Value::Null)
    }
}

/// Interleaved error/signal channel names: err1, chan1, err2, chan2, ...
pub fn tdm_names(n: u32) -> Vec<String> {
    (1..=n)
        .flat_map(|i| [format!("err{i}"), format!("chan{i}")])
        .collect()
}

/// A controller that already knows `names` and holds one record covering all of them
pub fn controller(
    server: MockServer,
    dir: &tempfile::TempDir,
    names: Vec<String>,
    settings: Value,
) -> ReconciliationController<MockServer> {
    let blocked = ChannelBlockList::new(&dir.path().join("blocked_channels.json"));
    let console = ConsoleFilter::new(&["ALIVE".to_string()], 15);
    let mut controller =
        ReconciliationController::new(server, blocked, console, Duration::from_millis(1500));
    let indices: Vec<usize> = (0..names.len()).collect();
    controller.handle_event(&StatusEvent::new(TOPIC_CHANNEL_NAMES, json!(names)));
    let mut state = settings;
    state["ChannelIndices"] = json!(indices);
    controller.handle_event(&StatusEvent::new(TOPIC_TRIGGER, json!([state])));
    controller
}

/// Record feed header: index, version, type code, npre, nsamp, scales, timestamps
pub fn header_bytes(channel_index: u16, type_code: u8, n_samples: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(RECORD_HEADER_SIZE);
    header.extend_from_slice(&channel_index.to_le_bytes());
    header.push(0);
    header.push(type_code);
    header.extend_from_slice(&(n_samples / 4).to_le_bytes());
    header.extend_from_slice(&n_samples.to_le_bytes());
    header.extend_from_slice(&1.0f32.to_le_bytes());
    header.extend_from_slice(&1e-6f32.to_le_bytes());
    header.extend_from_slice(&0u64.to_le_bytes());
    header.extend_from_slice(&0u64.to_le_bytes());
    header
}

/// A uint16 record for one channel
pub fn u16_record(channel_index: u16, samples: &[u16]) -> libtrigger_sync::record::RawRecord {
    libtrigger_sync::record::RawRecord {
        header: header_bytes(channel_index, 3, samples.len() as u32),
        data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}
