use crossbeam_channel::{Receiver, Sender};
use fxhash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use super::error::FeedError;
use super::record::RawRecord;

/// One decoded message of the status feed
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub topic: String,
    pub payload: Value,
}

impl StatusEvent {
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
        }
    }
}

/// Where a feed gets its multipart messages from.
///
/// `next_message` waits at most `timeout` and returns None if nothing arrived, so the
/// feed loop can notice a stop request.
pub trait FrameSource: Send {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, FeedError>;
}

/// A ZeroMQ SUB socket subscribed to every topic
pub struct ZmqSubscriber {
    _context: zmq::Context,
    socket: zmq::Socket,
}

impl ZmqSubscriber {
    pub fn connect(host: &str, port: u16) -> Result<Self, FeedError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::SUB)?;
        let endpoint = format!("tcp://{host}:{port}");
        socket.connect(&endpoint)?;
        socket.set_subscribe(b"")?;
        log::info!("Subscribed to {endpoint}");
        Ok(Self {
            _context: context,
            socket,
        })
    }
}

impl FrameSource for ZmqSubscriber {
    fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, FeedError> {
        let ready = self.socket.poll(zmq::POLLIN, timeout.as_millis() as i64)?;
        if ready == 0 {
            return Ok(None);
        }
        Ok(Some(self.socket.recv_multipart(0)?))
    }
}

/// Consumer side of a feed thread
pub trait FeedSink: Send + 'static {
    fn deliver(&mut self, parts: Vec<Vec<u8>>) -> Result<(), FeedError>;
}

/// Decides which delivered status messages are echoed to the console.
///
/// Quiet topics are only echoed for the first `limit` messages of the session. The
/// quiet set is shared, so a running workflow can silence a topic while the feed runs.
/// This never affects delivery to consumers.
#[derive(Debug, Clone)]
pub struct ConsoleFilter {
    quiet: Arc<Mutex<FxHashSet<String>>>,
    limit: usize,
}

impl ConsoleFilter {
    pub fn new(quiet_topics: &[String], limit: usize) -> Self {
        Self {
            quiet: Arc::new(Mutex::new(quiet_topics.iter().cloned().collect())),
            limit,
        }
    }

    fn topics(&self) -> MutexGuard<'_, FxHashSet<String>> {
        self.quiet.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_quiet(&self, topic: &str) -> bool {
        self.topics().contains(topic)
    }

    pub fn should_echo(&self, topic: &str, messages_seen: usize) -> bool {
        messages_seen < self.limit || !self.is_quiet(topic)
    }

    /// Silence `topic` until the returned guard is dropped. A topic that was already
    /// quiet stays quiet afterwards.
    pub fn quiet_while(&self, topic: &str) -> QuietGuard {
        let added = self.topics().insert(topic.to_string());
        QuietGuard {
            filter: self.clone(),
            topic: topic.to_string(),
            added,
        }
    }
}

pub struct QuietGuard {
    filter: ConsoleFilter,
    topic: String,
    added: bool,
}

impl Drop for QuietGuard {
    fn drop(&mut self) {
        if self.added {
            self.filter.topics().remove(&self.topic);
        }
    }
}

/// The decoded status sub-feed.
///
/// Every topic outside `always_deliver` is de-duplicated: a payload byte-identical to
/// the last one delivered on that topic is dropped.
#[derive(Debug)]
pub struct StatusFeed {
    consumers: Vec<Sender<StatusEvent>>,
    always_deliver: FxHashSet<String>,
    last_payloads: FxHashMap<String, Vec<u8>>,
    console: ConsoleFilter,
    messages_seen: usize,
}

impl StatusFeed {
    pub fn new(always_deliver: &[String], console: ConsoleFilter) -> Self {
        Self {
            consumers: Vec::new(),
            always_deliver: always_deliver.iter().cloned().collect(),
            last_payloads: FxHashMap::default(),
            console,
            messages_seen: 0,
        }
    }

    /// Register a consumer. Every delivered event is sent to every consumer.
    pub fn subscribe(&mut self) -> Receiver<StatusEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.consumers.push(tx);
        rx
    }

    /// Handle one message. Returns whether it was delivered.
    pub fn handle_message(&mut self, parts: Vec<Vec<u8>>) -> Result<bool, FeedError> {
        let [topic, payload]: [Vec<u8>; 2] = parts
            .try_into()
            .map_err(|p: Vec<Vec<u8>>| FeedError::BadFrame(p.len()))?;
        let topic = match String::from_utf8(topic) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("Dropped status message with a non UTF-8 topic: {e}");
                return Ok(false);
            }
        };

        let repeated = self.last_payloads.get(&topic) == Some(&payload);
        if repeated && !self.always_deliver.contains(&topic) {
            return Ok(false);
        }

        let value: Value = match serde_json::from_slice(&payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!(
                    "Error processing status message [topic,msg]: {topic}, {}: {e}",
                    String::from_utf8_lossy(&payload)
                );
                return Ok(false);
            }
        };

        if self.console.should_echo(&topic, self.messages_seen) {
            log::info!("{topic} {:5}: {value}", self.messages_seen);
        } else {
            log::trace!("{topic} {:5}: {value}", self.messages_seen);
        }
        self.messages_seen += 1;
        self.last_payloads.insert(topic.clone(), payload);

        let event = StatusEvent {
            topic,
            payload: value,
        };
        self.consumers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(true)
    }
}

impl FeedSink for StatusFeed {
    fn deliver(&mut self, parts: Vec<Vec<u8>>) -> Result<(), FeedError> {
        self.handle_message(parts).map(|_| ())
    }
}

/// The raw record sub-feed. No decoding, no de-duplication.
#[derive(Debug, Default)]
pub struct RecordFeed {
    consumers: Vec<Sender<RawRecord>>,
}

impl RecordFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<RawRecord> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.consumers.push(tx);
        rx
    }
}

impl FeedSink for RecordFeed {
    fn deliver(&mut self, parts: Vec<Vec<u8>>) -> Result<(), FeedError> {
        let [header, data]: [Vec<u8>; 2] = parts
            .try_into()
            .map_err(|p: Vec<Vec<u8>>| FeedError::BadFrame(p.len()))?;
        let record = RawRecord { header, data };
        self.consumers.retain(|tx| tx.send(record.clone()).is_ok());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    NotStarted,
    Running,
    Stopped,
}

/// A feed thread: pulls messages from a [FrameSource] and hands them to a [FeedSink]
/// until stopped. A stopped feed cannot be restarted.
pub struct Feed<S: FeedSink> {
    state: FeedState,
    sink: Option<S>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), FeedError>>>,
}

impl<S: FeedSink> Feed<S> {
    pub fn new(sink: S) -> Self {
        Self {
            state: FeedState::NotStarted,
            sink: Some(sink),
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// A running feed whose thread has exited on a fatal error reports `Stopped`
    pub fn state(&self) -> FeedState {
        match (self.state, &self.handle) {
            (FeedState::Running, Some(h)) if h.is_finished() => FeedState::Stopped,
            (state, _) => state,
        }
    }

    /// True once the thread has exited on its own (a fatal feed error) or been stopped
    pub fn is_finished(&self) -> bool {
        self.state() == FeedState::Stopped
    }

    pub fn start<F: FrameSource + 'static>(
        &mut self,
        source: F,
        poll_interval: Duration,
    ) -> Result<(), FeedError> {
        let sink = match (self.state(), self.sink.take()) {
            (FeedState::NotStarted, Some(sink)) => sink,
            (state, _) => return Err(FeedError::InvalidState(state)),
        };
        let stop_flag = self.stop_flag.clone();
        self.handle = Some(std::thread::spawn(move || {
            run_feed(sink, source, poll_interval, stop_flag)
        }));
        self.state = FeedState::Running;
        Ok(())
    }

    /// Stop the feed and wait for its thread. Returns the error that ended the thread,
    /// if any.
    pub fn stop(&mut self) -> Result<(), FeedError> {
        self.state = FeedState::Stopped;
        self.sink = None;
        self.stop_flag.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| FeedError::ThreadPanic)?,
            None => Ok(()),
        }
    }
}

impl<S: FeedSink> Drop for Feed<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Feed stopped with error: {e}");
        }
    }
}

fn run_feed<S: FeedSink, F: FrameSource>(
    mut sink: S,
    mut source: F,
    poll_interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> Result<(), FeedError> {
    while !stop_flag.load(Ordering::Relaxed) {
        let result = match source.next_message(poll_interval) {
            Ok(Some(parts)) => sink.deliver(parts),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::error!("Feed stopping: {e}");
            return Err(e);
        }
    }
    Ok(())
}
