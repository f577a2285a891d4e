use std::path::PathBuf;
use thiserror::Error;

use super::constants::RECORD_HEADER_SIZE;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC client failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("RPC client is closed; {0}(...) was not sent")]
    Closed(String),
    #[error("RPC call {0} timed out waiting for a response")]
    Timeout(String),
    #[error("RPC call {method} received a malformed response: {source}")]
    MalformedResponse {
        method: String,
        source: serde_json::Error,
    },
    #[error("RPC server closed the connection during {0}")]
    ConnectionClosed(String),
    #[error("RPC expected response id={expected}, received id={received:?}")]
    IdMismatch {
        expected: u64,
        received: Option<u64>,
    },
    #[error("RPC failed to encode request for {method}: {source}")]
    Encode {
        method: String,
        source: serde_json::Error,
    },
    #[error("Server rejected {method} with argument {params}: {message}")]
    Server {
        method: String,
        params: serde_json::Value,
        message: String,
    },
}

impl RpcError {
    /// Transport errors leave the connection in an unknown state; server errors do not.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Server { .. })
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Feed received a message with {0} parts; expected 2")]
    BadFrame(usize),
    #[error("Feed socket failed: {0}")]
    Socket(#[from] zmq::Error),
    #[error("Feed cannot be started from state {0:?}")]
    InvalidState(super::status_feed::FeedState),
    #[error("Feed thread panicked")]
    ThreadPanic,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record header has {0} bytes; expected {size}", size=RECORD_HEADER_SIZE)]
    BadHeaderSize(usize),
    #[error("Record header has unknown data type code {0}")]
    UnknownDataType(u8),
    #[error("Record data of {len} bytes is not a multiple of the {width}-byte sample width")]
    RaggedData { len: usize, width: usize },
    #[error("Failed to parse record: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BlockListError {
    #[error("Block list failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Block list failed to write JSON: {0}")]
    ParsingError(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Controller failed due to RPC error: {0}")]
    RpcError(#[from] RpcError),
    #[error("Controller failed due to block list error: {0}")]
    BlockListError(#[from] BlockListError),
    #[error("Controller failed to encode an RPC argument: {0}")]
    EncodeError(#[from] serde_json::Error),
    #[error("Controller event stream disconnected")]
    Disconnected,
}
