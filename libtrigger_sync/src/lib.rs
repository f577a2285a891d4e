//! # trigger_sync
//!
//! trigger_sync keeps a client-side picture of a data acquisition server's per-channel
//! trigger configuration and edits it on behalf of an operator, written in Rust. It
//! listens to the server's status feed, caches the trigger state of every channel, and
//! sends the smallest set of `ConfigureTriggers` calls needed to change the trigger of
//! any subset of channels.
//!
//! ## Installation
//!
//! Currently the only method of install is from source. If you have not used Rust
//! before, see the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! The status feeds use ZeroMQ through the `zmq` crate, which builds against `libzmq`.
//! Typically this will be installed using a package manager (homebrew, apt, etc).
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./trigger_sync_cli` from the
//! top level repository. The binary will be installed to your cargo install location
//! (typically something like `~/.cargo/bin/`).
//!
//! ## Structure
//!
//! - [rpc_client]: blocking JSON-RPC over one TCP connection, behind the
//! [rpc_client::RpcCaller] trait
//! - [status_feed]: the subscriber threads. The status sub-feed decodes JSON and drops
//! repeated payloads per topic; the record sub-feed forwards raw data records untouched
//! - [channel_registry]: channel name, index, and number lookups, and channel
//! specification strings like `chan:1,2,3`
//! - [trigger_state]: the [trigger_state::TriggerStateStore], the per-channel cache with
//! split-on-edit sharing of trigger records
//! - [block_list]: the persisted set of channel numbers that must never trigger
//! - [controller] and [workflow]: the [controller::ReconciliationController] that ties
//! these together, its trigger modes, and the hyperactive channel and level trigger
//! workflows
//!
//! ## Configuration
//!
//! The CLI reads a YAML file (make a template with `trigger_sync_cli new -p config.yml`):
//!
//! ```yml
//! host: localhost
//! base_port: 5500
//! block_list_path: ~/.dastard/blocked_channels.json
//! rpc_timeout_secs: 7.0
//! feed_poll_interval_ms: 100
//! always_deliver_topics: [ALIVE, TRIGGERRATE]
//! quiet_topics: [TRIGGERRATE, NUMBERWRITTEN, ALIVE, EXTERNALTRIGGER]
//! verbose_message_limit: 15
//! hyperactive:
//!   observation_window_secs: 10.0
//!   rate_messages_expected: 5
//!   max_quiet_rate_hz: 1.0
//! level_triggers:
//!   records_per_channel: 40
//!   auto_delay_ns: 50000000
//!   collection_timeout_secs: 60.0
//! sync_grace_period_secs: 1.5
//! startup_timeout_secs: 5.0
//! ```
//!
//! The RPC server listens on `base_port`, the status feed on `base_port + 1`, and the
//! record feed on `base_port + 2`. Missing fields take the defaults shown above.
//!
//! ## Block list format
//!
//! The block list is a JSON file holding the current set and up to ten previous sets:
//!
//! ```json
//! {"blocked": [2, 4, 6], "blocked_history": [[], [2]]}
//! ```
pub mod baseline;
pub mod block_list;
pub mod channel_registry;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod messages;
pub mod record;
pub mod rpc_client;
pub mod status_feed;
pub mod sync_state;
pub mod trigger_state;
pub mod worker_status;
pub mod workflow;
