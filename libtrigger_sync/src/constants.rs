// Server-side RPC methods. The service prefix is part of the name.
pub const METHOD_CONFIGURE_TRIGGERS: &str = "SourceControl.ConfigureTriggers";
pub const METHOD_SEND_ALL_STATUS: &str = "SourceControl.SendAllStatus";
pub const METHOD_SET_EXPERIMENT_STATE_LABEL: &str = "SourceControl.SetExperimentStateLabel";
pub const METHOD_WRITE_CONTROL: &str = "SourceControl.WriteControl";
pub const METHOD_CONFIGURE_PULSE_LENGTHS: &str = "SourceControl.ConfigurePulseLengths";
pub const METHOD_ADD_GROUP_TRIGGER: &str = "SourceControl.AddGroupTriggerCoupling";
pub const METHOD_DELETE_GROUP_TRIGGER: &str = "SourceControl.DeleteGroupTriggerCoupling";
pub const METHOD_STOP_TRIGGER_COUPLING: &str = "SourceControl.StopTriggerCoupling";
pub const METHOD_COUPLE_FB_TO_ERR: &str = "SourceControl.CoupleFBToErr";
pub const METHOD_COUPLE_ERR_TO_FB: &str = "SourceControl.CoupleErrToFB";

// Status feed topics
pub const TOPIC_ALIVE: &str = "ALIVE";
pub const TOPIC_STATUS: &str = "STATUS";
pub const TOPIC_TRIGGER: &str = "TRIGGER";
pub const TOPIC_TRIGGER_RATE: &str = "TRIGGERRATE";
pub const TOPIC_CHANNEL_NAMES: &str = "CHANNELNAMES";
pub const TOPIC_TRIG_COUPLING: &str = "TRIGCOUPLING";
pub const TOPIC_GROUP_TRIGGER: &str = "GROUPTRIGGER";
pub const TOPIC_NUMBER_WRITTEN: &str = "NUMBERWRITTEN";
pub const TOPIC_EXTERNAL_TRIGGER: &str = "EXTERNALTRIGGER";

/// Name prefix of the primary signal channels
pub const SIGNAL_PREFIX: &str = "chan";
/// Name prefix of the TDM error channels
pub const ERROR_PREFIX: &str = "err";

/// Offset from the RPC port to the status feed port
pub const STATUS_PORT_OFFSET: u16 = 1;
/// Offset from the RPC port to the raw record feed port
pub const RECORD_PORT_OFFSET: u16 = 2;

/// Size of the fixed record header in bytes
pub const RECORD_HEADER_SIZE: usize = 36;

pub const BLOCK_LIST_HISTORY_LENGTH: usize = 10;

/// Auto-trigger delay used by the "1 pulse per second" mode, in ns
pub const CONTINUOUS_1PPS_DELAY_NS: i64 = 1_000_000_000;
