/// Exponential backoff with jitter for requeue and RDY backoff.
pub mod backoff;
/// Consumers, producers, lookupd discovery and the client registry.
pub mod client;
/// Client settings loaded through the `config` crate.
pub mod config;
/// `tracing` subscriber setup.
pub mod logging;
/// NSQ V2 codec and the nsqd connection state machine.
pub mod network;
/// Cancellable named timers on top of tokio.
pub mod timer;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Client API: subscribe, publish, handlers.
pub use client::{
    Access, Consumer, ConsumerStats, FnHandler, HttpLookupdClient, Lookup, LookupData,
    LookupStats, LookupdClient, MsgHandler, NsqClient, NsqdNode, Producer,
};
/// Settings.
pub use config::{BackoffConfig, IdentifyConfig, NsqConfig};
/// Logging setup.
pub use logging::{init_logging, LogFormat, LoggingConfig};
/// Protocol types.
pub use network::{
    Command, ConnId, Connection, ConnectionSnapshot, ConnectionState, Frame, FrameType, Message,
    MessageId, MessageParams, RequeueDelay,
};
/// Errors.
pub use nsqlink_error::{NsqError, NsqResult, StackError, StatusCode};
