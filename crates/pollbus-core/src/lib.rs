//! Pollbus Core Library
//!
//! In-process notification bus: a sequence-numbered notification log, a
//! registry of waiting consumers, long-poll and streaming delivery.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;

pub use config::{BusConfig, RetentionConfig, SessionConfig};
pub use dispatcher::{BusStats, Dispatcher, PollOptions};
pub use error::{BusError, BusResult};
pub use model::{parse_channels, Channel, ChannelSet, Notification};
pub use presence::{PresenceHook, TracingPresence};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::CloseReason;
pub use session::{SessionState, StreamSession};
pub use store::NotificationStore;
