//! Driver-side core: the shared-memory log, its counters and the IPC
//! publication that coordinates publishers and subscribers over them.

pub mod clock;
pub mod context;
pub mod counters;
pub mod error;
pub mod frame;
pub mod fs;
pub mod layout;
pub mod mmap;
pub mod publication;
pub mod subscribable;
pub mod unblocker;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use context::DriverContext;
pub use counters::{CounterId, CountersManager, Position, SystemCounters};
pub use error::{Error, Result};
pub use layout::{
    MappedRawLog, ReplayInit, LOG_META_DATA_LENGTH, PARTITION_COUNT, TERM_MIN_LENGTH,
};
pub use publication::{
    Conductor, IpcPublication, PublicationParams, PublicationState, SubscriptionLink, IPC_CHANNEL,
};
pub use subscribable::{PositionHook, Subscribable, SubscriberPosition, TetherState};
