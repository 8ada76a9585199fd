//! Shared-memory log-buffer messaging core.
//!
//! Two halves, split the way the processes are:
//!
//! - [`core`]: the driver side. An [`core::IpcPublication`] owns a mapped
//!   append-only log of rotating term partitions, coordinates external
//!   publishers and subscribers through shared position counters, performs
//!   windowed flow control and recovers logs blocked by stalled publishers.
//! - [`stream`]: the client side. A [`stream::ReplayMerge`] joins an archived
//!   replay of a stream with its live feed through one multi-destination
//!   subscription, so a consumer observes the full history without gap or
//!   duplication.

pub mod core;
pub mod stream;

pub use crate::core::*;
