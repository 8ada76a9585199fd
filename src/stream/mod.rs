//! Client-side stream seams.
//!
//! The merge controller drives a multi-destination subscription and an
//! archive client it does not own the implementation of. Both collaborators
//! are traits so transports and archive wiring stay out of this crate;
//! implementations surface their own failures through `anyhow`.

pub mod replay_merge;

pub use replay_merge::{MergeState, ReplayMerge, LIVE_ADD_THRESHOLD, REPLAY_REMOVE_THRESHOLD};

pub const NULL_VALUE: i64 = -1;
pub const NULL_POSITION: i64 = -1;

/// A single source of fragments within a subscription, identified by session.
pub trait Image {
    fn session_id(&self) -> i32;

    /// Consumed position within the stream.
    fn position(&self) -> i64;

    fn is_closed(&self) -> bool;

    /// Number of transports actively delivering to this image. During a
    /// replay merge this reaches 2 once both replay and live are flowing.
    fn active_transport_count(&self) -> i32;

    /// Poll up to `fragment_limit` fragments, handing each payload and its
    /// end position to the handler. Returns fragments handled.
    fn poll(&mut self, handler: &mut dyn FnMut(&[u8], i64), fragment_limit: usize) -> usize;
}

/// A subscription able to take destinations on and off dynamically.
pub trait Subscription {
    type Image: Image;

    fn stream_id(&self) -> i32;

    fn is_connected(&self) -> bool;

    fn add_destination(&mut self, endpoint: &str) -> anyhow::Result<()>;

    fn remove_destination(&mut self, endpoint: &str) -> anyhow::Result<()>;

    /// Handle to the image for `session_id`, if one has arrived. Handles are
    /// cheap to clone and stay valid for the life of the image.
    fn image_by_session_id(&self, session_id: i32) -> Option<Self::Image>;
}

/// Asynchronous archive control surface. Each request returns a correlation
/// id; the response for that id is observed through [`ArchiveClient::poll_response`].
/// Callers keep at most one request outstanding.
pub trait ArchiveClient {
    /// Ask for the recorded position of a recording.
    fn request_recording_position(&mut self, recording_id: i64) -> anyhow::Result<i64>;

    /// Start a bounded replay. The response value is the replay session id.
    fn request_bounded_replay(
        &mut self,
        recording_id: i64,
        start_position: i64,
        limit_position: i64,
        channel: &str,
        stream_id: i32,
    ) -> anyhow::Result<i64>;

    /// Stop a running replay session.
    fn request_stop_replay(&mut self, replay_session_id: i64) -> anyhow::Result<i64>;

    /// Poll for the response to `correlation_id`. `None` until it arrives.
    fn poll_response(&mut self, correlation_id: i64) -> anyhow::Result<Option<i64>>;
}
