//! Replay a recorded stream and merge it with the live stream.
//!
//! The controller owns a multi-destination subscription and walks it through
//! a replay of `[start_position, ..)` sourced from an archive, then joins the
//! live destination once the replay has nearly caught up, and finally stops
//! the replay when both are flowing. A consumer polling through
//! [`ReplayMerge::poll`] observes the full history without gap or
//! duplication.
//!
//! Drive [`ReplayMerge::poll`] (or [`ReplayMerge::do_work`] interleaved with
//! polling the image) in a duty-cycle loop until [`ReplayMerge::is_merged`]
//! returns true; after that the image and its subscription can be used
//! directly and the controller can go out of scope.

use crate::core::layout::TERM_MIN_LENGTH;
use crate::stream::{ArchiveClient, Image, Subscription, NULL_POSITION, NULL_VALUE};

/// Position delta at which the live destination is added alongside the
/// replay.
pub const LIVE_ADD_THRESHOLD: i64 = (TERM_MIN_LENGTH / 4) as i64;

/// Position delta at which the replay is stopped once live has joined.
pub const REPLAY_REMOVE_THRESHOLD: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    GetRecordingPosition,
    Replay,
    Catchup,
    AttemptLiveJoin,
    StopReplay,
    Merged,
    Closed,
}

pub struct ReplayMerge<S: Subscription, A: ArchiveClient> {
    subscription: S,
    archive: A,
    replay_channel: String,
    replay_destination: String,
    live_destination: String,
    recording_id: i64,
    start_position: i64,

    state: MergeState,
    image: Option<S::Image>,
    active_correlation_id: i64,
    next_target_position: i64,
    replay_session_id: i64,
    is_live_added: bool,
    is_replay_active: bool,
}

impl<S: Subscription, A: ArchiveClient> ReplayMerge<S, A> {
    /// Create a merge over `subscription`, adding the replay destination.
    /// `subscription` must support dynamic destinations.
    pub fn new(
        mut subscription: S,
        archive: A,
        replay_channel: &str,
        replay_destination: &str,
        live_destination: &str,
        recording_id: i64,
        start_position: i64,
    ) -> anyhow::Result<Self> {
        subscription.add_destination(replay_destination)?;

        Ok(Self {
            subscription,
            archive,
            replay_channel: replay_channel.to_owned(),
            replay_destination: replay_destination.to_owned(),
            live_destination: live_destination.to_owned(),
            recording_id,
            start_position,
            state: MergeState::GetRecordingPosition,
            image: None,
            active_correlation_id: NULL_VALUE,
            next_target_position: NULL_POSITION,
            replay_session_id: NULL_VALUE,
            is_live_added: false,
            is_replay_active: false,
        })
    }

    /// Process the merge. Returns an indication of work done.
    pub fn do_work(&mut self) -> usize {
        match self.state {
            MergeState::GetRecordingPosition => self.get_recording_position(),
            MergeState::Replay => self.replay(),
            MergeState::Catchup => self.catchup(),
            MergeState::AttemptLiveJoin => self.attempt_live_join(),
            MergeState::StopReplay => self.stop_replay(),
            MergeState::Merged | MergeState::Closed => 0,
        }
    }

    /// Poll the image behind the merge for up to `fragment_limit` fragments.
    /// The merge is processed first; fragments are never consumed ahead of a
    /// pending state change.
    pub fn poll(
        &mut self,
        handler: &mut dyn FnMut(&[u8], i64),
        fragment_limit: usize,
    ) -> usize {
        self.do_work();
        match &mut self.image {
            Some(image) => image.poll(handler, fragment_limit),
            None => 0,
        }
    }

    /// Is the live stream merged and the replay stopped?
    pub fn is_merged(&self) -> bool {
        self.state == MergeState::Merged
    }

    /// Is the live destination added to the subscription?
    pub fn is_live_added(&self) -> bool {
        self.is_live_added
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    /// The image used for the replay and live stream. `None` until the
    /// replay image has arrived.
    pub fn image(&self) -> Option<&S::Image> {
        self.image.as_ref()
    }

    pub fn subscription(&self) -> &S {
        &self.subscription
    }

    fn get_recording_position(&mut self) -> usize {
        let mut work_count = 0;

        if self.active_correlation_id == NULL_VALUE {
            match self.archive.request_recording_position(self.recording_id) {
                Ok(correlation_id) => {
                    self.active_correlation_id = correlation_id;
                    work_count += 1;
                }
                Err(err) => log::warn!("recording position request failed: {err}"),
            }
        } else if let Some(position) = self.poll_archive_response() {
            self.next_target_position = position;
            self.active_correlation_id = NULL_VALUE;
            if position != NULL_POSITION {
                self.set_state(MergeState::Replay);
            }
            work_count += 1;
        }

        work_count
    }

    fn replay(&mut self) -> usize {
        let mut work_count = 0;

        if self.active_correlation_id == NULL_VALUE {
            let request = self.archive.request_bounded_replay(
                self.recording_id,
                self.start_position,
                self.next_target_position,
                &self.replay_channel,
                self.subscription.stream_id(),
            );
            match request {
                Ok(correlation_id) => {
                    self.active_correlation_id = correlation_id;
                    work_count += 1;
                }
                Err(err) => log::warn!("replay request failed: {err}"),
            }
        } else if let Some(session_id) = self.poll_archive_response() {
            self.replay_session_id = session_id;
            self.is_replay_active = true;
            self.active_correlation_id = NULL_VALUE;
            self.set_state(MergeState::Catchup);
            work_count += 1;
        }

        work_count
    }

    fn catchup(&mut self) -> usize {
        let mut work_count = 0;

        if self.image.is_none() && self.subscription.is_connected() {
            self.image = self
                .subscription
                .image_by_session_id(self.replay_session_id as i32);
        }

        if let Some(image) = &self.image {
            if image.is_closed() {
                return self.on_replay_lost();
            }
            self.set_state(MergeState::AttemptLiveJoin);
            work_count += 1;
        }

        work_count
    }

    fn attempt_live_join(&mut self) -> usize {
        let mut work_count = 0;

        if self.active_correlation_id == NULL_VALUE {
            match self.archive.request_recording_position(self.recording_id) {
                Ok(correlation_id) => {
                    self.active_correlation_id = correlation_id;
                    work_count += 1;
                }
                Err(err) => log::warn!("recording position refresh failed: {err}"),
            }
        } else if let Some(position) = self.poll_archive_response() {
            self.next_target_position = position;
            self.active_correlation_id = NULL_VALUE;

            if position != NULL_POSITION {
                let image_state = self.image.as_ref().map(|image| {
                    (
                        image.is_closed(),
                        image.position(),
                        image.active_transport_count(),
                    )
                });

                let mut next_state = MergeState::Catchup;
                if let Some((is_closed, image_position, transport_count)) = image_state {
                    if is_closed {
                        return self.on_replay_lost();
                    }
                    if self.should_add_live_destination(image_position) {
                        match self.subscription.add_destination(&self.live_destination) {
                            Ok(()) => self.is_live_added = true,
                            Err(err) => log::warn!("adding live destination failed: {err}"),
                        }
                    } else if self.should_stop_and_remove_replay(image_position, transport_count)
                    {
                        next_state = MergeState::StopReplay;
                    }
                }

                self.set_state(next_state);
                work_count += 1;
            }
        }

        work_count
    }

    fn stop_replay(&mut self) -> usize {
        let mut work_count = 0;

        if self.active_correlation_id == NULL_VALUE {
            match self.archive.request_stop_replay(self.replay_session_id) {
                Ok(correlation_id) => {
                    self.active_correlation_id = correlation_id;
                    work_count += 1;
                }
                Err(err) => log::warn!("stop replay request failed: {err}"),
            }
        } else if self.poll_archive_response().is_some() {
            self.is_replay_active = false;
            self.active_correlation_id = NULL_VALUE;
            if let Err(err) = self
                .subscription
                .remove_destination(&self.replay_destination)
            {
                log::warn!("removing replay destination failed: {err}");
            }
            self.set_state(MergeState::Merged);
            work_count += 1;
        }

        work_count
    }

    fn on_replay_lost(&mut self) -> usize {
        log::warn!(
            "replay session {} lost before merge, restarting",
            self.replay_session_id
        );
        self.image = None;
        self.is_replay_active = false;
        self.replay_session_id = NULL_VALUE;
        self.active_correlation_id = NULL_VALUE;
        self.set_state(MergeState::GetRecordingPosition);
        1
    }

    fn poll_archive_response(&mut self) -> Option<i64> {
        match self.archive.poll_response(self.active_correlation_id) {
            Ok(response) => response,
            Err(err) => {
                log::warn!("archive response poll failed: {err}");
                None
            }
        }
    }

    fn should_add_live_destination(&self, position: i64) -> bool {
        !self.is_live_added && (self.next_target_position - position) <= LIVE_ADD_THRESHOLD
    }

    fn should_stop_and_remove_replay(&self, position: i64, active_transport_count: i32) -> bool {
        self.is_live_added
            && (self.next_target_position - position) <= REPLAY_REMOVE_THRESHOLD
            && active_transport_count >= 2
    }

    fn set_state(&mut self, state: MergeState) {
        log::debug!("replay merge {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

impl<S: Subscription, A: ArchiveClient> Drop for ReplayMerge<S, A> {
    fn drop(&mut self) {
        if self.state != MergeState::Closed {
            if self.is_replay_active && self.replay_session_id != NULL_VALUE {
                let _ = self.archive.request_stop_replay(self.replay_session_id);
            }
            if self.state != MergeState::Merged {
                let _ = self
                    .subscription
                    .remove_destination(&self.replay_destination);
            }
            self.state = MergeState::Closed;
        }
    }
}
