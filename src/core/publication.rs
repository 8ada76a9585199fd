//! IPC publication: the in-process owner of a mapped log.
//!
//! The publication coordinates one or more external publishers with any
//! number of subscribers through shared counters. Each duty cycle the owning
//! conductor calls [`IpcPublication::update_pub_lmt`] and
//! [`IpcPublication::on_time_event`]; everything else happens in other
//! processes through the mapped log and the counters file.
//!
//! Flow control is windowed: the publication limit trails the slowest
//! non-resting subscriber by `term_window_length`, with `trip_gain` of
//! hysteresis so the limit counter is not rewritten on every cycle.

use std::sync::atomic::Ordering;

use crate::core::context::DriverContext;
use crate::core::counters::{CounterId, CountersManager, Position, SystemCounters};
use crate::core::frame::FRAME_ALIGNMENT;
use crate::core::layout::{self, MappedRawLog, ReplayInit};
use crate::core::subscribable::{
    PositionHook, Subscribable, SubscriberPosition, TetherState,
};
use crate::core::unblocker;
use crate::core::{fs, Error, Result};

pub const IPC_CHANNEL: &str = "logbus:ipc";

pub const DEFAULT_TERM_LENGTH: usize = 4 * 1024 * 1024;
pub const DEFAULT_MTU_LENGTH: usize = 1408;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    Active,
    Inactive,
    Linger,
}

/// Parameters resolved from a publication request.
#[derive(Debug, Clone)]
pub struct PublicationParams {
    pub term_length: usize,
    pub mtu_length: usize,
    pub is_sparse: bool,
    pub replay: Option<ReplayInit>,
}

impl Default for PublicationParams {
    fn default() -> Self {
        Self {
            term_length: DEFAULT_TERM_LENGTH,
            mtu_length: DEFAULT_MTU_LENGTH,
            is_sparse: false,
            replay: None,
        }
    }
}

impl PublicationParams {
    pub fn validate(&self, page_size: usize) -> Result<()> {
        layout::check_term_length(self.term_length)?;
        layout::check_page_size(page_size)?;
        layout::check_mtu_length(self.mtu_length, self.term_length)?;
        Ok(())
    }
}

/// One subscription registered with the conductor, linked to a publication
/// by registration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionLink {
    pub registration_id: i64,
    pub publication_id: i64,
}

impl SubscriptionLink {
    pub fn is_linked_to(&self, publication_registration_id: i64) -> bool {
        self.publication_id == publication_registration_id
    }
}

/// The conductor-side contract a publication requires: image notifications
/// and the subscription link table.
pub trait Conductor {
    #[allow(clippy::too_many_arguments)]
    fn on_available_image(
        &mut self,
        publication_registration_id: i64,
        stream_id: i32,
        session_id: i32,
        log_file_name: &str,
        counter_id: CounterId,
        subscription_registration_id: i64,
        channel: &str,
    );

    fn on_unavailable_image(
        &mut self,
        publication_registration_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
        channel: &str,
    );

    fn subscription_links(&self) -> &[SubscriptionLink];
}

/// Maintains the connected flag as subscribers come and go.
struct ConnectionHook<'a> {
    meta: &'a layout::LogMeta,
}

impl PositionHook for ConnectionHook<'_> {
    fn on_add(&mut self, _position: &Position) {
        self.meta.is_connected.store(1, Ordering::Release);
    }

    fn on_remove(&mut self, _position: &Position) {}
}

pub struct IpcPublication {
    session_id: i32,
    stream_id: i32,
    registration_id: i64,
    log_file_name: String,
    raw_log: MappedRawLog,
    pub_pos: Position,
    pub_lmt: Position,
    subscribable: Subscribable,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    term_window_length: i64,
    trip_gain: i64,
    unblock_timeout_ns: i64,
    untethered_window_limit_timeout_ns: i64,
    untethered_resting_timeout_ns: i64,
    is_exclusive: bool,
    unblocked_publications: Position,

    // Conductor-owned fields, mutated only on the duty cycle.
    state: PublicationState,
    ref_count: i32,
    has_reached_end_of_life: bool,
    consumer_position: i64,
    last_consumer_position: i64,
    clean_position: i64,
    trip_limit: i64,
    time_of_last_consumer_position_change_ns: i64,
    time_of_last_state_change_ns: i64,
}

impl IpcPublication {
    /// Create a publication and its mapped log.
    ///
    /// Fails fast before any resource is retained: parameter validation,
    /// then the free-space probe, then the mapping. The mapper's error is
    /// preserved in [`Error::MapFailed`].
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        context: &DriverContext,
        session_id: i32,
        stream_id: i32,
        registration_id: i64,
        pub_pos: Position,
        pub_lmt: Position,
        initial_term_id: i32,
        params: &PublicationParams,
        is_exclusive: bool,
        system_counters: &SystemCounters,
    ) -> Result<IpcPublication> {
        params.validate(context.file_page_size())?;
        if let Some(replay) = params.replay {
            if replay.term_id < initial_term_id {
                return Err(Error::InvalidParams("replay term id before initial term id"));
            }
            let offset = replay.term_offset;
            if offset < 0 || offset as usize > params.term_length {
                return Err(Error::InvalidParams("replay term offset outside term"));
            }
            if offset as usize % FRAME_ALIGNMENT != 0 {
                return Err(Error::InvalidParams("replay term offset not frame aligned"));
            }
        }

        let log_length = layout::compute_log_length(params.term_length, context.file_page_size());
        let available = context.usable_fs_space(context.dir());
        if available < log_length {
            return Err(Error::NoSpace {
                needed: log_length,
                available,
            });
        }

        let path = fs::publication_log_path(context.dir(), session_id, stream_id, registration_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut raw_log = MappedRawLog::create(
            &path,
            params.is_sparse,
            params.term_length,
            context.file_page_size(),
        )?;

        layout::init_log_meta(
            raw_log.meta_mut(),
            initial_term_id,
            params.term_length,
            params.mtu_length,
            context.file_page_size(),
            registration_id,
            session_id,
            stream_id,
            params.replay,
        );

        let term_window_length = context.producer_window_length(params.term_length);
        let now_ns = context.nano_time();

        let mut publication = IpcPublication {
            session_id,
            stream_id,
            registration_id,
            log_file_name: path.to_string_lossy().into_owned(),
            raw_log,
            pub_pos,
            pub_lmt,
            subscribable: Subscribable::new(),
            initial_term_id,
            position_bits_to_shift: (params.term_length as u64).trailing_zeros(),
            term_window_length,
            trip_gain: term_window_length / 8,
            unblock_timeout_ns: context.publication_unblock_timeout_ns(),
            untethered_window_limit_timeout_ns: context.untethered_window_limit_timeout_ns(),
            untethered_resting_timeout_ns: context.untethered_resting_timeout_ns(),
            is_exclusive,
            unblocked_publications: system_counters.unblocked_publications().clone(),
            state: PublicationState::Active,
            ref_count: 1,
            has_reached_end_of_life: false,
            consumer_position: 0,
            last_consumer_position: 0,
            clean_position: 0,
            trip_limit: 0,
            time_of_last_consumer_position_change_ns: now_ns,
            time_of_last_state_change_ns: now_ns,
        };

        let producer_position = publication.producer_position();
        publication.consumer_position = producer_position;
        publication.last_consumer_position = producer_position;
        publication.clean_position = producer_position;

        log::debug!(
            "created ipc publication session={session_id} stream={stream_id} \
             registration={registration_id} window={term_window_length}"
        );

        Ok(publication)
    }

    /// Free the publication's counters, the subscribers' counters and the
    /// mapped log. The log file is removed best effort.
    pub fn close(mut self, counters_manager: &mut CountersManager) {
        counters_manager.free(self.pub_lmt.id());
        counters_manager.free(self.pub_pos.id());
        for subscriber in self.subscribable.drain() {
            counters_manager.free(subscriber.counter_id());
        }
        drop(self.raw_log);
        let _ = std::fs::remove_file(&self.log_file_name);
        log::debug!("closed ipc publication registration={}", self.registration_id);
    }

    /// Advance the publication limit toward the slowest non-resting
    /// subscriber plus the window. Returns the work done.
    pub fn update_pub_lmt(&mut self) -> usize {
        if self.subscribable.is_empty() {
            return 0;
        }

        let mut work_count = 0;
        let mut min_sub_pos = i64::MAX;
        let mut max_sub_pos = self.consumer_position;

        for subscriber in self.subscribable.iter() {
            if subscriber.state() != TetherState::Resting {
                let position = subscriber.position_volatile();
                min_sub_pos = min_sub_pos.min(position);
                max_sub_pos = max_sub_pos.max(position);
            }
        }

        if min_sub_pos == i64::MAX {
            // Every subscriber is resting: freeze the limit at the prior
            // consumer position until one reactivates.
            self.pub_lmt.set_ordered(max_sub_pos);
            self.trip_limit = max_sub_pos;
        } else {
            let proposed_limit = min_sub_pos + self.term_window_length;
            if proposed_limit > self.trip_limit {
                self.clean_buffer(min_sub_pos);
                self.pub_lmt.set_ordered(proposed_limit);
                self.trip_limit = proposed_limit + self.trip_gain;
                work_count = 1;
            }

            self.consumer_position = max_sub_pos;
        }

        work_count
    }

    /// Zero consumed bytes from the clean position up to `position`, capped
    /// at the end of the containing term. The first word of the range is
    /// released last so a reader never observes a stale frame header ahead
    /// of half-zeroed bytes.
    pub fn clean_buffer(&mut self, position: i64) {
        let clean_position = self.clean_position;
        if position > clean_position {
            let dirty_index =
                layout::index_by_position(clean_position, self.position_bits_to_shift);
            let bytes_to_clean = (position - clean_position) as usize;
            let term_length = self.raw_log.term_length();
            let term_offset = (clean_position & (term_length as i64 - 1)) as usize;
            let bytes_left_in_term = term_length - term_offset;
            let length = bytes_to_clean.min(bytes_left_in_term);

            // SAFETY: the range is inside the dirty term partition; length
            // is at least one frame because positions are frame aligned.
            unsafe {
                let base = self.raw_log.term(dirty_index).add(term_offset);
                std::ptr::write_bytes(base.add(8), 0u8, length - 8);
                (*(base as *const std::sync::atomic::AtomicI64)).store(0, Ordering::Release);
            }

            self.clean_position = clean_position + length as i64;
        }
    }

    /// Run the tether state machine over every subscriber.
    pub fn check_untethered_subscriptions(
        &mut self,
        conductor: &mut dyn Conductor,
        now_ns: i64,
    ) {
        let consumer_position = self.consumer_position;
        let untethered_window_limit =
            (consumer_position - self.term_window_length) + self.trip_gain;
        let window_limit_timeout_ns = self.untethered_window_limit_timeout_ns;
        let resting_timeout_ns = self.untethered_resting_timeout_ns;
        let registration_id = self.registration_id;
        let stream_id = self.stream_id;
        let session_id = self.session_id;

        for subscriber in self.subscribable.iter_mut() {
            if subscriber.is_tether() {
                subscriber.touch(now_ns);
                continue;
            }

            match subscriber.state() {
                TetherState::Active => {
                    if subscriber.position_volatile() >= untethered_window_limit {
                        subscriber.touch(now_ns);
                    } else if now_ns
                        > subscriber.time_of_last_update_ns() + window_limit_timeout_ns
                    {
                        log::debug!(
                            "untethered subscription {} lingering on publication {}",
                            subscriber.subscription_registration_id(),
                            registration_id
                        );
                        conductor.on_unavailable_image(
                            registration_id,
                            subscriber.subscription_registration_id(),
                            stream_id,
                            IPC_CHANNEL,
                        );
                        subscriber.transition(TetherState::Linger, now_ns);
                    }
                }
                TetherState::Linger => {
                    if now_ns > subscriber.time_of_last_update_ns() + window_limit_timeout_ns {
                        subscriber.transition(TetherState::Resting, now_ns);
                    }
                }
                TetherState::Resting => {
                    if now_ns > subscriber.time_of_last_update_ns() + resting_timeout_ns {
                        // Rejoin at the live position, skipping what was missed.
                        subscriber.position().set_ordered(consumer_position);
                        conductor.on_available_image(
                            registration_id,
                            stream_id,
                            session_id,
                            &self.log_file_name,
                            subscriber.counter_id(),
                            subscriber.subscription_registration_id(),
                            IPC_CHANNEL,
                        );
                        subscriber.transition(TetherState::Active, now_ns);
                    }
                }
            }
        }
    }

    /// One duty-cycle tick of the lifecycle state machine.
    pub fn on_time_event(&mut self, conductor: &mut dyn Conductor, now_ns: i64, _now_ms: i64) {
        let producer_position = self.producer_position();
        self.pub_pos.set_ordered(producer_position);

        match self.state {
            PublicationState::Active => {
                self.check_untethered_subscriptions(conductor, now_ns);
                if !self.is_exclusive {
                    self.check_for_blocked_publisher(producer_position, now_ns);
                }
            }
            PublicationState::Inactive => {
                if self.is_drained() {
                    self.state = PublicationState::Linger;
                    self.time_of_last_state_change_ns = now_ns;
                    log::debug!(
                        "ipc publication registration={} drained, lingering",
                        self.registration_id
                    );

                    let linked: Vec<i64> = conductor
                        .subscription_links()
                        .iter()
                        .filter(|link| link.is_linked_to(self.registration_id))
                        .map(|link| link.registration_id)
                        .collect();
                    for subscription_registration_id in linked {
                        conductor.on_unavailable_image(
                            self.registration_id,
                            subscription_registration_id,
                            self.stream_id,
                            IPC_CHANNEL,
                        );
                    }
                } else if unblocker::unblock(&self.raw_log, self.consumer_position) {
                    self.unblocked_publications.increment_ordered(1);
                }
            }
            PublicationState::Linger => {
                self.has_reached_end_of_life = true;
            }
        }
    }

    pub fn incref(&mut self) {
        self.ref_count += 1;
    }

    /// Drop one reference. The publication goes INACTIVE on the last one:
    /// the limit is clamped down to the producer position so no publisher
    /// sees capacity past the end of the stream, then the end-of-stream
    /// position is published.
    pub fn decref(&mut self) {
        self.ref_count -= 1;
        debug_assert!(self.ref_count >= 0);

        if self.ref_count == 0 {
            self.state = PublicationState::Inactive;
            let producer_position = self.producer_position();

            if self.pub_lmt.get() > producer_position {
                self.pub_lmt.set_ordered(producer_position);
            }

            self.raw_log
                .meta()
                .end_of_stream_position
                .store(producer_position, Ordering::Release);

            log::debug!(
                "ipc publication registration={} inactive at position {}",
                self.registration_id,
                producer_position
            );
        }
    }

    fn check_for_blocked_publisher(&mut self, producer_position: i64, now_ns: i64) {
        let consumer_position = self.consumer_position;

        if consumer_position == self.last_consumer_position
            && self.is_possibly_blocked(producer_position, consumer_position)
        {
            if now_ns > self.time_of_last_consumer_position_change_ns + self.unblock_timeout_ns
                && unblocker::unblock(&self.raw_log, consumer_position)
            {
                log::warn!(
                    "unblocked stalled publisher on publication registration={} at {}",
                    self.registration_id,
                    consumer_position
                );
                self.unblocked_publications.increment_ordered(1);
            }
        } else {
            self.time_of_last_consumer_position_change_ns = now_ns;
            self.last_consumer_position = consumer_position;
        }
    }

    fn is_possibly_blocked(&self, producer_position: i64, consumer_position: i64) -> bool {
        let producer_term_count = self.raw_log.meta().active_term_count.load(Ordering::Acquire);
        let expected_term_count = (consumer_position >> self.position_bits_to_shift) as i32;

        if producer_term_count != expected_term_count {
            return true;
        }

        producer_position > consumer_position
    }

    /// Position immediately after the last reservation on the active term.
    pub fn producer_position(&self) -> i64 {
        let meta = self.raw_log.meta();
        let term_count = meta.active_term_count.load(Ordering::Acquire);
        let index = layout::index_by_term_count(term_count);
        let raw_tail = meta.term_tail_counters[index].load(Ordering::Acquire);

        layout::compute_position(
            layout::term_id(raw_tail),
            layout::term_offset(raw_tail, self.raw_log.term_length() as i64),
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    /// Position a newly attached subscriber adopts.
    pub fn joining_position(&self) -> i64 {
        self.producer_position()
    }

    /// All attached subscribers have consumed up to the producer position.
    pub fn is_drained(&self) -> bool {
        let producer_position = self.producer_position();
        self.subscribable
            .iter()
            .all(|subscriber| subscriber.position_volatile() >= producer_position)
    }

    pub fn add_subscriber(&mut self, position: SubscriberPosition) {
        debug_assert!(self.is_accepting_subscribers());
        let mut hook = ConnectionHook {
            meta: self.raw_log.meta(),
        };
        self.subscribable.add(position, &mut hook);
    }

    pub fn remove_subscriber(&mut self, counter_id: CounterId) -> Option<SubscriberPosition> {
        let mut hook = ConnectionHook {
            meta: self.raw_log.meta(),
        };
        let removed = self.subscribable.remove(counter_id, &mut hook);
        if removed.is_some() && self.subscribable.is_empty() {
            self.raw_log.meta().is_connected.store(0, Ordering::Release);
        }
        removed
    }

    pub fn is_accepting_subscribers(&self) -> bool {
        self.state == PublicationState::Active
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscribable.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &SubscriberPosition> {
        self.subscribable.iter()
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.has_reached_end_of_life
    }

    pub fn state(&self) -> PublicationState {
        self.state
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn log_file_name(&self) -> &str {
        &self.log_file_name
    }

    pub fn raw_log(&self) -> &MappedRawLog {
        &self.raw_log
    }

    pub fn term_window_length(&self) -> i64 {
        self.term_window_length
    }

    pub fn trip_gain(&self) -> i64 {
        self.trip_gain
    }

    pub fn trip_limit(&self) -> i64 {
        self.trip_limit
    }

    pub fn consumer_position(&self) -> i64 {
        self.consumer_position
    }

    pub fn clean_position(&self) -> i64 {
        self.clean_position
    }

    pub fn pub_lmt(&self) -> &Position {
        &self.pub_lmt
    }

    pub fn pub_pos(&self) -> &Position {
        &self.pub_pos
    }

    pub fn time_of_last_state_change_ns(&self) -> i64 {
        self.time_of_last_state_change_ns
    }
}
