//! Subscriber positions attached to a publication.

use crate::core::counters::{CounterId, Position};

/// Flow-control participation of an untethered subscriber. Tethered
/// subscribers are always effectively active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherState {
    Active,
    Linger,
    Resting,
}

/// One subscriber's position counter plus its tether bookkeeping.
pub struct SubscriberPosition {
    position: Position,
    subscription_registration_id: i64,
    is_tether: bool,
    state: TetherState,
    time_of_last_update_ns: i64,
}

impl SubscriberPosition {
    pub fn new(
        position: Position,
        subscription_registration_id: i64,
        is_tether: bool,
        now_ns: i64,
    ) -> Self {
        Self {
            position,
            subscription_registration_id,
            is_tether,
            state: TetherState::Active,
            time_of_last_update_ns: now_ns,
        }
    }

    pub fn counter_id(&self) -> CounterId {
        self.position.id()
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn position_volatile(&self) -> i64 {
        self.position.get_volatile()
    }

    pub fn subscription_registration_id(&self) -> i64 {
        self.subscription_registration_id
    }

    pub fn is_tether(&self) -> bool {
        self.is_tether
    }

    pub fn state(&self) -> TetherState {
        self.state
    }

    pub fn time_of_last_update_ns(&self) -> i64 {
        self.time_of_last_update_ns
    }

    pub fn touch(&mut self, now_ns: i64) {
        self.time_of_last_update_ns = now_ns;
    }

    pub fn transition(&mut self, state: TetherState, now_ns: i64) {
        self.state = state;
        self.time_of_last_update_ns = now_ns;
    }
}

/// Hooks invoked by a [`Subscribable`] as positions come and go, so the
/// owner can maintain cached aggregates. The hook borrows from the owner
/// only for the duration of the call.
pub trait PositionHook {
    fn on_add(&mut self, position: &Position);
    fn on_remove(&mut self, position: &Position);
}

/// Ordered collection of subscriber positions attached to one publication.
#[derive(Default)]
pub struct Subscribable {
    positions: Vec<SubscriberPosition>,
}

impl Subscribable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, position: SubscriberPosition, hook: &mut dyn PositionHook) {
        hook.on_add(position.position());
        self.positions.push(position);
    }

    /// Remove by counter id. Swap removal: survivors keep no particular
    /// order, every consumer of the set is a full scan.
    pub fn remove(
        &mut self,
        counter_id: CounterId,
        hook: &mut dyn PositionHook,
    ) -> Option<SubscriberPosition> {
        let index = self
            .positions
            .iter()
            .position(|p| p.counter_id() == counter_id)?;
        let removed = self.positions.swap_remove(index);
        hook.on_remove(removed.position());
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriberPosition> {
        self.positions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubscriberPosition> {
        self.positions.iter_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SubscriberPosition> + '_ {
        self.positions.drain(..)
    }
}
