//! Recyclable pool of isolated duel sides
//!
//! A [`TeamSlot`] is deliberately neither `Clone` nor `Copy`: whoever holds
//! the value owns the side. A live duel session keeps its slot by value and
//! hands it back through [`TeamSlotPool::release`], so two sessions can never
//! reference the same side at the same time.
//!
//! The pool grows lazily and never shrinks. Allocation churn is therefore
//! bounded by the historical peak of concurrent duels, and exhaustion cannot
//! happen: an empty free queue simply allocates a new side.

use log::debug;
use shared::{Team, TeamSlotId};
use std::collections::VecDeque;

/// Owned handle to one isolated side/collision context
#[derive(Debug, PartialEq, Eq)]
pub struct TeamSlot {
    id: TeamSlotId,
}

impl TeamSlot {
    pub fn id(&self) -> TeamSlotId {
        self.id
    }

    /// Team value avatars inside this slot are assigned to
    pub fn team(&self) -> Team {
        Team::Duel(self.id)
    }
}

#[derive(Debug, Default)]
pub struct TeamSlotPool {
    free: VecDeque<TeamSlot>,
    allocated: u32,
}

impl TeamSlotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a previously released slot, or allocates a new side when none
    /// is free
    pub fn acquire(&mut self) -> TeamSlot {
        if let Some(slot) = self.free.pop_front() {
            debug!("Reusing team slot {:?}", slot.id);
            return slot;
        }

        self.allocated += 1;
        let slot = TeamSlot {
            id: TeamSlotId(self.allocated),
        };
        debug!("Allocated team slot {:?}", slot.id);
        slot
    }

    /// Returns a torn-down slot to the free queue
    pub fn release(&mut self, slot: TeamSlot) {
        debug!("Released team slot {:?}", slot.id);
        self.free.push_back(slot);
    }

    /// Number of sides ever allocated
    pub fn allocated(&self) -> usize {
        self.allocated as usize
    }

    pub fn free(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.allocated() - self.free()
    }
}
