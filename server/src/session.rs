//! Lifecycle of one challenged pair
//!
//! A session moves through `Preparing -> Started -> RoundEnding` and then
//! either back to `Preparing` (via `RematchStaged`) or to teardown. The
//! session only holds state; the coordinator feeds it participant status
//! each tick and performs every side effect.

use crate::team_pool::TeamSlot;
use shared::{EntityId, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuelPhase {
    Preparing,
    Started,
    RoundEnding,
    /// Round over, waiting for the next tick to re-enter preparation
    RematchStaged,
}

/// Live view of a participant, computed by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParticipantStatus {
    pub connected: bool,
    /// Connected and the refereed entity is still active
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub peer: PeerId,
    /// Entity instance this session currently referees for the peer
    pub entity: Option<EntityId>,
    pub round_wins: u32,
}

impl Participant {
    fn new(peer: PeerId, entity: Option<EntityId>) -> Self {
        Self {
            peer,
            entity,
            round_wins: 0,
        }
    }
}

/// Result of the single decision taken when a round stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundDecision {
    pub winner: Option<PeerId>,
    /// Both participants are gone; no rematch and no reward
    pub forced_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeOutcome {
    pub winner: Option<PeerId>,
    pub loser: Option<PeerId>,
}

#[derive(Debug)]
pub struct DuelSession {
    id: SessionId,
    /// Requester first, requestee second
    participants: [Participant; 2],
    slot: TeamSlot,
    phase: DuelPhase,
    timer: f32,
    announced: bool,
    forced_end: bool,
    /// Both avatars fell in the same round while both peers stayed
    no_contest: bool,
    last_decision: Option<RoundDecision>,
    rounds_played: u32,
}

impl DuelSession {
    pub fn new(
        id: SessionId,
        requester: (PeerId, Option<EntityId>),
        requestee: (PeerId, Option<EntityId>),
        slot: TeamSlot,
    ) -> Self {
        Self {
            id,
            participants: [
                Participant::new(requester.0, requester.1),
                Participant::new(requestee.0, requestee.1),
            ],
            slot,
            phase: DuelPhase::Preparing,
            timer: 0.0,
            announced: false,
            forced_end: false,
            no_contest: false,
            last_decision: None,
            rounds_played: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> DuelPhase {
        self.phase
    }

    pub fn slot(&self) -> &TeamSlot {
        &self.slot
    }

    pub fn timer(&self) -> f32 {
        self.timer
    }

    pub fn participants(&self) -> &[Participant; 2] {
        &self.participants
    }

    pub fn requester(&self) -> PeerId {
        self.participants[0].peer
    }

    pub fn requestee(&self) -> PeerId {
        self.participants[1].peer
    }

    pub fn peers(&self) -> [PeerId; 2] {
        [self.requester(), self.requestee()]
    }

    pub fn involves(&self, peer: PeerId) -> bool {
        self.participants.iter().any(|p| p.peer == peer)
    }

    pub fn participant(&self, peer: PeerId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.peer == peer)
    }

    pub fn round_wins(&self, peer: PeerId) -> u32 {
        self.participant(peer).map_or(0, |p| p.round_wins)
    }

    pub fn last_decision(&self) -> Option<RoundDecision> {
        self.last_decision
    }

    pub fn rounds_played(&self) -> u32 {
        self.rounds_played
    }

    pub fn is_forced_end(&self) -> bool {
        self.forced_end
    }

    /// True once a round ended with both avatars down and both peers
    /// connected. Such a challenge ends without a winner.
    pub fn is_no_contest(&self) -> bool {
        self.no_contest
    }

    /// Enters `Preparing` with a fresh countdown. Returns true only the
    /// first time this session prepares.
    pub fn enter_preparation(&mut self, countdown: f32) -> bool {
        self.phase = DuelPhase::Preparing;
        self.timer = countdown;
        let first = !self.announced;
        self.announced = true;
        first
    }

    /// Counts the phase timer down
    pub fn advance(&mut self, dt: f32) {
        if matches!(self.phase, DuelPhase::Preparing | DuelPhase::RoundEnding) {
            self.timer = (self.timer - dt).max(0.0);
        }
    }

    pub fn timer_elapsed(&self) -> bool {
        self.timer <= 0.0
    }

    /// Swaps in a freshly built avatar for the peer between rounds. The
    /// refereed entity is frozen while a round is running.
    pub fn adopt_entity(&mut self, peer: PeerId, entity: EntityId) -> bool {
        if self.phase == DuelPhase::Started {
            return false;
        }
        match self.participants.iter_mut().find(|p| p.peer == peer) {
            Some(participant) if participant.entity != Some(entity) => {
                participant.entity = Some(entity);
                true
            }
            _ => false,
        }
    }

    pub fn ready_to_start(&self, status: [ParticipantStatus; 2]) -> bool {
        self.phase == DuelPhase::Preparing && self.timer_elapsed() && status.iter().all(|s| s.alive)
    }

    pub fn start(&mut self) {
        self.phase = DuelPhase::Started;
        self.timer = 0.0;
    }

    /// Takes the round decision if the round has to stop, moving the
    /// session into `RoundEnding`. Returns `None` when the round goes on or
    /// when the session is not in a decidable phase, so repeated calls never
    /// decide twice.
    pub fn decide_round(
        &mut self,
        status: [ParticipantStatus; 2],
        ending_delay: f32,
    ) -> Option<RoundDecision> {
        let standing: [bool; 2] = match self.phase {
            DuelPhase::Started => {
                let any_disconnected = status.iter().any(|s| !s.connected);
                let alive = status.iter().filter(|s| s.alive).count();
                if alive == 2 && !any_disconnected {
                    return None;
                }
                self.no_contest |= alive == 0 && !any_disconnected;
                [status[0].alive, status[1].alive]
            }
            DuelPhase::Preparing | DuelPhase::RematchStaged => {
                if status.iter().all(|s| s.connected) {
                    return None;
                }
                [status[0].connected, status[1].connected]
            }
            DuelPhase::RoundEnding => return None,
        };

        let winner = match standing {
            [true, false] => Some(0),
            [false, true] => Some(1),
            _ => None,
        };
        if let Some(index) = winner {
            self.participants[index].round_wins += 1;
        }

        let forced_end = status.iter().all(|s| !s.connected);
        self.forced_end |= forced_end;

        let decision = RoundDecision {
            winner: winner.map(|index| self.participants[index].peer),
            forced_end,
        };
        self.phase = DuelPhase::RoundEnding;
        self.timer = ending_delay;
        self.rounds_played += 1;
        self.last_decision = Some(decision);
        Some(decision)
    }

    /// Decides whether the challenge is over once the ending delay ran out.
    /// `None` means the pair goes for a rematch. A forced end or a no-contest
    /// round closes the challenge with no winner.
    pub fn challenge_outcome(
        &self,
        status: [ParticipantStatus; 2],
        win_threshold: u32,
    ) -> Option<ChallengeOutcome> {
        let threshold_winner = self
            .participants
            .iter()
            .position(|p| p.round_wins >= win_threshold.max(1));
        let mutually_valid = status.iter().all(|s| s.connected);

        let unresolved = self.forced_end || self.no_contest;
        if threshold_winner.is_none() && mutually_valid && !unresolved {
            return None;
        }

        let winner = if unresolved {
            None
        } else {
            threshold_winner.or(match [status[0].connected, status[1].connected] {
                [true, false] => Some(0),
                [false, true] => Some(1),
                _ => None,
            })
        };

        Some(ChallengeOutcome {
            winner: winner.map(|index| self.participants[index].peer),
            loser: winner.map(|index| self.participants[1 - index].peer),
        })
    }

    pub fn stage_rematch(&mut self) {
        self.phase = DuelPhase::RematchStaged;
        self.timer = 0.0;
    }

    /// Tears the session down, giving its side back to the caller
    pub fn into_slot(self) -> TeamSlot {
        self.slot
    }
}
