//! Error types raised inside the duel subsystem
//!
//! None of these ever reach a client. Rejections are swallowed at the
//! coordinator's hook boundary and only logged, reward failures degrade to
//! "no rating change".

use shared::{AccountId, PeerId};
use thiserror::Error;

/// Why a duel request or acceptance was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DuelRejection {
    #[error("peer {0} cannot challenge itself")]
    SelfTarget(PeerId),
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("peer {0} is already in a duel")]
    AlreadyDueling(PeerId),
    #[error("a request between {0} and {1} is already pending")]
    RequestExists(PeerId, PeerId),
    #[error("no pending request from {requester} to {requestee}")]
    NoPendingRequest { requester: PeerId, requestee: PeerId },
    #[error("peer {0} has no active controlled entity")]
    InactiveEntity(PeerId),
    #[error("focused entity is not controlled by a human peer")]
    NotAHumanTarget,
    #[error("peer {0} has no focused target")]
    NoFocus(PeerId),
}

/// Failure reported by the reward/rating collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewardError {
    #[error("rating service unavailable: {0}")]
    Unavailable(String),
    #[error("unknown account {0}")]
    UnknownAccount(AccountId),
}
