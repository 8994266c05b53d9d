use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;

pub const DUEL_REQUEST_TIMEOUT: f32 = 10.0;
pub const DUEL_REQUEST_GRACE: f32 = 0.5;
pub const DUEL_PREPARATION_TIME: f32 = 3.0;
pub const DUEL_ROUND_END_DELAY: f32 = 2.0;
pub const DUEL_WIN_THRESHOLD: u32 = 1;
pub const UPKEEP_INTERVAL: f32 = 60.0;

pub const MAX_HEALTH: f32 = 100.0;
pub const ATTACK_DAMAGE: f32 = 25.0;

pub type PeerId = u32;
pub type EntityId = u32;
pub type AccountId = u64;

/// Identifier of an isolated side/collision context used by one duel.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamSlotId(pub u32);

/// Side an avatar currently fights for.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Team {
    /// The shared arena every bystander lives in.
    #[default]
    Open,
    Duel(TeamSlotId),
}

/// Who drives an avatar. Interaction logic dispatches on this once, at the
/// boundary where a focused entity is resolved.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    Human(PeerId),
    Bot,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    // Connection management
    Connect {
        client_version: u32,
        account_id: AccountId,
    },
    Disconnect,
    /// Keeps an otherwise idle connection from timing out.
    Heartbeat,
    Connected {
        peer_id: PeerId,
        entity_id: EntityId,
    },
    Disconnected {
        reason: String,
    },

    // Focus, interaction and combat
    Focus {
        target_entity_id: Option<EntityId>,
    },
    Interact,
    Attack {
        target_entity_id: EntityId,
    },
    EntityBuilt {
        controller: Controller,
        entity_id: EntityId,
        team: Team,
    },
    EntityRemoved {
        controller: Controller,
        entity_id: EntityId,
    },

    // Duel protocol
    DuelRequest {
        target_entity_id: EntityId,
    },
    DuelRequestNotify {
        requester_id: PeerId,
        requestee_id: PeerId,
        /// Seconds until the server discards the request.
        expires_in: f32,
    },
    DuelAccept {
        target_peer_id: PeerId,
    },
    DuelPreparationStarted {
        requester_id: PeerId,
        requestee_id: PeerId,
    },
    DuelFirstPreparation {
        requester_id: PeerId,
        requestee_id: PeerId,
    },
    RoundEnded {
        requester_id: PeerId,
        requestee_id: PeerId,
        winner_id: Option<PeerId>,
    },
    DuelEnded {
        requester_id: PeerId,
        requestee_id: PeerId,
        winner_id: Option<PeerId>,
    },
    PointsUpdate {
        peer_id: PeerId,
        wins: u32,
        losses: u32,
        rating: i32,
    },
    DuelResult {
        won_duel: bool,
        rating_delta: i32,
    },
}

impl Packet {
    /// True for packets travelling from a client to the server.
    pub fn is_server_bound(&self) -> bool {
        matches!(
            self,
            Packet::Connect { .. }
                | Packet::Disconnect
                | Packet::Heartbeat
                | Packet::Focus { .. }
                | Packet::Interact
                | Packet::Attack { .. }
                | Packet::DuelRequest { .. }
                | Packet::DuelAccept { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode packet: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode packet: {0}")]
    Decode(#[source] bincode::Error),
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(packet).map_err(ProtocolError::Encode)
}

pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
    bincode::deserialize(data).map_err(ProtocolError::Decode)
}

/// Win/loss counters and rating of one peer as relayed by `PointsUpdate`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct DuelRecord {
    pub wins: u32,
    pub losses: u32,
    pub rating: i32,
}
