//! Authoritative arena state the duel coordinator referees
//!
//! Avatars are plain records: a controller, health, an active flag and the
//! team context they collide in. Attacks only land between avatars sharing a
//! team context, so a duel side is isolated from the open arena and from
//! every other duel.

use log::{debug, info};
use shared::{Controller, EntityId, PeerId, Team, ATTACK_DAMAGE, MAX_HEALTH};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    pub id: EntityId,
    pub controller: Controller,
    pub health: f32,
    pub active: bool,
    pub team: Team,
}

/// Lifecycle change the host has to relay to clients and to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaEvent {
    Built {
        controller: Controller,
        entity: EntityId,
        team: Team,
    },
    Removed {
        controller: Controller,
        entity: EntityId,
    },
}

#[derive(Debug, Default)]
pub struct ArenaState {
    pub tick: u32,
    avatars: HashMap<EntityId, Avatar>,
    /// Team every respawn of a human peer is placed in
    peer_teams: HashMap<PeerId, Team>,
    next_entity_id: EntityId,
}

impl ArenaState {
    pub fn new() -> Self {
        Self {
            next_entity_id: 1,
            ..Self::default()
        }
    }

    fn team_for(&self, controller: Controller) -> Team {
        match controller {
            Controller::Human(peer) => self.peer_teams.get(&peer).copied().unwrap_or_default(),
            Controller::Bot => Team::Open,
        }
    }

    /// Builds a fresh, full-health avatar
    pub fn spawn(&mut self, controller: Controller) -> ArenaEvent {
        let entity = self.next_entity_id;
        self.next_entity_id += 1;
        let team = self.team_for(controller);

        self.avatars.insert(
            entity,
            Avatar {
                id: entity,
                controller,
                health: MAX_HEALTH,
                active: true,
                team,
            },
        );
        info!("Spawned entity {} for {:?} in {:?}", entity, controller, team);
        ArenaEvent::Built {
            controller,
            entity,
            team,
        }
    }

    pub fn avatar(&self, entity: EntityId) -> Option<&Avatar> {
        self.avatars.get(&entity)
    }

    pub fn avatars(&self) -> impl Iterator<Item = &Avatar> {
        self.avatars.values()
    }

    /// Who drives the entity, if it is still in the arena
    pub fn resolve(&self, entity: EntityId) -> Option<Controller> {
        self.avatars
            .get(&entity)
            .filter(|avatar| avatar.active)
            .map(|avatar| avatar.controller)
    }

    /// Active avatar of a human peer
    pub fn entity_of(&self, peer: PeerId) -> Option<EntityId> {
        self.avatars
            .values()
            .find(|avatar| avatar.active && avatar.controller == Controller::Human(peer))
            .map(|avatar| avatar.id)
    }

    pub fn team_of(&self, peer: PeerId) -> Team {
        self.team_for(Controller::Human(peer))
    }

    /// Moves the peer, and its current avatar, into a team context
    pub fn assign_team(&mut self, peer: PeerId, team: Team) {
        self.peer_teams.insert(peer, team);
        if let Some(entity) = self.entity_of(peer) {
            if let Some(avatar) = self.avatars.get_mut(&entity) {
                avatar.team = team;
            }
        }
        debug!("Peer {} assigned to {:?}", peer, team);
    }

    /// Heals the peer's avatar, building a new one when it is gone
    pub fn resupply(&mut self, peer: PeerId) -> Option<ArenaEvent> {
        match self.entity_of(peer) {
            Some(entity) => {
                if let Some(avatar) = self.avatars.get_mut(&entity) {
                    avatar.health = MAX_HEALTH;
                }
                None
            }
            None => Some(self.spawn(Controller::Human(peer))),
        }
    }

    /// Applies one hit from the peer's avatar. Returns the removal when the
    /// target drops to zero health.
    pub fn attack(&mut self, attacker: PeerId, target: EntityId) -> Option<ArenaEvent> {
        let attacker_team = self
            .entity_of(attacker)
            .and_then(|entity| self.avatars.get(&entity))
            .map(|avatar| avatar.team)?;

        let avatar = self.avatars.get_mut(&target)?;
        if !avatar.active
            || avatar.team != attacker_team
            || avatar.controller == Controller::Human(attacker)
        {
            return None;
        }

        avatar.health = (avatar.health - ATTACK_DAMAGE).max(0.0);
        debug!(
            "Peer {} hit entity {} ({} health left)",
            attacker, target, avatar.health
        );
        if avatar.health > 0.0 {
            return None;
        }

        avatar.active = false;
        let controller = avatar.controller;
        self.avatars.remove(&target);
        info!("Entity {} eliminated by peer {}", target, attacker);
        Some(ArenaEvent::Removed {
            controller,
            entity: target,
        })
    }

    /// Drops everything a departed peer owned
    pub fn remove_peer(&mut self, peer: PeerId) -> Option<ArenaEvent> {
        self.peer_teams.remove(&peer);
        let entity = self.entity_of(peer)?;
        self.avatars.remove(&entity);
        info!("Removed entity {} of departed peer {}", entity, peer);
        Some(ArenaEvent::Removed {
            controller: Controller::Human(peer),
            entity,
        })
    }

    /// Brings back fallen peers accepted by `may_respawn`
    pub fn respawn_fallen<F>(&mut self, peers: &[PeerId], may_respawn: F) -> Vec<ArenaEvent>
    where
        F: Fn(PeerId) -> bool,
    {
        let fallen: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|peer| self.entity_of(*peer).is_none() && may_respawn(*peer))
            .collect();

        fallen
            .into_iter()
            .map(|peer| self.spawn(Controller::Human(peer)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.avatars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.avatars.is_empty()
    }
}
