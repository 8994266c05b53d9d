//! Client-side duel facade for the local player
//!
//! The interface mirrors what the server tells this player about duels:
//! - Inbound requests aimed at us, each with its remaining lifetime
//! - The single outbound request we have in flight
//! - The opponent of the duel we are currently in
//! - Counters of every peer, as relayed by `PointsUpdate`
//!
//! It turns focus + interact into the right protocol message and raises a
//! [`DuelUiEvent`] for every lifecycle change. Presentation subscribes with
//! [`PeerDuelInterface::subscribe`] and unsubscribes by dropping the receiver.
//!
//! Countdowns are local mirrors of server timing. The server stays
//! authoritative: an accept sent for a request the server already dropped is
//! ignored there.

use shared::{Controller, DuelRecord, EntityId, Packet, PeerId};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

/// Lifecycle notification for presentation
#[derive(Debug, Clone, PartialEq)]
pub enum DuelUiEvent {
    Requested {
        requester: PeerId,
        requestee: PeerId,
        expires_in: f32,
    },
    RequestExpired {
        requester: PeerId,
        requestee: PeerId,
    },
    PreparationStarted {
        requester: PeerId,
        requestee: PeerId,
    },
    FirstPreparation {
        requester: PeerId,
        requestee: PeerId,
    },
    RoundEnded {
        requester: PeerId,
        requestee: PeerId,
        winner: Option<PeerId>,
    },
    DuelEnded {
        requester: PeerId,
        requestee: PeerId,
        winner: Option<PeerId>,
    },
    PointsUpdated {
        peer: PeerId,
        record: DuelRecord,
    },
    PersonalResult {
        won_duel: bool,
        rating_delta: i32,
    },
}

impl fmt::Display for DuelUiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuelUiEvent::Requested {
                requester,
                requestee,
                expires_in,
            } => write!(
                f,
                "Peer {} challenged peer {} ({:.0}s to accept)",
                requester, requestee, expires_in
            ),
            DuelUiEvent::RequestExpired {
                requester,
                requestee,
            } => write!(f, "Challenge {} -> {} expired", requester, requestee),
            DuelUiEvent::PreparationStarted {
                requester,
                requestee,
            } => write!(f, "Duel {} vs {}: get ready", requester, requestee),
            DuelUiEvent::FirstPreparation {
                requester,
                requestee,
            } => write!(f, "Duel {} vs {} begins", requester, requestee),
            DuelUiEvent::RoundEnded { winner, .. } => match winner {
                Some(winner) => write!(f, "Round won by peer {}", winner),
                None => write!(f, "Round ended without a winner"),
            },
            DuelUiEvent::DuelEnded {
                requester,
                requestee,
                winner,
            } => match winner {
                Some(winner) => write!(
                    f,
                    "Duel {} vs {} won by peer {}",
                    requester, requestee, winner
                ),
                None => write!(f, "Duel {} vs {} ended without a winner", requester, requestee),
            },
            DuelUiEvent::PointsUpdated { peer, record } => write!(
                f,
                "Peer {}: {} wins, {} losses, rating {}",
                peer, record.wins, record.losses, record.rating
            ),
            DuelUiEvent::PersonalResult {
                won_duel,
                rating_delta,
            } => write!(
                f,
                "You {} the duel ({:+} rating)",
                if *won_duel { "won" } else { "lost" },
                rating_delta
            ),
        }
    }
}

/// What the local player is looking at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusedEntity {
    pub entity: EntityId,
    pub controller: Controller,
}

#[derive(Debug, Default)]
pub struct PeerDuelInterface {
    local_peer: Option<PeerId>,
    local_entity: Option<EntityId>,
    focus: Option<FocusedEntity>,
    inbound: HashMap<PeerId, f32>,
    outbound: Option<(PeerId, f32)>,
    opponent: Option<PeerId>,
    records: HashMap<PeerId, DuelRecord>,
    subscribers: Vec<mpsc::UnboundedSender<DuelUiEvent>>,
}

impl PeerDuelInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_peer(&mut self, peer: PeerId, entity: EntityId) {
        self.local_peer = Some(peer);
        self.local_entity = Some(entity);
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.local_peer
    }

    pub fn set_focus(&mut self, focus: Option<FocusedEntity>) {
        self.focus = focus;
    }

    pub fn focus(&self) -> Option<FocusedEntity> {
        self.focus
    }

    /// Registers a presentation listener
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DuelUiEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn dispatch(&mut self, event: DuelUiEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn involves_me(&self, requester: PeerId, requestee: PeerId) -> Option<PeerId> {
        let me = self.local_peer?;
        if requester == me {
            Some(requestee)
        } else if requestee == me {
            Some(requester)
        } else {
            None
        }
    }

    /// Message to send for an "interact" on the focused entity: accept when
    /// its owner already challenged us, challenge it otherwise
    pub fn on_interact(&self) -> Option<Packet> {
        let me = self.local_peer?;
        let focus = self.focus?;
        let Controller::Human(owner) = focus.controller else {
            return None;
        };
        if owner == me || self.opponent.is_some() {
            return None;
        }

        if self.inbound.contains_key(&owner) {
            return Some(Packet::DuelAccept {
                target_peer_id: owner,
            });
        }
        if self.outbound.is_some() {
            return None;
        }
        Some(Packet::DuelRequest {
            target_entity_id: focus.entity,
        })
    }

    /// Folds a server packet into the mirrored state
    pub fn handle_packet(&mut self, packet: &Packet) {
        match *packet {
            Packet::DuelRequestNotify {
                requester_id,
                requestee_id,
                expires_in,
            } => {
                let me = self.local_peer;
                if me == Some(requestee_id) {
                    self.inbound.insert(requester_id, expires_in);
                } else if me == Some(requester_id) {
                    self.outbound = Some((requestee_id, expires_in));
                }
                self.dispatch(DuelUiEvent::Requested {
                    requester: requester_id,
                    requestee: requestee_id,
                    expires_in,
                });
            }
            Packet::DuelPreparationStarted {
                requester_id,
                requestee_id,
            } => {
                if let Some(opponent) = self.involves_me(requester_id, requestee_id) {
                    self.opponent = Some(opponent);
                    self.inbound.clear();
                    self.outbound = None;
                }
                self.dispatch(DuelUiEvent::PreparationStarted {
                    requester: requester_id,
                    requestee: requestee_id,
                });
            }
            Packet::DuelFirstPreparation {
                requester_id,
                requestee_id,
            } => self.dispatch(DuelUiEvent::FirstPreparation {
                requester: requester_id,
                requestee: requestee_id,
            }),
            Packet::RoundEnded {
                requester_id,
                requestee_id,
                winner_id,
            } => self.dispatch(DuelUiEvent::RoundEnded {
                requester: requester_id,
                requestee: requestee_id,
                winner: winner_id,
            }),
            Packet::DuelEnded {
                requester_id,
                requestee_id,
                winner_id,
            } => {
                if self.involves_me(requester_id, requestee_id).is_some() {
                    self.opponent = None;
                }
                self.dispatch(DuelUiEvent::DuelEnded {
                    requester: requester_id,
                    requestee: requestee_id,
                    winner: winner_id,
                });
            }
            Packet::PointsUpdate {
                peer_id,
                wins,
                losses,
                rating,
            } => {
                let record = DuelRecord {
                    wins,
                    losses,
                    rating,
                };
                self.records.insert(peer_id, record);
                self.dispatch(DuelUiEvent::PointsUpdated {
                    peer: peer_id,
                    record,
                });
            }
            Packet::DuelResult {
                won_duel,
                rating_delta,
            } => self.dispatch(DuelUiEvent::PersonalResult {
                won_duel,
                rating_delta,
            }),
            Packet::EntityBuilt {
                controller: Controller::Human(peer),
                entity_id,
                ..
            } if Some(peer) == self.local_peer => self.local_entity = Some(entity_id),
            Packet::EntityRemoved {
                controller,
                entity_id,
            } => self.on_entity_removed(controller, entity_id),
            Packet::Disconnected { .. } => self.reset(),
            _ => {}
        }
    }

    /// The server drops requests of anyone whose avatar goes away
    fn on_entity_removed(&mut self, controller: Controller, entity: EntityId) {
        if self.focus.is_some_and(|f| f.entity == entity) {
            self.focus = None;
        }
        let Controller::Human(peer) = controller else {
            return;
        };

        if Some(peer) == self.local_peer && self.local_entity == Some(entity) {
            self.local_entity = None;
            self.inbound.clear();
            self.outbound = None;
            return;
        }
        self.inbound.remove(&peer);
        if self.outbound.is_some_and(|(target, _)| target == peer) {
            self.outbound = None;
        }
    }

    /// Runs the local request countdowns
    pub fn update(&mut self, dt: f32) {
        let Some(me) = self.local_peer else {
            return;
        };

        let mut expired = Vec::new();
        self.inbound.retain(|requester, remaining| {
            *remaining -= dt;
            if *remaining <= 0.0 {
                expired.push((*requester, me));
                false
            } else {
                true
            }
        });

        if let Some((requestee, remaining)) = self.outbound.as_mut() {
            *remaining -= dt;
            if *remaining <= 0.0 {
                expired.push((me, *requestee));
                self.outbound = None;
            }
        }

        for (requester, requestee) in expired {
            self.dispatch(DuelUiEvent::RequestExpired {
                requester,
                requestee,
            });
        }
    }

    fn reset(&mut self) {
        self.local_peer = None;
        self.local_entity = None;
        self.focus = None;
        self.inbound.clear();
        self.outbound = None;
        self.opponent = None;
    }

    /// Inbound challenges with their remaining seconds
    pub fn inbound_requests(&self) -> Vec<(PeerId, f32)> {
        let mut requests: Vec<(PeerId, f32)> =
            self.inbound.iter().map(|(peer, left)| (*peer, *left)).collect();
        requests.sort_by_key(|(peer, _)| *peer);
        requests
    }

    pub fn outbound_request(&self) -> Option<(PeerId, f32)> {
        self.outbound
    }

    pub fn opponent(&self) -> Option<PeerId> {
        self.opponent
    }

    pub fn is_dueling(&self) -> bool {
        self.opponent.is_some()
    }

    pub fn record_of(&self, peer: PeerId) -> Option<DuelRecord> {
        self.records.get(&peer).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn interface(me: PeerId) -> PeerDuelInterface {
        let mut duel = PeerDuelInterface::new();
        duel.set_local_peer(me, me * 10);
        duel
    }

    fn focus_on(duel: &mut PeerDuelInterface, peer: PeerId) {
        duel.set_focus(Some(FocusedEntity {
            entity: peer * 10,
            controller: Controller::Human(peer),
        }));
    }

    fn notify(requester: PeerId, requestee: PeerId) -> Packet {
        Packet::DuelRequestNotify {
            requester_id: requester,
            requestee_id: requestee,
            expires_in: 10.0,
        }
    }

    #[test]
    fn test_interact_requests_focused_peer() {
        let mut duel = interface(1);
        focus_on(&mut duel, 2);

        assert_eq!(
            duel.on_interact(),
            Some(Packet::DuelRequest {
                target_entity_id: 20
            })
        );
    }

    #[test]
    fn test_interact_accepts_inbound_request() {
        let mut duel = interface(1);
        duel.handle_packet(&notify(2, 1));
        focus_on(&mut duel, 2);

        assert_eq!(
            duel.on_interact(),
            Some(Packet::DuelAccept { target_peer_id: 2 })
        );
    }

    #[test]
    fn test_interact_ignores_bots_and_self() {
        let mut duel = interface(1);
        duel.set_focus(Some(FocusedEntity {
            entity: 5,
            controller: Controller::Bot,
        }));
        assert_eq!(duel.on_interact(), None);

        focus_on(&mut duel, 1);
        assert_eq!(duel.on_interact(), None);
    }

    #[test]
    fn test_outbound_request_blocks_second_request() {
        let mut duel = interface(1);
        duel.handle_packet(&notify(1, 2));
        focus_on(&mut duel, 3);

        assert_eq!(duel.outbound_request().map(|(peer, _)| peer), Some(2));
        assert_eq!(duel.on_interact(), None);
    }

    #[test]
    fn test_countdowns_expire() {
        let mut duel = interface(1);
        let mut events = duel.subscribe();
        duel.handle_packet(&notify(2, 1));
        duel.handle_packet(&notify(1, 3));
        events.try_recv().unwrap();
        events.try_recv().unwrap();

        duel.update(4.0);
        assert_approx_eq!(duel.inbound_requests()[0].1, 6.0, 0.001);

        duel.update(6.0);
        assert!(duel.inbound_requests().is_empty());
        assert_eq!(duel.outbound_request(), None);

        let mut expired = Vec::new();
        while let Ok(event) = events.try_recv() {
            expired.push(event);
        }
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&DuelUiEvent::RequestExpired {
            requester: 2,
            requestee: 1
        }));
    }

    #[test]
    fn test_preparation_sets_opponent_and_clears_requests() {
        let mut duel = interface(1);
        duel.handle_packet(&notify(2, 1));
        duel.handle_packet(&notify(3, 1));

        duel.handle_packet(&Packet::DuelPreparationStarted {
            requester_id: 2,
            requestee_id: 1,
        });
        assert_eq!(duel.opponent(), Some(2));
        assert!(duel.inbound_requests().is_empty());

        duel.handle_packet(&Packet::DuelEnded {
            requester_id: 2,
            requestee_id: 1,
            winner_id: Some(1),
        });
        assert!(!duel.is_dueling());
    }

    #[test]
    fn test_bystander_sees_duel_without_joining() {
        let mut duel = interface(9);
        duel.handle_packet(&Packet::DuelPreparationStarted {
            requester_id: 1,
            requestee_id: 2,
        });
        assert_eq!(duel.opponent(), None);
    }

    #[test]
    fn test_removed_entity_cancels_requests() {
        let mut duel = interface(1);
        duel.handle_packet(&notify(2, 1));
        focus_on(&mut duel, 2);

        duel.handle_packet(&Packet::EntityRemoved {
            controller: Controller::Human(2),
            entity_id: 20,
        });
        assert!(duel.inbound_requests().is_empty());
        assert_eq!(duel.focus(), None);
    }

    #[test]
    fn test_points_and_result_are_dispatched() {
        let mut duel = interface(1);
        let mut events = duel.subscribe();

        duel.handle_packet(&Packet::PointsUpdate {
            peer_id: 2,
            wins: 1,
            losses: 0,
            rating: 1016,
        });
        duel.handle_packet(&Packet::DuelResult {
            won_duel: false,
            rating_delta: -16,
        });

        assert_eq!(duel.record_of(2).unwrap().rating, 1016);
        assert!(matches!(
            events.try_recv().unwrap(),
            DuelUiEvent::PointsUpdated { peer: 2, .. }
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            DuelUiEvent::PersonalResult {
                won_duel: false,
                rating_delta: -16
            }
        );
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut duel = interface(1);
        let kept = duel.subscribe();
        let dropped = duel.subscribe();
        drop(dropped);
        assert_eq!(duel.subscriber_count(), 2);

        duel.handle_packet(&Packet::DuelResult {
            won_duel: true,
            rating_delta: 16,
        });
        assert_eq!(duel.subscriber_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_result_display() {
        let event = DuelUiEvent::PersonalResult {
            won_duel: true,
            rating_delta: 16,
        };
        assert_eq!(event.to_string(), "You won the duel (+16 rating)");
    }
}
