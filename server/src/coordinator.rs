//! Duel coordination for the shared arena
//!
//! The coordinator is the only owner and mutator of the duel request
//! registry, the live sessions and the team slot pool. The surrounding game
//! mode drives it through a handful of hooks:
//! - Peer connect/disconnect
//! - Controlled entity built/removed
//! - Focus changes and "interact" input
//! - `on_tick(dt)` once per simulation frame
//!
//! Side effects (packets, team assignment, resupply) are never applied
//! directly. They are queued as [`DuelCommand`]s on an unbounded channel that
//! the host loop drains after every hook and tick.
//!
//! ## Tick phases
//! Every tick runs the same fixed sequence:
//! 1. Drain finished rating hand-offs from the completion queue
//! 2. Periodic upkeep stipend
//! 3. Promote sessions staged for a rematch back into preparation
//! 4. Adopt respawned avatars of participants between rounds
//! 5. Decide rounds that have to stop (eliminations, disconnects)
//! 6. Start prepared sessions whose countdown elapsed, resupplying
//!    participants that fell while preparing
//! 7. Expire stale requests
//! 8. Run round-ending timers and finalize or stage rematches
//!
//! Rounds are decided before preparation is promoted, so no session is
//! started and ended in the same pass.
//!
//! ## Rating hand-off
//! Finalizing a challenge with a clear winner and loser that are both still
//! connected issues the rating future on the tokio runtime. Its result comes
//! back through a completion queue drained at the start of a later tick;
//! point broadcasts and personal results go out only then.

use crate::config::DuelConfig;
use crate::error::{DuelRejection, RewardError};
use crate::rating::{RatingOutcome, RatingService};
use crate::requests::{DuelRequest, RequestRegistry};
use crate::session::{
    ChallengeOutcome, DuelPhase, DuelSession, ParticipantStatus, RoundDecision, SessionId,
};
use crate::team_pool::TeamSlotPool;
use log::{debug, error, info, warn};
use shared::{AccountId, Controller, DuelRecord, EntityId, Packet, PeerId, Team};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Side effects requested by the coordinator, applied by the host loop
#[derive(Debug, Clone, PartialEq)]
pub enum DuelCommand {
    SendPacket { peer: PeerId, packet: Packet },
    BroadcastPacket { packet: Packet },
    AssignTeam { peer: PeerId, team: Team },
    /// Heal and resupply the peer's avatar, respawning it if it is gone
    Resupply { peer: PeerId },
}

/// Identity of a newly connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub account: AccountId,
}

/// Entity a peer is looking at, already resolved to its controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusTarget {
    pub entity: EntityId,
    pub controller: Controller,
}

#[derive(Debug)]
struct DuelPeer {
    account: AccountId,
    connected: bool,
    entity: Option<EntityId>,
    entity_active: bool,
    focus: Option<FocusTarget>,
    record: DuelRecord,
}

impl DuelPeer {
    fn is_refereeing(&self, entity: Option<EntityId>) -> bool {
        self.connected && self.entity_active && entity.is_some() && self.entity == entity
    }
}

#[derive(Debug)]
struct RatingTicket {
    session: SessionId,
    winner: PeerId,
    loser: PeerId,
}

#[derive(Debug)]
struct RatingCompletion {
    ticket: RatingTicket,
    result: Result<RatingOutcome, RewardError>,
}

pub struct Coordinator {
    config: DuelConfig,
    rating: Arc<dyn RatingService>,
    requests: RequestRegistry,
    sessions: BTreeMap<SessionId, DuelSession>,
    pool: TeamSlotPool,
    peers: HashMap<PeerId, DuelPeer>,
    commands: mpsc::UnboundedSender<DuelCommand>,
    completion_tx: mpsc::UnboundedSender<RatingCompletion>,
    completion_rx: mpsc::UnboundedReceiver<RatingCompletion>,
    pending_ratings: usize,
    rating_calls: u64,
    next_session_id: u64,
    now: f64,
    upkeep_elapsed: f32,
    tick: u64,
}

fn participant_status(
    peers: &HashMap<PeerId, DuelPeer>,
    session: &DuelSession,
) -> [ParticipantStatus; 2] {
    session.participants().clone().map(|participant| {
        peers
            .get(&participant.peer)
            .map(|peer| ParticipantStatus {
                connected: peer.connected,
                alive: peer.is_refereeing(participant.entity),
            })
            .unwrap_or_default()
    })
}

fn points_update(peer: PeerId, record: DuelRecord) -> Packet {
    Packet::PointsUpdate {
        peer_id: peer,
        wins: record.wins,
        losses: record.losses,
        rating: record.rating,
    }
}

impl Coordinator {
    pub fn new(
        config: DuelConfig,
        rating: Arc<dyn RatingService>,
    ) -> (Self, mpsc::UnboundedReceiver<DuelCommand>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            config,
            rating,
            requests: RequestRegistry::new(),
            sessions: BTreeMap::new(),
            pool: TeamSlotPool::new(),
            peers: HashMap::new(),
            commands,
            completion_tx,
            completion_rx,
            pending_ratings: 0,
            rating_calls: 0,
            next_session_id: 1,
            now: 0.0,
            upkeep_elapsed: 0.0,
            tick: 0,
        };
        (coordinator, command_rx)
    }

    fn emit(&self, command: DuelCommand) {
        if let Err(e) = self.commands.send(command) {
            error!("Failed to queue duel command: {}", e);
        }
    }

    fn send_to(&self, peer: PeerId, packet: Packet) {
        self.emit(DuelCommand::SendPacket { peer, packet });
    }

    fn broadcast(&self, packet: Packet) {
        self.emit(DuelCommand::BroadcastPacket { packet });
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|p| p.connected)
    }

    // ---------------------------------------------------------------------
    // Hooks
    // ---------------------------------------------------------------------

    pub fn on_peer_connected(&mut self, info: PeerInfo) {
        let record = DuelRecord {
            rating: self.rating.initial_rating(),
            ..DuelRecord::default()
        };

        for (id, peer) in self.peers.iter().filter(|(_, p)| p.connected) {
            self.send_to(info.id, points_update(*id, peer.record));
        }

        self.peers.insert(
            info.id,
            DuelPeer {
                account: info.account,
                connected: true,
                entity: None,
                entity_active: false,
                focus: None,
                record,
            },
        );
        self.broadcast(points_update(info.id, record));
        info!("Peer {} joined duels (account {})", info.id, info.account);
    }

    /// Marks the peer as gone. A running session notices on the next tick.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.connected = false;
            state.focus = None;
        }
        let purged = self.requests.remove_involving(peer);
        info!(
            "Peer {} left duels ({} pending requests dropped)",
            peer, purged
        );
    }

    pub fn on_controlled_entity_built(&mut self, peer: PeerId, entity: EntityId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.entity = Some(entity);
            state.entity_active = true;
            debug!("Peer {} now controls entity {}", peer, entity);
        }
    }

    pub fn on_controlled_entity_removed(&mut self, peer: PeerId, entity: EntityId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            if state.entity == Some(entity) {
                state.entity_active = false;
            }
        }
        let purged = self.requests.remove_involving(peer);
        if purged > 0 {
            debug!(
                "Entity {} of peer {} removed, {} requests cancelled",
                entity, peer, purged
            );
        }
    }

    pub fn on_focus_changed(&mut self, peer: PeerId, focus: Option<FocusTarget>) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.focus = focus;
        }
    }

    /// Interact against the focused entity: accepts a pending request from
    /// its controller, otherwise challenges it. Invalid interactions are
    /// dropped silently.
    pub fn on_player_interact(&mut self, peer: PeerId) {
        if let Err(rejection) = self.interact(peer) {
            debug!("Interaction of peer {} ignored: {}", peer, rejection);
        }
    }

    fn interact(&mut self, peer: PeerId) -> Result<(), DuelRejection> {
        let focus = self
            .peers
            .get(&peer)
            .ok_or(DuelRejection::UnknownPeer(peer))?
            .focus
            .ok_or(DuelRejection::NoFocus(peer))?;

        match focus.controller {
            Controller::Human(target) => {
                let inbound = self
                    .requests
                    .get(target, peer)
                    .is_some_and(|request| request.requester == target);
                if inbound {
                    self.accept_duel(target, peer).map(|_| ())
                } else {
                    self.request_duel(peer, target)
                }
            }
            Controller::Bot => Err(DuelRejection::NotAHumanTarget),
        }
    }

    fn validate_idle(&self, peer: PeerId) -> Result<(), DuelRejection> {
        let state = self
            .peers
            .get(&peer)
            .filter(|p| p.connected)
            .ok_or(DuelRejection::UnknownPeer(peer))?;
        if self.is_dueling(peer) {
            return Err(DuelRejection::AlreadyDueling(peer));
        }
        if !state.entity_active {
            return Err(DuelRejection::InactiveEntity(peer));
        }
        Ok(())
    }

    /// Registers a challenge and notifies both sides
    pub fn request_duel(&mut self, requester: PeerId, requestee: PeerId) -> Result<(), DuelRejection> {
        if requester == requestee {
            return Err(DuelRejection::SelfTarget(requester));
        }
        self.validate_idle(requester)?;
        self.validate_idle(requestee)?;

        let expires_at = self.now + self.config.request_lifetime();
        self.requests.register(requester, requestee, expires_at)?;

        let notify = Packet::DuelRequestNotify {
            requester_id: requester,
            requestee_id: requestee,
            expires_in: self.config.request_timeout,
        };
        self.send_to(requestee, notify.clone());
        self.send_to(requester, notify);
        info!("Peer {} challenged peer {}", requester, requestee);
        Ok(())
    }

    /// Consumes the pending request from `requester` and opens a session
    pub fn accept_duel(
        &mut self,
        requester: PeerId,
        requestee: PeerId,
    ) -> Result<SessionId, DuelRejection> {
        if requester == requestee {
            return Err(DuelRejection::SelfTarget(requester));
        }
        self.validate_idle(requester)?;
        self.validate_idle(requestee)?;

        self.requests
            .try_consume(requester, requestee)
            .ok_or(DuelRejection::NoPendingRequest {
                requester,
                requestee,
            })?;
        self.requests.remove_involving(requester);
        self.requests.remove_involving(requestee);

        let entity_of = |peer: PeerId| self.peers.get(&peer).and_then(|p| p.entity);
        let requester_entity = entity_of(requester);
        let requestee_entity = entity_of(requestee);

        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        let slot = self.pool.acquire();
        info!(
            "Duel {:?} opened between {} and {} on {:?}",
            id,
            requester,
            requestee,
            slot.id()
        );

        self.sessions.insert(
            id,
            DuelSession::new(
                id,
                (requester, requester_entity),
                (requestee, requestee_entity),
                slot,
            ),
        );
        self.enter_preparation(id);
        Ok(id)
    }

    fn enter_preparation(&mut self, id: SessionId) {
        let countdown = self.config.preparation_duration;
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let first = session.enter_preparation(countdown);
        let team = session.slot().team();
        let [requester, requestee] = session.peers();

        for peer in [requester, requestee] {
            self.emit(DuelCommand::AssignTeam { peer, team });
            self.emit(DuelCommand::Resupply { peer });
        }

        self.broadcast(Packet::DuelPreparationStarted {
            requester_id: requester,
            requestee_id: requestee,
        });
        if first {
            self.broadcast(Packet::DuelFirstPreparation {
                requester_id: requester,
                requestee_id: requestee,
            });
        }
    }

    // ---------------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------------

    pub fn on_tick(&mut self, dt: f32) {
        let dt = dt.max(0.0);
        self.tick += 1;
        self.now += f64::from(dt);

        self.drain_rating_completions();
        self.run_upkeep(dt);
        self.promote_staged_rematches();
        self.adopt_respawned_avatars();
        self.resolve_rounds();
        self.start_prepared_sessions(dt);
        self.expire_requests();
        self.advance_round_endings(dt);
        self.purge_departed_peers();
    }

    fn drain_rating_completions(&mut self) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.pending_ratings = self.pending_ratings.saturating_sub(1);
            self.apply_rating(completion);
        }
    }

    fn apply_rating(&mut self, completion: RatingCompletion) {
        let RatingCompletion { ticket, result } = completion;
        let ratings = match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    "Rating hand-off for duel {:?} failed, keeping cached ratings: {}",
                    ticket.session, e
                );
                None
            }
        };

        let updates = [
            (ticket.winner, ratings.map(|o| o.winner_rating), true),
            (ticket.loser, ratings.map(|o| o.loser_rating), false),
        ];
        for (peer, new_rating, won_duel) in updates {
            let Some(state) = self.peers.get_mut(&peer) else {
                continue;
            };
            let previous = state.record.rating;
            if let Some(rating) = new_rating {
                state.record.rating = rating;
            }
            let record = state.record;
            let connected = state.connected;

            self.broadcast(points_update(peer, record));
            if connected {
                self.send_to(
                    peer,
                    Packet::DuelResult {
                        won_duel,
                        rating_delta: record.rating - previous,
                    },
                );
            }
        }
    }

    fn run_upkeep(&mut self, dt: f32) {
        let interval = self.config.upkeep_interval;
        if interval <= 0.0 {
            return;
        }
        self.upkeep_elapsed += dt;
        if self.upkeep_elapsed < interval {
            return;
        }
        self.upkeep_elapsed -= interval;

        let accounts: Vec<AccountId> = self
            .peers
            .values()
            .filter(|p| p.connected)
            .map(|p| p.account)
            .collect();
        if !accounts.is_empty() {
            self.rating.grant_upkeep(&accounts);
        }
    }

    fn promote_staged_rematches(&mut self) {
        let staged: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.phase() == DuelPhase::RematchStaged)
            .map(DuelSession::id)
            .collect();

        for id in staged {
            info!("Duel {:?} preparing a rematch", id);
            self.enter_preparation(id);
        }
    }

    fn adopt_respawned_avatars(&mut self) {
        let peers = &self.peers;
        for session in self.sessions.values_mut() {
            for peer_id in session.peers() {
                let Some(peer) = peers.get(&peer_id) else {
                    continue;
                };
                if !(peer.connected && peer.entity_active) {
                    continue;
                }
                if let Some(entity) = peer.entity {
                    if session.adopt_entity(peer_id, entity) {
                        debug!(
                            "Duel {:?} now referees entity {} of peer {}",
                            session.id(),
                            entity,
                            peer_id
                        );
                    }
                }
            }
        }
    }

    fn resolve_rounds(&mut self) {
        let ending_delay = self.config.round_end_delay;
        let mut decided: Vec<(SessionId, [PeerId; 2], RoundDecision)> = Vec::new();

        for (id, session) in self.sessions.iter_mut() {
            let status = participant_status(&self.peers, session);
            if let Some(decision) = session.decide_round(status, ending_delay) {
                decided.push((*id, session.peers(), decision));
            }
        }

        for (id, [requester, requestee], decision) in decided {
            info!(
                "Duel {:?} round decided, winner {:?}{}",
                id,
                decision.winner,
                if decision.forced_end { " (forced end)" } else { "" }
            );
            self.broadcast(Packet::RoundEnded {
                requester_id: requester,
                requestee_id: requestee,
                winner_id: decision.winner,
            });

            if decision.forced_end {
                self.finalize(
                    id,
                    ChallengeOutcome {
                        winner: None,
                        loser: None,
                    },
                );
            }
        }
    }

    /// Counts preparation down and starts sessions with both avatars up.
    /// A participant whose avatar fell during preparation is resupplied
    /// again, the new avatar is adopted on a following tick.
    fn start_prepared_sessions(&mut self, dt: f32) {
        let mut fallen: Vec<PeerId> = Vec::new();

        for (id, session) in self.sessions.iter_mut() {
            if session.phase() != DuelPhase::Preparing {
                continue;
            }
            session.advance(dt);
            let status = participant_status(&self.peers, session);
            if session.ready_to_start(status) {
                session.start();
                info!("Duel {:?} started", id);
                continue;
            }

            for (peer, status) in session.peers().into_iter().zip(status) {
                if status.connected && !status.alive {
                    fallen.push(peer);
                }
            }
        }

        for peer in fallen {
            debug!("Resupplying fallen duel participant {}", peer);
            self.emit(DuelCommand::Resupply { peer });
        }
    }

    fn expire_requests(&mut self) {
        for request in self.requests.expire_stale(self.now) {
            debug!(
                "Request {} -> {} timed out",
                request.requester, request.requestee
            );
        }
    }

    fn advance_round_endings(&mut self, dt: f32) {
        let threshold = self.config.win_threshold;
        let mut finished: Vec<(SessionId, ChallengeOutcome)> = Vec::new();

        for (id, session) in self.sessions.iter_mut() {
            if session.phase() != DuelPhase::RoundEnding {
                continue;
            }
            session.advance(dt);
            if !session.timer_elapsed() {
                continue;
            }

            let status = participant_status(&self.peers, session);
            match session.challenge_outcome(status, threshold) {
                Some(outcome) => finished.push((*id, outcome)),
                None => {
                    session.stage_rematch();
                    debug!("Duel {:?} staged for rematch", id);
                }
            }
        }

        for (id, outcome) in finished {
            self.finalize(id, outcome);
        }
    }

    /// Tears a session down: releases its slot, returns both peers to the
    /// open arena, records the result and hands off to the rating service
    fn finalize(&mut self, id: SessionId, outcome: ChallengeOutcome) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        let [requester, requestee] = session.peers();
        self.pool.release(session.into_slot());

        for peer in [requester, requestee] {
            if self.is_connected(peer) {
                self.emit(DuelCommand::AssignTeam {
                    peer,
                    team: Team::Open,
                });
            }
        }
        self.broadcast(Packet::DuelEnded {
            requester_id: requester,
            requestee_id: requestee,
            winner_id: outcome.winner,
        });
        info!("Duel {:?} ended, winner {:?}", id, outcome.winner);

        let (Some(winner), Some(loser)) = (outcome.winner, outcome.loser) else {
            return;
        };
        if let Some(state) = self.peers.get_mut(&winner) {
            state.record.wins += 1;
        }
        if let Some(state) = self.peers.get_mut(&loser) {
            state.record.losses += 1;
        }

        if self.is_connected(winner) && self.is_connected(loser) {
            self.request_rating(RatingTicket {
                session: id,
                winner,
                loser,
            });
            return;
        }

        for peer in [winner, loser] {
            let Some(state) = self.peers.get(&peer) else {
                continue;
            };
            self.broadcast(points_update(peer, state.record));
            if state.connected {
                self.send_to(
                    peer,
                    Packet::DuelResult {
                        won_duel: peer == winner,
                        rating_delta: 0,
                    },
                );
            }
        }
    }

    fn request_rating(&mut self, ticket: RatingTicket) {
        let account_of = |peer: PeerId| self.peers.get(&peer).map(|p| p.account);
        let (Some(winner), Some(loser)) = (account_of(ticket.winner), account_of(ticket.loser))
        else {
            return;
        };

        self.rating_calls += 1;
        self.pending_ratings += 1;
        let future = self.rating.compute_duel_outcome(winner, loser);
        let completion_tx = self.completion_tx.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = future.await;
                    if let Err(e) = completion_tx.send(RatingCompletion { ticket, result }) {
                        error!("Failed to deliver rating result: {}", e);
                    }
                });
            }
            Err(_) => {
                let completion = RatingCompletion {
                    ticket,
                    result: Err(RewardError::Unavailable("no async runtime".to_string())),
                };
                if let Err(e) = completion_tx.send(completion) {
                    error!("Failed to deliver rating result: {}", e);
                }
            }
        }
    }

    fn purge_departed_peers(&mut self) {
        let sessions = &self.sessions;
        self.peers
            .retain(|id, peer| peer.connected || sessions.values().any(|s| s.involves(*id)));
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn config(&self) -> &DuelConfig {
        &self.config
    }

    /// Coordinator clock in seconds
    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn is_dueling(&self, peer: PeerId) -> bool {
        self.sessions.values().any(|s| s.involves(peer))
    }

    pub fn session_of(&self, peer: PeerId) -> Option<&DuelSession> {
        self.sessions.values().find(|s| s.involves(peer))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &DuelSession> {
        self.sessions.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn request_between(&self, a: PeerId, b: PeerId) -> Option<&DuelRequest> {
        self.requests.get(a, b)
    }

    pub fn record_of(&self, peer: PeerId) -> Option<DuelRecord> {
        self.peers.get(&peer).map(|p| p.record)
    }

    pub fn pool(&self) -> &TeamSlotPool {
        &self.pool
    }

    /// Rating futures issued so far
    pub fn rating_calls(&self) -> u64 {
        self.rating_calls
    }

    /// Rating futures issued but not yet drained
    pub fn pending_ratings(&self) -> usize {
        self.pending_ratings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rating::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRating {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl RatingService for CountingRating {
        fn compute_duel_outcome(
            &self,
            _winner: AccountId,
            _loser: AccountId,
        ) -> BoxFuture<Result<RatingOutcome, RewardError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(RewardError::Unavailable("test".to_string()))
                } else {
                    Ok(RatingOutcome {
                        winner_rating: 1016,
                        loser_rating: 984,
                    })
                }
            })
        }
    }

    fn setup(
        fail: bool,
    ) -> (
        Coordinator,
        mpsc::UnboundedReceiver<DuelCommand>,
        Arc<AtomicUsize>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let rating = CountingRating {
            calls: Arc::clone(&calls),
            fail,
        };
        let (coordinator, rx) = Coordinator::new(DuelConfig::default(), Arc::new(rating));
        (coordinator, rx, calls)
    }

    fn join(coordinator: &mut Coordinator, peer: PeerId) {
        coordinator.on_peer_connected(PeerInfo {
            id: peer,
            account: u64::from(peer) * 100,
        });
        coordinator.on_controlled_entity_built(peer, peer * 10);
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DuelCommand>) -> Vec<DuelCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    fn broadcasts(commands: &[DuelCommand]) -> Vec<&Packet> {
        commands
            .iter()
            .filter_map(|c| match c {
                DuelCommand::BroadcastPacket { packet } => Some(packet),
                _ => None,
            })
            .collect()
    }

    fn open_duel(coordinator: &mut Coordinator, a: PeerId, b: PeerId) -> SessionId {
        coordinator.request_duel(a, b).unwrap();
        coordinator.accept_duel(a, b).unwrap()
    }

    fn start(coordinator: &mut Coordinator) {
        let countdown = coordinator.config().preparation_duration;
        coordinator.on_tick(countdown);
    }

    #[test]
    fn test_request_notifies_both_sides() {
        let (mut coordinator, mut rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        drain(&mut rx);

        coordinator.request_duel(1, 2).unwrap();
        let commands = drain(&mut rx);

        let notified: Vec<PeerId> = commands
            .iter()
            .filter_map(|c| match c {
                DuelCommand::SendPacket {
                    peer,
                    packet: Packet::DuelRequestNotify { .. },
                } => Some(*peer),
                _ => None,
            })
            .collect();
        assert_eq!(notified, vec![2, 1]);
        assert_eq!(coordinator.pending_request_count(), 1);
    }

    #[test]
    fn test_request_rejections() {
        let (mut coordinator, _rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        join(&mut coordinator, 3);

        assert_eq!(
            coordinator.request_duel(1, 1),
            Err(DuelRejection::SelfTarget(1))
        );
        assert_eq!(
            coordinator.request_duel(1, 9),
            Err(DuelRejection::UnknownPeer(9))
        );

        coordinator.request_duel(1, 2).unwrap();
        assert!(coordinator.request_duel(2, 1).is_err());

        coordinator.accept_duel(1, 2).unwrap();
        assert_eq!(
            coordinator.request_duel(3, 1),
            Err(DuelRejection::AlreadyDueling(1))
        );
    }

    #[test]
    fn test_accept_without_request() {
        let (mut coordinator, _rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);

        assert_eq!(
            coordinator.accept_duel(1, 2),
            Err(DuelRejection::NoPendingRequest {
                requester: 1,
                requestee: 2
            })
        );
        assert_eq!(coordinator.session_count(), 0);
        assert_eq!(coordinator.pool().allocated(), 0);
    }

    #[test]
    fn test_accept_opens_session_and_announces_once() {
        let (mut coordinator, mut rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        coordinator.request_duel(1, 2).unwrap();
        drain(&mut rx);

        coordinator.accept_duel(1, 2).unwrap();
        let commands = drain(&mut rx);

        assert!(commands.contains(&DuelCommand::AssignTeam {
            peer: 1,
            team: Team::Duel(shared::TeamSlotId(1)),
        }));
        assert!(commands.contains(&DuelCommand::Resupply { peer: 2 }));
        let packets = broadcasts(&commands);
        assert_eq!(
            packets,
            vec![
                &Packet::DuelPreparationStarted {
                    requester_id: 1,
                    requestee_id: 2
                },
                &Packet::DuelFirstPreparation {
                    requester_id: 1,
                    requestee_id: 2
                },
            ]
        );
        assert_eq!(coordinator.pending_request_count(), 0);
        assert_eq!(coordinator.pool().in_use(), 1);
    }

    #[test]
    fn test_interact_requests_then_accepts() {
        let (mut coordinator, _rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);

        coordinator.on_focus_changed(
            1,
            Some(FocusTarget {
                entity: 20,
                controller: Controller::Human(2),
            }),
        );
        coordinator.on_player_interact(1);
        assert!(coordinator.request_between(1, 2).is_some());

        coordinator.on_focus_changed(
            2,
            Some(FocusTarget {
                entity: 10,
                controller: Controller::Human(1),
            }),
        );
        coordinator.on_player_interact(2);
        assert!(coordinator.is_dueling(1));
        assert!(coordinator.is_dueling(2));
    }

    #[test]
    fn test_interact_with_bot_is_ignored() {
        let (mut coordinator, _rx, _) = setup(false);
        join(&mut coordinator, 1);
        coordinator.on_focus_changed(
            1,
            Some(FocusTarget {
                entity: 99,
                controller: Controller::Bot,
            }),
        );

        assert_eq!(coordinator.interact(1), Err(DuelRejection::NotAHumanTarget));
        assert_eq!(coordinator.pending_request_count(), 0);
    }

    #[test]
    fn test_session_starts_only_with_both_entities_active() {
        let (mut coordinator, _rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);

        coordinator.on_controlled_entity_removed(2, 20);
        start(&mut coordinator);
        assert_eq!(
            coordinator.session_of(1).unwrap().phase(),
            DuelPhase::Preparing
        );

        coordinator.on_controlled_entity_built(2, 21);
        coordinator.on_tick(0.1);
        let session = coordinator.session_of(1).unwrap();
        assert_eq!(session.phase(), DuelPhase::Started);
        assert_eq!(session.participant(2).unwrap().entity, Some(21));
    }

    #[test]
    fn test_elimination_decides_round_once() {
        let (mut coordinator, mut rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);
        drain(&mut rx);

        coordinator.on_controlled_entity_removed(1, 10);
        coordinator.on_tick(0.1);
        coordinator.on_tick(0.1);

        let round_ends = drain(&mut rx)
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    DuelCommand::BroadcastPacket {
                        packet: Packet::RoundEnded { .. }
                    }
                )
            })
            .count();
        assert_eq!(round_ends, 1);
        assert_eq!(coordinator.session_of(2).unwrap().round_wins(2), 1);
    }

    #[test]
    fn test_respawn_outside_duel_does_not_revive_participant() {
        let (mut coordinator, _rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);

        coordinator.on_controlled_entity_removed(1, 10);
        coordinator.on_controlled_entity_built(1, 11);
        coordinator.on_tick(0.1);

        let decision = coordinator.session_of(1).unwrap().last_decision().unwrap();
        assert_eq!(decision.winner, Some(2));
    }

    #[test]
    fn test_rating_failure_without_runtime_still_releases_slot() {
        let (mut coordinator, mut rx, calls) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);

        coordinator.on_controlled_entity_removed(1, 10);
        coordinator.on_tick(0.1);
        coordinator.on_tick(coordinator.config().round_end_delay);

        assert_eq!(coordinator.session_count(), 0);
        assert_eq!(coordinator.pool().free(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drain(&mut rx);

        coordinator.on_tick(0.1);
        let commands = drain(&mut rx);
        assert!(commands.contains(&DuelCommand::SendPacket {
            peer: 2,
            packet: Packet::DuelResult {
                won_duel: true,
                rating_delta: 0
            },
        }));
        let record = coordinator.record_of(2).unwrap();
        assert_eq!(record.wins, 1);
        assert_eq!(record.rating, crate::rating::DEFAULT_RATING);
    }

    #[tokio::test]
    async fn test_rating_delivered_on_later_tick() {
        let (mut coordinator, mut rx, calls) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);

        coordinator.on_controlled_entity_removed(2, 20);
        coordinator.on_tick(0.1);
        coordinator.on_tick(coordinator.config().round_end_delay);
        assert_eq!(coordinator.pending_ratings(), 1);
        drain(&mut rx);

        for _ in 0..16 {
            if coordinator.pending_ratings() == 0 {
                break;
            }
            tokio::task::yield_now().await;
            coordinator.on_tick(0.0);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.record_of(1).unwrap().rating, 1016);
        assert_eq!(coordinator.record_of(2).unwrap().rating, 984);
        assert!(drain(&mut rx).contains(&DuelCommand::SendPacket {
            peer: 2,
            packet: Packet::DuelResult {
                won_duel: false,
                rating_delta: -16
            },
        }));
    }

    #[tokio::test]
    async fn test_rating_error_keeps_cached_values() {
        let (mut coordinator, _rx, calls) = setup(true);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);

        coordinator.on_controlled_entity_removed(2, 20);
        coordinator.on_tick(0.1);
        coordinator.on_tick(coordinator.config().round_end_delay);

        for _ in 0..16 {
            if coordinator.pending_ratings() == 0 {
                break;
            }
            tokio::task::yield_now().await;
            coordinator.on_tick(0.0);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_ratings(), 0);
        assert_eq!(
            coordinator.record_of(1).unwrap().rating,
            crate::rating::DEFAULT_RATING
        );
        assert_eq!(coordinator.pool().in_use(), 0);
    }

    #[test]
    fn test_rematch_keeps_slot_below_threshold() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = DuelConfig {
            win_threshold: 2,
            ..DuelConfig::default()
        };
        let rating = CountingRating {
            calls: Arc::clone(&calls),
            fail: false,
        };
        let (mut coordinator, mut rx) = Coordinator::new(config, Arc::new(rating));
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);
        drain(&mut rx);

        coordinator.on_controlled_entity_removed(1, 10);
        coordinator.on_tick(0.1);
        coordinator.on_tick(coordinator.config().round_end_delay);
        assert_eq!(
            coordinator.session_of(1).unwrap().phase(),
            DuelPhase::RematchStaged
        );

        coordinator.on_controlled_entity_built(1, 11);
        coordinator.on_tick(0.1);
        let session = coordinator.session_of(1).unwrap();
        assert_eq!(session.phase(), DuelPhase::Preparing);
        assert_eq!(session.participant(1).unwrap().entity, Some(11));
        assert_eq!(coordinator.pool().allocated(), 1);

        let packets = drain(&mut rx);
        let first_preparations = broadcasts(&packets)
            .into_iter()
            .filter(|p| matches!(p, Packet::DuelFirstPreparation { .. }))
            .count();
        let preparations = broadcasts(&packets)
            .into_iter()
            .filter(|p| matches!(p, Packet::DuelPreparationStarted { .. }))
            .count();
        assert_eq!(first_preparations, 0);
        assert_eq!(preparations, 1);
    }

    #[test]
    fn test_single_disconnect_forfeits_without_rating() {
        let (mut coordinator, _rx, calls) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);

        coordinator.on_peer_disconnected(1);
        coordinator.on_tick(0.1);
        assert_eq!(
            coordinator.session_of(2).unwrap().last_decision(),
            Some(RoundDecision {
                winner: Some(2),
                forced_end: false
            })
        );

        coordinator.on_tick(coordinator.config().round_end_delay);
        assert_eq!(coordinator.session_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.record_of(2).unwrap().wins, 1);
        assert!(coordinator.record_of(1).is_none());
    }

    #[test]
    fn test_entity_removal_cancels_pending_request() {
        let (mut coordinator, _rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        coordinator.request_duel(1, 2).unwrap();

        coordinator.on_controlled_entity_removed(2, 20);
        assert_eq!(coordinator.pending_request_count(), 0);
    }

    #[test]
    fn test_participant_falling_while_preparing_is_resupplied() {
        let (mut coordinator, mut rx, _) = setup(false);
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        drain(&mut rx);

        coordinator.on_controlled_entity_removed(2, 20);
        coordinator.on_tick(0.1);
        let commands = drain(&mut rx);
        assert_eq!(
            commands
                .iter()
                .filter(|c| matches!(c, DuelCommand::Resupply { .. }))
                .collect::<Vec<_>>(),
            vec![&DuelCommand::Resupply { peer: 2 }]
        );
        assert_eq!(
            coordinator.session_of(1).unwrap().phase(),
            DuelPhase::Preparing
        );

        // The host answers the resupply with a fresh avatar
        coordinator.on_controlled_entity_built(2, 21);
        start(&mut coordinator);

        let session = coordinator.session_of(1).unwrap();
        assert_eq!(session.phase(), DuelPhase::Started);
        assert_eq!(session.participant(2).unwrap().entity, Some(21));
        assert_eq!(coordinator.tick(), 2);
        assert!(!drain(&mut rx).contains(&DuelCommand::Resupply { peer: 2 }));
    }

    #[test]
    fn test_double_elimination_ends_challenge_without_rating() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = DuelConfig {
            win_threshold: 3,
            ..DuelConfig::default()
        };
        let rating = CountingRating {
            calls: Arc::clone(&calls),
            fail: false,
        };
        let (mut coordinator, mut rx) = Coordinator::new(config, Arc::new(rating));
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);
        open_duel(&mut coordinator, 1, 2);
        start(&mut coordinator);
        drain(&mut rx);

        coordinator.on_controlled_entity_removed(1, 10);
        coordinator.on_controlled_entity_removed(2, 20);
        coordinator.on_tick(0.1);
        assert!(coordinator.session_of(1).unwrap().is_no_contest());
        coordinator.on_tick(coordinator.config().round_end_delay);

        assert_eq!(coordinator.session_count(), 0);
        assert_eq!(coordinator.pool().in_use(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(broadcasts(&drain(&mut rx)).contains(&&Packet::DuelEnded {
            requester_id: 1,
            requestee_id: 2,
            winner_id: None,
        }));

        for peer in [1, 2] {
            let record = coordinator.record_of(peer).unwrap();
            assert_eq!((record.wins, record.losses), (0, 0));
        }
    }

    #[test]
    fn test_upkeep_runs_on_interval() {
        struct Upkeep(Arc<AtomicUsize>);
        impl RatingService for Upkeep {
            fn compute_duel_outcome(
                &self,
                _winner: AccountId,
                _loser: AccountId,
            ) -> BoxFuture<Result<RatingOutcome, RewardError>> {
                Box::pin(async { Err(RewardError::Unavailable("unused".to_string())) })
            }

            fn grant_upkeep(&self, accounts: &[AccountId]) {
                self.0.fetch_add(accounts.len(), Ordering::SeqCst);
            }
        }

        let granted = Arc::new(AtomicUsize::new(0));
        let config = DuelConfig {
            upkeep_interval: 1.0,
            ..DuelConfig::default()
        };
        let (mut coordinator, _rx) =
            Coordinator::new(config, Arc::new(Upkeep(Arc::clone(&granted))));
        join(&mut coordinator, 1);
        join(&mut coordinator, 2);

        coordinator.on_tick(0.6);
        assert_eq!(granted.load(Ordering::SeqCst), 0);
        coordinator.on_tick(0.6);
        assert_eq!(granted.load(Ordering::SeqCst), 2);
    }
}
