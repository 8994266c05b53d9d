//! Server network layer handling UDP communications and the tick loop
//!
//! Packets are turned into coordinator hooks here. Everything the
//! coordinator wants done comes back as [`DuelCommand`]s, which are drained
//! after every packet and every tick: arena commands are applied in place,
//! packet commands are routed to the sender task.

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, DuelCommand, FocusTarget, PeerInfo};
use crate::game::{ArenaEvent, ArenaState};
use crate::rating::RatingService;
use log::{debug, error, info, warn};
use shared::{decode, encode, Controller, Packet, PeerId, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client_id: PeerId },
    Shutdown,
}

/// Messages sent from the tick loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
    BroadcastPacket { packet: Packet },
}

/// Main server coordinating networking, the arena and duels
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    arena: ArenaState,
    coordinator: Coordinator,
    duel_rx: mpsc::UnboundedReceiver<DuelCommand>,
    tick_duration: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(
        config: ServerConfig,
        rating: Arc<dyn RatingService>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (coordinator, duel_rx) = Coordinator::new(config.duel.clone(), rating);

        let mut arena = ArenaState::new();
        for _ in 0..config.bots {
            arena.spawn(Controller::Bot);
        }

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.client_timeout,
            ))),
            arena,
            coordinator,
            duel_rx,
            tick_duration: config.tick_duration,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that can stop [`Server::run`] from another task
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match decode(&buffer[0..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet) {
        if let Err(e) = self.game_tx.send(GameMessage::BroadcastPacket { packet }) {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Relays an arena change to clients and to the coordinator
    fn relay_arena_event(&mut self, event: ArenaEvent) {
        match event {
            ArenaEvent::Built {
                controller,
                entity,
                team,
            } => {
                if let Controller::Human(peer) = controller {
                    self.coordinator.on_controlled_entity_built(peer, entity);
                }
                self.broadcast_packet(Packet::EntityBuilt {
                    controller,
                    entity_id: entity,
                    team,
                });
            }
            ArenaEvent::Removed { controller, entity } => {
                if let Controller::Human(peer) = controller {
                    self.coordinator.on_controlled_entity_removed(peer, entity);
                }
                self.broadcast_packet(Packet::EntityRemoved {
                    controller,
                    entity_id: entity,
                });
            }
        }
    }

    /// Applies everything the coordinator queued since the last drain
    async fn flush_duel_commands(&mut self) {
        while let Ok(command) = self.duel_rx.try_recv() {
            match command {
                DuelCommand::SendPacket { peer, packet } => {
                    let addr = {
                        let clients = self.clients.read().await;
                        clients.addr_of(peer)
                    };
                    match addr {
                        Some(addr) => self.send_packet(packet, addr),
                        None => debug!("Dropping packet for departed peer {}", peer),
                    }
                }
                DuelCommand::BroadcastPacket { packet } => self.broadcast_packet(packet),
                DuelCommand::AssignTeam { peer, team } => self.arena.assign_team(peer, team),
                DuelCommand::Resupply { peer } => {
                    if let Some(event) = self.arena.resupply(peer) {
                        self.relay_arena_event(event);
                    }
                }
            }
        }
    }

    /// Tears down everything a departed peer owned
    fn drop_peer(&mut self, peer: PeerId) {
        if let Some(event) = self.arena.remove_peer(peer) {
            self.relay_arena_event(event);
        }
        self.coordinator.on_peer_disconnected(peer);
    }

    async fn handle_connect(&mut self, client_version: u32, account_id: u64, addr: SocketAddr) {
        info!(
            "Client connecting from {} (version: {}, account: {})",
            addr, client_version, account_id
        );

        if client_version != PROTOCOL_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: format!("Unsupported protocol version {}", client_version),
                },
                addr,
            );
            return;
        }

        // Remove existing connection if present
        let existing_client_id = {
            let mut clients = self.clients.write().await;
            let existing = clients.find_client_by_addr(addr);
            if let Some(existing_id) = existing {
                clients.remove_client(&existing_id);
            }
            existing
        };
        if let Some(existing_id) = existing_client_id {
            info!("Replacing existing client {} from {}", existing_id, addr);
            self.drop_peer(existing_id);
        }

        let client_id = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr, account_id)
        };

        let Some(client_id) = client_id else {
            self.send_packet(
                Packet::Disconnected {
                    reason: "Server full".to_string(),
                },
                addr,
            );
            return;
        };

        self.coordinator.on_peer_connected(PeerInfo {
            id: client_id,
            account: account_id,
        });

        let event = self.arena.spawn(Controller::Human(client_id));
        let ArenaEvent::Built {
            entity: entity_id, ..
        } = event
        else {
            return;
        };
        self.send_packet(
            Packet::Connected {
                peer_id: client_id,
                entity_id,
            },
            addr,
        );

        for avatar in self.arena.avatars().filter(|a| a.id != entity_id) {
            self.send_packet(
                Packet::EntityBuilt {
                    controller: avatar.controller,
                    entity_id: avatar.id,
                    team: avatar.team,
                },
                addr,
            );
        }
        self.relay_arena_event(event);
    }

    /// Processes incoming packets and feeds the coordinator
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if !packet.is_server_bound() {
            warn!("Unexpected packet type from client at {}", addr);
            return;
        }

        if let Packet::Connect {
            client_version,
            account_id,
        } = packet
        {
            self.handle_connect(client_version, account_id, addr).await;
            return;
        }

        let client_id = {
            let mut clients = self.clients.write().await;
            clients.touch(addr)
        };
        let Some(client_id) = client_id else {
            debug!("Ignoring packet from unknown address {}", addr);
            return;
        };

        match packet {
            Packet::Heartbeat => {}
            Packet::Disconnect => {
                {
                    let mut clients = self.clients.write().await;
                    clients.remove_client(&client_id);
                }
                self.drop_peer(client_id);
            }
            Packet::Focus { target_entity_id } => {
                let focus = target_entity_id.and_then(|entity| {
                    self.arena
                        .resolve(entity)
                        .map(|controller| FocusTarget { entity, controller })
                });
                self.coordinator.on_focus_changed(client_id, focus);
            }
            Packet::Interact => self.coordinator.on_player_interact(client_id),
            Packet::Attack { target_entity_id } => {
                if let Some(event) = self.arena.attack(client_id, target_entity_id) {
                    self.relay_arena_event(event);
                }
            }
            Packet::DuelRequest { target_entity_id } => {
                match self.arena.resolve(target_entity_id) {
                    Some(Controller::Human(target)) => {
                        if let Err(rejection) = self.coordinator.request_duel(client_id, target) {
                            debug!("Duel request from {} ignored: {}", client_id, rejection);
                        }
                    }
                    Some(Controller::Bot) | None => {
                        debug!(
                            "Duel request from {} names no human entity ({})",
                            client_id, target_entity_id
                        );
                    }
                }
            }
            Packet::DuelAccept { target_peer_id } => {
                if let Err(rejection) = self.coordinator.accept_duel(target_peer_id, client_id) {
                    debug!("Duel accept from {} ignored: {}", client_id, rejection);
                }
            }
            _ => warn!("Unexpected packet type from client at {}", addr),
        }
    }

    /// Advances the arena and the coordinator by one tick
    async fn tick(&mut self, dt: f32) {
        self.arena.tick += 1;

        let peers = {
            let clients = self.clients.read().await;
            clients.peer_ids()
        };
        let coordinator = &self.coordinator;
        let respawned = self
            .arena
            .respawn_fallen(&peers, |peer| !coordinator.is_dueling(peer));
        for event in respawned {
            self.relay_arena_event(event);
        }

        self.coordinator.on_tick(dt);
        self.flush_duel_commands().await;

        if self.arena.tick % 600 == 0 && self.coordinator.session_count() > 0 {
            debug!(
                "Tick {}: {} duels, {} pending requests, {} team slots allocated",
                self.arena.tick,
                self.coordinator.session_count(),
                self.coordinator.pending_request_count(),
                self.coordinator.pool().allocated()
            );
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.tick_duration);
        let mut last_tick = Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                            self.flush_duel_commands().await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            info!("Client {} timed out", client_id);
                            self.drop_peer(client_id);
                            self.flush_duel_commands().await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                // Handle server tick events
                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    self.tick(dt).await;
                },
            }
        }

        Ok(())
    }
}
