use crate::duel::{FocusedEntity, PeerDuelInterface};
use crate::input::{parse_command, Command};
use log::{debug, error, info, warn};
use shared::{
    decode, encode, AccountId, Controller, EntityId, Packet, PeerId, Team, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::interval;

/// Headless client: mirrors the arena and duel state, reads commands from stdin
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    account_id: AccountId,
    peer_id: Option<PeerId>,
    entity_id: Option<EntityId>,
    connected: bool,

    entities: HashMap<EntityId, (Controller, Team)>,
    duel: PeerDuelInterface,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        account_id: AccountId,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            account_id,
            peer_id: None,
            entity_id: None,
            connected: false,
            entities: HashMap::new(),
            duel: PeerDuelInterface::new(),
        })
    }

    pub fn duel(&self) -> &PeerDuelInterface {
        &self.duel
    }

    pub fn duel_mut(&mut self) -> &mut PeerDuelInterface {
        &mut self.duel
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server as account {}...", self.account_id);

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            account_id: self.account_id,
        };
        self.send_packet(&packet).await
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Applies a server packet to the local mirror
    pub fn handle_packet(&mut self, packet: Packet) {
        match &packet {
            Packet::Connected { peer_id, entity_id } => {
                info!("Connected! Peer ID: {}, entity {}", peer_id, entity_id);
                self.peer_id = Some(*peer_id);
                self.entity_id = Some(*entity_id);
                self.connected = true;
                self.duel.set_local_peer(*peer_id, *entity_id);
            }
            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.peer_id = None;
                self.entity_id = None;
            }
            Packet::EntityBuilt {
                controller,
                entity_id,
                team,
            } => {
                debug!("Entity {} ({:?}) in {:?}", entity_id, controller, team);
                self.entities.insert(*entity_id, (*controller, *team));
                if self.peer_id.is_some_and(|me| *controller == Controller::Human(me)) {
                    self.entity_id = Some(*entity_id);
                }
            }
            Packet::EntityRemoved { entity_id, .. } => {
                self.entities.remove(entity_id);
                if self.entity_id == Some(*entity_id) {
                    info!("Your avatar was eliminated");
                    self.entity_id = None;
                }
            }
            other if other.is_server_bound() => {
                warn!("Unexpected packet type");
                return;
            }
            _ => {}
        }

        self.duel.handle_packet(&packet);
    }

    /// Executes one console command. Returns false when the client should stop.
    pub async fn handle_command(
        &mut self,
        command: Command,
    ) -> Result<bool, Box<dyn std::error::Error>> {
        match command {
            Command::Focus(None) => {
                self.duel.set_focus(None);
                self.send_packet(&Packet::Focus {
                    target_entity_id: None,
                })
                .await?;
            }
            Command::Focus(Some(entity)) => match self.entities.get(&entity) {
                Some((controller, _)) => {
                    self.duel.set_focus(Some(FocusedEntity {
                        entity,
                        controller: *controller,
                    }));
                    self.send_packet(&Packet::Focus {
                        target_entity_id: Some(entity),
                    })
                    .await?;
                }
                None => println!("No entity {} in sight", entity),
            },
            Command::Interact => match self.duel.on_interact() {
                Some(packet) => self.send_packet(&packet).await?,
                None => println!("Nothing to interact with"),
            },
            Command::Attack(entity) => {
                self.send_packet(&Packet::Attack {
                    target_entity_id: entity,
                })
                .await?;
            }
            Command::Status => self.print_status(),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn print_status(&self) {
        println!(
            "Peer {:?}, avatar {:?}, opponent {:?}",
            self.peer_id,
            self.entity_id,
            self.duel.opponent()
        );

        let mut entities: Vec<_> = self.entities.iter().collect();
        entities.sort_by_key(|(id, _)| **id);
        for (id, (controller, team)) in entities {
            println!("  entity {}: {:?} in {:?}", id, controller, team);
        }
        for (requester, left) in self.duel.inbound_requests() {
            println!("  challenge from peer {} ({:.1}s left)", requester, left);
        }
        if let Some((requestee, left)) = self.duel.outbound_request() {
            println!("  waiting on peer {} ({:.1}s left)", requestee, left);
        }
        if let Some(record) = self.peer_id.and_then(|me| self.duel.record_of(me)) {
            println!(
                "  record: {} wins, {} losses, rating {}",
                record.wins, record.losses, record.rating
            );
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut events = self.duel.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                println!("{}", event);
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut update_interval = interval(Duration::from_millis(100));
        let mut heartbeat_interval = interval(Duration::from_secs(1));
        let mut last_update = Instant::now();

        let mut buffer = [0u8; 2048];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => match decode(&buffer[0..len]) {
                            Ok(packet) => self.handle_packet(packet),
                            Err(e) => warn!("Dropping packet: {}", e),
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                line = lines.next_line() => {
                    match line? {
                        Some(line) => match parse_command(&line) {
                            Ok(command) => {
                                if !self.handle_command(command).await? {
                                    break;
                                }
                            }
                            Err(e) => println!("{}", e),
                        },
                        None => break,
                    }
                },

                _ = update_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_update).as_secs_f32();
                    last_update = now;
                    self.duel.update(dt);
                },

                _ = heartbeat_interval.tick() => {
                    if self.connected {
                        if let Err(e) = self.send_packet(&Packet::Heartbeat).await {
                            error!("Error sending heartbeat: {}", e);
                        }
                    }
                },
            }
        }

        if self.connected {
            if let Err(e) = self.send_packet(&Packet::Disconnect).await {
                error!("Error sending disconnect: {}", e);
            }
        }

        Ok(())
    }
}
