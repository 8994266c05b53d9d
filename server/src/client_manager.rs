//! Connection tracking for duel peers
//!
//! This module handles the server-side bookkeeping of connected peers:
//! - Connection lifecycle (connect, disconnect, timeout)
//! - Mapping between socket addresses, peer ids and accounts
//! - Capacity enforcement
//!
//! Peer ids are handed out once and never reused while the server runs, so
//! a stale id in a duel session can never alias a newcomer.

use log::info;
use shared::{AccountId, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected peer
#[derive(Debug)]
pub struct Client {
    /// Unique peer identifier assigned by the server
    pub id: PeerId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Account the rating service knows this peer by
    pub account: AccountId,
    /// Last time we received any packet from this peer
    pub last_seen: Instant,
}

impl Client {
    pub fn new(id: PeerId, addr: SocketAddr, account: AccountId) -> Self {
        Self {
            id,
            addr,
            account,
            last_seen: Instant::now(),
        }
    }

    /// Returns true if nothing was received within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Roster of connected peers
///
/// Enforces the capacity limit and answers the address lookups the network
/// layer needs to route packets in both directions.
pub struct ClientManager {
    clients: HashMap<PeerId, Client>,
    next_client_id: PeerId,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Creates an empty roster. Peer ids start from 1.
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Attempts to add a new peer
    ///
    /// Returns `Some(peer_id)` if successful, `None` if the server is full.
    pub fn add_client(&mut self, addr: SocketAddr, account: AccountId) -> Option<PeerId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!(
            "Client {} connected from {} (account {})",
            client_id, addr, account
        );
        self.clients
            .insert(client_id, Client::new(client_id, addr, account));

        Some(client_id)
    }

    /// Removes a peer. Returns false if it was already gone.
    pub fn remove_client(&mut self, client_id: &PeerId) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Associates an incoming packet with a connected peer
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Refreshes the activity timestamp of the peer at `addr`
    pub fn touch(&mut self, addr: SocketAddr) -> Option<PeerId> {
        let client = self.clients.values_mut().find(|client| client.addr == addr)?;
        client.last_seen = Instant::now();
        Some(client.id)
    }

    pub fn addr_of(&self, client_id: PeerId) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|client| client.addr)
    }

    pub fn account_of(&self, client_id: PeerId) -> Option<AccountId> {
        self.clients.get(&client_id).map(|client| client.account)
    }

    /// Removes peers silent for longer than the timeout, returning their ids
    pub fn check_timeouts(&mut self) -> Vec<PeerId> {
        let timeout = self.timeout;
        let timed_out: Vec<PeerId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// All peer ids and addresses, for broadcasting
    pub fn get_client_addrs(&self) -> Vec<(PeerId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn manager(max_clients: usize) -> ClientManager {
        ClientManager::new(max_clients, Duration::from_secs(5))
    }

    #[test]
    fn test_client_timeout() {
        let mut client = Client::new(1, test_addr(), 77);
        assert!(!client.is_timed_out(Duration::from_secs(1)));

        client.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_multiple_clients() {
        let mut manager = manager(3);

        assert_eq!(manager.add_client(test_addr(), 10), Some(1));
        assert_eq!(manager.add_client(test_addr2(), 20), Some(2));
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.account_of(2), Some(20));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = manager(1);

        assert!(manager.add_client(test_addr(), 10).is_some());
        assert!(manager.add_client(test_addr2(), 20).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut manager = manager(2);
        let first = manager.add_client(test_addr(), 10).unwrap();
        manager.remove_client(&first);

        let second = manager.add_client(test_addr(), 10).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_remove_nonexistent_client() {
        let mut manager = manager(2);
        assert!(!manager.remove_client(&999));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_find_and_touch_by_addr() {
        let mut manager = manager(2);
        let id = manager.add_client(test_addr(), 10).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(id));
        assert_eq!(manager.touch(test_addr()), Some(id));
        assert_eq!(manager.touch(test_addr2()), None);
        assert_eq!(manager.addr_of(id), Some(test_addr()));
    }

    #[test]
    fn test_check_timeouts_removes_silent_peers() {
        let mut manager = ClientManager::new(2, Duration::from_millis(50));
        let silent = manager.add_client(test_addr(), 10).unwrap();
        let fresh = manager.add_client(test_addr2(), 20).unwrap();

        if let Some(client) = manager.clients.get_mut(&silent) {
            client.last_seen = Instant::now() - Duration::from_secs(1);
        }

        assert_eq!(manager.check_timeouts(), vec![silent]);
        assert_eq!(manager.peer_ids(), vec![fresh]);
    }
}
