//! # Duel Server Library
//!
//! This library provides the authoritative server for a shared arena in
//! which players can challenge each other to isolated, real-time duels while
//! everyone else keeps playing around them.
//!
//! ## Core Responsibilities
//!
//! ### Matchmaking
//! Players challenge whatever avatar they are focusing. A challenge lives
//! for a bounded time and is accepted by interacting back with the
//! challenger. At most one request exists per pair of players.
//!
//! ### Session Lifecycle
//! An accepted challenge becomes a duel session with its own isolated side.
//! Rounds go through a preparation countdown, the fight itself and a short
//! ending delay, then either a rematch or the final result.
//!
//! ### Results and Ratings
//! Finished duels update win/loss counters right away. Ratings come from an
//! asynchronous rating service whose answer is folded back into the tick
//! loop once it arrives.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! All duel state is owned and mutated by one [`coordinator::Coordinator`]
//! driven from the server's tick loop. Hooks and ticks never run
//! concurrently, so no duel state needs locking.
//!
//! ### Command Queue
//! The coordinator never touches sockets or the arena. It queues
//! [`coordinator::DuelCommand`]s which the network layer applies after every
//! hook and tick.
//!
//! ## Module Organization
//!
//! ### Duel Core
//! - `requests`: pending challenges keyed by unordered peer pair
//! - `session`: phase machine of a single duel
//! - `team_pool`: recyclable isolated sides
//! - `coordinator`: owner of all of the above, and the tick phases
//! - `rating`: boundary to the asynchronous rating service
//!
//! ### Hosting
//! - `game`: avatars, health and team contexts of the arena
//! - `client_manager`: connected peers, addresses and timeouts
//! - `network`: UDP tasks and the main loop
//! - `config`, `error`: construction-time settings and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::rating::LocalRatingService;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 30Hz tick loop with room for 32 peers
//!     let config = ServerConfig::new("127.0.0.1:8080", 30, 32);
//!     let mut server = Server::new(config, Arc::new(LocalRatingService::new())).await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod game;
pub mod network;
pub mod rating;
pub mod requests;
pub mod session;
pub mod team_pool;
