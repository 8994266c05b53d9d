//! # Duel Client Library
//!
//! Client side of the arena: a headless console client that mirrors what the
//! server announces and lets a player challenge, accept and fight duels.
//!
//! ## Module Organization
//!
//! ### Duel Module (`duel`)
//! The per-player duel facade:
//! - Inbound and outbound request tracking with local countdowns
//! - Turning "interact" on the focused entity into a request or an accept
//! - Lifecycle events for whatever presentation subscribes
//!
//! ### Input Module (`input`)
//! Parses console lines into commands (`focus`, `interact`, `attack`,
//! `status`, `quit`).
//!
//! ### Network Module (`network`)
//! UDP connection to the server, packet decoding and the client loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:8080", 42).await?;
//!
//!     // Every duel lifecycle change, for a custom presentation layer
//!     let mut events = client.duel_mut().subscribe();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{}", event);
//!         }
//!     });
//!
//!     client.run().await
//! }
//! ```
//!
//! ## Server Authority
//! Nothing the client mirrors is trusted by the server. Countdowns and the
//! "accept or request" choice are conveniences for the player; the server
//! validates every request and accept on its own.

pub mod duel;
pub mod input;
pub mod network;
