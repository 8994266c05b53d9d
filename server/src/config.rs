//! Configuration handed to the server and the duel coordinator at construction

use serde::{Deserialize, Serialize};
use shared::{
    DUEL_PREPARATION_TIME, DUEL_REQUEST_GRACE, DUEL_REQUEST_TIMEOUT, DUEL_ROUND_END_DELAY,
    DUEL_WIN_THRESHOLD, UPKEEP_INTERVAL,
};
use std::time::Duration;

/// Timings and scoring rules for duels. All durations are in seconds of
/// simulated time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuelConfig {
    /// How long a request stays acceptable from the requestee's point of view
    pub request_timeout: f32,
    /// Extra server-side tolerance that absorbs message latency
    pub request_grace: f32,
    pub preparation_duration: f32,
    pub round_end_delay: f32,
    /// Round wins needed to take the challenge
    pub win_threshold: u32,
    pub upkeep_interval: f32,
}

impl DuelConfig {
    /// Lifetime of a request on the server, grace included
    pub fn request_lifetime(&self) -> f64 {
        f64::from(self.request_timeout) + f64::from(self.request_grace)
    }
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            request_timeout: DUEL_REQUEST_TIMEOUT,
            request_grace: DUEL_REQUEST_GRACE,
            preparation_duration: DUEL_PREPARATION_TIME,
            round_end_delay: DUEL_ROUND_END_DELAY,
            win_threshold: DUEL_WIN_THRESHOLD,
            upkeep_interval: UPKEEP_INTERVAL,
        }
    }
}

/// Settings for the network server binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tick_duration: Duration,
    pub max_clients: usize,
    pub client_timeout: Duration,
    /// NPC avatars spawned into the open arena at startup
    pub bots: usize,
    pub duel: DuelConfig,
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>, tick_rate: u32, max_clients: usize) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            tick_duration: Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32),
            max_clients,
            client_timeout: Duration::from_secs(5),
            bots: 0,
            duel: DuelConfig::default(),
        }
    }
}
