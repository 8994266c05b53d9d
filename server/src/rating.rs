//! Boundary to the reward/rating subsystem
//!
//! The coordinator only knows the [`RatingService`] contract. Computing a
//! duel outcome is asynchronous: the returned future is driven on the tokio
//! runtime while the tick loop keeps going.

use crate::error::RewardError;
use log::debug;
use shared::AccountId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub const DEFAULT_RATING: i32 = 1000;

/// New rating values after one finalized challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingOutcome {
    pub winner_rating: i32,
    pub loser_rating: i32,
}

pub trait RatingService: Send + Sync {
    /// Computes updated ratings for a decided challenge. Called at most once
    /// per finalized challenge, and only when both sides are still connected.
    fn compute_duel_outcome(
        &self,
        winner: AccountId,
        loser: AccountId,
    ) -> BoxFuture<Result<RatingOutcome, RewardError>>;

    /// Periodic time-based stipend for everyone connected
    fn grant_upkeep(&self, _accounts: &[AccountId]) {}

    fn initial_rating(&self) -> i32 {
        DEFAULT_RATING
    }
}

/// In-memory Elo ratings, the default collaborator of the server binary
#[derive(Debug, Clone)]
pub struct LocalRatingService {
    ratings: Arc<Mutex<HashMap<AccountId, i32>>>,
    k_factor: f64,
}

impl LocalRatingService {
    pub fn new() -> Self {
        Self {
            ratings: Arc::new(Mutex::new(HashMap::new())),
            k_factor: 32.0,
        }
    }

    pub async fn rating_of(&self, account: AccountId) -> i32 {
        let ratings = self.ratings.lock().await;
        ratings.get(&account).copied().unwrap_or(DEFAULT_RATING)
    }
}

impl Default for LocalRatingService {
    fn default() -> Self {
        Self::new()
    }
}

/// Points moved from loser to winner
pub fn elo_delta(winner_rating: i32, loser_rating: i32, k_factor: f64) -> i32 {
    let expected = 1.0 / (1.0 + 10f64.powf(f64::from(loser_rating - winner_rating) / 400.0));
    (k_factor * (1.0 - expected)).round() as i32
}

impl RatingService for LocalRatingService {
    fn compute_duel_outcome(
        &self,
        winner: AccountId,
        loser: AccountId,
    ) -> BoxFuture<Result<RatingOutcome, RewardError>> {
        let ratings = Arc::clone(&self.ratings);
        let k_factor = self.k_factor;

        Box::pin(async move {
            let mut ratings = ratings.lock().await;
            let winner_rating = ratings.get(&winner).copied().unwrap_or(DEFAULT_RATING);
            let loser_rating = ratings.get(&loser).copied().unwrap_or(DEFAULT_RATING);

            let delta = elo_delta(winner_rating, loser_rating, k_factor);
            let outcome = RatingOutcome {
                winner_rating: winner_rating + delta,
                loser_rating: loser_rating - delta,
            };

            ratings.insert(winner, outcome.winner_rating);
            ratings.insert(loser, outcome.loser_rating);
            debug!(
                "Rated duel: account {} -> {}, account {} -> {}",
                winner, outcome.winner_rating, loser, outcome.loser_rating
            );
            Ok(outcome)
        })
    }

    fn grant_upkeep(&self, accounts: &[AccountId]) {
        debug!("Upkeep stipend for {} accounts", accounts.len());
    }
}
