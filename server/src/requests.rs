//! Pending duel challenges between unordered pairs of peers
//!
//! At most one request exists per unordered pair. The registry knows nothing
//! about running sessions; the coordinator checks duel membership before it
//! registers anything.

use crate::error::DuelRejection;
use log::debug;
use shared::PeerId;
use std::collections::HashMap;

/// Unordered pair key, smaller id first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PairKey(PeerId, PeerId);

impl PairKey {
    fn new(a: PeerId, b: PeerId) -> Self {
        if a <= b {
            PairKey(a, b)
        } else {
            PairKey(b, a)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuelRequest {
    pub requester: PeerId,
    pub requestee: PeerId,
    /// Coordinator clock value after which the request is discarded
    pub expires_at: f64,
}

impl DuelRequest {
    pub fn involves(&self, peer: PeerId) -> bool {
        self.requester == peer || self.requestee == peer
    }
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    requests: HashMap<PairKey, DuelRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new challenge. Refused when the pair already has one, in
    /// either direction, or when a peer targets itself.
    pub fn register(
        &mut self,
        requester: PeerId,
        requestee: PeerId,
        expires_at: f64,
    ) -> Result<&DuelRequest, DuelRejection> {
        if requester == requestee {
            return Err(DuelRejection::SelfTarget(requester));
        }

        let key = PairKey::new(requester, requestee);
        if self.requests.contains_key(&key) {
            return Err(DuelRejection::RequestExists(requester, requestee));
        }

        debug!(
            "Registered duel request {} -> {} (expires at {:.2})",
            requester, requestee, expires_at
        );
        Ok(self.requests.entry(key).or_insert(DuelRequest {
            requester,
            requestee,
            expires_at,
        }))
    }

    /// Removes and returns the request only if `requester` really challenged
    /// `requestee`
    pub fn try_consume(&mut self, requester: PeerId, requestee: PeerId) -> Option<DuelRequest> {
        let key = PairKey::new(requester, requestee);
        match self.requests.get(&key) {
            Some(request) if request.requester == requester => self.requests.remove(&key),
            _ => None,
        }
    }

    /// Drops every request whose expiry has passed, returning them
    pub fn expire_stale(&mut self, now: f64) -> Vec<DuelRequest> {
        let stale: Vec<PairKey> = self
            .requests
            .iter()
            .filter(|(_, request)| request.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.requests.remove(&key))
            .inspect(|request| {
                debug!(
                    "Duel request {} -> {} expired",
                    request.requester, request.requestee
                )
            })
            .collect()
    }

    /// Purges any request naming `peer` on either side
    pub fn remove_involving(&mut self, peer: PeerId) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, request| !request.involves(peer));
        before - self.requests.len()
    }

    pub fn get(&self, a: PeerId, b: PeerId) -> Option<&DuelRequest> {
        self.requests.get(&PairKey::new(a, b))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
