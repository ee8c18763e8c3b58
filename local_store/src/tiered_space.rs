use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use write_lib::{SessionId, SessionTracker, SpaceReserver, WriteError, WriteResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(alias = "name")]
    pub alias: String,
    #[serde(alias = "size_limit")]
    pub capacity: u64,
}

impl TierConfig {
    pub fn new(alias: impl Into<String>, capacity: u64) -> Self {
        Self {
            alias: alias.into(),
            capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierUsage {
    pub alias: String,
    pub capacity: u64,
    pub used: u64,
}

struct Tier {
    alias: String,
    capacity: u64,
    used: u64,
}

/// Bytes a target holds on each tier, by tier index.
type Holding = HashMap<usize, u64>;

struct SpaceInner {
    tiers: Vec<Tier>,
    reservations: HashMap<(SessionId, String), Holding>,
}

impl SpaceInner {
    fn give_back(&mut self, holding: &Holding) {
        for (index, bytes) in holding.iter() {
            if let Some(tier) = self.tiers.get_mut(*index) {
                tier.used = tier.used.saturating_sub(*bytes);
            }
        }
    }
}

/// Temporary space reservations over an ordered list of storage tiers.
///
/// A reservation is taken from the first tier, top-down, that can hold it
/// whole. Reserved bytes count as used until they are settled, released or
/// dropped with their session.
pub struct TieredSpaceManager {
    inner: Mutex<SpaceInner>,
}

impl TieredSpaceManager {
    pub fn new(tiers: &[TierConfig]) -> WriteResult<Self> {
        if tiers.is_empty() {
            return Err(WriteError::InvalidConfig(
                "at least one storage tier is required".to_string(),
            ));
        }
        let tiers = tiers
            .iter()
            .map(|t| Tier {
                alias: t.alias.clone(),
                capacity: t.capacity,
                used: 0,
            })
            .collect();
        Ok(Self {
            inner: Mutex::new(SpaceInner {
                tiers,
                reservations: HashMap::new(),
            }),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, SpaceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tier_usage(&self) -> Vec<TierUsage> {
        self.lock_inner()
            .tiers
            .iter()
            .map(|t| TierUsage {
                alias: t.alias.clone(),
                capacity: t.capacity,
                used: t.used,
            })
            .collect()
    }

    pub fn reserved_bytes(&self, session_id: SessionId, target_id: &str) -> u64 {
        self.lock_inner()
            .reservations
            .get(&(session_id, target_id.to_string()))
            .map(|holding| holding.values().sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SpaceReserver for TieredSpaceManager {
    async fn reserve(
        &self,
        session_id: SessionId,
        target_id: &str,
        additional_bytes: u64,
    ) -> WriteResult<()> {
        let mut inner = self.lock_inner();
        let Some(index) = inner
            .tiers
            .iter()
            .position(|t| t.capacity.saturating_sub(t.used) >= additional_bytes)
        else {
            warn!(
                "TieredSpaceManager: no tier can hold {} bytes for {} {}",
                additional_bytes, session_id, target_id
            );
            return Err(WriteError::CapacityExhausted(format!(
                "no tier has {} free bytes for {}",
                additional_bytes, target_id
            )));
        };

        inner.tiers[index].used += additional_bytes;
        *inner
            .reservations
            .entry((session_id, target_id.to_string()))
            .or_default()
            .entry(index)
            .or_insert(0) += additional_bytes;
        debug!(
            "TieredSpaceManager: reserved {} bytes on {} for {} {}",
            additional_bytes, inner.tiers[index].alias, session_id, target_id
        );
        Ok(())
    }

    async fn settle(
        &self,
        session_id: SessionId,
        target_id: &str,
        kept_bytes: u64,
    ) -> WriteResult<()> {
        let mut inner = self.lock_inner();
        let Some(mut holding) = inner
            .reservations
            .remove(&(session_id, target_id.to_string()))
        else {
            return Ok(());
        };

        // return the excess from the lowest tiers first
        let mut excess = holding.values().sum::<u64>().saturating_sub(kept_bytes);
        let mut indexes: Vec<usize> = holding.keys().copied().collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let mut returned = Holding::new();
        for index in indexes {
            if excess == 0 {
                break;
            }
            let held = holding.entry(index).or_insert(0);
            let give = (*held).min(excess);
            *held -= give;
            excess -= give;
            returned.insert(index, give);
        }
        inner.give_back(&returned);
        debug!(
            "TieredSpaceManager: settled {} {} at {} bytes",
            session_id, target_id, kept_bytes
        );
        Ok(())
    }

    async fn release(&self, session_id: SessionId, target_id: &str) -> WriteResult<()> {
        let mut inner = self.lock_inner();
        if let Some(holding) = inner
            .reservations
            .remove(&(session_id, target_id.to_string()))
        {
            inner.give_back(&holding);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionTracker for TieredSpaceManager {
    async fn cleanup_session(&self, session_id: SessionId) -> WriteResult<()> {
        let mut inner = self.lock_inner();
        let keys: Vec<(SessionId, String)> = inner
            .reservations
            .keys()
            .filter(|(session, _)| *session == session_id)
            .cloned()
            .collect();
        let mut freed = 0u64;
        for key in keys {
            if let Some(holding) = inner.reservations.remove(&key) {
                freed += holding.values().sum::<u64>();
                inner.give_back(&holding);
            }
        }
        info!(
            "TieredSpaceManager: cleanup {} freed {} bytes",
            session_id, freed
        );
        Ok(())
    }
}
