//! Bounded, TTL-boxed cache of participant profiles. The remote profile
//! service stays authoritative; everything here is disposable.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use storage::{now_millis, CachedProfile, Store, StoredParticipant};

use crate::api::ProfileService;

pub const CACHE_TTL_MS: i64 = 24 * 60 * 60 * 1000;
pub const MAX_CACHE_SIZE: i64 = 500;
/// Evicting a little past the limit avoids running cleanup on every write.
const EVICTION_SLACK: i64 = 50;
/// Background refreshes run on a bounded pool so a bursty conversation list
/// cannot fan out unbounded fetches.
const MAX_BACKGROUND_REFRESHES: usize = 4;

pub struct ProfileCache {
    store: Store,
    service: Arc<dyn ProfileService>,
    refresh_permits: Arc<Semaphore>,
}

impl ProfileCache {
    pub fn new(store: Store, service: Arc<dyn ProfileService>) -> Arc<Self> {
        Arc::new(Self {
            store,
            service,
            refresh_permits: Arc::new(Semaphore::new(MAX_BACKGROUND_REFRESHES)),
        })
    }

    /// Cached entry if present, otherwise a synchronous fetch. `None` means
    /// the user is unknown both locally and remotely; callers render a
    /// fallback.
    pub async fn get(&self, user_id: &str) -> Option<CachedProfile> {
        match self.store.cached_profile(user_id).await {
            Ok(Some(profile)) => return Some(profile),
            Ok(None) => {}
            Err(err) => {
                warn!(user_id, error = %err, "profile cache lookup failed");
                return None;
            }
        }
        match self.fetch_and_cache(user_id).await {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(user_id, error = %err, "profile fetch failed");
                None
            }
        }
    }

    /// Returns whatever is cached immediately. Placeholder or stale entries
    /// additionally kick off a background refresh that never blocks the
    /// caller; a miss kicks one off and returns `None`.
    pub async fn get_or_refresh(
        self: &Arc<Self>,
        user_id: &str,
        max_age_ms: i64,
    ) -> Option<CachedProfile> {
        let cached = match self.store.cached_profile(user_id).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(user_id, error = %err, "profile cache lookup failed");
                return None;
            }
        };
        match cached {
            Some(profile) => {
                let age = now_millis() - profile.last_updated;
                if is_placeholder(&profile) || age > max_age_ms {
                    self.spawn_refresh(user_id);
                }
                Some(profile)
            }
            None => {
                self.spawn_refresh(user_id);
                None
            }
        }
    }

    /// Fire-and-forget refresh. Skipped when the pool is saturated; a
    /// redundant refresh is an idempotent upsert, a missing one heals on the
    /// next access.
    pub fn spawn_refresh(self: &Arc<Self>, user_id: &str) {
        let Ok(permit) = Arc::clone(&self.refresh_permits).try_acquire_owned() else {
            debug!(user_id, "refresh pool saturated, skipping");
            return;
        };
        let cache = Arc::clone(self);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = cache.fetch_and_cache(&user_id).await {
                debug!(user_id, error = %err, "background profile refresh failed");
            }
        });
    }

    /// Fetches from the profile service and writes both the cache row and
    /// the participant projection, preserving known presence fields. A fetch
    /// failure leaves any existing cached value untouched.
    pub async fn fetch_and_cache(&self, user_id: &str) -> Result<CachedProfile> {
        let profile = self.service.fetch_profile(user_id).await?;
        let existing = self.store.participant(user_id).await?;
        let now = now_millis();

        let participant = StoredParticipant {
            user_id: profile.user_id.clone(),
            name: profile
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| "User".to_string()),
            avatar_url: profile
                .profile_picture_url
                .clone()
                .or_else(|| existing.as_ref().and_then(|p| p.avatar_url.clone())),
            is_online: existing.as_ref().is_some_and(|p| p.is_online),
            last_seen: existing.as_ref().and_then(|p| p.last_seen),
            last_updated: now,
        };
        self.store.upsert_participant(&participant).await?;

        let cached = CachedProfile {
            user_id: participant.user_id.clone(),
            username: profile.name,
            avatar_url: profile.profile_picture_url,
            is_online: participant.is_online,
            last_seen: participant.last_seen,
            cached_at: now,
            last_updated: now,
        };
        self.store.upsert_profile(&cached).await?;
        debug!(user_id, "cached participant profile");

        if let Err(err) = self.cleanup().await {
            warn!(error = %err, "profile cache maintenance failed");
        }
        Ok(cached)
    }

    async fn cleanup(&self) -> Result<()> {
        let expired = self
            .store
            .delete_expired_profiles(now_millis() - CACHE_TTL_MS)
            .await?;
        if expired > 0 {
            debug!(expired, "purged expired profile entries");
        }

        let size = self.store.profile_cache_size().await?;
        if size > MAX_CACHE_SIZE {
            let evicted = self
                .store
                .delete_oldest_profiles(size - MAX_CACHE_SIZE + EVICTION_SLACK)
                .await?;
            debug!(evicted, "evicted oldest profile entries");
        }
        Ok(())
    }
}

fn is_placeholder(profile: &CachedProfile) -> bool {
    let nameless = profile
        .username
        .as_deref()
        .map_or(true, |name| name.trim().is_empty() || name == "User");
    let avatarless = profile
        .avatar_url
        .as_deref()
        .map_or(true, str::is_empty);
    nameless || avatarless
}

#[cfg(test)]
#[path = "tests/profiles_tests.rs"]
mod tests;
