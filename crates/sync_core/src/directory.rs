use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use shared::domain::{Profile, UserId};
use tracing::debug;

use crate::{error::EngineError, ProfileSource};

/// Lazily-populated cache of participant profiles.
///
/// Entries are created on first miss, overwritten on re-fetch, and never
/// evicted for the engine's lifetime.
pub struct ParticipantDirectory {
    source: Arc<dyn ProfileSource>,
    cache: HashMap<UserId, Profile>,
}

impl ParticipantDirectory {
    pub fn new(source: Arc<dyn ProfileSource>) -> Self {
        Self {
            source,
            cache: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Cache read; never reaches the profile source.
    pub fn get(&self, user_id: &UserId) -> Option<&Profile> {
        self.cache.get(user_id)
    }

    /// Resolve `user_ids`, fetching all uncached ids in one batched lookup.
    ///
    /// Nothing is cached when the lookup fails.
    pub async fn resolve(
        &mut self,
        user_ids: &HashSet<UserId>,
    ) -> Result<HashMap<UserId, Profile>, EngineError> {
        let missing: HashSet<UserId> = user_ids
            .iter()
            .filter(|id| !self.cache.contains_key(*id))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let fetched = self
                .source
                .fetch_profiles(missing)
                .await
                .map_err(EngineError::FetchFailed)?;
            debug!(count = fetched.len(), "merged fetched profiles");
            self.cache.extend(fetched);
        }

        Ok(user_ids
            .iter()
            .filter_map(|id| self.cache.get(id).map(|p| (id.clone(), p.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;

    struct TestProfileSource {
        profiles: HashMap<UserId, Profile>,
        fail_with: Option<String>,
        fetches: Arc<Mutex<Vec<HashSet<UserId>>>>,
    }

    impl TestProfileSource {
        fn with_users(names: &[&str]) -> Self {
            Self {
                profiles: names
                    .iter()
                    .map(|name| (UserId::new(*name), profile(name)))
                    .collect(),
                fail_with: None,
                fetches: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing(err: impl Into<String>) -> Self {
            Self {
                profiles: HashMap::new(),
                fail_with: Some(err.into()),
                fetches: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ProfileSource for TestProfileSource {
        async fn fetch_profiles(
            &self,
            user_ids: HashSet<UserId>,
        ) -> Result<HashMap<UserId, Profile>> {
            self.fetches.lock().await.push(user_ids.clone());
            if let Some(err) = &self.fail_with {
                return Err(anyhow!(err.clone()));
            }
            Ok(user_ids
                .iter()
                .filter_map(|id| self.profiles.get(id).map(|p| (id.clone(), p.clone())))
                .collect())
        }
    }

    fn profile(name: &str) -> Profile {
        Profile {
            user_id: UserId::new(name),
            display_name: name.to_uppercase(),
            avatar_url: None,
        }
    }

    fn user_set(names: &[&str]) -> HashSet<UserId> {
        names.iter().map(|name| UserId::new(*name)).collect()
    }

    #[tokio::test]
    async fn resolves_misses_in_one_batched_lookup() {
        let source = TestProfileSource::with_users(&["alice", "bob"]);
        let fetches = source.fetches.clone();
        let mut directory = ParticipantDirectory::new(Arc::new(source));

        let resolved = directory
            .resolve(&user_set(&["alice", "bob"]))
            .await
            .expect("resolve");
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved[&UserId::new("alice")].display_name,
            "ALICE"
        );

        let fetches = fetches.lock().await;
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0], user_set(&["alice", "bob"]));
    }

    #[tokio::test]
    async fn cached_ids_never_refetch() {
        let source = TestProfileSource::with_users(&["alice", "bob"]);
        let fetches = source.fetches.clone();
        let mut directory = ParticipantDirectory::new(Arc::new(source));

        directory.resolve(&user_set(&["alice"])).await.expect("first");
        directory
            .resolve(&user_set(&["alice", "bob"]))
            .await
            .expect("second");

        let fetches = fetches.lock().await;
        assert_eq!(fetches.len(), 2);
        // the second lookup only carried the miss
        assert_eq!(fetches[1], user_set(&["bob"]));
    }

    #[tokio::test]
    async fn failed_lookups_cache_nothing() {
        let source = TestProfileSource::failing("directory offline");
        let mut directory = ParticipantDirectory::new(Arc::new(source));

        let err = directory
            .resolve(&user_set(&["alice"]))
            .await
            .expect_err("lookup must fail");
        assert!(matches!(err, EngineError::FetchFailed(_)));
        assert!(directory.is_empty());
        assert!(directory.get(&UserId::new("alice")).is_none());
    }

    #[tokio::test]
    async fn get_is_a_pure_cache_read() {
        let source = TestProfileSource::with_users(&["alice"]);
        let fetches = source.fetches.clone();
        let directory = ParticipantDirectory::new(Arc::new(source));

        assert!(directory.get(&UserId::new("alice")).is_none());
        assert!(fetches.lock().await.is_empty());
    }
}
