//! Session-scoped user id to display name cache.
//!
//! Both the history path and the push path resolve authors through one
//! [`ProfileCache`], so a user seen on both paths is looked up once. Ids
//! already being looked up are joined rather than re-requested. Entries
//! never expire; [`ProfileCache::clear`] drops everything on logout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use coursechat_proto::message::{DisplayName, UserId};
use coursechat_proto::wire::Profile;

use crate::transport::{AuthProvider, Directory, authorized};

/// Memoizes directory lookups for the lifetime of a session.
pub struct ProfileCache<D> {
    directory: Arc<D>,
    entries: RwLock<HashMap<UserId, Profile>>,
    /// Ids with a lookup in flight; the receiver flips to `true` when done.
    in_flight: Mutex<HashMap<UserId, watch::Receiver<bool>>>,
    /// Bumped by [`clear`](Self::clear); lookups started under an older
    /// generation discard their results.
    generation: AtomicU64,
}

/// Ids this caller is looking up. Released on drop, including when the
/// lookup future is cancelled.
struct InFlightClaim<'a> {
    in_flight: &'a Mutex<HashMap<UserId, watch::Receiver<bool>>>,
    users: Vec<UserId>,
    done: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        for user in &self.users {
            // A clear() may have handed the id to a newer lookup.
            if in_flight
                .get(user)
                .is_some_and(|rx| rx.same_channel(&self.done_rx))
            {
                in_flight.remove(user);
            }
        }
        self.done.send_replace(true);
    }
}

impl<D> std::fmt::Debug for ProfileCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileCache")
            .field("entries", &self.entries.read().len())
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl<D> ProfileCache<D>
where
    D: Directory + AuthProvider + 'static,
{
    /// Creates an empty cache backed by `directory`.
    pub fn new(directory: Arc<D>) -> Self {
        Self {
            directory,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the cached name, or the placeholder. Never blocks.
    pub fn get_cached(&self, user: UserId) -> DisplayName {
        self.entries
            .read()
            .get(&user)
            .map_or(DisplayName::Placeholder, |p| {
                DisplayName::Known(p.display_name.clone())
            })
    }

    /// Returns the cached profile, if any.
    pub fn profile(&self, user: UserId) -> Option<Profile> {
        self.entries.read().get(&user).cloned()
    }

    /// Returns the cached name immediately and starts a background lookup
    /// when the id is unknown.
    pub fn resolve(self: &Arc<Self>, user: UserId) -> DisplayName {
        let name = self.get_cached(user);
        if !name.is_known() {
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                cache.prefetch([user]).await;
            });
        }
        name
    }

    /// Starts a batched [`prefetch`](Self::prefetch) in the background.
    pub fn spawn_prefetch(self: &Arc<Self>, users: Vec<UserId>) -> JoinHandle<Vec<Profile>> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.prefetch(users).await })
    }

    /// Resolves one id, waiting for the lookup if needed.
    pub async fn resolve_now(&self, user: UserId) -> DisplayName {
        self.prefetch([user]).await;
        self.get_cached(user)
    }

    /// Looks up every id not already cached in a single batch and returns
    /// the profiles known afterwards for the requested ids.
    ///
    /// Each id is requested at most once per batch. Ids another caller is
    /// already looking up are awaited instead of re-requested. Failed
    /// lookups are not cached, so a later batch retries them.
    pub async fn prefetch(&self, users: impl IntoIterator<Item = UserId>) -> Vec<Profile> {
        let requested: Vec<UserId> = {
            let mut seen = HashSet::new();
            users.into_iter().filter(|u| seen.insert(*u)).collect()
        };

        let mut to_await = Vec::new();
        let (claim, generation) = {
            let entries = self.entries.read();
            let mut in_flight = self.in_flight.lock();
            let generation = self.generation.load(Ordering::Acquire);
            let (done, done_rx) = watch::channel(false);
            let mut users = Vec::new();
            for user in &requested {
                if entries.contains_key(user) {
                    continue;
                }
                if let Some(rx) = in_flight.get(user) {
                    to_await.push(rx.clone());
                } else {
                    in_flight.insert(*user, done_rx.clone());
                    users.push(*user);
                }
            }
            let claim = InFlightClaim {
                in_flight: &self.in_flight,
                users,
                done,
                done_rx,
            };
            (claim, generation)
        };

        if !claim.users.is_empty() {
            self.lookup_batch(&claim.users, generation).await;
        }
        drop(claim);

        for mut rx in to_await {
            let _ = rx.wait_for(|done| *done).await;
        }

        let entries = self.entries.read();
        requested
            .iter()
            .filter_map(|u| entries.get(u).cloned())
            .collect()
    }

    async fn lookup_batch(&self, users: &[UserId], generation: u64) {
        let directory = &*self.directory;
        match authorized(directory, move |token| directory.lookup_profiles(token, users)).await {
            Ok(profiles) => {
                tracing::debug!(
                    requested = users.len(),
                    resolved = profiles.len(),
                    "profile batch resolved"
                );
                let mut entries = self.entries.write();
                if self.generation.load(Ordering::Acquire) != generation {
                    tracing::debug!(
                        requested = users.len(),
                        "profile batch discarded, cache cleared meanwhile"
                    );
                    return;
                }
                for profile in profiles {
                    entries.insert(profile.user_id, profile);
                }
            }
            Err(e) => {
                tracing::warn!(requested = users.len(), error = %e, "profile lookup failed");
            }
        }
    }

    /// Drops every cached profile (logout).
    ///
    /// Lookups still in flight are abandoned: their results are discarded
    /// and the ids they held can be requested again right away.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
        self.in_flight.lock().clear();
        drop(entries);
        tracing::info!("profile cache cleared");
    }

    /// Number of cached profiles.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
