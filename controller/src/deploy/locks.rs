//! Keyed async locks for deployment transitions and host administration
//!
//! Locks are taken in a fixed order: host, then (stack, host) pair, then
//! repository. Transitions hold the host lock shared; deleting or
//! reconfiguring a host holds it exclusively. An entry is dropped from its map
//! once no handle refers to it.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

struct KeyedLocks<K, L> {
    entries: StdMutex<HashMap<K, Arc<L>>>,
}

impl<K, L> Default for KeyedLocks<K, L> {
    fn default() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, L: Default> KeyedLocks<K, L> {
    fn handle(&self, key: K) -> LockHandle<'_, K, L> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let lock = entries.entry(key.clone()).or_default().clone();
        LockHandle {
            entries: &self.entries,
            key,
            lock,
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Shared reference to one keyed lock; lock it through `Deref`
pub struct LockHandle<'a, K: Eq + Hash, L: Default> {
    entries: &'a StdMutex<HashMap<K, Arc<L>>>,
    key: K,
    lock: Arc<L>,
}

impl<K: Eq + Hash, L: Default> Deref for LockHandle<'_, K, L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.lock
    }
}

impl<K: Eq + Hash, L: Default> Drop for LockHandle<'_, K, L> {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Release our reference under the map lock so concurrent drops agree on the count
        drop(std::mem::take(&mut self.lock));
        if entries.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            entries.remove(&self.key);
        }
    }
}

#[derive(Default)]
pub struct TransitionLocks {
    hosts: KeyedLocks<Uuid, RwLock<()>>,
    pairs: KeyedLocks<(Uuid, Uuid), Mutex<()>>,
    repositories: KeyedLocks<Uuid, Mutex<()>>,
}

impl TransitionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self, host_id: Uuid) -> LockHandle<'_, Uuid, RwLock<()>> {
        self.hosts.handle(host_id)
    }

    pub fn pair(&self, stack_id: Uuid, host_id: Uuid) -> LockHandle<'_, (Uuid, Uuid), Mutex<()>> {
        self.pairs.handle((stack_id, host_id))
    }

    /// Guards the on-disk checkout of a repository
    pub fn repository(&self, repository_id: Uuid) -> LockHandle<'_, Uuid, Mutex<()>> {
        self.repositories.handle(repository_id)
    }

    /// Number of locks currently tracked
    pub fn tracked(&self) -> usize {
        self.hosts.len() + self.pairs.len() + self.repositories.len()
    }
}
