use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Utc};

/// Insertion-ordered set capped at `cap` entries. When the cap is exceeded,
/// the oldest half is evicted. Used for the soft caches in §3/§5: losing an
/// entry never violates safety because the Host's durable state is
/// authoritative for everything these caches remember.
#[derive(Debug, Clone)]
pub struct BoundedSet<T: Eq + Hash + Clone> {
    order: VecDeque<T>,
    members: HashSet<T>,
    cap: usize,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            cap,
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.members.contains(item)
    }

    pub fn insert(&mut self, item: T) {
        if self.members.contains(&item) {
            return;
        }
        self.order.push_back(item.clone());
        self.members.insert(item);
        if self.order.len() > self.cap {
            let evict = self.cap / 2;
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.members.remove(&old);
                } else {
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Insertion-ordered map capped at `cap` entries, same eviction policy as
/// [`BoundedSet`]. Used for `pending_assignments` and `recovery_last_attempt`.
#[derive(Debug, Clone)]
pub struct BoundedMap<K: Eq + Hash + Clone, V> {
    order: VecDeque<K>,
    entries: HashMap<K, V>,
    cap: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            cap,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &K) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    pub fn insert(&mut self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, value);
        if self.order.len() > self.cap {
            let evict = self.cap / 2;
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.entries.remove(&old);
                } else {
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// `true` once `since` is at least `window_secs` in the past.
pub fn elapsed_at_least(since: DateTime<Utc>, window_secs: i64, now: DateTime<Utc>) -> bool {
    (now - since).num_seconds() >= window_secs
}
