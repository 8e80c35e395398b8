use blackboard_types::{GroupAddress, MessageAddress};
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Directory lookup behind attribute-based addressing
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, group: &GroupAddress) -> Vec<MessageAddress>;
}

/// Two resolutions of the same group, for detecting membership changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub old: Option<Vec<MessageAddress>>,
    pub current: Vec<MessageAddress>,
}

impl Translation {
    fn sets(&self) -> (BTreeSet<&MessageAddress>, BTreeSet<&MessageAddress>) {
        let old = self.old.iter().flatten().collect();
        let current = self.current.iter().collect();
        (old, current)
    }

    /// Whether membership differs between the two resolutions
    pub fn changed(&self) -> bool {
        self.old.is_some() && {
            let (old, current) = self.sets();
            old != current
        }
    }

    pub fn added(&self) -> Vec<MessageAddress> {
        let (old, current) = self.sets();
        current.difference(&old).map(|a| (*a).clone()).collect()
    }

    pub fn removed(&self) -> Vec<MessageAddress> {
        let (old, current) = self.sets();
        old.difference(&current).map(|a| (*a).clone()).collect()
    }
}

/// LRU cache of group resolutions, refreshed on change notifications
pub struct AddressCache {
    resolver: Arc<dyn AddressResolver>,
    cache: LruCache<GroupAddress, Translation>,
    stale: HashSet<GroupAddress>,
}

impl AddressCache {
    pub fn new(resolver: Arc<dyn AddressResolver>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver,
            cache: LruCache::new(capacity),
            stale: HashSet::new(),
        }
    }

    pub fn resolve(&mut self, group: &GroupAddress) -> Vec<MessageAddress> {
        if !self.stale.contains(group) {
            if let Some(translation) = self.cache.get(group) {
                return translation.current.clone();
            }
        }
        let current = self.resolver.resolve(group);
        let old = self.cache.peek(group).map(|t| t.current.clone());
        self.stale.remove(group);
        self.insert(
            group.clone(),
            Translation {
                old,
                current: current.clone(),
            },
        );
        current
    }

    /// Cache a translation, forgetting staleness of whatever the LRU evicts
    fn insert(&mut self, group: GroupAddress, translation: Translation) {
        if let Some((evicted, _)) = self.cache.push(group.clone(), translation) {
            if evicted != group {
                self.stale.remove(&evicted);
            }
        }
    }

    pub fn invalidate(&mut self, group: &GroupAddress) {
        if self.cache.contains(group) {
            self.stale.insert(group.clone());
        }
    }

    /// Re-resolve cached groups and return those whose membership moved
    pub fn refresh(&mut self, groups: &[GroupAddress]) -> Vec<(GroupAddress, Translation)> {
        let mut changed = Vec::new();
        for group in groups {
            let Some(previous) = self.cache.peek(group).map(|t| t.current.clone()) else {
                continue;
            };
            let translation = Translation {
                old: Some(previous),
                current: self.resolver.resolve(group),
            };
            self.stale.remove(group);
            if translation.changed() {
                changed.push((group.clone(), translation.clone()));
            }
            self.insert(group.clone(), translation);
        }
        changed
    }

    pub fn translation(&self, group: &GroupAddress) -> Option<&Translation> {
        self.cache.peek(group)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// In-memory resolver, editable at runtime
#[derive(Debug, Default)]
pub struct StaticResolver {
    groups: RwLock<HashMap<GroupAddress, Vec<MessageAddress>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, group: GroupAddress, members: Vec<MessageAddress>) {
        self.groups.write().insert(group, members);
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, group: &GroupAddress) -> Vec<MessageAddress> {
        self.groups.read().get(group).cloned().unwrap_or_default()
    }
}
