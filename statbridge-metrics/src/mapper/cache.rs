// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./cache_test.rs"]
mod cache_test;

use super::MappingResult;
use crate::protos::metric::MetricType;
use crate::stats::Scope;
use ahash::AHashMap;
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Negative (miss) entries stay resident for less time than hits so that a rule added on reload
// of an upstream system cannot be shadowed for long by a stale miss.
const NEGATIVE_RESIDENCY: Duration = Duration::from_secs(30);

const NIL: usize = usize::MAX;

//
// CacheType
//

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheType {
  Lru,
  Random,
}

impl std::str::FromStr for CacheType {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "lru" => Ok(Self::Lru),
      "random" => Ok(Self::Random),
      _ => Err(anyhow::anyhow!("unsupported cache type '{s}'")),
    }
  }
}

// A size of 0 disables caching entirely.
#[must_use]
pub fn make_cache(
  scope: &Scope,
  cache_type: CacheType,
  max_size: usize,
) -> Option<Arc<dyn MappingCache>> {
  if max_size == 0 {
    return None;
  }
  Some(match cache_type {
    CacheType::Lru => Arc::new(LruMappingCache::new(scope, max_size)),
    CacheType::Random => Arc::new(RandomMappingCache::new(scope, max_size)),
  })
}

//
// CacheKey
//

// The exact synthesized match string plus the event kind. Keying on the kind keeps rules with
// a match_metric_type filter from observing results cached for another kind.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
  pub match_string: String,
  pub mtype: MetricType,
}

//
// CacheOutcome
//

#[derive(Clone, Debug)]
pub enum CacheOutcome {
  Hit(Arc<MappingResult>),
  Miss,
}

#[derive(Clone, Debug)]
enum CachedValue {
  Hit(Arc<MappingResult>),
  Miss(Instant),
}

impl CachedValue {
  fn outcome(&self, negative_residency: Duration) -> Option<CacheOutcome> {
    match self {
      Self::Hit(result) => Some(CacheOutcome::Hit(result.clone())),
      Self::Miss(inserted) if inserted.elapsed() < negative_residency => Some(CacheOutcome::Miss),
      Self::Miss(_) => None,
    }
  }
}

//
// MappingCache
//

pub trait MappingCache: Send + Sync {
  fn get(&self, key: &CacheKey) -> Option<CacheOutcome>;
  fn put(&self, key: CacheKey, value: Option<Arc<MappingResult>>);
  // Invalidate everything. Called on configuration reload.
  fn clear(&self);
}

//
// CacheStats
//

struct CacheStats {
  hits: IntCounter,
  misses: IntCounter,
  size: IntGauge,
}

impl CacheStats {
  fn new(scope: &Scope) -> Self {
    Self {
      hits: scope.counter("cache_hits_total"),
      misses: scope.counter("cache_misses_total"),
      size: scope.gauge("cache_size"),
    }
  }
}

//
// LruMappingCache
//

struct Slot {
  key: CacheKey,
  value: CachedValue,
  prev: usize,
  next: usize,
}

// Arena doubly-linked list over the slot vector. head is most recently used, tail is the
// eviction candidate. Freed slots are recycled through the free list.
struct LruInner {
  map: AHashMap<CacheKey, usize>,
  slots: Vec<Slot>,
  free: Vec<usize>,
  head: usize,
  tail: usize,
}

impl LruInner {
  fn detach(&mut self, index: usize) {
    let (prev, next) = (self.slots[index].prev, self.slots[index].next);
    if prev == NIL {
      self.head = next;
    } else {
      self.slots[prev].next = next;
    }
    if next == NIL {
      self.tail = prev;
    } else {
      self.slots[next].prev = prev;
    }
  }

  fn push_front(&mut self, index: usize) {
    self.slots[index].prev = NIL;
    self.slots[index].next = self.head;
    if self.head == NIL {
      self.tail = index;
    } else {
      self.slots[self.head].prev = index;
    }
    self.head = index;
  }

  fn remove(&mut self, index: usize) {
    self.detach(index);
    let key = self.slots[index].key.clone();
    self.map.remove(&key);
    self.free.push(index);
  }

  fn alloc(&mut self, key: CacheKey, value: CachedValue) -> usize {
    let slot = Slot {
      key,
      value,
      prev: NIL,
      next: NIL,
    };
    if let Some(index) = self.free.pop() {
      self.slots[index] = slot;
      index
    } else {
      self.slots.push(slot);
      self.slots.len() - 1
    }
  }
}

pub struct LruMappingCache {
  max_size: usize,
  negative_residency: Duration,
  stats: CacheStats,
  locked: Mutex<LruInner>,
}

impl LruMappingCache {
  #[must_use]
  pub fn new(scope: &Scope, max_size: usize) -> Self {
    assert!(max_size > 0);
    Self {
      max_size,
      negative_residency: NEGATIVE_RESIDENCY,
      stats: CacheStats::new(scope),
      locked: Mutex::new(LruInner {
        map: AHashMap::new(),
        slots: Vec::new(),
        free: Vec::new(),
        head: NIL,
        tail: NIL,
      }),
    }
  }

  #[cfg(test)]
  fn with_negative_residency(mut self, negative_residency: Duration) -> Self {
    self.negative_residency = negative_residency;
    self
  }
}

impl MappingCache for LruMappingCache {
  fn get(&self, key: &CacheKey) -> Option<CacheOutcome> {
    let mut inner = self.locked.lock();
    let Some(&index) = inner.map.get(key) else {
      self.stats.misses.inc();
      return None;
    };
    match inner.slots[index].value.outcome(self.negative_residency) {
      Some(outcome) => {
        inner.detach(index);
        inner.push_front(index);
        self.stats.hits.inc();
        Some(outcome)
      },
      None => {
        inner.remove(index);
        self.stats.size.set(inner.map.len().try_into().unwrap());
        self.stats.misses.inc();
        None
      },
    }
  }

  fn put(&self, key: CacheKey, value: Option<Arc<MappingResult>>) {
    let value = value.map_or_else(|| CachedValue::Miss(Instant::now()), CachedValue::Hit);
    let mut inner = self.locked.lock();
    if let Some(&index) = inner.map.get(&key) {
      inner.slots[index].value = value;
      inner.detach(index);
      inner.push_front(index);
      return;
    }

    if inner.map.len() >= self.max_size {
      let tail = inner.tail;
      inner.remove(tail);
    }
    let index = inner.alloc(key.clone(), value);
    inner.map.insert(key, index);
    inner.push_front(index);
    self.stats.size.set(inner.map.len().try_into().unwrap());
  }

  fn clear(&self) {
    let mut inner = self.locked.lock();
    inner.map.clear();
    inner.slots.clear();
    inner.free.clear();
    inner.head = NIL;
    inner.tail = NIL;
    self.stats.size.set(0);
  }
}

//
// RandomMappingCache
//

// Uniform-random replacement: cheaper bookkeeping than LRU at the cost of occasionally evicting
// a hot entry.
pub struct RandomMappingCache {
  max_size: usize,
  negative_residency: Duration,
  stats: CacheStats,
  locked: Mutex<AHashMap<CacheKey, CachedValue>>,
}

impl RandomMappingCache {
  #[must_use]
  pub fn new(scope: &Scope, max_size: usize) -> Self {
    assert!(max_size > 0);
    Self {
      max_size,
      negative_residency: NEGATIVE_RESIDENCY,
      stats: CacheStats::new(scope),
      locked: Mutex::new(AHashMap::new()),
    }
  }

  #[cfg(test)]
  fn with_negative_residency(mut self, negative_residency: Duration) -> Self {
    self.negative_residency = negative_residency;
    self
  }
}

impl MappingCache for RandomMappingCache {
  fn get(&self, key: &CacheKey) -> Option<CacheOutcome> {
    let mut map = self.locked.lock();
    let Some(value) = map.get(key) else {
      self.stats.misses.inc();
      return None;
    };
    match value.outcome(self.negative_residency) {
      Some(outcome) => {
        self.stats.hits.inc();
        Some(outcome)
      },
      None => {
        map.remove(key);
        self.stats.size.set(map.len().try_into().unwrap());
        self.stats.misses.inc();
        None
      },
    }
  }

  fn put(&self, key: CacheKey, value: Option<Arc<MappingResult>>) {
    let value = value.map_or_else(|| CachedValue::Miss(Instant::now()), CachedValue::Hit);
    let mut map = self.locked.lock();
    if !map.contains_key(&key) && map.len() >= self.max_size {
      let victim = rand::thread_rng().gen_range(0 .. map.len());
      if let Some(victim) = map.keys().nth(victim).cloned() {
        map.remove(&victim);
      }
    }
    map.insert(key, value);
    self.stats.size.set(map.len().try_into().unwrap());
  }

  fn clear(&self) {
    self.locked.lock().clear();
    self.stats.size.set(0);
  }
}
