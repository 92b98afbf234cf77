// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::mapper::config::Action;
use crate::mapper::ObserverSettings;
use crate::stats::Collector;

fn make_key(name: &str) -> CacheKey {
  CacheKey {
    match_string: name.to_string(),
    mtype: MetricType::Counter,
  }
}

fn make_result(name: &str) -> Arc<MappingResult> {
  Arc::new(MappingResult {
    rule_index: 0,
    name: name.to_string(),
    labels: vec![],
    action: Action::Observe,
    ttl: None,
    observer: Arc::new(ObserverSettings::default()),
  })
}

fn assert_hit(cache: &dyn MappingCache, key: &CacheKey, name: &str) {
  match cache.get(key) {
    Some(CacheOutcome::Hit(result)) => assert_eq!(result.name, name),
    other => panic!("expected hit for {key:?}, got {other:?}"),
  }
}

#[test]
fn lru_evicts_least_recently_used() {
  let cache = LruMappingCache::new(&Collector::default().scope("test"), 2);
  cache.put(make_key("a"), Some(make_result("a")));
  cache.put(make_key("b"), Some(make_result("b")));

  // Touch "a" so that "b" is the eviction candidate.
  assert_hit(&cache, &make_key("a"), "a");
  cache.put(make_key("c"), Some(make_result("c")));

  assert_hit(&cache, &make_key("a"), "a");
  assert!(cache.get(&make_key("b")).is_none());
  assert_hit(&cache, &make_key("c"), "c");
}

#[test]
fn lru_update_existing_key_does_not_grow() {
  let cache = LruMappingCache::new(&Collector::default().scope("test"), 2);
  cache.put(make_key("a"), Some(make_result("a")));
  cache.put(make_key("a"), Some(make_result("a2")));
  cache.put(make_key("b"), Some(make_result("b")));
  assert_hit(&cache, &make_key("a"), "a2");
  assert_hit(&cache, &make_key("b"), "b");
}

#[test]
fn lru_negative_entries_expire() {
  let cache = LruMappingCache::new(&Collector::default().scope("test"), 4)
    .with_negative_residency(Duration::from_millis(5));
  cache.put(make_key("gone"), None);
  assert!(matches!(
    cache.get(&make_key("gone")),
    Some(CacheOutcome::Miss)
  ));
  std::thread::sleep(Duration::from_millis(10));
  assert!(cache.get(&make_key("gone")).is_none());
}

#[test]
fn lru_clear() {
  let cache = LruMappingCache::new(&Collector::default().scope("test"), 2);
  cache.put(make_key("a"), Some(make_result("a")));
  cache.clear();
  assert!(cache.get(&make_key("a")).is_none());
  // The cache keeps working after a clear.
  cache.put(make_key("b"), Some(make_result("b")));
  assert_hit(&cache, &make_key("b"), "b");
}

#[test]
fn lru_eviction_churn() {
  let cache = LruMappingCache::new(&Collector::default().scope("test"), 3);
  for i in 0 .. 100 {
    cache.put(make_key(&format!("key{i}")), Some(make_result("r")));
  }
  // Only the three most recent keys survive.
  for i in 0 .. 97 {
    assert!(cache.get(&make_key(&format!("key{i}"))).is_none());
  }
  for i in 97 .. 100 {
    assert_hit(&cache, &make_key(&format!("key{i}")), "r");
  }
}

#[test]
fn random_bounds_size() {
  let cache = RandomMappingCache::new(&Collector::default().scope("test"), 3);
  for i in 0 .. 100 {
    cache.put(make_key(&format!("key{i}")), Some(make_result("r")));
  }
  let live = (0 .. 100)
    .filter(|i| cache.get(&make_key(&format!("key{i}"))).is_some())
    .count();
  assert_eq!(3, live);
}

#[test]
fn random_negative_entries_expire() {
  let cache = RandomMappingCache::new(&Collector::default().scope("test"), 4)
    .with_negative_residency(Duration::from_millis(5));
  cache.put(make_key("gone"), None);
  assert!(matches!(
    cache.get(&make_key("gone")),
    Some(CacheOutcome::Miss)
  ));
  std::thread::sleep(Duration::from_millis(10));
  assert!(cache.get(&make_key("gone")).is_none());
}

#[test]
fn kind_is_part_of_the_key() {
  let cache = LruMappingCache::new(&Collector::default().scope("test"), 4);
  let counter_key = CacheKey {
    match_string: "foo".to_string(),
    mtype: MetricType::Counter,
  };
  let gauge_key = CacheKey {
    match_string: "foo".to_string(),
    mtype: MetricType::Gauge,
  };
  cache.put(counter_key.clone(), Some(make_result("foo")));
  cache.put(gauge_key.clone(), None);
  assert_hit(&cache, &counter_key, "foo");
  assert!(matches!(cache.get(&gauge_key), Some(CacheOutcome::Miss)));
}
