// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::shutdown::ComponentShutdownTrigger;
use crate::stats::Collector;
use crate::test::{make_counter, make_event, make_gauge, make_timer};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn make_aggregator(yaml: &str) -> (Aggregator, AggregatorHandle, SnapshotReceiver) {
  let scope = Collector::default().scope("test");
  let mapper = Arc::new(MetricMapper::new(&scope, None));
  if !yaml.is_empty() {
    mapper.init_from_yaml(yaml).unwrap();
  }
  Aggregator::new(&scope, mapper)
}

const FOO_RULE: &str = r"
mappings:
- match: foo.*
  name: foo_$1
";

fn counter_value(snapshot: &[MeasurementSnapshot], name: &str) -> Option<f64> {
  snapshot.iter().find(|m| m.name == name).map(|m| match m.value {
    MeasurementValue::Counter(value) => value,
    ref other => panic!("expected counter for {name}, got {other:?}"),
  })
}

#[test]
fn unmapped_events_are_counted_not_exported() {
  let (mut aggregator, ..) = make_aggregator("");
  aggregator.observe(&make_counter("foo.bar", 1.0));
  assert_eq!(1, aggregator.stats.unmapped.get());
  assert!(aggregator.snapshot().is_empty());
}

#[test]
fn mapped_counter_is_exported() {
  let (mut aggregator, ..) = make_aggregator(FOO_RULE);
  aggregator.observe(&make_counter("foo.bar", 3.0));
  let snapshot = aggregator.snapshot();
  assert_eq!(Some(3.0), counter_value(&snapshot, "foo_bar"));
  assert_eq!(1, aggregator.stats.metrics.with_label_values(&["counter"]).get());
}

#[test]
fn sampled_counter_scales_and_conflict_preserves() {
  let (mut aggregator, ..) = make_aggregator(FOO_RULE);
  aggregator.observe(&make_event(
    "foo.bar",
    &[],
    MetricType::Counter,
    2.0,
    0.5,
  ));
  assert_eq!(Some(4.0), counter_value(&aggregator.snapshot(), "foo_bar"));

  // A gauge for the same output key is rejected and the counter survives.
  aggregator.observe(&make_gauge("foo.bar", 7.0));
  assert_eq!(
    1,
    aggregator
      .stats
      .conflicts
      .with_label_values(&["gauge", "foo_bar"])
      .get()
  );
  assert_eq!(Some(4.0), counter_value(&aggregator.snapshot(), "foo_bar"));
}

#[test]
fn counter_total_is_rate_scaled_sum() {
  let (mut aggregator, ..) = make_aggregator(FOO_RULE);
  let samples = [(3.0, 1.0), (2.0, 0.5), (1.0, 0.25), (5.0, 1.0)];
  for (value, rate) in samples {
    aggregator.observe(&make_event("foo.bar", &[], MetricType::Counter, value, rate));
  }
  let expected: f64 = samples.iter().map(|(value, rate)| value / rate).sum();
  assert_eq!(Some(expected), counter_value(&aggregator.snapshot(), "foo_bar"));
}

#[test]
fn earlier_rule_wins_with_its_captures() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: a.*.c
  name: first_$1
- match: a.b.*
  name: second_$1
",
  );
  aggregator.observe(&make_counter("a.b.c", 1.0));
  let snapshot = aggregator.snapshot();
  assert_eq!(Some(1.0), counter_value(&snapshot, "first_b"));
  assert!(counter_value(&snapshot, "second_c").is_none());
}

#[test]
fn dogstatsd_tags_become_labels() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: req
  name: req
  labels:
    env: $env
",
  );
  aggregator.observe(&make_event(
    "req",
    &[("env", "prod"), ("svc", "api")],
    MetricType::Counter,
    1.0,
    1.0,
  ));
  let snapshot = aggregator.snapshot();
  assert_eq!(1, snapshot.len());
  assert_eq!("req", snapshot[0].name);
  assert_eq!(
    vec![
      ("env".to_string(), "prod".to_string()),
      ("svc".to_string(), "api".to_string()),
    ],
    snapshot[0].labels
  );
  assert_eq!(MeasurementValue::Counter(1.0), snapshot[0].value);
}

#[test]
fn rule_labels_override_event_tags() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: req
  name: req
  labels:
    env: forced
",
  );
  aggregator.observe(&make_event(
    "req",
    &[("env", "prod")],
    MetricType::Counter,
    1.0,
    1.0,
  ));
  let snapshot = aggregator.snapshot();
  assert_eq!(
    vec![("env".to_string(), "forced".to_string())],
    snapshot[0].labels
  );
}

#[test]
fn invalid_tag_keys_are_dropped_and_counted() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: req
  name: req
",
  );
  aggregator.observe(&make_event(
    "req",
    &[("bad-key", "x"), ("env", "prod")],
    MetricType::Counter,
    1.0,
    1.0,
  ));
  let snapshot = aggregator.snapshot();
  assert_eq!(
    vec![("env".to_string(), "prod".to_string())],
    snapshot[0].labels
  );
  assert_eq!(
    1,
    aggregator
      .stats
      .errors
      .with_label_values(&["invalid_label"])
      .get()
  );
}

#[test]
fn drop_action_counts_and_skips() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: noisy.*
  name: noisy
  action: drop
",
  );
  aggregator.observe(&make_counter("noisy.thing", 1.0));
  assert_eq!(
    1,
    aggregator.stats.actions.with_label_values(&["drop"]).get()
  );
  assert_eq!(0, aggregator.stats.unmapped.get());
  assert!(aggregator.snapshot().is_empty());
}

#[test]
fn gauge_set_and_delta() {
  let (mut aggregator, ..) = make_aggregator(FOO_RULE);
  aggregator.observe(&make_gauge("foo.g", 5.0));
  aggregator.observe(&make_event("foo.g", &[], MetricType::DeltaGauge, -2.0, 1.0));
  aggregator.observe(&make_event("foo.g", &[], MetricType::DeltaGauge, 1.0, 1.0));
  let snapshot = aggregator.snapshot();
  assert_eq!(MeasurementValue::Gauge(4.0), snapshot[0].value);
}

#[test]
fn timer_observes_into_histogram() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: lat.*
  name: lat_$1
  buckets: [1.0, 5.0]
",
  );
  aggregator.observe(&make_timer("lat.web", 0.5));
  aggregator.observe(&make_event("lat.web", &[], MetricType::Timer, 3.0, 0.5));
  let snapshot = aggregator.snapshot();
  assert_eq!(
    MeasurementValue::Histogram {
      buckets: vec![(1.0, 1.0), (5.0, 3.0)],
      sum: 0.5 + 3.0 * 2.0,
      count: 3.0,
    },
    snapshot[0].value
  );
}

#[test]
fn distribution_uses_rule_buckets() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: size.*
  name: size_$1
  buckets: [10.0, 100.0]
",
  );
  aggregator.observe(&make_event(
    "size.payload",
    &[],
    MetricType::Distribution,
    50.0,
    1.0,
  ));
  let snapshot = aggregator.snapshot();
  assert_eq!(
    MeasurementValue::Histogram {
      buckets: vec![(10.0, 0.0), (100.0, 1.0)],
      sum: 50.0,
      count: 1.0,
    },
    snapshot[0].value
  );
}

#[test]
fn summary_timer_type() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: lat.*
  name: lat_$1
  timer_type: summary
  quantiles: [0.5]
",
  );
  for value in [1.0, 2.0, 3.0] {
    aggregator.observe(&make_timer("lat.web", value));
  }
  let snapshot = aggregator.snapshot();
  let MeasurementValue::Summary {
    ref quantiles,
    sum,
    count,
  } = snapshot[0].value
  else {
    panic!("expected summary");
  };
  assert_eq!(&vec![(0.5, 2.0)], quantiles);
  assert_eq!(6.0, sum);
  assert_eq!(3.0, count);
}

#[test]
fn set_exports_cardinality() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: users.*
  name: users_$1
",
  );
  for value in [1.0, 2.0, 1.0] {
    aggregator.observe(&make_event("users.active", &[], MetricType::Set, value, 1.0));
  }
  let snapshot = aggregator.snapshot();
  assert_eq!(MeasurementValue::Set { size: 2 }, snapshot[0].value);
}

#[test]
fn ttl_expires_lazily_at_snapshot() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: foo.*
  name: foo_$1
  ttl: 5ms
",
  );
  aggregator.observe(&make_counter("foo.bar", 1.0));
  assert_eq!(1, aggregator.snapshot().len());

  std::thread::sleep(Duration::from_millis(10));
  assert!(aggregator.snapshot().is_empty());
  assert_eq!(0, aggregator.stats.metrics.with_label_values(&["counter"]).get());
}

#[test]
fn observation_refreshes_ttl() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: foo.*
  name: foo_$1
  ttl: 40ms
",
  );
  aggregator.observe(&make_counter("foo.bar", 1.0));
  std::thread::sleep(Duration::from_millis(25));
  aggregator.observe(&make_counter("foo.bar", 1.0));
  std::thread::sleep(Duration::from_millis(25));
  // 50ms after the first observation but only 25ms after the refresh.
  assert_eq!(1, aggregator.snapshot().len());
}

#[test]
fn every_event_has_exactly_one_outcome() {
  let (mut aggregator, ..) = make_aggregator(
    r"
mappings:
- match: drop.*
  name: dropped
  action: drop
- match: keep.*
  name: keep_$1
",
  );
  aggregator.observe(&make_counter("keep.a", 1.0));
  aggregator.observe(&make_counter("drop.a", 1.0));
  aggregator.observe(&make_counter("unknown.a", 1.0));
  aggregator.observe(&make_gauge("keep.a", 1.0));

  let events: u64 = 4;
  let observed_updates = 1;
  let conflicts = 1;
  let dropped = 1;
  let unmapped = 1;
  assert_eq!(
    events,
    aggregator.stats.events.with_label_values(&["counter"]).get()
      + aggregator.stats.events.with_label_values(&["gauge"]).get()
  );
  assert_eq!(unmapped, aggregator.stats.unmapped.get());
  assert_eq!(
    dropped,
    aggregator.stats.actions.with_label_values(&["drop"]).get()
  );
  assert_eq!(
    conflicts,
    aggregator
      .stats
      .conflicts
      .with_label_values(&["gauge", "keep_a"])
      .get()
  );
  assert_eq!(observed_updates, aggregator.snapshot().len());
}

#[tokio::test]
async fn run_loop_end_to_end() {
  let (aggregator, handle, snapshots) = make_aggregator(FOO_RULE);
  let trigger = ComponentShutdownTrigger::default();
  let queue = EventQueue::new(
    &Collector::default().scope("test"),
    10,
    1,
    Duration::from_millis(50),
    trigger.make_shutdown(),
  );
  let task = tokio::spawn(aggregator.run(queue.clone(), snapshots));

  queue.queue(vec![make_counter("foo.bar", 3.0)]);
  let mut exported = None;
  for _ in 0 .. 100 {
    let snapshot = handle.snapshot().await;
    if let Some(value) = counter_value(&snapshot, "foo_bar") {
      exported = Some(value);
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  assert_eq!(Some(3.0), exported);

  // Shutdown drains the queue and ends the run loop.
  trigger.shutdown().await;
  task.await.unwrap();
  assert!(handle.snapshot().await.is_empty());
}
