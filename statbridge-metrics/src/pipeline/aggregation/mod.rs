// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

mod counter;
mod gauge;
mod histogram;
mod set;
mod summary;

use self::counter::CounterMeasurement;
use self::gauge::GaugeMeasurement;
use self::histogram::HistogramMeasurement;
use self::set::SetMeasurement;
use self::summary::SummaryMeasurement;
use crate::mapper::config::{Action, ObserverType};
use crate::mapper::{MappingResult, MetricMapper, ObserverSettings, valid_label_key};
use crate::pipeline::event::EventQueue;
use crate::protos::metric::{Event, MetricType};
use crate::stats::Scope;
use ahash::AHashMap;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec};
use std::collections::BTreeMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

//
// MeasurementValue
//

// Kind-specific scrape payload for one live measurement.
#[derive(Clone, Debug, PartialEq)]
pub enum MeasurementValue {
  Counter(f64),
  Gauge(f64),
  Histogram {
    // (upper bound, cumulative count) pairs; +Inf is implied by count.
    buckets: Vec<(f64, f64)>,
    sum: f64,
    count: f64,
  },
  Summary {
    quantiles: Vec<(f64, f64)>,
    sum: f64,
    count: f64,
  },
  Set {
    size: usize,
  },
}

impl MeasurementValue {
  #[must_use]
  pub const fn kind(&self) -> &'static str {
    match self {
      Self::Counter(_) => "counter",
      Self::Gauge(_) => "gauge",
      Self::Histogram { .. } => "histogram",
      Self::Summary { .. } => "summary",
      Self::Set { .. } => "set",
    }
  }
}

//
// MeasurementSnapshot
//

#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementSnapshot {
  pub name: String,
  pub labels: Vec<(String, String)>,
  pub value: MeasurementValue,
}

//
// AggregatorHandle
//

pub struct SnapshotRequest {
  reply: oneshot::Sender<Vec<MeasurementSnapshot>>,
}

pub type SnapshotReceiver = mpsc::Receiver<SnapshotRequest>;

// Scrape-side handle. The snapshot is taken on the aggregator task itself, so scrapes never
// touch the measurement map from another task.
#[derive(Clone)]
pub struct AggregatorHandle {
  sender: mpsc::Sender<SnapshotRequest>,
}

impl AggregatorHandle {
  pub async fn snapshot(&self) -> Vec<MeasurementSnapshot> {
    let (reply, receiver) = oneshot::channel();
    if self.sender.send(SnapshotRequest { reply }).await.is_err() {
      return vec![];
    }
    receiver.await.unwrap_or_default()
  }
}

//
// Measurement
//

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MeasurementKind {
  Counter,
  Gauge,
  Histogram,
  Summary,
  Set,
}

impl MeasurementKind {
  const fn as_str(self) -> &'static str {
    match self {
      Self::Counter => "counter",
      Self::Gauge => "gauge",
      Self::Histogram => "histogram",
      Self::Summary => "summary",
      Self::Set => "set",
    }
  }
}

// The measurement variant an event of this kind must fold into, given the matched rule's
// observer settings.
const fn required_kind(mtype: MetricType, observer: &ObserverSettings) -> MeasurementKind {
  match mtype {
    MetricType::Counter => MeasurementKind::Counter,
    MetricType::Gauge | MetricType::DeltaGauge => MeasurementKind::Gauge,
    MetricType::Timer | MetricType::Histogram | MetricType::Distribution => {
      match observer.observer_type {
        ObserverType::Histogram => MeasurementKind::Histogram,
        ObserverType::Summary => MeasurementKind::Summary,
      }
    },
    MetricType::Set => MeasurementKind::Set,
  }
}

enum Measurement {
  Counter(CounterMeasurement),
  Gauge(GaugeMeasurement),
  Histogram(HistogramMeasurement),
  Summary(SummaryMeasurement),
  Set(SetMeasurement),
}

impl Measurement {
  fn new(kind: MeasurementKind, observer: &Arc<ObserverSettings>) -> Self {
    match kind {
      MeasurementKind::Counter => Self::Counter(CounterMeasurement::default()),
      MeasurementKind::Gauge => Self::Gauge(GaugeMeasurement::default()),
      MeasurementKind::Histogram => Self::Histogram(HistogramMeasurement::new(observer.clone())),
      MeasurementKind::Summary => Self::Summary(SummaryMeasurement::new(observer.clone())),
      MeasurementKind::Set => Self::Set(SetMeasurement::default()),
    }
  }

  const fn kind(&self) -> MeasurementKind {
    match self {
      Self::Counter(_) => MeasurementKind::Counter,
      Self::Gauge(_) => MeasurementKind::Gauge,
      Self::Histogram(_) => MeasurementKind::Histogram,
      Self::Summary(_) => MeasurementKind::Summary,
      Self::Set(_) => MeasurementKind::Set,
    }
  }

  fn fold(&mut self, event: &Event, now: Instant) {
    match self {
      Self::Counter(counter) => counter.aggregate(event.value, event.sample_rate),
      Self::Gauge(gauge) => {
        if event.mtype() == MetricType::DeltaGauge {
          gauge.add(event.value);
        } else {
          gauge.set(event.value);
        }
      },
      Self::Histogram(histogram) => histogram.aggregate(event.value, 1.0 / event.sample_rate),
      Self::Summary(summary) => summary.aggregate(event.value, 1.0 / event.sample_rate, now),
      Self::Set(set) => set.insert(&event.value.to_string()),
    }
  }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct MeasurementKey {
  name: String,
  labels: Vec<(String, String)>,
}

struct MeasurementEntry {
  measurement: Measurement,
  expires_at: Option<Instant>,
}

//
// Aggregator
//

struct Stats {
  events: IntCounterVec,
  unmapped: IntCounter,
  actions: IntCounterVec,
  conflicts: IntCounterVec,
  errors: IntCounterVec,
  metrics: IntGaugeVec,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    Self {
      events: scope.counter_vec("events_total", &["type"]),
      unmapped: scope.counter("events_unmapped_total"),
      actions: scope.counter_vec("events_actions_total", &["action"]),
      conflicts: scope.counter_vec("events_conflict_total", &["type", "metric_name"]),
      errors: scope.counter_vec("events_error_total", &["reason"]),
      metrics: scope.gauge_vec("metrics_total", &["type"]),
    }
  }
}

// Owns the live measurement map. Runs as a single consumer task: events arrive through the
// event queue, scrapes through the snapshot channel, so no lock guards the map.
pub struct Aggregator {
  mapper: Arc<MetricMapper>,
  measurements: AHashMap<MeasurementKey, MeasurementEntry>,
  stats: Stats,
}

impl Aggregator {
  #[must_use]
  pub fn new(
    scope: &Scope,
    mapper: Arc<MetricMapper>,
  ) -> (Self, AggregatorHandle, SnapshotReceiver) {
    let (sender, receiver) = mpsc::channel(8);
    (
      Self {
        mapper,
        measurements: AHashMap::new(),
        stats: Stats::new(scope),
      },
      AggregatorHandle { sender },
      receiver,
    )
  }

  pub async fn run(mut self, queue: Arc<EventQueue>, mut snapshots: SnapshotReceiver) {
    loop {
      tokio::select! {
        batch = queue.next_batch() => match batch {
          Some(events) => {
            for event in &events {
              self.observe(event);
            }
          },
          None => break,
        },
        Some(request) = snapshots.recv() => {
          let _ignored = request.reply.send(self.snapshot());
        },
      }
    }
    log::debug!("aggregator drained, exiting");
  }

  fn observe(&mut self, event: &Event) {
    self
      .stats
      .events
      .with_label_values(&[event.mtype().as_str()])
      .inc();

    let Some(mapping) = self.mapper.get_mapping(event.id(), event.mtype()) else {
      self.stats.unmapped.inc();
      return;
    };
    if mapping.action == Action::Drop {
      self.stats.actions.with_label_values(&["drop"]).inc();
      return;
    }
    self.stats.actions.with_label_values(&["observe"]).inc();

    let key = MeasurementKey {
      name: mapping.name.clone(),
      labels: self.render_labels(event, &mapping),
    };
    let required = required_kind(event.mtype(), &mapping.observer);
    let now = Instant::now();

    match self.measurements.entry(key) {
      Entry::Vacant(vacant) => {
        let mut measurement = Measurement::new(required, &mapping.observer);
        measurement.fold(event, now);
        self
          .stats
          .metrics
          .with_label_values(&[required.as_str()])
          .inc();
        vacant.insert(MeasurementEntry {
          measurement,
          expires_at: mapping.ttl.map(|ttl| now + ttl),
        });
      },
      Entry::Occupied(mut occupied) => {
        let entry = occupied.get_mut();
        if entry.measurement.kind() != required {
          log::debug!(
            "conflicting kind for '{}': event {} vs measurement {}",
            mapping.name,
            event.mtype().as_str(),
            entry.measurement.kind().as_str()
          );
          self
            .stats
            .conflicts
            .with_label_values(&[event.mtype().as_str(), &mapping.name])
            .inc();
          return;
        }
        entry.measurement.fold(event, now);
        entry.expires_at = mapping.ttl.map(|ttl| now + ttl);
      },
    }
  }

  // Event tags pass through as base labels; non-empty rendered rule labels override them. Tag
  // keys outside the label grammar are dropped and counted, they never fail the event.
  fn render_labels(&self, event: &Event, mapping: &MappingResult) -> Vec<(String, String)> {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    for tag in event.id().tags() {
      let key = String::from_utf8_lossy(&tag.tag).into_owned();
      if !valid_label_key(&key) {
        log::debug!("dropping tag with invalid label key '{key}'");
        self
          .stats
          .errors
          .with_label_values(&["invalid_label"])
          .inc();
        continue;
      }
      labels.insert(key, String::from_utf8_lossy(&tag.value).into_owned());
    }
    for (key, value) in &mapping.labels {
      if value.is_empty() {
        labels.entry(key.clone()).or_default();
      } else {
        labels.insert(key.clone(), value.clone());
      }
    }
    labels.into_iter().collect()
  }

  // Point-in-time view for the scrape handler. Expired measurements are evicted lazily here.
  fn snapshot(&mut self) -> Vec<MeasurementSnapshot> {
    let now = Instant::now();
    let stats = &self.stats;
    self.measurements.retain(|key, entry| {
      let live = entry.expires_at.is_none_or(|expires_at| expires_at > now);
      if !live {
        log::debug!("expiring measurement '{}'", key.name);
        stats
          .metrics
          .with_label_values(&[entry.measurement.kind().as_str()])
          .dec();
      }
      live
    });

    let mut out: Vec<MeasurementSnapshot> = self
      .measurements
      .iter_mut()
      .map(|(key, entry)| MeasurementSnapshot {
        name: key.name.clone(),
        labels: key.labels.clone(),
        value: match &mut entry.measurement {
          Measurement::Counter(counter) => MeasurementValue::Counter(counter.value()),
          Measurement::Gauge(gauge) => MeasurementValue::Gauge(gauge.value()),
          Measurement::Histogram(histogram) => histogram.snapshot(),
          Measurement::Summary(summary) => summary.snapshot(now),
          Measurement::Set(set) => MeasurementValue::Set { size: set.len() },
        },
      })
      .collect();
    out.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
    out
  }
}
