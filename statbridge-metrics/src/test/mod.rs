// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::protos::metric::{Event, MetricId, MetricType, TagValue};

#[must_use]
pub fn make_tag(tag: &'static str, value: &'static str) -> TagValue {
  TagValue {
    tag: tag.into(),
    value: value.into(),
  }
}

#[must_use]
pub fn make_id(name: &'static str, tags: &[(&'static str, &'static str)]) -> MetricId {
  MetricId::new(
    name.into(),
    tags.iter().map(|(tag, value)| make_tag(tag, value)).collect(),
    false,
  )
}

#[must_use]
pub fn make_event(
  name: &'static str,
  tags: &[(&'static str, &'static str)],
  mtype: MetricType,
  value: f64,
  sample_rate: f64,
) -> Event {
  Event::new(make_id(name, tags), mtype, value, sample_rate)
}

#[must_use]
pub fn make_counter(name: &'static str, value: f64) -> Event {
  make_event(name, &[], MetricType::Counter, value, 1.0)
}

#[must_use]
pub fn make_gauge(name: &'static str, value: f64) -> Event {
  make_event(name, &[], MetricType::Gauge, value, 1.0)
}

#[must_use]
pub fn make_timer(name: &'static str, value: f64) -> Event {
  make_event(name, &[], MetricType::Timer, value, 1.0)
}
