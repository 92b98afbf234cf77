// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;

fn make_histogram(buckets: Vec<f64>) -> HistogramMeasurement {
  HistogramMeasurement::new(Arc::new(ObserverSettings {
    buckets,
    ..ObserverSettings::default()
  }))
}

#[test]
fn cumulative_buckets() {
  let mut histogram = make_histogram(vec![1.0, 2.0, 5.0]);
  histogram.aggregate(0.5, 1.0);
  histogram.aggregate(1.5, 1.0);
  histogram.aggregate(10.0, 1.0);

  let MeasurementValue::Histogram {
    buckets,
    sum,
    count,
  } = histogram.snapshot()
  else {
    panic!("expected histogram");
  };
  assert_eq!(vec![(1.0, 1.0), (2.0, 2.0), (5.0, 2.0)], buckets);
  assert_eq!(12.0, sum);
  assert_eq!(3.0, count);
}

#[test]
fn boundary_is_inclusive() {
  let mut histogram = make_histogram(vec![1.0, 2.0]);
  histogram.aggregate(1.0, 1.0);
  let MeasurementValue::Histogram { buckets, .. } = histogram.snapshot() else {
    panic!("expected histogram");
  };
  assert_eq!(vec![(1.0, 1.0), (2.0, 1.0)], buckets);
}

#[test]
fn sampled_observations_are_weighted() {
  let mut histogram = make_histogram(vec![1.0]);
  histogram.aggregate(0.5, 4.0);

  let MeasurementValue::Histogram {
    buckets,
    sum,
    count,
  } = histogram.snapshot()
  else {
    panic!("expected histogram");
  };
  assert_eq!(vec![(1.0, 4.0)], buckets);
  assert_eq!(2.0, sum);
  assert_eq!(4.0, count);
}
