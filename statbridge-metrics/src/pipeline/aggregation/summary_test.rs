// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn make_summary(quantiles: Vec<f64>, max_age: Duration) -> SummaryMeasurement {
  SummaryMeasurement::new(Arc::new(ObserverSettings {
    quantiles,
    max_age,
    ..ObserverSettings::default()
  }))
}

fn unpack(value: MeasurementValue) -> (Vec<(f64, f64)>, f64, f64) {
  let MeasurementValue::Summary {
    quantiles,
    sum,
    count,
  } = value
  else {
    panic!("expected summary");
  };
  (quantiles, sum, count)
}

#[test]
fn exact_quantiles() {
  let mut summary = make_summary(vec![0.5, 0.99], Duration::from_secs(600));
  let now = Instant::now();
  for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
    summary.aggregate(value, 1.0, now);
  }
  let (quantiles, sum, count) = unpack(summary.snapshot(now));
  assert_eq!(vec![(0.5, 3.0), (0.99, 5.0)], quantiles);
  assert_eq!(15.0, sum);
  assert_eq!(5.0, count);
}

#[test]
fn weights_shift_quantiles() {
  let mut summary = make_summary(vec![0.5], Duration::from_secs(600));
  let now = Instant::now();
  summary.aggregate(1.0, 10.0, now);
  summary.aggregate(100.0, 1.0, now);
  let (quantiles, ..) = unpack(summary.snapshot(now));
  assert_eq!(vec![(0.5, 1.0)], quantiles);
}

#[test]
fn window_prunes_old_samples() {
  let mut summary = make_summary(vec![0.5], Duration::from_secs(60));
  let start = Instant::now();
  summary.aggregate(100.0, 1.0, start);
  let later = start + Duration::from_secs(120);
  summary.aggregate(1.0, 1.0, later);

  let (quantiles, sum, count) = unpack(summary.snapshot(later));
  // The old sample has aged out of the quantile window; lifetime sum and count keep it.
  assert_eq!(vec![(0.5, 1.0)], quantiles);
  assert_eq!(101.0, sum);
  assert_eq!(2.0, count);
}

#[test]
fn empty_window_is_nan() {
  let mut summary = make_summary(vec![0.5], Duration::from_secs(60));
  let (quantiles, sum, count) = unpack(summary.snapshot(Instant::now()));
  assert_eq!(1, quantiles.len());
  assert!(quantiles[0].1.is_nan());
  assert_eq!(0.0, sum);
  assert_eq!(0.0, count);
}
