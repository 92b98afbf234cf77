// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;

#[test]
fn scaled_sum() {
  let mut counter = CounterMeasurement::default();
  counter.aggregate(3.0, 1.0);
  assert_eq!(3.0, counter.value());
  counter.aggregate(2.0, 0.5);
  assert_eq!(7.0, counter.value());
  counter.aggregate(1.0, 0.1);
  assert!((counter.value() - 17.0).abs() < 1e-9);
}
