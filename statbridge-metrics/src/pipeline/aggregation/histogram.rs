// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./histogram_test.rs"]
mod histogram_test;

use super::MeasurementValue;
use crate::mapper::ObserverSettings;
use std::sync::Arc;

//
// HistogramMeasurement
//

// Fixed-boundary histogram. Bucket counts are kept cumulative: a sample increments every
// bucket whose upper bound is at or above it, with the implicit +Inf bucket carried by the
// total count. Sampled observations weigh in at 1/rate.
pub(super) struct HistogramMeasurement {
  settings: Arc<ObserverSettings>,
  counts: Vec<f64>,
  sum: f64,
  count: f64,
}

impl HistogramMeasurement {
  pub fn new(settings: Arc<ObserverSettings>) -> Self {
    let counts = vec![0.0; settings.buckets.len()];
    Self {
      settings,
      counts,
      sum: 0.0,
      count: 0.0,
    }
  }

  pub fn aggregate(&mut self, sample: f64, weight: f64) {
    self.count += weight;
    self.sum += sample * weight;
    for (index, bound) in self.settings.buckets.iter().enumerate() {
      if sample <= *bound {
        self.counts[index] += weight;
      }
    }
  }

  pub fn snapshot(&self) -> MeasurementValue {
    MeasurementValue::Histogram {
      buckets: self
        .settings
        .buckets
        .iter()
        .zip(self.counts.iter())
        .map(|(bound, count)| (*bound, *count))
        .collect(),
      sum: self.sum,
      count: self.count,
    }
  }
}
