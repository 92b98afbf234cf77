// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./summary_test.rs"]
mod summary_test;

use super::MeasurementValue;
use crate::mapper::ObserverSettings;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

struct Sample {
  at: Instant,
  value: f64,
  weight: f64,
}

//
// SummaryMeasurement
//

// Configured quantiles over a sliding max_age window. Samples are kept verbatim and pruned as
// they age out; quantiles are computed exactly at snapshot time over the surviving window,
// weighted by 1/sample_rate. Sum and count are running totals over the measurement's lifetime,
// matching the summary exposition convention.
pub(super) struct SummaryMeasurement {
  settings: Arc<ObserverSettings>,
  samples: VecDeque<Sample>,
  sum: f64,
  count: f64,
}

impl SummaryMeasurement {
  pub fn new(settings: Arc<ObserverSettings>) -> Self {
    Self {
      settings,
      samples: VecDeque::new(),
      sum: 0.0,
      count: 0.0,
    }
  }

  pub fn aggregate(&mut self, sample: f64, weight: f64, now: Instant) {
    self.prune(now);
    self.samples.push_back(Sample {
      at: now,
      value: sample,
      weight,
    });
    self.sum += sample * weight;
    self.count += weight;
  }

  fn prune(&mut self, now: Instant) {
    let max_age = self.settings.max_age;
    while self
      .samples
      .front()
      .is_some_and(|sample| now.duration_since(sample.at) > max_age)
    {
      self.samples.pop_front();
    }
  }

  pub fn snapshot(&mut self, now: Instant) -> MeasurementValue {
    self.prune(now);

    let mut ordered: Vec<(f64, f64)> = self
      .samples
      .iter()
      .map(|sample| (sample.value, sample.weight))
      .collect();
    ordered.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total_weight: f64 = ordered.iter().map(|(_, weight)| weight).sum();

    let quantiles = self
      .settings
      .quantiles
      .iter()
      .map(|quantile| (*quantile, weighted_quantile(&ordered, total_weight, *quantile)))
      .collect();

    MeasurementValue::Summary {
      quantiles,
      sum: self.sum,
      count: self.count,
    }
  }
}

// An empty window exports NaN, the summary convention for "no observations".
fn weighted_quantile(ordered: &[(f64, f64)], total_weight: f64, quantile: f64) -> f64 {
  if ordered.is_empty() || total_weight <= 0.0 {
    return f64::NAN;
  }
  let target = quantile * total_weight;
  let mut cumulative = 0.0;
  for (value, weight) in ordered {
    cumulative += weight;
    if cumulative >= target {
      return *value;
    }
  }
  ordered[ordered.len() - 1].0
}
