// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use ahash::AHashSet;

//
// SetMeasurement
//

// Unique observed values, exported as a cardinality.
#[derive(Default)]
pub(super) struct SetMeasurement {
  values: AHashSet<String>,
}

impl SetMeasurement {
  pub fn insert(&mut self, value: &str) {
    if !self.values.contains(value) {
      self.values.insert(value.to_string());
    }
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }
}
