// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

//
// Collector
//

// Owns the registry that all internal stats are registered into. The admin server gathers it
// for the scrape endpoint.
#[derive(Clone, Default)]
pub struct Collector {
  registry: Registry,
}

impl Collector {
  #[must_use]
  pub fn scope(&self, name: &str) -> Scope {
    Scope {
      registry: self.registry.clone(),
      prefix: name.to_string(),
    }
  }

  #[must_use]
  pub const fn registry(&self) -> &Registry {
    &self.registry
  }
}

//
// Scope
//

// A named scope within the collector. Stat names are the scope prefix joined to the local name
// with '_'. Components build their Stats structs from a scope handed down at construction.
#[derive(Clone)]
pub struct Scope {
  registry: Registry,
  prefix: String,
}

impl Scope {
  #[must_use]
  pub fn scope(&self, name: &str) -> Self {
    Self {
      registry: self.registry.clone(),
      prefix: format!("{}_{name}", self.prefix),
    }
  }

  fn full_name(&self, name: &str) -> String {
    format!("{}_{name}", self.prefix)
  }

  // Registration failures (duplicate names) leave a working but unexported stat. This only
  // happens if two components ask for the same fully scoped name.
  fn register<C: prometheus::core::Collector + Clone + 'static>(&self, c: &C) {
    if let Err(e) = self.registry.register(Box::new(c.clone())) {
      log::debug!("stat registration failed: {e}");
    }
  }

  #[must_use]
  pub fn counter(&self, name: &str) -> IntCounter {
    let full = self.full_name(name);
    let counter = IntCounter::new(full.clone(), full).unwrap();
    self.register(&counter);
    counter
  }

  #[must_use]
  pub fn counter_vec(&self, name: &str, labels: &[&str]) -> IntCounterVec {
    let full = self.full_name(name);
    let counter = IntCounterVec::new(Opts::new(full.clone(), full), labels).unwrap();
    self.register(&counter);
    counter
  }

  #[must_use]
  pub fn gauge(&self, name: &str) -> IntGauge {
    let full = self.full_name(name);
    let gauge = IntGauge::new(full.clone(), full).unwrap();
    self.register(&gauge);
    gauge
  }

  #[must_use]
  pub fn gauge_vec(&self, name: &str, labels: &[&str]) -> IntGaugeVec {
    let full = self.full_name(name);
    let gauge = IntGaugeVec::new(Opts::new(full.clone(), full), labels).unwrap();
    self.register(&gauge);
    gauge
  }
}
