// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::protos::metric::MetricType;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

fn default_buckets() -> Vec<f64> {
  vec![
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
  ]
}

fn default_quantiles() -> Vec<f64> {
  vec![0.5, 0.9, 0.99]
}

const fn default_summary_max_age() -> Duration {
  Duration::from_secs(10 * 60)
}

//
// MatchType
//

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
  #[default]
  Glob,
  Regex,
}

//
// MatchTarget
//

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchTarget {
  #[default]
  Name,
  NameAndTags,
}

//
// MatchMetricType
//

// Optional per-rule filter on the event kind. "gauge" covers both absolute and delta gauge
// samples, "observer" covers all three observed-value kinds.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMetricType {
  Counter,
  Gauge,
  Timer,
  Histogram,
  Distribution,
  Set,
  Observer,
}

impl MatchMetricType {
  #[must_use]
  pub const fn matches(self, mtype: MetricType) -> bool {
    match self {
      Self::Counter => matches!(mtype, MetricType::Counter),
      Self::Gauge => matches!(mtype, MetricType::Gauge | MetricType::DeltaGauge),
      Self::Timer => matches!(mtype, MetricType::Timer),
      Self::Histogram => matches!(mtype, MetricType::Histogram),
      Self::Distribution => matches!(mtype, MetricType::Distribution),
      Self::Set => matches!(mtype, MetricType::Set),
      Self::Observer => mtype.is_observer(),
    }
  }
}

//
// ObserverType
//

// How observed-value kinds (timer, histogram, distribution) aggregate and export.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ObserverType {
  #[default]
  Histogram,
  Summary,
}

//
// Action
//

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
  #[default]
  Observe,
  Drop,
}

//
// MappingDefaults
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MappingDefaults {
  pub match_type: MatchType,
  #[serde(with = "humantime_serde")]
  pub ttl: Option<Duration>,
  pub timer_type: ObserverType,
  pub buckets: Vec<f64>,
  pub quantiles: Vec<f64>,
  #[serde(with = "humantime_serde")]
  pub summary_max_age: Duration,
}

impl Default for MappingDefaults {
  fn default() -> Self {
    Self {
      match_type: MatchType::default(),
      ttl: None,
      timer_type: ObserverType::default(),
      buckets: default_buckets(),
      quantiles: default_quantiles(),
      summary_max_age: default_summary_max_age(),
    }
  }
}

//
// RuleConfig
//

// One mapping rule as written in the configuration file. Unset per-rule knobs fall back to the
// file-level defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
  #[serde(rename = "match")]
  pub match_pattern: String,
  pub match_type: Option<MatchType>,
  #[serde(default)]
  pub match_target: MatchTarget,
  pub match_metric_type: Option<MatchMetricType>,
  pub name: String,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
  #[serde(default, with = "humantime_serde")]
  pub ttl: Option<Duration>,
  pub timer_type: Option<ObserverType>,
  pub buckets: Option<Vec<f64>>,
  pub quantiles: Option<Vec<f64>>,
  #[serde(default, with = "humantime_serde")]
  pub summary_max_age: Option<Duration>,
  #[serde(default)]
  pub action: Action,
}

//
// MappingConfig
//

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingConfig {
  #[serde(default)]
  pub defaults: MappingDefaults,
  #[serde(default)]
  pub mappings: Vec<RuleConfig>,
}
