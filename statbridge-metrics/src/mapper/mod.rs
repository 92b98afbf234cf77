// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod cache;
pub mod config;
pub mod fsm;

use self::cache::{CacheKey, CacheOutcome, MappingCache};
use self::config::{
  Action,
  MappingConfig,
  MatchMetricType,
  MatchTarget,
  MatchType,
  ObserverType,
};
use self::fsm::Fsm;
use crate::protos::metric::{MetricId, MetricType};
use crate::stats::Scope;
use anyhow::{Context, bail};
use parking_lot::RwLock;
use prometheus::{IntCounterVec, IntGauge};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// Prometheus label key grammar.
pub(crate) fn valid_label_key(key: &str) -> bool {
  let mut chars = key.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// The canonical match input: the metric name followed by sorted k=v tag pairs, ';' separated.
#[must_use]
pub fn synthesize_match_string(id: &MetricId) -> String {
  let mut out = String::from_utf8_lossy(id.name()).into_owned();
  for tag in id.tags() {
    out.push(';');
    out.push_str(&String::from_utf8_lossy(&tag.tag));
    out.push('=');
    out.push_str(&String::from_utf8_lossy(&tag.value));
  }
  out
}

//
// Template
//

#[derive(Clone, Debug)]
enum TemplateFragment {
  Literal(String),
  // 1-indexed capture reference.
  Capture(usize),
}

// An output template with $1..$N / ${n} placeholders. Undefined captures render empty.
#[derive(Clone, Debug)]
struct Template {
  fragments: Vec<TemplateFragment>,
}

impl Template {
  fn parse(input: &str) -> Self {
    let mut fragments = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars().peekable();

    let flush = |literal: &mut String, fragments: &mut Vec<TemplateFragment>| {
      if !literal.is_empty() {
        fragments.push(TemplateFragment::Literal(std::mem::take(literal)));
      }
    };

    while let Some(c) = chars.next() {
      if c != '$' {
        literal.push(c);
        continue;
      }
      let braced = chars.peek() == Some(&'{');
      if braced {
        chars.next();
      }
      let mut digits = String::new();
      while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
        digits.push(*d);
        chars.next();
      }
      let closed = !braced || chars.peek() == Some(&'}');
      if digits.is_empty() || !closed {
        literal.push('$');
        if braced {
          literal.push('{');
        }
        literal.push_str(&digits);
        continue;
      }
      if braced {
        chars.next();
      }
      // An index too large to parse cannot reference a real capture; it renders empty.
      let index = digits.parse().unwrap_or(usize::MAX);
      flush(&mut literal, &mut fragments);
      fragments.push(TemplateFragment::Capture(index));
    }
    flush(&mut literal, &mut fragments);
    Self { fragments }
  }

  fn render(&self, captures: &[String]) -> String {
    let mut out = String::new();
    for fragment in &self.fragments {
      match fragment {
        TemplateFragment::Literal(literal) => out.push_str(literal),
        TemplateFragment::Capture(index) => {
          if let Some(capture) = index.checked_sub(1).and_then(|i| captures.get(i)) {
            out.push_str(capture);
          }
        },
      }
    }
    out
  }
}

//
// ObserverSettings
//

// Resolved observer configuration for a rule: how timer/histogram/distribution samples
// aggregate and export.
#[derive(Clone, Debug)]
pub struct ObserverSettings {
  pub observer_type: ObserverType,
  pub buckets: Vec<f64>,
  pub quantiles: Vec<f64>,
  pub max_age: Duration,
}

impl Default for ObserverSettings {
  fn default() -> Self {
    let defaults = config::MappingDefaults::default();
    Self {
      observer_type: defaults.timer_type,
      buckets: defaults.buckets,
      quantiles: defaults.quantiles,
      max_age: defaults.summary_max_age,
    }
  }
}

//
// MappingResult
//

// The outcome of a successful mapping: the rendered output name and labels plus the per-rule
// options the aggregator needs.
#[derive(Clone, Debug)]
pub struct MappingResult {
  pub rule_index: usize,
  pub name: String,
  pub labels: Vec<(String, String)>,
  pub action: Action,
  pub ttl: Option<Duration>,
  pub observer: Arc<ObserverSettings>,
}

//
// CompiledRule
//

#[derive(Debug)]
struct CompiledRule {
  match_metric_type: Option<MatchMetricType>,
  match_target: MatchTarget,
  name: Template,
  labels: Vec<(String, Template)>,
  ttl: Option<Duration>,
  action: Action,
  observer: Arc<ObserverSettings>,
}

//
// CompiledMappings
//

// The immutable compile of one configuration load. Swapped in wholesale so a reader holds
// either the previous or the next compile, never a partial one.
#[derive(Debug, Default)]
pub struct CompiledMappings {
  rules: Vec<CompiledRule>,
  name_fsm: Fsm,
  tagged_fsm: Fsm,
  regex_rules: Vec<(usize, Regex)>,
}

fn validate_buckets(buckets: &[f64]) -> anyhow::Result<()> {
  if buckets.is_empty() {
    bail!("buckets must not be empty");
  }
  if !buckets.windows(2).all(|pair| pair[0] < pair[1]) {
    bail!("buckets must be strictly increasing");
  }
  Ok(())
}

fn validate_quantiles(quantiles: &[f64]) -> anyhow::Result<()> {
  if quantiles.is_empty() {
    bail!("quantiles must not be empty");
  }
  for quantile in quantiles {
    if !(*quantile > 0.0 && *quantile < 1.0) {
      bail!("quantiles must be between 0.0 and 1.0");
    }
  }
  Ok(())
}

impl CompiledMappings {
  pub fn compile(config: MappingConfig) -> anyhow::Result<Self> {
    let defaults = &config.defaults;
    validate_buckets(&defaults.buckets).context("defaults")?;
    validate_quantiles(&defaults.quantiles).context("defaults")?;

    let mut compiled = Self::default();
    for (index, rule) in config.mappings.iter().enumerate() {
      let context = || format!("mapping {index} ('{}')", rule.match_pattern);

      if rule.name.is_empty() {
        bail!("{}: empty output name", context());
      }
      for key in rule.labels.keys() {
        if !valid_label_key(key) {
          bail!("{}: invalid label key '{key}'", context());
        }
      }

      match rule.match_type.unwrap_or(defaults.match_type) {
        MatchType::Glob => {
          let fsm = match rule.match_target {
            MatchTarget::Name => &mut compiled.name_fsm,
            MatchTarget::NameAndTags => &mut compiled.tagged_fsm,
          };
          fsm
            .add_rule(&rule.match_pattern, index)
            .with_context(context)?;
        },
        MatchType::Regex => {
          let regex = Regex::new(&rule.match_pattern).with_context(context)?;
          compiled.regex_rules.push((index, regex));
        },
      }

      let buckets = rule
        .buckets
        .clone()
        .unwrap_or_else(|| defaults.buckets.clone());
      validate_buckets(&buckets).with_context(context)?;
      let quantiles = rule
        .quantiles
        .clone()
        .unwrap_or_else(|| defaults.quantiles.clone());
      validate_quantiles(&quantiles).with_context(context)?;

      compiled.rules.push(CompiledRule {
        match_metric_type: rule.match_metric_type,
        match_target: rule.match_target,
        name: Template::parse(&rule.name),
        labels: rule
          .labels
          .iter()
          .map(|(key, value)| (key.clone(), Template::parse(value)))
          .collect(),
        ttl: rule.ttl.or(defaults.ttl),
        action: rule.action,
        observer: Arc::new(ObserverSettings {
          observer_type: rule.timer_type.unwrap_or(defaults.timer_type),
          buckets,
          quantiles,
          max_age: rule.summary_max_age.unwrap_or(defaults.summary_max_age),
        }),
      });
    }
    Ok(compiled)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.rules.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  fn lookup(
    &self,
    name: &[u8],
    match_string: &str,
    mtype: MetricType,
  ) -> Option<Arc<MappingResult>> {
    // Glob candidates from both FSMs, then smallest rule index that passes the kind filter.
    let mut candidates = self.name_fsm.lookup(name);
    candidates.extend(self.tagged_fsm.lookup(match_string.as_bytes()));
    candidates.sort_by_key(|candidate| candidate.rule_index);
    for candidate in candidates {
      let rule = &self.rules[candidate.rule_index];
      if rule
        .match_metric_type
        .is_some_and(|filter| !filter.matches(mtype))
      {
        continue;
      }
      return Some(self.render(candidate.rule_index, &candidate.captures));
    }

    // No glob match; linear scan of regex rules in source order.
    let name_string = String::from_utf8_lossy(name);
    for (index, regex) in &self.regex_rules {
      let rule = &self.rules[*index];
      if rule
        .match_metric_type
        .is_some_and(|filter| !filter.matches(mtype))
      {
        continue;
      }
      let target = match rule.match_target {
        MatchTarget::Name => name_string.as_ref(),
        MatchTarget::NameAndTags => match_string,
      };
      if let Some(found) = regex.captures(target) {
        let captures: Vec<String> = found
          .iter()
          .skip(1)
          .map(|group| group.map_or_else(String::new, |m| m.as_str().to_string()))
          .collect();
        return Some(self.render(*index, &captures));
      }
    }
    None
  }

  fn render(&self, index: usize, captures: &[String]) -> Arc<MappingResult> {
    let rule = &self.rules[index];
    Arc::new(MappingResult {
      rule_index: index,
      name: rule.name.render(captures),
      labels: rule
        .labels
        .iter()
        .map(|(key, template)| (key.clone(), template.render(captures)))
        .collect(),
      action: rule.action,
      ttl: rule.ttl,
      observer: rule.observer.clone(),
    })
  }
}

//
// MetricMapper
//

struct MapperStats {
  reloads: IntCounterVec,
  loaded: IntGauge,
}

// Resolves event names and tags to mapping results. Stateless per lookup: the only state is
// the installed compile and the optional cache in front of it.
pub struct MetricMapper {
  compiled: RwLock<Arc<CompiledMappings>>,
  cache: Option<Arc<dyn MappingCache>>,
  stats: MapperStats,
}

impl MetricMapper {
  #[must_use]
  pub fn new(scope: &Scope, cache: Option<Arc<dyn MappingCache>>) -> Self {
    Self {
      compiled: RwLock::new(Arc::new(CompiledMappings::default())),
      cache,
      stats: MapperStats {
        reloads: scope.counter_vec("config_reloads_total", &["outcome"]),
        loaded: scope.gauge("loaded_mappings"),
      },
    }
  }

  pub fn init_from_file(&self, path: &Path) -> anyhow::Result<()> {
    let source = match std::fs::read_to_string(path) {
      Ok(source) => source,
      Err(e) => {
        self.stats.reloads.with_label_values(&["failure"]).inc();
        return Err(e).with_context(|| format!("reading mapping config {}", path.display()));
      },
    };
    self.init_from_yaml(&source)
  }

  // Parse and compile a new rule list, then atomically install it and flush the cache. On any
  // failure the previous configuration stays installed.
  pub fn init_from_yaml(&self, source: &str) -> anyhow::Result<()> {
    let compiled = serde_yaml::from_str::<MappingConfig>(source)
      .map_err(anyhow::Error::from)
      .and_then(CompiledMappings::compile);
    match compiled {
      Ok(compiled) => {
        let loaded = compiled.len();
        *self.compiled.write() = Arc::new(compiled);
        if let Some(cache) = &self.cache {
          cache.clear();
        }
        self.stats.loaded.set(loaded.try_into().unwrap());
        self.stats.reloads.with_label_values(&["success"]).inc();
        log::info!("mapping config loaded with {loaded} mapping(s)");
        Ok(())
      },
      Err(e) => {
        self.stats.reloads.with_label_values(&["failure"]).inc();
        Err(e)
      },
    }
  }

  #[must_use]
  pub fn get_mapping(&self, id: &MetricId, mtype: MetricType) -> Option<Arc<MappingResult>> {
    let match_string = synthesize_match_string(id);
    let Some(cache) = &self.cache else {
      let compiled = self.compiled.read().clone();
      return compiled.lookup(id.name(), &match_string, mtype);
    };

    let key = CacheKey { match_string, mtype };
    if let Some(outcome) = cache.get(&key) {
      return match outcome {
        CacheOutcome::Hit(result) => Some(result),
        CacheOutcome::Miss => None,
      };
    }
    let compiled = self.compiled.read().clone();
    let result = compiled.lookup(id.name(), &key.match_string, mtype);
    cache.put(key, result.clone());
    result
  }
}
