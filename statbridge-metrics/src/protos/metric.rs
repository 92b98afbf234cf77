// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::fmt::Display;
use std::hash::Hash;
use thiserror::Error;

//
// MetricType
//

// Internal metric kind shared by the parser, mapper, and aggregator. Drives which measurement
// variant a sample folds into.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MetricType {
  Counter,
  Gauge,
  DeltaGauge,
  Timer,
  Histogram,
  Distribution,
  Set,
}

impl MetricType {
  pub const fn from_statsd(t: &[u8]) -> Result<Self, ParseError> {
    match t {
      b"c" => Ok(Self::Counter),
      b"g" => Ok(Self::Gauge),
      b"ms" => Ok(Self::Timer),
      b"h" => Ok(Self::Histogram),
      b"d" => Ok(Self::Distribution),
      b"s" => Ok(Self::Set),
      _ => Err(ParseError::InvalidType),
    }
  }

  #[must_use]
  pub const fn to_statsd(self) -> &'static [u8] {
    match self {
      Self::Counter => b"c",
      Self::Gauge | Self::DeltaGauge => b"g",
      Self::Timer => b"ms",
      Self::Histogram => b"h",
      Self::Distribution => b"d",
      Self::Set => b"s",
    }
  }

  // Label value used for by-kind stats.
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Counter => "counter",
      Self::Gauge => "gauge",
      Self::DeltaGauge => "gauge_delta",
      Self::Timer => "timer",
      Self::Histogram => "histogram",
      Self::Distribution => "distribution",
      Self::Set => "set",
    }
  }

  // Timers, histograms, and distributions all feed value observers.
  #[must_use]
  pub const fn is_observer(self) -> bool {
    matches!(self, Self::Timer | Self::Histogram | Self::Distribution)
  }
}

//
// TagValue
//

// Wraps a metric tag (key, value).
#[derive(PartialOrd, Eq, Ord, Debug, Clone, PartialEq, Hash)]
pub struct TagValue {
  pub tag: bytes::Bytes,
  pub value: bytes::Bytes,
}

impl Display for TagValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{}={}",
      String::from_utf8_lossy(&self.tag),
      String::from_utf8_lossy(&self.value)
    )
  }
}

//
// MetricId
//

// Metric identity: name plus sorted tags, so that equal samples hash and compare equal no
// matter the wire tag order.
#[derive(Clone, Debug, Eq, PartialOrd, PartialEq)]
pub struct MetricId {
  name: bytes::Bytes,
  tags: Vec<TagValue>,
}

fn tags_sorted(tags: &[TagValue]) -> bool {
  tags.windows(2).all(|pair| pair[0] <= pair[1])
}

impl MetricId {
  pub fn new(name: bytes::Bytes, mut tags: Vec<TagValue>, already_sorted: bool) -> Self {
    if already_sorted {
      debug_assert!(tags_sorted(&tags));
    } else {
      tags.sort_unstable();
    }
    Self { name, tags }
  }

  pub const fn name(&self) -> &bytes::Bytes {
    &self.name
  }

  pub fn tags(&self) -> &[TagValue] {
    &self.tags
  }
}

impl Hash for MetricId {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.name.hash(state);
    for tag in &self.tags {
      tag.tag.hash(state);
      tag.value.hash(state);
    }
  }
}

impl Display for MetricId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name_str = String::from_utf8_lossy(self.name.as_ref());
    write!(f, "{name_str}(")?;
    for tag in &self.tags {
      write!(f, "[{tag}]")?;
    }
    write!(f, ")")
  }
}

//
// Event
//

// A parsed and normalized statsd sample. Created by the line parser, consumed by the
// aggregator, never mutated in between.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
  id: MetricId,
  mtype: MetricType,
  pub value: f64,
  pub sample_rate: f64,
}

impl Event {
  pub const fn new(id: MetricId, mtype: MetricType, value: f64, sample_rate: f64) -> Self {
    Self {
      id,
      mtype,
      value,
      sample_rate,
    }
  }

  pub const fn id(&self) -> &MetricId {
    &self.id
  }

  pub const fn mtype(&self) -> MetricType {
    self.mtype
  }
}

impl Display for Event {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{}[TYPE={}][VALUE={}]",
      self.id,
      self.mtype.as_str(),
      self.value
    )
  }
}

//
// ParseError
//

// Errors that arise during line parsing. Each maps onto one of the four per-reason sample
// error counters.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum ParseError {
  #[error("overall invalid line - no structural elements found in parsing")]
  InvalidLine,
  #[error("invalid parsed value")]
  InvalidValue,
  #[error("invalid type")]
  InvalidType,
  #[error("invalid sample rate")]
  InvalidSampleRate,
  #[error("more than one sample rate field found")]
  RepeatedSampleRate,
  #[error("more than one set of tags found")]
  RepeatedTags,
  #[error("invalid tag")]
  InvalidTag,
}

impl ParseError {
  // Label value for the sample error counter.
  #[must_use]
  pub const fn reason(&self) -> &'static str {
    match self {
      Self::InvalidLine | Self::InvalidValue => "malformed",
      Self::InvalidType => "bad_type",
      Self::InvalidSampleRate | Self::RepeatedSampleRate => "bad_rate",
      Self::RepeatedTags | Self::InvalidTag => "bad_tags",
    }
  }
}
