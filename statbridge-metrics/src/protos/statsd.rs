// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./statsd_test.rs"]
mod statsd_test;

use super::metric::{Event, MetricId, MetricType, ParseError, TagValue};
use crate::stats::Scope;
use bytes::{Bytes, BytesMut};
use memchr::{memchr, memmem};
use prometheus::{IntCounter, IntCounterVec};

//
// ParserStats
//

#[derive(Clone)]
pub struct ParserStats {
  samples: IntCounter,
  sample_errors: IntCounterVec,
  tags: IntCounter,
  tag_errors: IntCounter,
}

impl ParserStats {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    Self {
      samples: scope.counter("samples_total"),
      sample_errors: scope.counter_vec("sample_errors_total", &["reason"]),
      tags: scope.counter("tags_total"),
      tag_errors: scope.counter("tag_errors_total"),
    }
  }
}

fn parse_tags(input: &Bytes, tags: &mut Vec<TagValue>) -> u64 {
  if input.is_empty() {
    return 0;
  }

  let mut parsed = 0;
  let mut scan = input.clone();
  loop {
    let tag_index_end = memchr(b',', scan.as_ref()).map_or_else(|| scan.len(), |i| i);
    let tag_scan = scan.slice(0 .. tag_index_end);
    match memchr(b':', tag_scan.as_ref()) {
      // Value-less tag, consume the name and continue
      None => tags.push(TagValue {
        tag: tag_scan,
        value: "".into(),
      }),
      Some(value_start) => tags.push(TagValue {
        tag: tag_scan.slice(0 .. value_start),
        value: tag_scan.slice(value_start + 1 ..),
      }),
    }
    parsed += 1;
    if tag_index_end == scan.len() {
      return parsed;
    }
    scan = scan.slice(tag_index_end + 1 ..);
  }
}

// Parse a comma separated k=v list used by the name-embedded tag dialects. Malformed pairs are
// skipped and counted, they never fail the sample.
fn parse_name_tags(region: &Bytes, tags: &mut Vec<TagValue>) -> (u64, u64) {
  let mut parsed = 0;
  let mut errors = 0;
  let mut scan = region.clone();
  loop {
    let pair_end = memchr(b',', scan.as_ref()).map_or_else(|| scan.len(), |i| i);
    let pair = scan.slice(0 .. pair_end);
    match memchr(b'=', pair.as_ref()) {
      Some(eq) if eq > 0 => {
        tags.push(TagValue {
          tag: pair.slice(0 .. eq),
          value: pair.slice(eq + 1 ..),
        });
        parsed += 1;
      },
      _ => errors += 1,
    }
    if pair_end == scan.len() {
      return (parsed, errors);
    }
    scan = scan.slice(pair_end + 1 ..);
  }
}

//
// LineParser
//

// Parses wire lines into events. Each tag dialect is independently enablable; when a name
// carries more than one dialect marker, the earliest enabled marker wins and the rest of the
// name is literal.
pub struct LineParser {
  dogstatsd_tags: bool,
  influxdb_tags: bool,
  librato_tags: bool,
  signalfx_tags: bool,
  stats: ParserStats,
}

impl LineParser {
  #[must_use]
  pub fn new(scope: &Scope) -> Self {
    Self {
      dogstatsd_tags: false,
      influxdb_tags: false,
      librato_tags: false,
      signalfx_tags: false,
      stats: ParserStats::new(scope),
    }
  }

  pub fn enable_dogstatsd_parsing(&mut self) {
    self.dogstatsd_tags = true;
  }

  pub fn enable_influxdb_parsing(&mut self) {
    self.influxdb_tags = true;
  }

  pub fn enable_librato_parsing(&mut self) {
    self.librato_tags = true;
  }

  pub fn enable_signalfx_parsing(&mut self) {
    self.signalfx_tags = true;
  }

  // Parse one line into zero or more events. A line holds one metric name and one or more
  // value|type samples separated by ':'. Failed samples are counted per reason and skipped.
  pub fn parse_line(&self, line: &Bytes) -> Vec<Event> {
    if line.is_empty() {
      return vec![];
    }

    let Some(name_end) = memchr(b':', line.as_ref()) else {
      self.stats.samples.inc();
      self.count_error(&ParseError::InvalidLine, line);
      return vec![];
    };

    let mut tags = Vec::new();
    let name = self.decode_name(&line.slice(0 .. name_end), &mut tags);
    if name.is_empty() {
      self.stats.samples.inc();
      self.count_error(&ParseError::InvalidLine, line);
      return vec![];
    }

    // DogStatsD tag values may themselves contain ':', so the presence of a tag section
    // disables multi-sample splitting for the rest of the line.
    let rest = line.slice(name_end + 1 ..);
    let samples: Vec<Bytes> = if memmem::find(rest.as_ref(), b"|#").is_some() {
      vec![rest]
    } else {
      let mut out = Vec::new();
      let mut scan = rest;
      loop {
        let end = memchr(b':', scan.as_ref()).map_or_else(|| scan.len(), |i| i);
        out.push(scan.slice(0 .. end));
        if end == scan.len() {
          break;
        }
        scan = scan.slice(end + 1 ..);
      }
      out
    };

    let mut events = Vec::with_capacity(samples.len());
    for sample in samples {
      self.stats.samples.inc();
      match self.parse_sample(name.clone(), &tags, &sample) {
        Ok(event) => events.push(event),
        Err(e) => self.count_error(&e, &sample),
      }
    }
    events
  }

  fn count_error(&self, e: &ParseError, input: &Bytes) {
    log::debug!("sample parse failure {e:?} (input: {input:?})");
    self.stats.sample_errors.with_label_values(&[e.reason()]).inc();
  }

  // Strip an embedded tag dialect from the name segment, appending decoded tags. The first
  // recognized marker is decoded; an unterminated SignalFX section leaves the name literal.
  fn decode_name(&self, raw: &Bytes, tags: &mut Vec<TagValue>) -> Bytes {
    let influx = self
      .influxdb_tags
      .then(|| memchr(b',', raw.as_ref()))
      .flatten();
    let librato = self
      .librato_tags
      .then(|| memchr(b'#', raw.as_ref()))
      .flatten();
    let signalfx = self
      .signalfx_tags
      .then(|| memchr(b'[', raw.as_ref()))
      .flatten();

    let earliest = [influx, librato, signalfx]
      .into_iter()
      .flatten()
      .min();
    let Some(marker) = earliest else {
      return raw.clone();
    };

    if Some(marker) == signalfx {
      let Some(close) = memchr(b']', &raw.as_ref()[marker + 1 ..]) else {
        self.stats.tag_errors.inc();
        return raw.clone();
      };
      let close = marker + 1 + close;
      let (parsed, errors) = parse_name_tags(&raw.slice(marker + 1 .. close), tags);
      self.stats.tags.inc_by(parsed);
      self.stats.tag_errors.inc_by(errors);
      if close + 1 == raw.len() {
        return raw.slice(0 .. marker);
      }
      let mut name = BytesMut::with_capacity(raw.len() - (close + 1 - marker));
      name.extend_from_slice(&raw[.. marker]);
      name.extend_from_slice(&raw[close + 1 ..]);
      return name.freeze();
    }

    let (parsed, errors) = parse_name_tags(&raw.slice(marker + 1 ..), tags);
    self.stats.tags.inc_by(parsed);
    self.stats.tag_errors.inc_by(errors);
    raw.slice(0 .. marker)
  }

  // Parse a single value|type[|@rate][|#tags] sample. '@' and '#' fields are accepted in
  // either order.
  fn parse_sample(
    &self,
    name: Bytes,
    base_tags: &[TagValue],
    sample: &Bytes,
  ) -> Result<Event, ParseError> {
    let length = sample.len();
    let type_index = memchr(b'|', sample.as_ref()).ok_or(ParseError::InvalidLine)? + 1;
    if type_index < 2 {
      return Err(ParseError::InvalidValue);
    }

    let mut type_index_end = length;
    let mut sample_rate_index: Option<(usize, usize)> = None;
    let mut tags_index: Option<(usize, usize)> = None;

    let mut scan_index = type_index;
    loop {
      let index = memchr(b'|', &sample[scan_index ..]).map(|v| v + scan_index);
      match index {
        None => break,
        Some(x) if x + 2 >= length => break,
        Some(x) if x < type_index_end => type_index_end = x,
        _ => (),
      }
      match sample[index.unwrap() + 1] {
        b'@' => {
          if sample_rate_index.is_some() {
            return Err(ParseError::RepeatedSampleRate);
          }
          sample_rate_index = index.map(|v| (v + 2, length));
          tags_index = tags_index.map(|(v, _l)| (v, index.unwrap()));
        },
        b'#' => {
          if tags_index.is_some() {
            return Err(ParseError::RepeatedTags);
          }
          tags_index = index.map(|v| (v + 2, length));
          sample_rate_index = sample_rate_index.map(|(v, _l)| (v, index.unwrap()));
        },
        _ => (),
      }
      scan_index = index.unwrap() + 1;
    }

    let mtype = match (
      MetricType::from_statsd(&sample[type_index .. type_index_end])?,
      sample[0],
    ) {
      (MetricType::Gauge, b'-' | b'+') => MetricType::DeltaGauge,
      (t, _) => t,
    };

    let sample_rate = sample_rate_index
      .map(|(start, end)| {
        std::str::from_utf8(&sample[start .. end])
          .map_err(|_| ParseError::InvalidSampleRate)?
          .parse::<f64>()
          .map_err(|_| ParseError::InvalidSampleRate)
      })
      .transpose()?
      .unwrap_or(1.0);
    if !(sample_rate > 0.0 && sample_rate <= 1.0) {
      return Err(ParseError::InvalidSampleRate);
    }

    let value = std::str::from_utf8(&sample[.. type_index - 1])
      .map_err(|_| ParseError::InvalidValue)?
      .parse::<f64>()
      .map_err(|_| ParseError::InvalidValue)?;
    if !value.is_finite() {
      return Err(ParseError::InvalidValue);
    }
    if mtype == MetricType::Counter && value < 0.0 {
      return Err(ParseError::InvalidValue);
    }

    let mut tags = base_tags.to_vec();
    if let Some((start, end)) = tags_index {
      if self.dogstatsd_tags {
        let parsed = parse_tags(&sample.slice(start .. end), &mut tags);
        self.stats.tags.inc_by(parsed);
      } else {
        self.stats.tag_errors.inc();
      }
    }

    Ok(Event::new(
      MetricId::new(name, tags, false),
      mtype,
      value,
      sample_rate,
    ))
  }
}

// Serialize an event back into a canonical statsd line.
#[must_use]
pub fn to_statsd_line(event: &Event) -> Bytes {
  let mut line = BytesMut::new();
  line.extend_from_slice(event.id().name().as_ref());
  line.extend_from_slice(b":");
  if event.mtype() == MetricType::DeltaGauge && event.value.is_sign_positive() {
    line.extend_from_slice(b"+");
  }
  line.extend_from_slice(event.value.to_string().as_bytes());
  line.extend_from_slice(b"|");
  line.extend_from_slice(event.mtype().to_statsd());
  if event.sample_rate != 1.0 {
    line.extend_from_slice(b"|@");
    line.extend_from_slice(event.sample_rate.to_string().as_bytes());
  }
  if !event.id().tags().is_empty() {
    line.extend_from_slice(b"|#");
    let it = &mut event.id().tags().iter().peekable();
    while let Some(tag) = it.next() {
      line.extend_from_slice(tag.tag.as_ref());
      if !tag.value.is_empty() {
        line.extend_from_slice(b":");
        line.extend_from_slice(tag.value.as_ref());
      }
      if it.peek().is_some() {
        line.extend_from_slice(b",");
      }
    }
  }
  line.freeze()
}
