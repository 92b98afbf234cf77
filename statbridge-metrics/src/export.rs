// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./export_test.rs"]
mod export_test;

use crate::pipeline::aggregation::{MeasurementSnapshot, MeasurementValue};
use std::fmt::Write;

fn escape_label_value(value: &str) -> String {
  value
    .replace('\\', "\\\\")
    .replace('"', "\\\"")
    .replace('\n', "\\n")
}

fn write_labels(out: &mut String, labels: &[(String, String)], extra: Option<(&str, &str)>) {
  if labels.is_empty() && extra.is_none() {
    return;
  }
  out.push('{');
  let mut first = true;
  for (key, value) in labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).chain(extra) {
    if !first {
      out.push(',');
    }
    first = false;
    let _ = write!(out, "{key}=\"{}\"", escape_label_value(value));
  }
  out.push('}');
}

fn write_sample(out: &mut String, name: &str, labels: &[(String, String)], extra: Option<(&str, &str)>, value: f64) {
  out.push_str(name);
  write_labels(out, labels, extra);
  let _ = writeln!(out, " {value}");
}

// Serialize a measurement snapshot into the Prometheus text exposition format. Snapshots
// arrive sorted by name, so the TYPE header is emitted once per metric family.
#[must_use]
pub fn render(snapshots: &[MeasurementSnapshot]) -> String {
  let mut out = String::new();
  let mut previous_name: Option<&str> = None;

  for snapshot in snapshots {
    if previous_name != Some(snapshot.name.as_str()) {
      let family = match snapshot.value {
        MeasurementValue::Counter(_) => "counter",
        // Sets export their cardinality as a gauge.
        MeasurementValue::Gauge(_) | MeasurementValue::Set { .. } => "gauge",
        MeasurementValue::Histogram { .. } => "histogram",
        MeasurementValue::Summary { .. } => "summary",
      };
      let _ = writeln!(out, "# TYPE {} {family}", snapshot.name);
      previous_name = Some(snapshot.name.as_str());
    }

    let name = snapshot.name.as_str();
    let labels = &snapshot.labels;
    match &snapshot.value {
      MeasurementValue::Counter(value) | MeasurementValue::Gauge(value) => {
        write_sample(&mut out, name, labels, None, *value);
      },
      MeasurementValue::Set { size } => {
        #[allow(clippy::cast_precision_loss)]
        write_sample(&mut out, name, labels, None, *size as f64);
      },
      MeasurementValue::Histogram {
        buckets,
        sum,
        count,
      } => {
        let bucket_name = format!("{name}_bucket");
        for (le, cumulative) in buckets {
          write_sample(
            &mut out,
            &bucket_name,
            labels,
            Some(("le", &le.to_string())),
            *cumulative,
          );
        }
        write_sample(&mut out, &bucket_name, labels, Some(("le", "+Inf")), *count);
        write_sample(&mut out, &format!("{name}_sum"), labels, None, *sum);
        write_sample(&mut out, &format!("{name}_count"), labels, None, *count);
      },
      MeasurementValue::Summary {
        quantiles,
        sum,
        count,
      } => {
        for (quantile, value) in quantiles {
          write_sample(
            &mut out,
            name,
            labels,
            Some(("quantile", &quantile.to_string())),
            *value,
          );
        }
        write_sample(&mut out, &format!("{name}_sum"), labels, None, *sum);
        write_sample(&mut out, &format!("{name}_count"), labels, None, *count);
      },
    }
  }
  out
}
