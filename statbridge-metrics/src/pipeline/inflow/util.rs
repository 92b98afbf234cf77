// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./util_test.rs"]
mod util_test;

use crate::pipeline::event::EventQueue;
use crate::pipeline::relay::Relay;
use crate::protos::statsd::LineParser;
use crate::stats::Scope;
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use prometheus::IntCounter;
use std::sync::Arc;

// Split buffered bytes into complete lines, stripping the newline (and a preceding carriage
// return). With expect_new_lines unset, a trailing partial line is returned too; stream
// transports keep it buffered for the next read instead.
pub(super) fn process_buffer_newlines(buf: &mut BytesMut, expect_new_lines: bool) -> Vec<Bytes> {
  let mut ret: Vec<Bytes> = Vec::new();
  loop {
    match memchr(b'\n', buf) {
      None => break,
      Some(newline) => {
        let mut incoming = buf.split_to(newline + 1);
        let len = incoming.len();
        if len >= 2 && incoming[len - 2] == b'\r' {
          incoming.truncate(len - 2);
        } else {
          incoming.truncate(len - 1);
        }
        ret.push(incoming.freeze());
      },
    };
  }

  if !expect_new_lines && !buf.is_empty() {
    ret.push(buf.split().freeze());
  }

  ret
}

//
// LineHandler
//

// Shared per-line handling for every listener: count the line, tee it to the relay, parse it,
// and enqueue the resulting events.
#[derive(Clone)]
pub struct LineHandler {
  parser: Arc<LineParser>,
  queue: Arc<EventQueue>,
  relay: Option<Arc<Relay>>,
  lines: IntCounter,
}

impl LineHandler {
  #[must_use]
  pub fn new(
    scope: &Scope,
    parser: Arc<LineParser>,
    queue: Arc<EventQueue>,
    relay: Option<Arc<Relay>>,
  ) -> Self {
    Self {
      parser,
      queue,
      relay,
      lines: scope.counter("lines_total"),
    }
  }

  pub fn handle_lines(&self, lines: Vec<Bytes>) {
    for line in lines {
      if line.is_empty() {
        continue;
      }
      self.lines.inc();
      if let Some(relay) = &self.relay {
        relay.relay_line(&line);
      }
      let events = self.parser.parse_line(&line);
      if !events.is_empty() {
        self.queue.queue(events);
      }
    }
  }
}
