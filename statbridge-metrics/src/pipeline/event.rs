// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./event_test.rs"]
mod event_test;

use crate::protos::metric::Event;
use crate::shutdown::ComponentShutdown;
use crate::stats::Scope;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

struct LockedState {
  pending: Vec<Event>,
  batches: VecDeque<Vec<Event>>,
}

struct Stats {
  flushed: IntCounter,
  dropped: IntCounter,
}

//
// EventQueue
//

// Bounded handoff between the listeners and the aggregator. Producers append events; a batch
// moves to the consumer side when the pending buffer reaches the flush threshold or the flush
// interval elapses. When the batch queue is full the oldest batch is dropped: under overload
// the system sheds the oldest data rather than stalling the listeners.
pub struct EventQueue {
  locked: Mutex<LockedState>,
  notify: Notify,
  shutdown: AtomicBool,
  flush_threshold: usize,
  max_queued_batches: usize,
  stats: Stats,
}

impl EventQueue {
  #[must_use]
  pub fn new(
    scope: &Scope,
    max_queued_batches: usize,
    flush_threshold: usize,
    flush_interval: Duration,
    mut shutdown: ComponentShutdown,
  ) -> Arc<Self> {
    let queue = Arc::new(Self {
      locked: Mutex::new(LockedState {
        pending: Vec::new(),
        batches: VecDeque::new(),
      }),
      notify: Notify::new(),
      shutdown: AtomicBool::new(false),
      flush_threshold,
      max_queued_batches,
      stats: Stats {
        flushed: scope.counter("event_queue_flushed_total"),
        dropped: scope.counter("events_dropped_total"),
      },
    });

    let cloned_queue = queue.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(flush_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = interval.tick() => cloned_queue.flush(),
          () = shutdown.cancelled() => {
            cloned_queue.close();
            break;
          }
        }
      }
      drop(shutdown);
    });

    queue
  }

  // Append a producer's events, preserving their order. Flushes when the pending buffer
  // reaches the count threshold.
  pub fn queue(&self, events: Vec<Event>) {
    if events.is_empty() {
      return;
    }
    let mut state = self.locked.lock();
    state.pending.extend(events);
    if state.pending.len() >= self.flush_threshold {
      self.flush_locked(&mut state);
    }
  }

  pub fn flush(&self) {
    let mut state = self.locked.lock();
    self.flush_locked(&mut state);
  }

  fn flush_locked(&self, state: &mut LockedState) {
    if state.pending.is_empty() {
      return;
    }
    let batch = std::mem::take(&mut state.pending);
    state.batches.push_back(batch);
    if state.batches.len() > self.max_queued_batches {
      if let Some(dropped) = state.batches.pop_front() {
        log::debug!("event queue full, dropping {} event(s)", dropped.len());
        self
          .stats
          .dropped
          .inc_by(dropped.len().try_into().unwrap());
      }
    }
    self.stats.flushed.inc();
    self.notify.notify_one();
  }

  // Close the queue. The consumer drains remaining batches and then receives None.
  pub fn close(&self) {
    self.shutdown.store(true, Ordering::SeqCst);
    self.flush();
    self.notify.notify_one();
  }

  // Consumer side. Returns batches in arrival order, None once closed and drained.
  pub async fn next_batch(&self) -> Option<Vec<Event>> {
    loop {
      let notified = self.notify.notified();
      {
        let mut state = self.locked.lock();
        if let Some(batch) = state.batches.pop_front() {
          return Some(batch);
        }
        if self.shutdown.load(Ordering::SeqCst) {
          return None;
        }
      }
      notified.await;
    }
  }
}
