// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./relay_test.rs"]
mod relay_test;

use crate::shutdown::ComponentShutdown;
use crate::stats::Scope;
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use prometheus::IntCounter;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub(crate) struct RelayStats {
  pub packets: IntCounter,
  pub long_lines: IntCounter,
  pub relayed_lines: IntCounter,
}

impl RelayStats {
  fn new(scope: &Scope, target: &str) -> Self {
    Self {
      packets: scope
        .counter_vec("relay_packets_total", &["target"])
        .with_label_values(&[target]),
      long_lines: scope
        .counter_vec("relay_long_lines_total", &["target"])
        .with_label_values(&[target]),
      relayed_lines: scope
        .counter_vec("relay_lines_relayed_total", &["target"])
        .with_label_values(&[target]),
    }
  }
}

//
// Relay
//

// Forwards the raw inbound line stream to a downstream UDP collector, unmodified. Lines are
// packed into datagrams bounded by the configured packet length and flushed at least once a
// second. Best effort only: a send error terminates the relay loop.
pub struct Relay {
  sender: mpsc::Sender<Bytes>,
  packet_length: usize,
  pub(crate) stats: RelayStats,
}

impl Relay {
  pub async fn new(
    scope: &Scope,
    target: &str,
    packet_length: usize,
    shutdown: ComponentShutdown,
  ) -> anyhow::Result<Arc<Self>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    info!("relaying statsd lines to {target}");

    let stats = RelayStats::new(scope, target);
    let (sender, receiver) = mpsc::channel(100);
    tokio::spawn(relay_loop(
      socket,
      receiver,
      packet_length,
      stats.clone(),
      shutdown,
    ));

    Ok(Arc::new(Self {
      sender,
      packet_length,
      stats,
    }))
  }

  // Buffer a single raw line for relaying, appending the terminating newline when absent.
  // Lines that cannot fit a packet are dropped and counted.
  pub fn relay_line(&self, line: &Bytes) {
    if line.is_empty() {
      return;
    }
    if line.len() > self.packet_length.saturating_sub(1) {
      warn!(
        "line too long, not relaying (length {}, max {})",
        line.len(),
        self.packet_length.saturating_sub(1)
      );
      self.stats.long_lines.inc();
      return;
    }

    let mut owned = BytesMut::with_capacity(line.len() + 1);
    owned.extend_from_slice(line);
    if owned[owned.len() - 1] != b'\n' {
      owned.extend_from_slice(b"\n");
    }
    self.stats.relayed_lines.inc();
    if self.sender.try_send(owned.freeze()).is_err() {
      debug!("relay channel full, dropping line");
    }
  }
}

async fn send_packet(socket: &UdpSocket, stats: &RelayStats, buffer: &[u8]) -> std::io::Result<()> {
  if buffer.is_empty() {
    return Ok(());
  }
  debug!("relaying packet of {} byte(s)", buffer.len());
  socket.send(buffer).await?;
  stats.packets.inc();
  Ok(())
}

async fn relay_loop(
  socket: UdpSocket,
  mut receiver: mpsc::Receiver<Bytes>,
  packet_length: usize,
  stats: RelayStats,
  mut shutdown: ComponentShutdown,
) {
  let mut buffer = BytesMut::new();
  let mut interval = tokio::time::interval(FLUSH_INTERVAL);
  loop {
    select! {
      _ = interval.tick() => {
        if let Err(e) = send_packet(&socket, &stats, &buffer).await {
          error!("relay send error: {e}");
          return;
        }
        buffer.clear();
      }
      line = receiver.recv() => {
        let Some(line) = line else {
          break;
        };
        if buffer.len() + line.len() > packet_length {
          if let Err(e) = send_packet(&socket, &stats, &buffer).await {
            error!("relay send error: {e}");
            return;
          }
          buffer.clear();
        }
        buffer.extend_from_slice(&line);
      }
      () = shutdown.cancelled() => {
        break;
      }
    }
  }

  // Best-effort final flush on clean shutdown.
  if let Err(e) = send_packet(&socket, &stats, &buffer).await {
    error!("relay send error: {e}");
  }
  drop(shutdown);
}
