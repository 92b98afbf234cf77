// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::PipelineInflow;
use super::util::{LineHandler, process_buffer_newlines};
use crate::shutdown::ComponentShutdown;
use crate::stats::Scope;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{info, warn};
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;

const RECV_BUFFER_SIZE: usize = 65536;

//
// UdpInflowConfig
//

pub struct UdpInflowConfig {
  pub bind: String,
  pub packet_queue_size: usize,
}

#[derive(Clone)]
struct UdpStats {
  packets: IntCounter,
  packet_drops: IntCounter,
}

//
// UdpInflow
//

// Datagram listener. The socket reader splits packets into lines and pushes them onto a
// bounded packet queue; a separate task parses and enqueues so a slow parse never backs up
// into the kernel buffer. Queue overflow drops the packet and counts it.
pub struct UdpInflow {
  bind: String,
  socket: Mutex<Option<UdpSocket>>,
  handler: LineHandler,
  stats: UdpStats,
  packet_queue_size: usize,
  shutdown: ComponentShutdown,
}

impl UdpInflow {
  pub async fn new(
    config: UdpInflowConfig,
    handler: LineHandler,
    scope: &Scope,
    shutdown: ComponentShutdown,
  ) -> anyhow::Result<Self> {
    let socket = UdpSocket::bind(&config.bind).await?;
    info!("udp listener running on {}", socket.local_addr()?);
    Ok(Self {
      bind: config.bind,
      socket: Mutex::new(Some(socket)),
      handler,
      stats: UdpStats {
        packets: scope.counter("udp_packets_total"),
        packet_drops: scope.counter("udp_packet_drops_total"),
      },
      packet_queue_size: config.packet_queue_size,
      shutdown,
    })
  }
}

#[async_trait]
impl PipelineInflow for UdpInflow {
  async fn start(self: Arc<Self>) {
    let (packet_tx, packet_rx) = mpsc::channel(self.packet_queue_size);
    tokio::spawn(udp_reader(
      self.bind.clone(),
      self.socket.lock().take().unwrap(),
      packet_tx,
      self.stats.clone(),
      self.shutdown.clone(),
    ));
    tokio::spawn(udp_processor(
      packet_rx,
      self.handler.clone(),
      self.shutdown.clone(),
    ));
  }
}

async fn udp_reader(
  bind: String,
  socket: UdpSocket,
  packet_tx: mpsc::Sender<Vec<Bytes>>,
  stats: UdpStats,
  mut shutdown: ComponentShutdown,
) {
  let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
  loop {
    buf.reserve(RECV_BUFFER_SIZE);
    select! {
      result = socket.recv_buf_from(&mut buf) => {
        match result {
          Ok((bytes, peer_addr)) => {
            log::trace!("udp recv from={peer_addr} len={bytes}");
            stats.packets.inc();
            let lines = process_buffer_newlines(&mut buf, false);
            debug_assert!(buf.is_empty());
            if packet_tx.try_send(lines).is_err() {
              stats.packet_drops.inc();
            }
          },
          Err(e) => warn!("udp receiver error: {e}"),
        }
      }
      () = shutdown.cancelled() => {
        break;
      }
    }
  }
  info!("terminated udp listener on {bind}");
  drop(shutdown);
}

async fn udp_processor(
  mut packet_rx: mpsc::Receiver<Vec<Bytes>>,
  handler: LineHandler,
  mut shutdown: ComponentShutdown,
) {
  loop {
    select! {
      lines = packet_rx.recv() => match lines {
        Some(lines) => handler.handle_lines(lines),
        None => break,
      },
      () = shutdown.cancelled() => {
        break;
      }
    }
  }
  drop(shutdown);
}
