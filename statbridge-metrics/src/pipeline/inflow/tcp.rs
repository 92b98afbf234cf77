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
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;

const READ_BUFFER_SIZE: usize = 8192;

// Lines longer than this cannot be valid samples; the connection buffer is discarded and the
// line counted rather than growing without bound.
const MAX_LINE_LEN: usize = 65536;

//
// TcpInflowConfig
//

pub struct TcpInflowConfig {
  pub bind: String,
}

#[derive(Clone)]
struct TcpStats {
  connections: IntCounter,
  errors: IntCounter,
  too_long_lines: IntCounter,
}

//
// TcpInflow
//

pub struct TcpInflow {
  bind: String,
  listener: Mutex<Option<TcpListener>>,
  handler: LineHandler,
  stats: TcpStats,
  shutdown: ComponentShutdown,
}

impl TcpInflow {
  pub async fn new(
    config: TcpInflowConfig,
    handler: LineHandler,
    scope: &Scope,
    shutdown: ComponentShutdown,
  ) -> anyhow::Result<Self> {
    let listener = TcpListener::bind(&config.bind).await?;
    info!("tcp listener running on {}", listener.local_addr()?);
    Ok(Self {
      bind: config.bind,
      listener: Mutex::new(Some(listener)),
      handler,
      stats: TcpStats {
        connections: scope.counter("tcp_connections_total"),
        errors: scope.counter("tcp_connection_errors_total"),
        too_long_lines: scope.counter("tcp_too_long_lines_total"),
      },
      shutdown,
    })
  }
}

#[async_trait]
impl PipelineInflow for TcpInflow {
  async fn start(self: Arc<Self>) {
    tokio::spawn(accept_loop(
      self.bind.clone(),
      self.listener.lock().take().unwrap(),
      self.handler.clone(),
      self.stats.clone(),
      self.shutdown.clone(),
    ));
  }
}

async fn accept_loop(
  bind: String,
  listener: TcpListener,
  handler: LineHandler,
  stats: TcpStats,
  mut shutdown: ComponentShutdown,
) {
  loop {
    select! {
      result = listener.accept() => {
        match result {
          Ok((socket, peer_addr)) => {
            debug!("tcp accept from {peer_addr}");
            stats.connections.inc();
            tokio::spawn(connection_handler(
              socket,
              handler.clone(),
              stats.clone(),
              shutdown.clone(),
            ));
          },
          Err(e) => {
            warn!("tcp accept error: {e}");
            stats.errors.inc();
          },
        }
      }
      () = shutdown.cancelled() => {
        break;
      }
    }
  }
  info!("terminated tcp listener on {bind}");
  drop(shutdown);
}

async fn connection_handler(
  mut socket: TcpStream,
  handler: LineHandler,
  stats: TcpStats,
  mut shutdown: ComponentShutdown,
) {
  let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
  loop {
    if buf.remaining_mut() < READ_BUFFER_SIZE {
      buf.reserve(READ_BUFFER_SIZE);
    }
    let result = select! {
      r = socket.read_buf(&mut buf) => r,
      () = shutdown.cancelled() => break,
    };
    match result {
      Ok(0) => {
        // Peer closed; a final unterminated line is still a line on a stream.
        let mut lines = process_buffer_newlines(&mut buf, true);
        if !buf.is_empty() {
          lines.push(buf.split().freeze());
        }
        handler.handle_lines(lines);
        debug!("closing tcp reader (eof)");
        break;
      },
      Ok(_) => {
        let lines = process_buffer_newlines(&mut buf, true);
        handler.handle_lines(lines);
        if buf.len() > MAX_LINE_LEN {
          stats.too_long_lines.inc();
          buf.clear();
        }
      },
      Err(e) => {
        debug!("tcp read error: {e}");
        stats.errors.inc();
        break;
      },
    }
  }
  drop(shutdown);
}
