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
use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use log::{info, warn};
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixDatagram;
use tokio::select;

const RECV_BUFFER_SIZE: usize = 65536;

//
// UnixInflowConfig
//

pub struct UnixInflowConfig {
  pub path: PathBuf,
  // Octal permission bits applied to the socket file after bind.
  pub socket_mode: Option<u32>,
}

//
// UnixInflow
//

// Local datagram listener. Same line semantics as UDP, minus the packet queue: unixgram
// senders are local and the kernel buffer is the only backpressure.
pub struct UnixInflow {
  path: PathBuf,
  socket: Mutex<Option<UnixDatagram>>,
  handler: LineHandler,
  packets: IntCounter,
  shutdown: ComponentShutdown,
}

impl UnixInflow {
  pub async fn new(
    config: UnixInflowConfig,
    handler: LineHandler,
    scope: &Scope,
    shutdown: ComponentShutdown,
  ) -> anyhow::Result<Self> {
    if config.path.exists() {
      bail!("unixgram socket {} already exists", config.path.display());
    }
    let socket = UnixDatagram::bind(&config.path)
      .with_context(|| format!("binding unixgram socket {}", config.path.display()))?;
    if let Some(mode) = config.socket_mode {
      std::fs::set_permissions(&config.path, std::fs::Permissions::from_mode(mode))
        .context("setting unixgram socket permissions")?;
    }
    info!("unixgram listener running on {}", config.path.display());
    Ok(Self {
      path: config.path,
      socket: Mutex::new(Some(socket)),
      handler,
      packets: scope.counter("unixgram_packets_total"),
      shutdown,
    })
  }
}

#[async_trait]
impl PipelineInflow for UnixInflow {
  async fn start(self: Arc<Self>) {
    tokio::spawn(unixgram_reader(
      self.path.clone(),
      self.socket.lock().take().unwrap(),
      self.handler.clone(),
      self.packets.clone(),
      self.shutdown.clone(),
    ));
  }
}

async fn unixgram_reader(
  path: PathBuf,
  socket: UnixDatagram,
  handler: LineHandler,
  packets: IntCounter,
  mut shutdown: ComponentShutdown,
) {
  let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
  loop {
    buf.reserve(RECV_BUFFER_SIZE);
    select! {
      result = socket.recv_buf_from(&mut buf) => {
        match result {
          Ok((bytes, _peer_addr)) => {
            log::trace!("unixgram recv len={bytes}");
            packets.inc();
            let lines = process_buffer_newlines(&mut buf, false);
            handler.handle_lines(lines);
          },
          Err(e) => warn!("unixgram receiver error: {e}"),
        }
      }
      () = shutdown.cancelled() => {
        break;
      }
    }
  }
  if let Err(e) = std::fs::remove_file(&path) {
    warn!("failed to remove unixgram socket {}: {e}", path.display());
  }
  info!("terminated unixgram listener on {}", path.display());
  drop(shutdown);
}
