// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::export;
use crate::mapper::MetricMapper;
use crate::pipeline::aggregation::AggregatorHandle;
use crate::shutdown::ComponentShutdown;
use crate::stats::Collector;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use log::{info, warn};
use prometheus::{Encoder, TextEncoder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

//
// AdminState
//

// State behind the scrape/lifecycle endpoints: the aggregator snapshot handle, the internal
// stats registry, and the mapper for lifecycle reloads.
pub struct AdminState {
  collector: Collector,
  aggregator: AggregatorHandle,
  mapper: Arc<MetricMapper>,
  mapping_path: Option<PathBuf>,
}

impl AdminState {
  #[must_use]
  pub const fn new(
    collector: Collector,
    aggregator: AggregatorHandle,
    mapper: Arc<MetricMapper>,
    mapping_path: Option<PathBuf>,
  ) -> Self {
    Self {
      collector,
      aggregator,
      mapper,
      mapping_path,
    }
  }

  async fn root() -> &'static str {
    "statbridge: statsd to prometheus bridge"
  }

  async fn healthy() -> &'static str {
    "statbridge is healthy\n"
  }

  async fn ready() -> &'static str {
    "statbridge is ready\n"
  }

  // The scrape surface: aggregated measurements first, then the process-internal stats.
  async fn metrics(State(state): State<Arc<Self>>) -> String {
    let mut out = export::render(&state.aggregator.snapshot().await);

    let families = state.collector.registry().gather();
    let mut encoded = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut encoded) {
      warn!("failed to encode internal stats: {e}");
    }
    out.push_str(&String::from_utf8_lossy(&encoded));
    out
  }

  async fn reload(State(state): State<Arc<Self>>) -> String {
    let Some(path) = &state.mapping_path else {
      warn!("received lifecycle reload but no mapping config to reload");
      return "no mapping config to reload\n".to_string();
    };
    info!("received lifecycle reload, attempting reload");
    match state.mapper.init_from_file(path) {
      Ok(()) => "config reloaded\n".to_string(),
      Err(e) => {
        warn!("error reloading config: {e:#}");
        format!("config reload failed: {e:#}\n")
      },
    }
  }

  fn make_router(self: Arc<Self>) -> Router {
    Router::new()
      .route("/", get(Self::root))
      .route("/metrics", get(Self::metrics))
      .route("/-/healthy", get(Self::healthy))
      .route("/-/ready", get(Self::ready))
      .route("/-/reload", post(Self::reload))
      .with_state(self)
  }
}

// Bind and spawn the admin server. Bind failures are fatal; everything after runs until
// shutdown.
pub async fn spawn_server(
  state: Arc<AdminState>,
  bind: &str,
  mut shutdown: ComponentShutdown,
) -> anyhow::Result<()> {
  let listener = TcpListener::bind(bind).await?;
  info!("admin server starting on {}", listener.local_addr()?);
  let router = state.make_router();
  tokio::spawn(async move {
    let result = axum::serve(listener, router)
      .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
      })
      .await;
    if let Err(e) = result {
      warn!("admin server error: {e}");
    }
  });
  Ok(())
}
