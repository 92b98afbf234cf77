// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::{Context, bail};
use clap::Parser;
use log::{info, warn};
use statbridge_metrics::admin::server::{AdminState, spawn_server};
use statbridge_metrics::mapper::MetricMapper;
use statbridge_metrics::mapper::cache::{CacheType, make_cache};
use statbridge_metrics::pipeline::aggregation::Aggregator;
use statbridge_metrics::pipeline::event::EventQueue;
use statbridge_metrics::pipeline::inflow::PipelineInflow;
use statbridge_metrics::pipeline::inflow::tcp::{TcpInflow, TcpInflowConfig};
use statbridge_metrics::pipeline::inflow::udp::{UdpInflow, UdpInflowConfig};
use statbridge_metrics::pipeline::inflow::unix::{UnixInflow, UnixInflowConfig};
use statbridge_metrics::pipeline::inflow::util::LineHandler;
use statbridge_metrics::pipeline::relay::Relay;
use statbridge_metrics::protos::statsd::LineParser;
use statbridge_metrics::shutdown::ComponentShutdownTrigger;
use statbridge_metrics::stats::Collector;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

fn parse_duration(input: &str) -> anyhow::Result<Duration> {
  Ok(humantime::parse_duration(input)?)
}

#[derive(Parser, Debug, Clone)]
#[command(
  name = "statbridge",
  about = "Bridges statsd metric traffic into prometheus measurements"
)]
struct Options {
  #[arg(
    long = "web.listen-address",
    default_value = "0.0.0.0:9102",
    help = "The address on which to expose the scrape and lifecycle endpoints."
  )]
  web_listen_address: String,

  #[arg(
    long = "statsd.listen-udp",
    default_value = "0.0.0.0:9125",
    help = "The UDP address on which to receive statsd metric lines. \"\" disables it."
  )]
  statsd_listen_udp: String,

  #[arg(
    long = "statsd.listen-tcp",
    default_value = "0.0.0.0:9125",
    help = "The TCP address on which to receive statsd metric lines. \"\" disables it."
  )]
  statsd_listen_tcp: String,

  #[arg(
    long = "statsd.listen-unixgram",
    default_value = "",
    help = "The unixgram socket path to receive statsd metric lines. \"\" disables it."
  )]
  statsd_listen_unixgram: String,

  // Not an octal literal so the default displays as expected.
  #[arg(
    long = "statsd.unixsocket-mode",
    default_value = "755",
    help = "The permission mode of the unixgram socket."
  )]
  statsd_unixsocket_mode: String,

  #[arg(
    long = "statsd.mapping-config",
    help = "Metric mapping configuration file name."
  )]
  statsd_mapping_config: Option<PathBuf>,

  #[arg(
    long = "statsd.cache-size",
    default_value_t = 1000,
    help = "Maximum size of the metric mapping cache. 0 disables the cache."
  )]
  statsd_cache_size: usize,

  #[arg(
    long = "statsd.cache-type",
    default_value = "lru",
    help = "Metric mapping cache replacement policy, \"lru\" or \"random\"."
  )]
  statsd_cache_type: String,

  #[arg(
    long = "statsd.event-queue-size",
    default_value_t = 10000,
    help = "Number of event batches the internal queue holds before shedding the oldest."
  )]
  statsd_event_queue_size: usize,

  #[arg(
    long = "statsd.event-flush-threshold",
    default_value_t = 1000,
    help = "Number of events to hold in queue before flushing."
  )]
  statsd_event_flush_threshold: usize,

  #[arg(
    long = "statsd.event-flush-interval",
    default_value = "200ms",
    value_parser = parse_duration,
    help = "Maximum time between event queue flushes."
  )]
  statsd_event_flush_interval: Duration,

  #[arg(
    long = "statsd.udp-packet-queue-size",
    default_value_t = 10000,
    help = "Size of the internal queue for processing UDP packets."
  )]
  statsd_udp_packet_queue_size: usize,

  #[arg(
    long = "statsd.parse-dogstatsd-tags",
    default_value_t = true,
    action = clap::ArgAction::Set,
    help = "Parse DogStatsD style tags."
  )]
  statsd_parse_dogstatsd_tags: bool,

  #[arg(
    long = "statsd.parse-influxdb-tags",
    default_value_t = true,
    action = clap::ArgAction::Set,
    help = "Parse InfluxDB style tags."
  )]
  statsd_parse_influxdb_tags: bool,

  #[arg(
    long = "statsd.parse-librato-tags",
    default_value_t = true,
    action = clap::ArgAction::Set,
    help = "Parse Librato style tags."
  )]
  statsd_parse_librato_tags: bool,

  #[arg(
    long = "statsd.parse-signalfx-tags",
    default_value_t = true,
    action = clap::ArgAction::Set,
    help = "Parse SignalFX style tags."
  )]
  statsd_parse_signalfx_tags: bool,

  #[arg(
    long = "statsd.relay.address",
    help = "The UDP relay target address (host:port)."
  )]
  statsd_relay_address: Option<String>,

  #[arg(
    long = "statsd.relay.packet-length",
    default_value_t = 1400,
    help = "Maximum relay output packet length to avoid fragmentation."
  )]
  statsd_relay_packet_length: usize,

  #[arg(long = "check-config", help = "Check configuration and exit.")]
  check_config: bool,
}

fn main() -> anyhow::Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  let opts = Options::parse();

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::new(1).unwrap()
  });
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()
    .unwrap();
  runtime.block_on(run(opts))
}

async fn run(opts: Options) -> anyhow::Result<()> {
  let collector = Collector::default();
  let scope = collector.scope("statbridge");

  let mut parser = LineParser::new(&scope);
  if opts.statsd_parse_dogstatsd_tags {
    parser.enable_dogstatsd_parsing();
  }
  if opts.statsd_parse_influxdb_tags {
    parser.enable_influxdb_parsing();
  }
  if opts.statsd_parse_librato_tags {
    parser.enable_librato_parsing();
  }
  if opts.statsd_parse_signalfx_tags {
    parser.enable_signalfx_parsing();
  }
  let parser = Arc::new(parser);

  let cache_type: CacheType = opts.statsd_cache_type.parse()?;
  let cache = make_cache(&scope.scope("mapper"), cache_type, opts.statsd_cache_size);
  let mapper = Arc::new(MetricMapper::new(&scope, cache));
  if let Some(path) = &opts.statsd_mapping_config {
    mapper
      .init_from_file(path)
      .with_context(|| format!("loading mapping config {}", path.display()))?;
  }
  if opts.check_config {
    info!("configuration check successful, exiting");
    return Ok(());
  }

  if opts.statsd_listen_udp.is_empty()
    && opts.statsd_listen_tcp.is_empty()
    && opts.statsd_listen_unixgram.is_empty()
  {
    bail!("at least one of UDP/TCP/unixgram listeners must be specified");
  }

  let shutdown_trigger = ComponentShutdownTrigger::default();

  let queue = EventQueue::new(
    &scope,
    opts.statsd_event_queue_size,
    opts.statsd_event_flush_threshold,
    opts.statsd_event_flush_interval,
    shutdown_trigger.make_shutdown(),
  );

  let (aggregator, aggregator_handle, snapshots) = Aggregator::new(&scope, mapper.clone());
  let aggregator_task = tokio::spawn(aggregator.run(queue.clone(), snapshots));

  let relay = match &opts.statsd_relay_address {
    Some(target) => Some(
      Relay::new(
        &scope,
        target,
        opts.statsd_relay_packet_length,
        shutdown_trigger.make_shutdown(),
      )
      .await?,
    ),
    None => None,
  };

  let handler = LineHandler::new(&scope, parser, queue.clone(), relay);

  let mut inflows: Vec<Arc<dyn PipelineInflow>> = Vec::new();
  if !opts.statsd_listen_udp.is_empty() {
    inflows.push(Arc::new(
      UdpInflow::new(
        UdpInflowConfig {
          bind: opts.statsd_listen_udp.clone(),
          packet_queue_size: opts.statsd_udp_packet_queue_size,
        },
        handler.clone(),
        &scope,
        shutdown_trigger.make_shutdown(),
      )
      .await?,
    ));
  }
  if !opts.statsd_listen_tcp.is_empty() {
    inflows.push(Arc::new(
      TcpInflow::new(
        TcpInflowConfig {
          bind: opts.statsd_listen_tcp.clone(),
        },
        handler.clone(),
        &scope,
        shutdown_trigger.make_shutdown(),
      )
      .await?,
    ));
  }
  if !opts.statsd_listen_unixgram.is_empty() {
    let socket_mode = u32::from_str_radix(&opts.statsd_unixsocket_mode, 8)
      .map(Some)
      .unwrap_or_else(|e| {
        warn!(
          "bad unixgram socket mode '{}': {e}, ignoring",
          opts.statsd_unixsocket_mode
        );
        None
      });
    inflows.push(Arc::new(
      UnixInflow::new(
        UnixInflowConfig {
          path: PathBuf::from(&opts.statsd_listen_unixgram),
          socket_mode,
        },
        handler.clone(),
        &scope,
        shutdown_trigger.make_shutdown(),
      )
      .await?,
    ));
  }
  for inflow in inflows {
    inflow.start().await;
  }
  info!(
    "accepting statsd traffic (udp: '{}', tcp: '{}', unixgram: '{}')",
    opts.statsd_listen_udp, opts.statsd_listen_tcp, opts.statsd_listen_unixgram
  );

  let admin_state = Arc::new(AdminState::new(
    collector,
    aggregator_handle,
    mapper.clone(),
    opts.statsd_mapping_config.clone(),
  ));
  spawn_server(
    admin_state,
    &opts.web_listen_address,
    shutdown_trigger.make_shutdown(),
  )
  .await?;
  info!("accepting scrapes on {}", opts.web_listen_address);

  // SIGHUP reloads the mapping configuration in place.
  {
    let mapper = mapper.clone();
    let mapping_config = opts.statsd_mapping_config.clone();
    let mut shutdown = shutdown_trigger.make_shutdown();
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
      loop {
        select! {
          _ = sighup.recv() => {
            let Some(path) = &mapping_config else {
              warn!("received SIGHUP but no mapping config to reload");
              continue;
            };
            info!("received SIGHUP, attempting reload");
            match mapper.init_from_file(path) {
              Ok(()) => info!("config reloaded successfully"),
              Err(e) => warn!("error reloading config: {e:#}"),
            }
          },
          () = shutdown.cancelled() => break,
        }
      }
      drop(shutdown);
    });
  }

  let mut sigint = signal(SignalKind::interrupt())?;
  let mut sigterm = signal(SignalKind::terminate())?;
  select! {
    _ = sigint.recv() => info!("received sigint"),
    _ = sigterm.recv() => info!("received sigterm"),
  }

  // Stop the listeners and the queue flusher; closing the queue lets the aggregator drain and
  // exit on its own.
  shutdown_trigger.shutdown().await;
  aggregator_task.await?;
  info!("clean shutdown complete");
  Ok(())
}
