// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use std::time::Duration;

#[tokio::test]
async fn shutdown_waits_for_components() {
  let trigger = ComponentShutdownTrigger::default();
  let mut shutdown = trigger.make_shutdown();
  let (started_tx, started_rx) = tokio::sync::oneshot::channel();
  let handle = tokio::spawn(async move {
    started_tx.send(()).unwrap();
    shutdown.cancelled().await;
    // Hold the shutdown briefly to prove the trigger waits for the drop.
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(shutdown);
  });

  started_rx.await.unwrap();
  trigger.shutdown().await;
  handle.await.unwrap();
}

#[tokio::test]
async fn cancelled_is_clone_safe() {
  let trigger = ComponentShutdownTrigger::default();
  let shutdown = trigger.make_shutdown();
  let mut clone = shutdown.clone();
  let handle = tokio::spawn(async move {
    clone.cancelled().await;
  });
  drop(shutdown);
  trigger.shutdown().await;
  handle.await.unwrap();
}
