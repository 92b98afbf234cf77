// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./shutdown_test.rs"]
mod shutdown_test;

use tokio::sync::{mpsc, watch};

//
// ComponentShutdownTrigger
//

// Signals shutdown to every ComponentShutdown handed out via make_shutdown() and waits for all
// of them to drop. Components hold their ComponentShutdown for the lifetime of their task loop
// so the drop doubles as a completion acknowledgement.
pub struct ComponentShutdownTrigger {
  sender: watch::Sender<bool>,
  receiver: watch::Receiver<bool>,
  ack_sender: mpsc::Sender<()>,
  ack_receiver: mpsc::Receiver<()>,
}

impl Default for ComponentShutdownTrigger {
  fn default() -> Self {
    let (sender, receiver) = watch::channel(false);
    let (ack_sender, ack_receiver) = mpsc::channel(1);
    Self {
      sender,
      receiver,
      ack_sender,
      ack_receiver,
    }
  }
}

impl ComponentShutdownTrigger {
  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      receiver: self.receiver.clone(),
      _ack: self.ack_sender.clone(),
    }
  }

  // Trigger shutdown and wait for every outstanding ComponentShutdown to drop.
  pub async fn shutdown(self) {
    let Self {
      sender,
      receiver,
      ack_sender,
      mut ack_receiver,
    } = self;
    drop(receiver);
    drop(ack_sender);
    let _ignored = sender.send(true);
    // recv() returns None once the last ack sender is gone.
    while ack_receiver.recv().await.is_some() {}
  }
}

//
// ComponentShutdown
//

#[derive(Clone)]
pub struct ComponentShutdown {
  receiver: watch::Receiver<bool>,
  _ack: mpsc::Sender<()>,
}

impl ComponentShutdown {
  // Resolves when shutdown has been triggered. Cancel safe.
  pub async fn cancelled(&mut self) {
    // An error means the trigger was dropped without firing, which we treat the same way.
    let _ignored = self.receiver.wait_for(|shutdown| *shutdown).await;
  }
}
