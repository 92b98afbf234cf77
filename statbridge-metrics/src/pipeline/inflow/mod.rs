// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod tcp;
pub mod udp;
pub mod unix;
pub mod util;

use async_trait::async_trait;
use std::sync::Arc;

//
// PipelineInflow
//

// A bound wire listener. Construction binds the socket (bind failures are the only fatal
// errors past argument parsing); start() spawns the read tasks.
#[async_trait]
pub trait PipelineInflow: Send + Sync {
  async fn start(self: Arc<Self>);
}
