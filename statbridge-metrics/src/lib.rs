// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod admin;
pub mod export;
pub mod mapper;
pub mod pipeline;
pub mod protos;
pub mod shutdown;
pub mod stats;

#[cfg(test)]
pub mod test;
