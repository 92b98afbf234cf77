// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::shutdown::ComponentShutdownTrigger;
use crate::stats::Collector;
use pretty_assertions::assert_eq;

async fn make_receiver() -> (UdpSocket, String) {
  let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  let target = socket.local_addr().unwrap().to_string();
  (socket, target)
}

async fn recv_packet(socket: &UdpSocket) -> Vec<u8> {
  let mut buf = vec![0_u8; 65536];
  let len = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
    .await
    .expect("timed out waiting for relay packet")
    .unwrap();
  buf.truncate(len);
  buf
}

#[tokio::test]
async fn lines_are_packed_until_packet_length() {
  let (receiver, target) = make_receiver().await;
  let trigger = ComponentShutdownTrigger::default();
  let relay = Relay::new(
    &Collector::default().scope("test"),
    &target,
    16,
    trigger.make_shutdown(),
  )
  .await
  .unwrap();

  relay.relay_line(&"foo.bar:1|c".into());
  // The second line overflows the 16 byte packet, forcing the first out immediately.
  relay.relay_line(&"foo.baz:2|c".into());

  assert_eq!(b"foo.bar:1|c\n".to_vec(), recv_packet(&receiver).await);
  assert_eq!(2, relay.stats.relayed_lines.get());
  trigger.shutdown().await;
}

#[tokio::test]
async fn newline_is_not_duplicated() {
  let (receiver, target) = make_receiver().await;
  let trigger = ComponentShutdownTrigger::default();
  let relay = Relay::new(
    &Collector::default().scope("test"),
    &target,
    16,
    trigger.make_shutdown(),
  )
  .await
  .unwrap();

  relay.relay_line(&"foo.bar:1|c\n".into());
  relay.relay_line(&"foo.baz:2|c".into());
  assert_eq!(b"foo.bar:1|c\n".to_vec(), recv_packet(&receiver).await);
  trigger.shutdown().await;
}

#[tokio::test]
async fn long_lines_are_dropped_and_counted() {
  let (_receiver, target) = make_receiver().await;
  let trigger = ComponentShutdownTrigger::default();
  let relay = Relay::new(
    &Collector::default().scope("test"),
    &target,
    16,
    trigger.make_shutdown(),
  )
  .await
  .unwrap();

  relay.relay_line(&"this.line.is.far.too.long.to.relay:1|c".into());
  assert_eq!(1, relay.stats.long_lines.get());
  assert_eq!(0, relay.stats.relayed_lines.get());
  trigger.shutdown().await;
}

#[tokio::test]
async fn periodic_tick_flushes_buffer() {
  let (receiver, target) = make_receiver().await;
  let trigger = ComponentShutdownTrigger::default();
  let relay = Relay::new(
    &Collector::default().scope("test"),
    &target,
    1400,
    trigger.make_shutdown(),
  )
  .await
  .unwrap();

  relay.relay_line(&"foo.bar:1|c".into());
  // Nothing close to 1400 bytes buffered: only the one second tick can flush.
  assert_eq!(b"foo.bar:1|c\n".to_vec(), recv_packet(&receiver).await);
  trigger.shutdown().await;
}
