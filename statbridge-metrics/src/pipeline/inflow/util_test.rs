// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn splits_complete_lines() {
  let mut buf = BytesMut::from(&b"foo:1|c\nbar:2|c\n"[..]);
  let lines = process_buffer_newlines(&mut buf, true);
  assert_eq!(vec![Bytes::from("foo:1|c"), Bytes::from("bar:2|c")], lines);
  assert!(buf.is_empty());
}

#[test]
fn strips_carriage_returns() {
  let mut buf = BytesMut::from(&b"foo:1|c\r\nbar:2|c\r\n"[..]);
  let lines = process_buffer_newlines(&mut buf, true);
  assert_eq!(vec![Bytes::from("foo:1|c"), Bytes::from("bar:2|c")], lines);
}

#[test]
fn stream_mode_keeps_partial_line_buffered() {
  let mut buf = BytesMut::from(&b"foo:1|c\nbar:2"[..]);
  let lines = process_buffer_newlines(&mut buf, true);
  assert_eq!(vec![Bytes::from("foo:1|c")], lines);
  assert_eq!(&b"bar:2"[..], buf.as_ref());
}

#[test]
fn datagram_mode_flushes_trailing_line() {
  let mut buf = BytesMut::from(&b"foo:1|c\nbar:2|c"[..]);
  let lines = process_buffer_newlines(&mut buf, false);
  assert_eq!(vec![Bytes::from("foo:1|c"), Bytes::from("bar:2|c")], lines);
  assert!(buf.is_empty());
}

#[test]
fn empty_lines_are_yielded_but_skipped_by_handler() {
  let mut buf = BytesMut::from(&b"\n\nfoo:1|c\n"[..]);
  let lines = process_buffer_newlines(&mut buf, true);
  assert_eq!(3, lines.len());
  assert!(lines[0].is_empty());
  assert!(lines[1].is_empty());
}
