// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn literal_match() {
  let mut fsm = Fsm::default();
  fsm.add_rule("foo.bar", 0).unwrap();
  assert_eq!(
    vec![GlobMatch {
      rule_index: 0,
      captures: vec![],
    }],
    fsm.lookup(b"foo.bar")
  );
  assert!(fsm.lookup(b"foo").is_empty());
  assert!(fsm.lookup(b"foo.bar.baz").is_empty());
  assert!(fsm.lookup(b"foo.baz").is_empty());
}

#[test]
fn wildcard_captures() {
  let mut fsm = Fsm::default();
  fsm.add_rule("client.*.request.*", 3).unwrap();
  assert_eq!(
    vec![GlobMatch {
      rule_index: 3,
      captures: vec!["web".to_string(), "count".to_string()],
    }],
    fsm.lookup(b"client.web.request.count")
  );
  assert!(fsm.lookup(b"client.web.response.count").is_empty());
}

#[test]
fn ambiguity_returns_all_matches_in_rule_order() {
  let mut fsm = Fsm::default();
  fsm.add_rule("a.*.c", 0).unwrap();
  fsm.add_rule("a.b.*", 1).unwrap();
  let matches = fsm.lookup(b"a.b.c");
  assert_eq!(2, matches.len());
  assert_eq!(0, matches[0].rule_index);
  assert_eq!(vec!["b".to_string()], matches[0].captures);
  assert_eq!(1, matches[1].rule_index);
  assert_eq!(vec!["c".to_string()], matches[1].captures);
}

#[test]
fn literal_and_wildcard_both_accept() {
  let mut fsm = Fsm::default();
  fsm.add_rule("a.b", 1).unwrap();
  fsm.add_rule("a.*", 0).unwrap();
  let matches = fsm.lookup(b"a.b");
  assert_eq!(2, matches.len());
  assert_eq!(0, matches[0].rule_index);
  assert_eq!(vec!["b".to_string()], matches[0].captures);
  assert_eq!(1, matches[1].rule_index);
  assert!(matches[1].captures.is_empty());
}

#[test]
fn all_wildcards() {
  let mut fsm = Fsm::default();
  fsm.add_rule("*.*.*", 0).unwrap();
  assert_eq!(
    vec![GlobMatch {
      rule_index: 0,
      captures: vec!["a".to_string(), "b".to_string(), "c".to_string()],
    }],
    fsm.lookup(b"a.b.c")
  );
  assert!(fsm.lookup(b"a.b").is_empty());
}

#[test]
fn partial_wildcard_segment_rejected() {
  let mut fsm = Fsm::default();
  assert!(fsm.add_rule("foo*.bar", 0).is_err());
}

#[test]
fn empty_fsm() {
  let fsm = Fsm::default();
  assert!(fsm.is_empty());
  assert!(fsm.lookup(b"anything").is_empty());
}
