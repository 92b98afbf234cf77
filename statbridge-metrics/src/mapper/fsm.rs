// statbridge - bitdrift's statsd to prometheus bridge
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./fsm_test.rs"]
mod fsm_test;

use ahash::AHashMap;
use anyhow::bail;

const ROOT: usize = 0;

//
// Node
//

// One FSM state. Children are arena indices, never owning pointers, so the whole automaton is
// freed as a single allocation when a reload swaps it out.
#[derive(Debug, Default)]
struct Node {
  children: AHashMap<String, usize>,
  wildcard: Option<usize>,
  // Rule indices accepting at this state. More than one entry means identical patterns.
  accepts: Vec<usize>,
}

//
// GlobMatch
//

#[derive(Debug, Eq, PartialEq)]
pub struct GlobMatch {
  pub rule_index: usize,
  pub captures: Vec<String>,
}

//
// Fsm
//

// A finite-state automaton over '.'-separated name segments. Each glob rule contributes a path
// from the root to an accepting state; a '*' segment becomes a wildcard edge that binds the
// consumed segment as a capture.
#[derive(Debug)]
pub struct Fsm {
  nodes: Vec<Node>,
}

impl Default for Fsm {
  fn default() -> Self {
    Self {
      nodes: vec![Node::default()],
    }
  }
}

impl Fsm {
  pub fn add_rule(&mut self, pattern: &str, rule_index: usize) -> anyhow::Result<()> {
    let mut node = ROOT;
    for segment in pattern.split('.') {
      if segment == "*" {
        node = match self.nodes[node].wildcard {
          Some(next) => next,
          None => {
            let next = self.alloc();
            self.nodes[node].wildcard = Some(next);
            next
          },
        };
      } else if segment.contains('*') {
        bail!("unsupported glob segment '{segment}' in pattern '{pattern}'");
      } else {
        node = match self.nodes[node].children.get(segment) {
          Some(next) => *next,
          None => {
            let next = self.alloc();
            self.nodes[node].children.insert(segment.to_string(), next);
            next
          },
        };
      }
    }
    self.nodes[node].accepts.push(rule_index);
    Ok(())
  }

  fn alloc(&mut self) -> usize {
    self.nodes.push(Node::default());
    self.nodes.len() - 1
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    let root = &self.nodes[ROOT];
    root.children.is_empty() && root.wildcard.is_none() && root.accepts.is_empty()
  }

  // Walk the automaton over the input's segments and collect every accepting path together
  // with its wildcard captures, ordered by rule index. Literal edges are explored before the
  // wildcard edge but ambiguity is resolved by rule order, not path shape.
  #[must_use]
  pub fn lookup(&self, input: &[u8]) -> Vec<GlobMatch> {
    if self.is_empty() {
      return vec![];
    }

    let segments: Vec<&[u8]> = input.split(|b| *b == b'.').collect();
    let mut matches = Vec::new();
    let mut captures = Vec::new();
    self.walk(ROOT, &segments, &mut captures, &mut matches);
    matches.sort_by_key(|m| m.rule_index);
    matches
  }

  fn walk(
    &self,
    node: usize,
    segments: &[&[u8]],
    captures: &mut Vec<String>,
    out: &mut Vec<GlobMatch>,
  ) {
    let Some((segment, rest)) = segments.split_first() else {
      for rule_index in &self.nodes[node].accepts {
        out.push(GlobMatch {
          rule_index: *rule_index,
          captures: captures.clone(),
        });
      }
      return;
    };

    if let Some(child) = std::str::from_utf8(segment)
      .ok()
      .and_then(|segment| self.nodes[node].children.get(segment))
    {
      self.walk(*child, rest, captures, out);
    }
    if let Some(wildcard) = self.nodes[node].wildcard {
      captures.push(String::from_utf8_lossy(segment).into_owned());
      self.walk(wildcard, rest, captures, out);
      captures.pop();
    }
  }
}
