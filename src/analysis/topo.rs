use std::collections::{HashMap, VecDeque};

use crate::builder::SysBuilder;
use crate::ir::node::BaseNode;

use super::external_usage::downstream_dependencies;

/// Kahn's topological sort over the downstream dependency graph. A downstream depends
/// on another downstream when its externals include a value the other produces.
/// Sequential modules never appear in the order; they are event-driven.
///
/// Panics on cycles: a combinational loop has no consistent evaluation order.
pub fn topo_downstream_modules(sys: &SysBuilder) -> Vec<BaseNode> {
  let downstreams = sys.downstreams.clone();
  let mut succs: HashMap<BaseNode, Vec<BaseNode>> = HashMap::new();
  let mut in_degree: HashMap<BaseNode, usize> = HashMap::new();
  for module in downstreams.iter() {
    succs.entry(*module).or_default();
    in_degree.entry(*module).or_insert(0);
  }
  for module in downstreams.iter() {
    for upstream in downstream_dependencies(sys, module) {
      if downstreams.contains(&upstream) {
        succs.get_mut(&upstream).unwrap().push(*module);
        *in_degree.get_mut(module).unwrap() += 1;
      }
    }
  }
  let mut queue = downstreams
    .iter()
    .filter(|x| in_degree[x] == 0)
    .copied()
    .collect::<VecDeque<_>>();
  let mut res = Vec::with_capacity(downstreams.len());
  while let Some(module) = queue.pop_front() {
    res.push(module);
    for succ in succs[&module].clone() {
      let degree = in_degree.get_mut(&succ).unwrap();
      *degree -= 1;
      if *degree == 0 {
        queue.push_back(succ);
      }
    }
  }
  if res.len() != downstreams.len() {
    panic!("Circular dependency detected in downstream modules");
  }
  res
}
