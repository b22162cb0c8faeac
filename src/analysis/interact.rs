use linked_hash_map::LinkedHashMap;

use crate::builder::SysBuilder;
use crate::ir::instructions::{ArrayRead, ArrayWrite, AsyncCall, FIFOPush};
use crate::ir::node::*;
use crate::ir::visitor::Visitor;
use crate::ir::*;

/// Per-module interaction record: every resource-touching site in body order.
#[derive(Default)]
pub struct ModuleRecord {
  pub array_reads: Vec<BaseNode>,
  pub array_writes: Vec<BaseNode>,
  pub fifo_pushes: Vec<BaseNode>,
  pub fifo_pops: Vec<BaseNode>,
  pub async_calls: Vec<BaseNode>,
  pub finishes: Vec<BaseNode>,
}

/// The per-(module, resource) interaction index. Collected once over the frozen system
/// and then sealed: collection after sealing and queries before it are both programming
/// errors and fail loudly.
pub struct InteractionMatrix {
  frozen: bool,
  records: LinkedHashMap<BaseNode, ModuleRecord>,
  /// caller -> callee -> async-call sites, in body order.
  calls: LinkedHashMap<(BaseNode, BaseNode), Vec<BaseNode>>,
}

impl InteractionMatrix {
  pub fn new() -> Self {
    Self {
      frozen: false,
      records: LinkedHashMap::new(),
      calls: LinkedHashMap::new(),
    }
  }

  fn assert_mutable(&self) {
    assert!(!self.frozen, "InteractionMatrix is frozen; collection is over");
  }

  fn assert_frozen(&self) {
    assert!(
      self.frozen,
      "InteractionMatrix is still being collected; freeze it before querying"
    );
  }

  fn record_mut(&mut self, module: BaseNode) -> &mut ModuleRecord {
    self.assert_mutable();
    self.records.entry(module).or_insert_with(ModuleRecord::default)
  }

  pub fn freeze(&mut self) {
    self.assert_mutable();
    self.frozen = true;
  }

  pub fn is_frozen(&self) -> bool {
    self.frozen
  }

  pub fn record(&self, module: &BaseNode) -> Option<&ModuleRecord> {
    self.assert_frozen();
    self.records.get(module)
  }

  /// The async-call sites of caller into callee.
  pub fn calls_between(&self, caller: &BaseNode, callee: &BaseNode) -> &[BaseNode] {
    self.assert_frozen();
    self
      .calls
      .get(&(*caller, *callee))
      .map(|x| x.as_slice())
      .unwrap_or(&[])
  }

  /// Iterate the async-call ledger in collection order.
  pub fn call_iter(&self) -> impl Iterator<Item = (&(BaseNode, BaseNode), &Vec<BaseNode>)> {
    self.assert_frozen();
    self.calls.iter()
  }

  /// The modules calling the given callee, in collection order.
  pub fn callers_of(&self, callee: &BaseNode) -> Vec<BaseNode> {
    self.assert_frozen();
    let mut res = Vec::new();
    for ((caller, target), _) in self.calls.iter() {
      if target == callee && !res.contains(caller) {
        res.push(*caller);
      }
    }
    res
  }

  /// Whether any module finishes the simulation.
  pub fn has_finish(&self, module: &BaseNode) -> bool {
    self.assert_frozen();
    self
      .records
      .get(module)
      .map(|x| !x.finishes.is_empty())
      .unwrap_or(false)
  }
}

struct Collector<'a> {
  sys: &'a SysBuilder,
  module: BaseNode,
  matrix: InteractionMatrix,
}

impl Visitor<()> for Collector<'_> {
  fn visit_module(&mut self, module: &ModuleRef<'_>) -> Option<()> {
    self.module = module.upcast();
    self.matrix.record_mut(self.module);
    self.visit_block(&module.get_body())
  }

  fn visit_expr(&mut self, expr: &ExprRef<'_>) -> Option<()> {
    let node = expr.get().upcast();
    let module = self.module;
    match expr.get_opcode() {
      Opcode::ArrayRead => {
        debug_assert!(node.as_inst::<ArrayRead>(self.sys).is_ok());
        self.matrix.record_mut(module).array_reads.push(node);
      }
      Opcode::ArrayWrite => {
        debug_assert!(node.as_inst::<ArrayWrite>(self.sys).is_ok());
        self.matrix.record_mut(module).array_writes.push(node);
      }
      Opcode::FIFOPush => {
        debug_assert!(node.as_inst::<FIFOPush>(self.sys).is_ok());
        self.matrix.record_mut(module).fifo_pushes.push(node);
      }
      Opcode::FIFOPop => {
        self.matrix.record_mut(module).fifo_pops.push(node);
      }
      Opcode::AsyncCall => {
        let callee = node.as_inst::<AsyncCall>(self.sys).unwrap().callee().upcast();
        self.matrix.record_mut(module).async_calls.push(node);
        self
          .matrix
          .assert_mutable();
        self
          .matrix
          .calls
          .entry((module, callee))
          .or_insert_with(Vec::new)
          .push(node);
      }
      Opcode::Intrinsic { intrin } => {
        if let crate::ir::expr::subcode::Intrinsic::Finish = intrin {
          self.matrix.record_mut(module).finishes.push(node);
        }
      }
      _ => {}
    }
    None
  }
}

impl Default for InteractionMatrix {
  fn default() -> Self {
    Self::new()
  }
}

/// Collect and seal the interaction matrix of a fully built system.
pub fn collect_interactions(sys: &SysBuilder) -> InteractionMatrix {
  let mut collector = Collector {
    sys,
    module: BaseNode::unknown(),
    matrix: InteractionMatrix::new(),
  };
  collector.enter(sys);
  let mut matrix = collector.matrix;
  matrix.freeze();
  matrix
}
