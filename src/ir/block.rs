use crate::ir::node::*;
use crate::ir::*;

use super::module::Module;

/// The guard of a block.
pub enum BlockKind {
  /// The root block of a module body.
  ModuleRoot,
  /// A conditionally executed block. The condition value is an operand-like reference,
  /// but conditions do not consume user slots; the guarded side effects carry the
  /// cumulative predicate in their `meta_cond`.
  Condition(BaseNode),
  /// A testbench-only block fired at an absolute simulated cycle.
  Cycle(usize),
}

/// An ordered sequence of expressions and nested blocks.
pub struct Block {
  pub(crate) key: usize,
  kind: BlockKind,
  body: Vec<BaseNode>,
  parent: BaseNode,
}

impl Block {
  pub(crate) fn new(kind: BlockKind, parent: BaseNode) -> Self {
    Self {
      key: 0,
      kind,
      body: Vec::new(),
      parent,
    }
  }

  pub fn get_kind(&self) -> &BlockKind {
    &self.kind
  }

  pub fn get_condition(&self) -> Option<BaseNode> {
    match &self.kind {
      BlockKind::Condition(cond) => Some(*cond),
      _ => None,
    }
  }

  pub fn get_cycle(&self) -> Option<usize> {
    match &self.kind {
      BlockKind::Cycle(cycle) => Some(*cycle),
      _ => None,
    }
  }

  pub fn get_num_exprs(&self) -> usize {
    self.body.len()
  }

  pub fn get(&self, idx: usize) -> Option<&BaseNode> {
    self.body.get(idx)
  }

  pub fn body_iter(&self) -> impl Iterator<Item = &BaseNode> {
    self.body.iter()
  }
}

impl Parented for Block {
  fn get_parent(&self) -> BaseNode {
    self.parent
  }

  fn set_parent(&mut self, parent: BaseNode) {
    self.parent = parent;
  }
}

impl BlockRef<'_> {
  /// Walk up the parent chain to the owning module.
  pub fn get_module(&self) -> ModuleRef<'_> {
    let mut runner = self.upcast();
    while runner.get_kind() != NodeKind::Module {
      runner = match runner.get_kind() {
        NodeKind::Block => self.sys.get::<Block>(&runner).unwrap().get_parent(),
        _ => panic!("Unexpected parent kind {:?}", runner.get_kind()),
      };
    }
    runner.as_ref::<Module>(self.sys).unwrap()
  }
}

impl BlockMut<'_> {
  /// Insert a node at the given position. `None` appends. Returns the position for the
  /// next insertion.
  pub fn insert_at(&mut self, at: Option<usize>, node: BaseNode) -> Option<usize> {
    let idx = at.unwrap_or(self.get().body.len());
    self.get_mut().body.insert(idx, node);
    at.map(|x| x + 1)
  }
}
