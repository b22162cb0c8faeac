use std::collections::HashSet;

use crate::ir::node::*;
use crate::ir::*;

/// An input port of a sequential module. Every port is a FIFO queue in both execution
/// models.
pub struct FIFO {
  pub(crate) key: usize,
  /// Parent is patched by the builder right after the owning module is materialized.
  pub(crate) parent: BaseNode,
  name: String,
  dtype: DataType,
  idx: usize,
  pub(crate) user_set: HashSet<BaseNode>,
}

impl FIFO {
  pub(crate) fn new(dtype: DataType, name: &str) -> Self {
    Self {
      key: 0,
      parent: BaseNode::unknown(),
      name: name.to_string(),
      dtype,
      idx: usize::MAX,
      user_set: HashSet::new(),
    }
  }

  pub fn get_name(&self) -> &str {
    self.name.as_str()
  }

  pub fn scalar_ty(&self) -> DataType {
    self.dtype.clone()
  }

  /// The position of this port in the owning module's port list.
  pub fn idx(&self) -> usize {
    self.idx
  }

  pub(crate) fn set_idx(&mut self, idx: usize) {
    self.idx = idx;
  }
}

impl Typed for FIFO {
  fn dtype(&self) -> DataType {
    self.dtype.clone()
  }
}

impl Parented for FIFO {
  fn get_parent(&self) -> BaseNode {
    self.parent
  }

  fn set_parent(&mut self, parent: BaseNode) {
    self.parent = parent;
  }
}

impl FIFORef<'_> {
  pub fn users(&self) -> &HashSet<BaseNode> {
    &self.get().user_set
  }
}
