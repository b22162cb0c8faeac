use crate::builder::SysBuilder;
use crate::ir::node::*;

use super::data::Array;
use super::expr::Expr;
use super::module::Module;
use super::port::FIFO;

/// An operand edge: the value consumed and the expression consuming it. Operands are
/// slab elements of their own so that "users" traversal is a set of O(1) hops.
pub struct Operand {
  pub(crate) key: usize,
  value: BaseNode,
  user: BaseNode,
}

impl Operand {
  pub(crate) fn new(value: BaseNode) -> Self {
    Self {
      key: 0,
      value,
      user: BaseNode::unknown(),
    }
  }

  pub fn get_value(&self) -> &BaseNode {
    &self.value
  }

  pub fn get_user(&self) -> BaseNode {
    self.user
  }

  pub(crate) fn set_user(&mut self, user: BaseNode) {
    self.user = user;
  }
}

impl SysBuilder {
  /// Register the given operand as a user of its value. Only value-producing elements
  /// maintain reverse edges.
  pub(crate) fn add_user(&mut self, operand: BaseNode) {
    let value = *operand.as_ref::<Operand>(self).unwrap().get_value();
    match value.get_kind() {
      NodeKind::Expr => {
        value
          .as_mut::<Expr>(self)
          .unwrap()
          .get_mut()
          .user_set
          .insert(operand);
      }
      NodeKind::FIFO => {
        value
          .as_mut::<FIFO>(self)
          .unwrap()
          .get_mut()
          .user_set
          .insert(operand);
      }
      NodeKind::Array => {
        value
          .as_mut::<Array>(self)
          .unwrap()
          .get_mut()
          .user_set
          .insert(operand);
      }
      NodeKind::Module => {
        value
          .as_mut::<Module>(self)
          .unwrap()
          .get_mut()
          .user_set
          .insert(operand);
      }
      _ => {}
    }
  }
}
