use crate::builder::SysBuilder;
use crate::ir::node::*;
use crate::ir::*;

/// A read-only traversal over the frozen system. Default methods walk the whole tree;
/// implementors override the nodes they care about.
pub trait Visitor<T> {
  fn enter(&mut self, sys: &SysBuilder) -> Option<T> {
    for module in sys.module_iter() {
      if let Some(res) = self.visit_module(&module) {
        return Some(res);
      }
    }
    for module in sys.downstream_iter() {
      if let Some(res) = self.visit_module(&module) {
        return Some(res);
      }
    }
    None
  }

  fn visit_module(&mut self, module: &ModuleRef<'_>) -> Option<T> {
    for port in module.port_iter() {
      if let Some(res) = self.visit_port(&port) {
        return Some(res);
      }
    }
    self.visit_block(&module.get_body())
  }

  fn visit_port(&mut self, _: &FIFORef<'_>) -> Option<T> {
    None
  }

  fn visit_block(&mut self, block: &BlockRef<'_>) -> Option<T> {
    for elem in block.body_iter() {
      if let Some(res) = self.dispatch(block.sys, elem) {
        return Some(res);
      }
    }
    None
  }

  fn visit_expr(&mut self, _: &ExprRef<'_>) -> Option<T> {
    None
  }

  fn visit_array(&mut self, _: &ArrayRef<'_>) -> Option<T> {
    None
  }

  fn visit_int_imm(&mut self, _: &IntImmRef<'_>) -> Option<T> {
    None
  }

  fn visit_str_imm(&mut self, _: &StrImmRef<'_>) -> Option<T> {
    None
  }

  fn dispatch(&mut self, sys: &SysBuilder, node: &BaseNode) -> Option<T> {
    match node.get_kind() {
      NodeKind::Expr => self.visit_expr(&node.as_ref::<Expr>(sys).unwrap()),
      NodeKind::Block => self.visit_block(&node.as_ref::<Block>(sys).unwrap()),
      NodeKind::Module => self.visit_module(&node.as_ref::<Module>(sys).unwrap()),
      NodeKind::FIFO => self.visit_port(&node.as_ref::<FIFO>(sys).unwrap()),
      NodeKind::Array => self.visit_array(&node.as_ref::<Array>(sys).unwrap()),
      NodeKind::IntImm => self.visit_int_imm(&node.as_ref::<IntImm>(sys).unwrap()),
      NodeKind::StrImm => self.visit_str_imm(&node.as_ref::<StrImm>(sys).unwrap()),
      NodeKind::Operand => {
        let value = *node.as_ref::<Operand>(sys).unwrap().get_value();
        self.dispatch(sys, &value)
      }
      NodeKind::Unknown => panic!("Unknown node in the IR tree"),
    }
  }
}
