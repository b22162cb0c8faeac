use crate::ir::node::*;
use crate::ir::visitor::Visitor;
use crate::ir::*;

/// Soundness checks over a constructed system: operand/user edges must be symmetric,
/// and every expression must sit in a block of its owning module. This verifies the IR
/// data structure, not the described hardware.
use super::SysBuilder;

struct Verifier;

fn verify_operand(sys: &SysBuilder, operand: &BaseNode) {
  let operand_ref = operand.as_ref::<Operand>(sys).unwrap();
  let value = *operand_ref.get_value();
  let contained = match value.get_kind() {
    NodeKind::Expr => value.as_ref::<Expr>(sys).unwrap().users().contains(operand),
    NodeKind::FIFO => value.as_ref::<FIFO>(sys).unwrap().users().contains(operand),
    NodeKind::Array => value
      .as_ref::<Array>(sys)
      .unwrap()
      .user_set
      .contains(operand),
    NodeKind::Module => value.as_ref::<Module>(sys).unwrap().users().contains(operand),
    _ => true,
  };
  assert!(
    contained,
    "Value {} does not know its user {:?}",
    value.to_string(sys),
    operand
  );
}

impl Visitor<()> for Verifier {
  fn visit_expr(&mut self, expr: &ExprRef<'_>) -> Option<()> {
    let node = expr.get().upcast();
    // Every user operand must point back at this expression.
    for user in expr.users().iter() {
      let user_ref = user.as_ref::<Operand>(expr.sys).unwrap();
      assert_eq!(
        *user_ref.get_value(),
        node,
        "User edge of {} is stale",
        node.to_string(expr.sys)
      );
    }
    // Every operand must be registered as a user of its value.
    for operand in expr.get().operands.iter() {
      let operand_ref = operand.as_ref::<Operand>(expr.sys).unwrap();
      assert_eq!(
        operand_ref.get_user(),
        node,
        "Operand of {} points at a different user",
        node.to_string(expr.sys)
      );
      verify_operand(expr.sys, operand);
    }
    // The parent block must contain this expression.
    let parent = expr.get().get_parent();
    let block = parent.as_ref::<Block>(expr.sys).unwrap();
    assert!(
      block.body_iter().any(|x| *x == node),
      "{} is not in its parent block",
      node.to_string(expr.sys)
    );
    None
  }
}

pub fn verify(sys: &SysBuilder) {
  Verifier.enter(sys);
}
