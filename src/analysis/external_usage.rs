use crate::builder::SysBuilder;
use crate::ir::node::*;
use crate::ir::*;

/// Whether the expression is consumed outside its owning module.
///
/// With `exclude_push` set, values that only cross module boundaries as FIFO-push
/// payloads do not count: pushes are cross-module by design and travel through the
/// callee's port, needing no exposure wiring.
pub fn expr_externally_used(sys: &SysBuilder, expr: &BaseNode, exclude_push: bool) -> bool {
  let expr_ref = expr.as_ref::<Expr>(sys).unwrap();
  let home = expr_ref.get_module();
  for operand in expr_ref.users().iter() {
    let user = operand.as_ref::<Operand>(sys).unwrap().get_user();
    let user_module = match user.get_kind() {
      NodeKind::Expr => {
        if exclude_push {
          let user_expr = user.as_ref::<Expr>(sys).unwrap();
          if matches!(user_expr.get_opcode(), Opcode::FIFOPush) {
            continue;
          }
        }
        user.owner_module(sys)
      }
      NodeKind::Block => user.owner_module(sys),
      _ => None,
    };
    if let Some(user_module) = user_module {
      if user_module != home {
        return true;
      }
    }
  }
  false
}

/// The modules whose values the given (downstream) module consumes combinationally.
/// Push payloads and binds do not create upstream edges.
pub fn get_upstreams(sys: &SysBuilder, module: &BaseNode) -> Vec<BaseNode> {
  let mut res = Vec::new();
  let module_ref = module.as_ref::<Module>(sys).unwrap();
  for (value, _) in module_ref.ext_iter() {
    if value.get_kind() != NodeKind::Expr {
      continue;
    }
    let expr = value.as_ref::<Expr>(sys).unwrap();
    if matches!(expr.get_opcode(), Opcode::FIFOPush | Opcode::Bind) {
      continue;
    }
    let upstream = value.owner_module(sys).unwrap();
    if upstream != *module && !res.contains(&upstream) {
      res.push(upstream);
    }
  }
  res
}

fn collect_triggered(sys: &SysBuilder, block: &BaseNode, res: &mut Vec<BaseNode>) {
  let block = block.as_ref::<Block>(sys).unwrap();
  for elem in block.body_iter() {
    match elem.get_kind() {
      NodeKind::Expr => {
        let expr = elem.as_ref::<Expr>(sys).unwrap();
        if matches!(expr.get_opcode(), Opcode::Triggered) {
          let target = *expr.get_operand(0).unwrap().get_value();
          if !res.contains(&target) {
            res.push(target);
          }
        }
      }
      NodeKind::Block => collect_triggered(sys, elem, res),
      _ => {}
    }
  }
}

/// What a downstream's re-evaluation is gated on: its data upstreams plus every
/// module it probes with `triggered()`. Both backends derive their gating from this
/// one list, so they cannot disagree.
pub fn downstream_dependencies(sys: &SysBuilder, module: &BaseNode) -> Vec<BaseNode> {
  let mut res = get_upstreams(sys, module);
  let body = module.as_ref::<Module>(sys).unwrap().get_body().upcast();
  collect_triggered(sys, &body, &mut res);
  res
}
