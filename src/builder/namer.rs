use crate::builder::SysBuilder;
use crate::ir::node::*;
use crate::ir::*;

/// Assign deterministic, opcode-derived names to every unnamed valued expression.
/// Walking modules and blocks in creation order makes the result reproducible across
/// runs, which both backends rely on for stable generated identifiers.
pub fn namify_exprs(sys: &mut SysBuilder) {
  let modules = sys
    .modules
    .iter()
    .chain(sys.downstreams.iter())
    .copied()
    .collect::<Vec<_>>();
  for module in modules {
    let body = sys.get::<Module>(&module).unwrap().get_body().upcast();
    namify_block(sys, body);
  }
}

fn namify_block(sys: &mut SysBuilder, block: BaseNode) {
  let body = {
    let block = block.as_ref::<Block>(sys).unwrap();
    block.body_iter().copied().collect::<Vec<_>>()
  };
  for elem in body {
    match elem.get_kind() {
      NodeKind::Expr => {
        let (valued, named, mnemonic) = {
          let expr = elem.as_ref::<Expr>(sys).unwrap();
          (
            expr.get_opcode().is_valued(),
            expr.has_explicit_name(),
            expr.get_opcode().mnemonic(),
          )
        };
        if valued && !named {
          elem.as_mut::<Expr>(sys).unwrap().set_name(mnemonic);
        }
      }
      NodeKind::Block => namify_block(sys, elem),
      _ => {}
    }
  }
}
