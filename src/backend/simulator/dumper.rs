use crate::builder::SysBuilder;
use crate::ir::node::*;
use crate::ir::*;

use super::utils::{dtype_to_rust_type, int_imm_dumper_impl, namify};

/// The name of the simulator field backing a port FIFO.
pub(crate) fn fifo_name(sys: &SysBuilder, fifo: &FIFORef<'_>) -> String {
  let module = fifo.get_parent().as_ref::<Module>(sys).unwrap();
  format!(
    "{}_{}",
    namify(module.get_name()),
    namify(fifo.get_name())
  )
}

/// Dump a right-value reference as it is spelled inside the generated module function.
/// `module_ctx` is the module whose body is being generated: foreign values read the
/// producer's exposed `Option` cache and panic if the producer did not fire.
pub(crate) fn dump_rval_ref(sys: &SysBuilder, module_ctx: &BaseNode, node: &BaseNode) -> String {
  let node = if let NodeKind::Operand = node.get_kind() {
    *node.as_ref::<Operand>(sys).unwrap().get_value()
  } else {
    *node
  };
  match node.get_kind() {
    NodeKind::Array => namify(node.as_ref::<Array>(sys).unwrap().get_name()),
    NodeKind::FIFO => fifo_name(sys, &node.as_ref::<FIFO>(sys).unwrap()),
    NodeKind::IntImm => {
      let imm = node.as_ref::<IntImm>(sys).unwrap();
      int_imm_dumper_impl(&imm.dtype(), imm.get_value())
    }
    NodeKind::StrImm => format!("{:?}", node.as_ref::<StrImm>(sys).unwrap().get_value()),
    NodeKind::Module => namify(node.as_ref::<Module>(sys).unwrap().get_name()),
    NodeKind::Expr => {
      let expr = node.as_ref::<Expr>(sys).unwrap();
      let raw = namify(&expr.get_name());
      if expr.get_module() != *module_ctx {
        return format!(
          "{{ if let Some(x) = &sim.{}_value {{ x }} else {{ panic!(\"Value {} invalid!\") }} \
           }}.clone()",
          raw, raw
        );
      }
      if matches!(
        expr.get_opcode(),
        Opcode::FIFOField {
          field: crate::ir::expr::subcode::FIFOField::Peek
        }
      ) {
        return format!("{}.clone().unwrap()", raw);
      }
      if expr.dtype().get_bits() > 64 {
        format!("{}.clone()", raw)
      } else {
        raw
      }
    }
    _ => panic!("Cannot dump {:?} as an rvalue", node),
  }
}

/// Rust type of a value reference.
pub(crate) fn rust_ty_of(sys: &SysBuilder, node: &BaseNode) -> String {
  dtype_to_rust_type(&node.get_dtype(sys).unwrap())
}
