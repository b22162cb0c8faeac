use crate::builder::SysBuilder;
use crate::ir::node::*;
use crate::ir::*;

use super::instructions::*;
use super::visitor::Visitor;

/// Deterministic textual dump of the IR. Used by `Display` on `SysBuilder` and by the
/// tests to pin construction results.
pub struct IRPrinter {
  indent: usize,
}

impl IRPrinter {
  pub fn new() -> Self {
    IRPrinter { indent: 0 }
  }

  fn pad(&self) -> String {
    " ".repeat(self.indent)
  }
}

impl Default for IRPrinter {
  fn default() -> Self {
    Self::new()
  }
}

impl Visitor<String> for IRPrinter {
  fn visit_port(&mut self, port: &FIFORef<'_>) -> Option<String> {
    format!("{}: fifo<{}>", port.get_name(), port.scalar_ty().to_string()).into()
  }

  fn visit_array(&mut self, array: &ArrayRef<'_>) -> Option<String> {
    let mut res = format!(
      "{} = [{}; {}]",
      array.get_name(),
      array.scalar_ty().to_string(),
      array.get_size()
    );
    if let Some(init) = array.get_initializer() {
      let init = init.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", ");
      res.push_str(&format!(" = {{{}}}", init));
    }
    res.into()
  }

  fn visit_module(&mut self, module: &ModuleRef<'_>) -> Option<String> {
    let mut res = String::new();
    for (ext, _) in module.ext_iter() {
      res.push_str(&format!(
        "{}// external: {}\n",
        self.pad(),
        ext.to_string(module.sys)
      ));
    }
    let head = match module.get_kind() {
      ModuleKind::Sequential => "module",
      ModuleKind::Downstream => "downstream",
      ModuleKind::Sram(_) => "downstream.sram",
      ModuleKind::Dram(_) => "downstream.dram",
    };
    res.push_str(&format!("{}{} {}(", self.pad(), head, module.get_name()));
    let ports = module
      .port_iter()
      .map(|x| self.visit_port(&x).unwrap())
      .collect::<Vec<_>>()
      .join(", ");
    res.push_str(&ports);
    res.push_str(") {");
    if let Some(timing) = module.get_timing() {
      res.push_str(&format!(" // timing: {}", timing.to_str()));
    }
    res.push('\n');
    self.indent += 2;
    let body = self.visit_block(&module.get_body()).unwrap();
    res.push_str(&body);
    self.indent -= 2;
    res.push_str(&format!("{}}}\n", self.pad()));
    res.into()
  }

  fn visit_block(&mut self, block: &BlockRef<'_>) -> Option<String> {
    let mut res = String::new();
    let scoped = match block.get_kind() {
      BlockKind::ModuleRoot => false,
      BlockKind::Condition(cond) => {
        res.push_str(&format!(
          "{}when {} {{\n",
          self.pad(),
          cond.to_string(block.sys)
        ));
        true
      }
      BlockKind::Cycle(cycle) => {
        res.push_str(&format!("{}cycle {} {{\n", self.pad(), cycle));
        true
      }
    };
    if scoped {
      self.indent += 2;
    }
    for elem in block.body_iter() {
      match elem.get_kind() {
        NodeKind::Expr => {
          let expr = elem.as_ref::<Expr>(block.sys).unwrap();
          res.push_str(&format!("{}\n", self.visit_expr(&expr).unwrap()));
        }
        NodeKind::Block => {
          let inner = elem.as_ref::<Block>(block.sys).unwrap();
          res.push_str(&self.visit_block(&inner).unwrap());
        }
        _ => panic!("Unexpected element {:?} in block", elem),
      }
    }
    if scoped {
      self.indent -= 2;
      res.push_str(&format!("{}}}\n", self.pad()));
    }
    res.into()
  }

  fn visit_expr(&mut self, expr: &ExprRef<'_>) -> Option<String> {
    let sys = expr.sys;
    let node = expr.get().upcast();
    let opcode = expr.get_opcode();
    let lval = expr.get_name();
    let body = if opcode.is_binary() || opcode.is_cmp() {
      format!(
        "{} = {} {} {}",
        lval,
        expr.get_operand_value(0).unwrap().to_string(sys),
        opcode.to_string(),
        expr.get_operand_value(1).unwrap().to_string(sys)
      )
    } else if opcode.is_unary() {
      format!(
        "{} = {}{}",
        lval,
        opcode.to_string(),
        expr.get_operand_value(0).unwrap().to_string(sys)
      )
    } else {
      match opcode {
        Opcode::ArrayRead => {
          let read = node.as_inst::<ArrayRead>(sys).unwrap();
          format!(
            "{} = {}[{}]",
            lval,
            read.array().get_name(),
            read.idx().to_string(sys)
          )
        }
        Opcode::ArrayWrite => {
          let write = node.as_inst::<ArrayWrite>(sys).unwrap();
          format!(
            "{}[{}] <= {} // writer: {}",
            write.array().get_name(),
            write.idx().to_string(sys),
            write.value().to_string(sys),
            write.writer().get_name()
          )
        }
        Opcode::FIFOPush => {
          let push = node.as_inst::<FIFOPush>(sys).unwrap();
          format!(
            "{}.push({})",
            push.fifo().upcast().to_string(sys),
            push.value().to_string(sys)
          )
        }
        Opcode::FIFOPop => {
          let pop = node.as_inst::<FIFOPop>(sys).unwrap();
          format!("{} = {}.pop()", lval, pop.fifo().upcast().to_string(sys))
        }
        Opcode::FIFOField { field } => {
          let probe = node.as_inst::<FIFOField>(sys).unwrap();
          format!(
            "{} = {}.{}()",
            lval,
            probe.fifo().upcast().to_string(sys),
            field.to_string()
          )
        }
        Opcode::Triggered => {
          let probe = node.as_inst::<Triggered>(sys).unwrap();
          format!("{} = {}.triggered()", lval, probe.module().get_name())
        }
        Opcode::Bind => {
          let bind = node.as_inst::<Bind>(sys).unwrap();
          let pushes = bind
            .push_iter()
            .map(|x| x.to_string(sys))
            .collect::<Vec<_>>()
            .join(", ");
          format!("{} = {}.bind([{}])", lval, bind.callee().get_name(), pushes)
        }
        Opcode::AsyncCall => {
          let call = node.as_inst::<AsyncCall>(sys).unwrap();
          format!("async_call {}", call.bind().to_string(sys))
        }
        Opcode::Select => {
          let select = node.as_inst::<Select>(sys).unwrap();
          format!(
            "{} = {} ? {} : {}",
            lval,
            select.cond().to_string(sys),
            select.true_value().to_string(sys),
            select.false_value().to_string(sys)
          )
        }
        Opcode::Select1Hot => {
          let select = node.as_inst::<Select1Hot>(sys).unwrap();
          let values = select
            .value_iter()
            .map(|x| x.to_string(sys))
            .collect::<Vec<_>>()
            .join(", ");
          format!(
            "{} = select_1hot {} ({})",
            lval,
            select.cond().to_string(sys),
            values
          )
        }
        Opcode::Slice => {
          let slice = node.as_inst::<Slice>(sys).unwrap();
          format!(
            "{} = {}[{}:{}]",
            lval,
            slice.x().to_string(sys),
            slice.l().get_value(),
            slice.r().get_value()
          )
        }
        Opcode::Concat => {
          let concat = node.as_inst::<Concat>(sys).unwrap();
          format!(
            "{} = {{{}, {}}}",
            lval,
            concat.msb().to_string(sys),
            concat.lsb().to_string(sys)
          )
        }
        Opcode::Cast { cast } => {
          let expr_dtype = expr.dtype().to_string();
          let x = node.as_inst::<CastInst>(sys).unwrap().x();
          format!("{} = {} {} to {}", lval, cast.to_string(), x.to_string(sys), expr_dtype)
        }
        Opcode::Log => {
          let args = expr
            .operand_iter()
            .map(|x| x.get_value().to_string(sys))
            .collect::<Vec<_>>()
            .join(", ");
          format!("log({})", args)
        }
        Opcode::Intrinsic { intrin } => {
          let args = expr
            .operand_iter()
            .map(|x| x.get_value().to_string(sys))
            .collect::<Vec<_>>()
            .join(", ");
          if opcode.is_valued() {
            format!("{} = intrinsic.{}({})", lval, intrin.to_string(), args)
          } else {
            format!("intrinsic.{}({})", intrin.to_string(), args)
          }
        }
        _ => panic!("Unimplemented opcode {:?}", opcode),
      }
    };
    format!("{}{}", self.pad(), body).into()
  }
}

impl std::fmt::Display for SysBuilder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut printer = IRPrinter::new();
    writeln!(f, "system {} {{", self.get_name())?;
    for array in self.array_iter() {
      writeln!(f, "  {};", printer.visit_array(&array).unwrap())?;
    }
    printer.indent += 2;
    for module in self.module_iter() {
      writeln!(f)?;
      write!(f, "{}", printer.visit_module(&module).unwrap())?;
    }
    for module in self.downstream_iter() {
      writeln!(f)?;
      write!(f, "{}", printer.visit_module(&module).unwrap())?;
    }
    write!(f, "}}")
  }
}
