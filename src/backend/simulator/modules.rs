use crate::analysis::{expr_externally_used, Analysis};
use crate::builder::SysBuilder;
use crate::ir::expr::subcode;
use crate::ir::instructions::*;
use crate::ir::node::*;
use crate::ir::visitor::Visitor;
use crate::ir::*;

use super::dumper::{dump_rval_ref, fifo_name, rust_ty_of};
use super::utils::{dtype_to_rust_type, namify};

/// Generates one `pub fn <module>(sim: &mut Simulator) -> bool` per module. Returning
/// `false` aborts the attempt without consuming the pending event, which is how
/// backpressure suspension (empty FIFO, unmet wait_until) is modeled.
pub(crate) struct ElaborateModule<'a> {
  sys: &'a SysBuilder,
  analysis: &'a Analysis,
  module: BaseNode,
  module_name: String,
  indent: usize,
}

impl<'a> ElaborateModule<'a> {
  pub(crate) fn new(sys: &'a SysBuilder, analysis: &'a Analysis) -> Self {
    Self {
      sys,
      analysis,
      module: BaseNode::unknown(),
      module_name: String::new(),
      indent: 0,
    }
  }

  fn dump(&self, node: &BaseNode) -> String {
    dump_rval_ref(self.sys, &self.module, node)
  }
}

impl Visitor<String> for ElaborateModule<'_> {
  fn visit_module(&mut self, module: &ModuleRef<'_>) -> Option<String> {
    self.module = module.upcast();
    self.module_name = module.get_name().to_string();
    let mut res = String::new();
    res.push_str(&format!("\n// Elaborating module {}\n", namify(&self.module_name)));
    res.push_str(&format!(
      "pub fn {}(sim: &mut Simulator) -> bool {{\n",
      namify(&self.module_name)
    ));
    self.indent += 2;
    res.push_str(&self.visit_block(&module.get_body()).unwrap());
    self.indent -= 2;
    res.push_str("  true\n}\n");
    res.into()
  }

  fn visit_block(&mut self, block: &BlockRef<'_>) -> Option<String> {
    let mut res = String::new();
    let scoped = match block.get_kind() {
      BlockKind::ModuleRoot => false,
      BlockKind::Condition(cond) => {
        res.push_str(&format!(
          "{}if {} {{\n",
          " ".repeat(self.indent),
          self.dump(cond)
        ));
        true
      }
      BlockKind::Cycle(cycle) => {
        res.push_str(&format!(
          "{}if sim.stamp / 100 == {} {{\n",
          " ".repeat(self.indent),
          cycle
        ));
        true
      }
    };
    if scoped {
      self.indent += 2;
    }
    for elem in block.body_iter() {
      match elem.get_kind() {
        NodeKind::Expr => {
          let expr = elem.as_ref::<Expr>(self.sys).unwrap();
          res.push_str(&self.visit_expr(&expr).unwrap());
        }
        NodeKind::Block => {
          let inner = elem.as_ref::<Block>(self.sys).unwrap();
          res.push_str(&self.visit_block(&inner).unwrap());
        }
        _ => panic!("Unexpected element {:?} in block", elem),
      }
    }
    if scoped {
      self.indent -= 2;
      res.push_str(&format!("{}}}\n", " ".repeat(self.indent)));
    }
    res.into()
  }

  fn visit_expr(&mut self, expr: &ExprRef<'_>) -> Option<String> {
    let sys = self.sys;
    let node = expr.get().upcast();
    let opcode = expr.get_opcode();

    // Binds only exist for their pushes; nothing to compute at runtime.
    if let Opcode::Bind = opcode {
      return Some(String::new());
    }

    let code = if opcode.is_binary() {
      let bin = node.as_inst::<BinaryInst>(sys).unwrap();
      let (a, b) = (bin.lhs(), bin.rhs());
      let lhs_ty = a.get_dtype(sys).unwrap();
      let is_signed_shr = matches!(bin.get_binop(), subcode::Binary::Shr) && lhs_ty.is_signed();
      let cast_ty = if is_signed_shr {
        if lhs_ty.get_bits() <= 64 {
          format!("i{}", lhs_ty.get_bits().next_power_of_two().max(8))
        } else {
          "BigInt".to_string()
        }
      } else {
        dtype_to_rust_type(&expr.dtype())
      };
      format!(
        "ValueCastTo::<{}>::cast(&{}) {} ValueCastTo::<{}>::cast(&{})",
        cast_ty,
        self.dump(&a),
        opcode.to_string(),
        cast_ty,
        self.dump(&b)
      )
    } else if opcode.is_cmp() {
      let cmp = node.as_inst::<CompareInst>(sys).unwrap();
      let (a, b) = (cmp.lhs(), cmp.rhs());
      let ty = rust_ty_of(sys, &a);
      format!(
        "ValueCastTo::<{}>::cast(&{}) {} ValueCastTo::<{}>::cast(&{})",
        ty,
        self.dump(&a),
        opcode.to_string(),
        ty,
        self.dump(&b)
      )
    } else if opcode.is_unary() {
      let uop = node.as_inst::<UnaryInst>(sys).unwrap();
      format!("{}{}", opcode.to_string(), self.dump(&uop.x()))
    } else {
      match opcode {
        Opcode::ArrayRead => {
          let read = node.as_inst::<ArrayRead>(sys).unwrap();
          format!(
            "sim.{}.payload[ValueCastTo::<u64>::cast(&{}) as usize].clone()",
            namify(read.array().get_name()),
            self.dump(&read.idx())
          )
        }
        Opcode::ArrayWrite => {
          let write = node.as_inst::<ArrayWrite>(sys).unwrap();
          let array = write.array_node();
          let writer = write.writer().upcast();
          let port = self
            .analysis
            .ports
            .write_port(&array, &writer)
            .expect("Write without an allocated port");
          format!(
            "{{\n{pad}  let stamp = sim.stamp - sim.stamp % 100 + 50;\n{pad}  \
             sim.{array}.write_port.push(ArrayWrite::new(stamp, \
             ValueCastTo::<u64>::cast(&{idx}) as usize, {value}.clone(), \"{writer}\", \
             {port}));\n{pad}}}",
            pad = " ".repeat(self.indent),
            array = namify(write.array().get_name()),
            idx = self.dump(&write.idx()),
            value = self.dump(&write.value()),
            writer = namify(write.writer().get_name()),
            port = port
          )
        }
        Opcode::AsyncCall => {
          let call = node.as_inst::<AsyncCall>(sys).unwrap();
          let callee = namify(call.callee().get_name());
          format!(
            "{{\n{pad}  let stamp = sim.stamp - sim.stamp % 100 + 100;\n{pad}  \
             sim.{callee}_event.push_back(stamp)\n{pad}}}",
            pad = " ".repeat(self.indent),
            callee = callee
          )
        }
        Opcode::FIFOPop => {
          let pop = node.as_inst::<FIFOPop>(sys).unwrap();
          let fifo = fifo_name(sys, &pop.fifo());
          format!(
            "{{\n{pad}  let stamp = sim.stamp - sim.stamp % 100 + 50;\n{pad}  \
             sim.{fifo}.pop.push(FIFOPop::new(stamp, \"{module}\"));\n{pad}  \
             match sim.{fifo}.payload.front() {{\n{pad}    Some(value) => \
             value.clone(),\n{pad}    None => return false,\n{pad}  }}\n{pad}}}",
            pad = " ".repeat(self.indent),
            fifo = fifo,
            module = namify(&self.module_name)
          )
        }
        Opcode::FIFOPush => {
          let push = node.as_inst::<FIFOPush>(sys).unwrap();
          let fifo = fifo_name(sys, &push.fifo());
          format!(
            "{{\n{pad}  let stamp = sim.stamp;\n{pad}  \
             sim.{fifo}.push.push(FIFOPush::new(stamp + 50, {value}.clone(), \
             \"{module}\"));\n{pad}}}",
            pad = " ".repeat(self.indent),
            fifo = fifo,
            value = self.dump(&push.value()),
            module = namify(&self.module_name)
          )
        }
        Opcode::FIFOField { field } => {
          let probe = node.as_inst::<FIFOField>(sys).unwrap();
          let fifo = fifo_name(sys, &probe.fifo());
          match field {
            subcode::FIFOField::Valid => format!("!sim.{}.payload.is_empty()", fifo),
            subcode::FIFOField::Peek => format!("sim.{}.payload.front().cloned()", fifo),
          }
        }
        Opcode::Triggered => {
          let probe = node.as_inst::<Triggered>(sys).unwrap();
          format!("sim.{}_triggered", namify(probe.module().get_name()))
        }
        Opcode::Select => {
          let select = node.as_inst::<Select>(sys).unwrap();
          format!(
            "if {} {{ {} }} else {{ {} }}",
            self.dump(&select.cond()),
            self.dump(&select.true_value()),
            self.dump(&select.false_value())
          )
        }
        Opcode::Select1Hot => {
          let select = node.as_inst::<Select1Hot>(sys).unwrap();
          let target = dtype_to_rust_type(&expr.dtype());
          let mut res = format!(
            "{{ let cond = {};\nassert!(cond.count_ones() == 1, \"Select1Hot: condition is \
             not 1-hot\");\n",
            self.dump(&select.cond())
          );
          for (i, value) in select.value_iter().enumerate() {
            if i != 0 {
              res.push_str(" else ");
            }
            res.push_str(&format!(
              "if cond >> {} & 1 != 0 {{ ValueCastTo::<{}>::cast(&{}) }}",
              i,
              target,
              self.dump(&value)
            ));
          }
          res.push_str(" else { unreachable!() } }");
          res
        }
        Opcode::Slice => {
          let slice = node.as_inst::<Slice>(sys).unwrap();
          let a = self.dump(&slice.x());
          let l = slice.l().get_value();
          let r = slice.r().get_value();
          let mask = "1".repeat((r - l + 1) as usize);
          let prologue = if r < 64 {
            format!(
              "let a = ValueCastTo::<u64>::cast(&{});\nlet mask = \
               u64::from_str_radix(\"{}\", 2).unwrap();",
              a, mask
            )
          } else {
            format!(
              "let a = ValueCastTo::<BigUint>::cast(&{});\nlet mask = \
               BigUint::parse_bytes(\"{}\".as_bytes(), 2).unwrap();",
              a, mask
            )
          };
          format!(
            "{{\n{}\nlet res = (a >> {}) & mask;\nValueCastTo::<{}>::cast(&res)\n}}",
            prologue,
            l,
            dtype_to_rust_type(&expr.dtype())
          )
        }
        Opcode::Concat => {
          let concat = node.as_inst::<Concat>(sys).unwrap();
          let lsb_bits = concat.lsb().get_dtype(sys).unwrap().get_bits();
          format!(
            "{{\nlet a = ValueCastTo::<BigUint>::cast(&{});\nlet b = \
             ValueCastTo::<BigUint>::cast(&{});\nlet c = (a << {}) | \
             b;\nValueCastTo::<{}>::cast(&c)\n}}",
            self.dump(&concat.msb()),
            self.dump(&concat.lsb()),
            lsb_bits,
            dtype_to_rust_type(&expr.dtype())
          )
        }
        Opcode::Cast { .. } => {
          let cast = node.as_inst::<CastInst>(sys).unwrap();
          format!(
            "ValueCastTo::<{}>::cast(&{})",
            dtype_to_rust_type(&expr.dtype()),
            self.dump(&cast.x())
          )
        }
        Opcode::Log => {
          let log = node.as_inst::<Log>(sys).unwrap();
          let mut res = format!(
            "print!(\"@line:{{:<5}} {{:<10}}: [{}]\\t\", line!(), cyclize(sim.stamp));\n",
            self.module_name
          );
          res.push_str("println!(");
          res.push_str(&self.dump(&log.fmt().get().upcast()));
          for arg in log.arg_iter() {
            let mut dump = self.dump(&arg);
            if arg.get_dtype(sys).unwrap().get_bits() == 1 {
              dump = format!("if {} {{ 1 }} else {{ 0 }}", dump);
            }
            res.push_str(&format!(", {}", dump));
          }
          res.push(')');
          res
        }
        Opcode::Intrinsic { intrin } => {
          let inst = node.as_inst::<IntrinsicInst>(sys).unwrap();
          match intrin {
            subcode::Intrinsic::WaitUntil => {
              format!("if !{} {{ return false; }}", self.dump(&inst.arg(0)))
            }
            subcode::Intrinsic::Finish => "std::process::exit(0);".to_string(),
            subcode::Intrinsic::Assert => format!("assert!({});", self.dump(&inst.arg(0))),
            subcode::Intrinsic::Barrier => "/* barrier */".to_string(),
            subcode::Intrinsic::SendReadRequest => {
              let addr = self.dump(&inst.arg(0));
              let module = namify(&self.module_name);
              format!(
                "unsafe {{\nlet addr = ValueCastTo::<i64>::cast(&{addr});\nlet succ = \
                 sim.mi_{module}.send_request(addr, false, rust_callback_{module}, sim as \
                 *const _ as *mut _);\nif succ {{ \
                 sim.request_stamp_map_table.insert(addr, sim.stamp); }}\nsucc\n}}",
                addr = addr,
                module = module
              )
            }
            subcode::Intrinsic::SendWriteRequest => {
              let addr = self.dump(&inst.arg(0));
              let module = namify(&self.module_name);
              format!(
                "unsafe {{\nlet addr = ValueCastTo::<i64>::cast(&{addr});\nlet succ = \
                 sim.mi_{module}.send_request(addr, true, rust_callback_{module}, sim as \
                 *const _ as *mut _);\nif succ {{ \
                 sim.request_stamp_map_table.insert(addr, sim.stamp); }}\nsucc\n}}",
                addr = addr,
                module = module
              )
            }
            subcode::Intrinsic::HasMemResp => {
              let dram = namify(&inst.arg(0).to_string(sys));
              format!("sim.{}_response.valid", dram)
            }
            subcode::Intrinsic::MemResp => {
              let dram = namify(&inst.arg(0).to_string(sys));
              format!(
                "ValueCastTo::<{}>::cast(&sim.{}_response.data)",
                dtype_to_rust_type(&expr.dtype()),
                dram
              )
            }
          }
        }
        _ => panic!("Unknown opcode: {:?}", opcode),
      }
    };

    let pad = " ".repeat(self.indent);
    let res = if opcode.is_valued() {
      let id = namify(&expr.get_name());
      let exposed = expr_externally_used(sys, &node, true);
      let update = if exposed {
        format!(" sim.{}_value = Some({}.clone());", id, id)
      } else {
        String::new()
      };
      format!("{}let {} = {{ {} }};{}\n", pad, id, code, update)
    } else {
      format!("{}{};\n", pad, code)
    };
    res.into()
  }
}
