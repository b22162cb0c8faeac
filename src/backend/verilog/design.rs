use std::collections::HashSet;

use linked_hash_map::LinkedHashMap;

use crate::analysis::{expr_externally_used, Analysis};
use crate::backend::common::Config;
use crate::builder::SysBuilder;
use crate::ir::expr::subcode;
use crate::ir::instructions::*;
use crate::ir::node::*;
use crate::ir::*;

use super::utils::{dump_type, dump_type_cast, namify};

/// One entry of the condition stack while walking nested blocks.
pub(crate) enum CondFrame {
  Cond { pred: String, cond: BaseNode },
  Cycle { pred: String, cycle: usize },
}

impl CondFrame {
  fn pred(&self) -> &str {
    match self {
      CondFrame::Cond { pred, .. } | CondFrame::Cycle { pred, .. } => pred,
    }
  }
}

/// Lowers each IR module into a PyCDE class. All the staging the simulator gets from
/// sequential execution is reconstructed explicitly here: predicates aggregate into
/// mux chains, side effects gate on `executed_wire`, and cross-module values travel
/// through expose/valid port pairs.
pub(crate) struct VerilogDumper<'a> {
  pub(crate) sys: &'a SysBuilder,
  pub(crate) analysis: &'a Analysis,
  pub(crate) config: &'a Config,
  pub(crate) indent: usize,
  pub(crate) code: Vec<String>,
  cond_stack: Vec<CondFrame>,
  /// resource (array/port/callee-module) or expression -> guarded sites.
  exposes: LinkedHashMap<BaseNode, Vec<(BaseNode, String)>>,
  wait_until: Option<String>,
  finish_conds: Vec<String>,
  pub(crate) current_module: BaseNode,
  /// Set while the Top harness is generated: rvalues are spelled globally there.
  pub(crate) is_top: bool,
  /// Python statements replayed by the generated cocotb testbench.
  pub(crate) logs: Vec<String>,
  exposed_ports: Vec<String>,
  /// Arrays that are SRAM payloads: they lower to memory blackboxes, not register files.
  pub(crate) sram_payloads: HashSet<BaseNode>,
}

impl<'a> VerilogDumper<'a> {
  pub(crate) fn new(sys: &'a SysBuilder, analysis: &'a Analysis, config: &'a Config) -> Self {
    let mut sram_payloads = HashSet::new();
    for module in sys.downstream_iter() {
      if matches!(module.get_kind(), ModuleKind::Sram(_)) {
        let node = module.upcast();
        if let Some(record) = analysis.matrix.record(&node) {
          if let Some(write) = record.array_writes.first() {
            let array = write.as_inst::<ArrayWrite>(sys).unwrap().array_node();
            sram_payloads.insert(array);
          }
        }
      }
    }
    Self {
      sys,
      analysis,
      config,
      indent: 0,
      code: Vec::new(),
      cond_stack: Vec::new(),
      exposes: LinkedHashMap::new(),
      wait_until: None,
      finish_conds: Vec::new(),
      current_module: BaseNode::unknown(),
      is_top: false,
      logs: Vec::new(),
      exposed_ports: Vec::new(),
      sram_payloads,
    }
  }

  pub(crate) fn append_code(&mut self, code: &str) {
    if code.trim().is_empty() {
      self.code.push(String::new());
    } else {
      self.code.push(format!("{}{}", " ".repeat(self.indent), code));
    }
  }

  /// The conjunction of the active condition stack, `Bits(1)(1)` at top level.
  fn get_pred(&self) -> String {
    if self.cond_stack.is_empty() {
      return "Bits(1)(1)".to_string();
    }
    self
      .cond_stack
      .iter()
      .map(|x| x.pred().to_string())
      .collect::<Vec<_>>()
      .join(" & ")
  }

  /// The input-port name a consumer module uses for a foreign value.
  pub(crate) fn external_port_name(&self, expr: &BaseNode) -> String {
    let expr_ref = expr.as_ref::<Expr>(self.sys).unwrap();
    let producer = expr_ref.get_module();
    let producer = namify(producer.as_ref::<Module>(self.sys).unwrap().get_name());
    format!("{}_{}", producer, namify(&expr_ref.get_name()))
  }

  /// Dump a right-value reference. With `with_namespace`, names are qualified by their
  /// producing module (used for expose port names).
  pub(crate) fn dump_rval(&self, node: &BaseNode, with_namespace: bool) -> String {
    let node = if let NodeKind::Operand = node.get_kind() {
      *node.as_ref::<Operand>(self.sys).unwrap().get_value()
    } else {
      *node
    };
    match node.get_kind() {
      NodeKind::IntImm => {
        let imm = node.as_ref::<IntImm>(self.sys).unwrap();
        if imm.dtype().is_signed() {
          format!("{}({})", dump_type(&imm.dtype()), imm.get_value() as i64)
        } else {
          format!("{}({})", dump_type(&imm.dtype()), imm.get_value())
        }
      }
      NodeKind::StrImm => format!("{:?}", node.as_ref::<StrImm>(self.sys).unwrap().get_value()),
      NodeKind::Module => namify(node.as_ref::<Module>(self.sys).unwrap().get_name()),
      NodeKind::Array => namify(node.as_ref::<Array>(self.sys).unwrap().get_name()),
      NodeKind::FIFO => namify(node.as_ref::<FIFO>(self.sys).unwrap().get_name()),
      NodeKind::Expr => {
        let expr = node.as_ref::<Expr>(self.sys).unwrap();
        // A foreign value is read through this module's input port.
        if !self.is_top && expr.get_module() != self.current_module {
          let is_external = self
            .current_module
            .as_ref::<Module>(self.sys)
            .map(|x| x.get().externals.contains_key(&node))
            .unwrap_or(false);
          if is_external {
            return format!("self.{}", self.external_port_name(&node));
          }
        }
        if let Opcode::FIFOPop = expr.get_opcode() {
          let pop = node.as_inst::<FIFOPop>(self.sys).unwrap();
          if with_namespace {
            let module = pop.fifo().get_parent();
            return format!(
              "{}_{}",
              namify(module.as_ref::<Module>(self.sys).unwrap().get_name()),
              namify(pop.fifo().get_name())
            );
          }
          return format!("self.{}", namify(pop.fifo().get_name()));
        }
        let name = namify(&expr.get_name());
        if with_namespace {
          let module = expr.get_module();
          format!(
            "{}_{}",
            namify(module.as_ref::<Module>(self.sys).unwrap().get_name()),
            name
          )
        } else {
          name
        }
      }
      _ => panic!("Cannot dump {:?} as an rvalue", node),
    }
  }

  fn expose(&mut self, key: BaseNode, site: BaseNode) {
    let pred = self.get_pred();
    self.exposes.entry(key).or_insert_with(Vec::new).push((site, pred));
  }

  // -------------------------------------------------------------------------
  // Blocks and expressions.

  fn block_has_log(&self, block: &BaseNode) -> bool {
    let block = block.as_ref::<Block>(self.sys).unwrap();
    let result = block.body_iter().any(|elem| match elem.get_kind() {
      NodeKind::Expr => matches!(
        elem.as_ref::<Expr>(self.sys).unwrap().get_opcode(),
        Opcode::Log
      ),
      NodeKind::Block => self.block_has_log(elem),
      _ => false,
    });
    result
  }

  pub(crate) fn visit_block(&mut self, block: &BaseNode) {
    let kind = {
      let b = block.as_ref::<Block>(self.sys).unwrap();
      match b.get_kind() {
        BlockKind::ModuleRoot => None,
        BlockKind::Condition(cond) => Some((Some(*cond), 0)),
        BlockKind::Cycle(cycle) => Some((None, *cycle)),
      }
    };
    if let Some((cond, cycle)) = &kind {
      match cond {
        Some(cond) => {
          let pred = format!("({})", self.dump_rval(cond, false));
          // A logging block must replay its guard in the testbench, so the guard is
          // exposed like any other externally observed value.
          if self.block_has_log(block) {
            self.expose(*cond, *cond);
          }
          self.cond_stack.push(CondFrame::Cond { pred, cond: *cond });
        }
        None => {
          let pred = format!("(self.cycle_count == UInt(64)({}))", cycle);
          self.cond_stack.push(CondFrame::Cycle {
            pred,
            cycle: *cycle,
          });
        }
      }
    }
    let body = {
      let b = block.as_ref::<Block>(self.sys).unwrap();
      b.body_iter().copied().collect::<Vec<_>>()
    };
    for elem in body {
      match elem.get_kind() {
        NodeKind::Expr => self.visit_expr(&elem),
        NodeKind::Block => self.visit_block(&elem),
        _ => panic!("Unexpected element {:?} in block", elem),
      }
    }
    if kind.is_some() {
      self.cond_stack.pop();
    }
  }

  #[allow(clippy::too_many_lines)]
  fn visit_expr(&mut self, node: &BaseNode) {
    let sys = self.sys;
    let expr = node.as_ref::<Expr>(sys).unwrap();
    let opcode = expr.get_opcode();
    let rval = self.dump_rval(node, false);

    let body: Option<String> = if opcode.is_binary() {
      let bin = node.as_inst::<BinaryInst>(sys).unwrap();
      let (a, b) = (self.dump_rval(&bin.lhs(), false), self.dump_rval(&bin.rhs(), false));
      let dtype = expr.dtype();
      let cast = dump_type_cast(&dtype);
      match bin.get_binop() {
        subcode::Binary::Shl | subcode::Binary::Shr => {
          let lhs_ty = bin.lhs().get_dtype(sys).unwrap();
          let rhs_ty = bin.rhs().get_dtype(sys).unwrap();
          let mut b = format!("{}.as_bits()", b);
          if lhs_ty.get_bits() > rhs_ty.get_bits() {
            b = format!(
              "BitsSignal.concat([Bits({})(0), {}])",
              lhs_ty.get_bits() - rhs_ty.get_bits(),
              b
            );
          }
          let op_class = match bin.get_binop() {
            subcode::Binary::Shl => "comb.ShlOp",
            _ if lhs_ty.is_signed() => "comb.ShrSOp",
            _ => "comb.ShrUOp",
          };
          Some(format!(
            "{} = {}({}.as_bits(), {}).{}",
            rval, op_class, a, b, cast
          ))
        }
        subcode::Binary::Mod => {
          let op_class = if expr.dtype().is_signed() {
            "comb.ModSOp"
          } else {
            "comb.ModUOp"
          };
          Some(format!(
            "{} = {}({}.as_bits(), {}.as_bits()).{}",
            rval, op_class, a, b, cast
          ))
        }
        subcode::Binary::BitwiseAnd | subcode::Binary::BitwiseOr | subcode::Binary::BitwiseXor => {
          let op = opcode.to_string();
          Some(format!(
            "{} = (({}.as_bits({bits}) {} {}.as_bits({bits})).{})",
            rval,
            a,
            op,
            b,
            cast,
            bits = dtype.get_bits()
          ))
        }
        _ => {
          let op = opcode.to_string();
          Some(format!("{} = (({} {} {}).{})", rval, a, op, b, cast))
        }
      }
    } else if opcode.is_cmp() {
      let cmp = node.as_inst::<CompareInst>(sys).unwrap();
      let mut a = self.dump_rval(&cmp.lhs(), false);
      let mut b = self.dump_rval(&cmp.rhs(), false);
      if !cmp.lhs().get_dtype(sys).unwrap().is_int() {
        a = format!("{}.as_uint()", a);
      }
      if !cmp.rhs().get_dtype(sys).unwrap().is_int() {
        b = format!("{}.as_uint()", b);
      }
      Some(format!(
        "{} = (({} {} {}).{})",
        rval,
        a,
        opcode.to_string(),
        b,
        dump_type_cast(&expr.dtype())
      ))
    } else if opcode.is_unary() {
      let uop = node.as_inst::<UnaryInst>(sys).unwrap();
      let op = match uop.get_uop() {
        subcode::Unary::Flip => "~",
        subcode::Unary::Neg => "-",
      };
      let x = self.dump_rval(&uop.x(), false);
      Some(format!(
        "{} = ({}({}.as_bits())).{}",
        rval,
        op,
        x,
        dump_type_cast(&expr.dtype())
      ))
    } else {
      match opcode {
        Opcode::ArrayRead => {
          let read = node.as_inst::<ArrayRead>(sys).unwrap();
          let array = read.array_node();
          self.expose(array, *node);
          if self.sram_payloads.contains(&array) {
            Some(format!("{} = self.mem_dataout", rval))
          } else {
            let port = self.analysis.ports.read_port(node).unwrap();
            Some(format!(
              "{} = self.{}_rdata_port{}",
              rval,
              namify(read.array().get_name()),
              port
            ))
          }
        }
        Opcode::ArrayWrite => {
          let write = node.as_inst::<ArrayWrite>(sys).unwrap();
          let array = write.array_node();
          self.expose(array, *node);
          None
        }
        Opcode::FIFOPush => {
          let push = node.as_inst::<FIFOPush>(sys).unwrap();
          let fifo = push.fifo().upcast();
          self.expose(fifo, *node);
          None
        }
        Opcode::FIFOPop => {
          let pop = node.as_inst::<FIFOPop>(sys).unwrap();
          let fifo = pop.fifo().upcast();
          self.expose(fifo, *node);
          // The popped value IS the port input; the alias only aids readability.
          let raw = namify(&expr.get_name());
          Some(format!("{} = self.{}", raw, namify(pop.fifo().get_name())))
        }
        Opcode::FIFOField { field } => {
          let probe = node.as_inst::<FIFOField>(sys).unwrap();
          let name = namify(probe.fifo().get_name());
          match field {
            subcode::FIFOField::Valid => Some(format!("{} = self.{}_valid", rval, name)),
            subcode::FIFOField::Peek => Some(format!("{} = self.{}", rval, name)),
          }
        }
        Opcode::Triggered => {
          let probe = node.as_inst::<Triggered>(sys).unwrap();
          Some(format!(
            "{} = self.{}_executed",
            rval,
            namify(probe.module().get_name())
          ))
        }
        Opcode::AsyncCall => {
          let call = node.as_inst::<AsyncCall>(sys).unwrap();
          let callee = call.callee().upcast();
          self.expose(callee, *node);
          None
        }
        Opcode::Bind => None,
        Opcode::Select => {
          let select = node.as_inst::<Select>(sys).unwrap();
          let cond = self.dump_rval(&select.cond(), false);
          let t = self.dump_rval(&select.true_value(), false);
          let f = self.dump_rval(&select.false_value(), false);
          Some(format!("{} = Mux({}, {}, {})", rval, cond, f, t))
        }
        Opcode::Select1Hot => {
          let select = node.as_inst::<Select1Hot>(sys).unwrap();
          let cond = self.dump_rval(&select.cond(), false);
          let values = select
            .value_iter()
            .map(|x| self.dump_rval(&x, false))
            .collect::<Vec<_>>();
          let num = values.len();
          if num == 1 {
            Some(format!("{} = {}", rval, values[0]))
          } else {
            let selector_bits = (usize::BITS - (num - 1).leading_zeros()).max(1) as usize;
            self.append_code(&format!("{}_sel = Bits({})(0)", rval, selector_bits));
            for (i, _) in values.iter().enumerate() {
              self.append_code(&format!(
                "{rval}_sel = Mux({cond}.as_bits()[{i}], {rval}_sel, Bits({bits})({i}))",
                rval = rval,
                cond = cond,
                i = i,
                bits = selector_bits
              ));
            }
            Some(format!("{} = Mux({}_sel, {})", rval, rval, values.join(", ")))
          }
        }
        Opcode::Slice => {
          let slice = node.as_inst::<Slice>(sys).unwrap();
          let a = self.dump_rval(&slice.x(), false);
          let l = slice.l().get_value();
          let r = slice.r().get_value();
          Some(format!("{} = {}.as_bits()[{}:{}]", rval, a, l, r + 1))
        }
        Opcode::Concat => {
          let concat = node.as_inst::<Concat>(sys).unwrap();
          let a = self.dump_rval(&concat.msb(), false);
          let b = self.dump_rval(&concat.lsb(), false);
          Some(format!(
            "{} = BitsSignal.concat([{}.as_bits(), {}.as_bits()])",
            rval, a, b
          ))
        }
        Opcode::Cast { cast } => {
          let inst = node.as_inst::<CastInst>(sys).unwrap();
          let a = self.dump_rval(&inst.x(), false);
          let src_bits = inst.x().get_dtype(sys).unwrap().get_bits();
          let pad = expr.dtype().get_bits() - src_bits;
          let body = match cast {
            subcode::Cast::Bitcast => format!("{}.{}", a, dump_type_cast(&expr.dtype())),
            subcode::Cast::ZExt => format!(
              "BitsSignal.concat([Bits({})(0), {}.as_bits()]).{}",
              pad,
              a,
              dump_type_cast(&expr.dtype())
            ),
            subcode::Cast::SExt => format!(
              "BitsSignal.concat([BitsSignal.concat([{}.as_bits()[{}]] * {}), \
               {}.as_bits()]).{}",
              a,
              src_bits - 1,
              pad,
              a,
              dump_type_cast(&expr.dtype())
            ),
          };
          Some(format!("{} = {}", rval, body))
        }
        Opcode::Log => {
          self.codegen_log(node);
          None
        }
        Opcode::Intrinsic { intrin } => {
          let inst = node.as_inst::<IntrinsicInst>(sys).unwrap();
          match intrin {
            subcode::Intrinsic::Finish => {
              let pred = self.get_pred();
              self.finish_conds.push(pred);
              None
            }
            subcode::Intrinsic::Assert => {
              let arg = inst.arg(0);
              self.expose(arg, arg);
              None
            }
            subcode::Intrinsic::WaitUntil => {
              self.wait_until = Some(self.dump_rval(&inst.arg(0), false));
              None
            }
            subcode::Intrinsic::Barrier => None,
            _ => panic!(
              "Intrinsic {:?} has no hardware lowering; DRAM models are simulation-only",
              intrin
            ),
          }
        }
        _ => panic!("Unknown opcode {:?}", opcode),
      }
    };

    // Valued expressions consumed elsewhere leave the module as expose/valid pairs.
    if opcode.is_valued() && !matches!(opcode, Opcode::Bind) {
      if expr_externally_used(sys, node, true) {
        self.expose(*node, *node);
      }
    }
    if let Some(body) = body {
      self.append_code(&body);
    }
  }

  /// Translate a `log` statement into a testbench-side print guarded by the exposed
  /// predicate and argument validity.
  fn codegen_log(&mut self, node: &BaseNode) {
    let sys = self.sys;
    let log = node.as_inst::<Log>(sys).unwrap();
    let module_name = namify(
      self
        .current_module
        .as_ref::<Module>(sys)
        .unwrap()
        .get_name(),
    );
    let fmt = log.fmt().get_value().to_string();

    let mut arg_snippets = Vec::new();
    let mut validity = Vec::new();
    for arg in log.arg_iter() {
      if let NodeKind::IntImm = arg.get_kind() {
        let imm = arg.as_ref::<IntImm>(sys).unwrap();
        arg_snippets.push(imm.get_value().to_string());
        continue;
      }
      self.expose(arg, arg);
      let exposed = namify(&self.dump_rval(&arg, true));
      validity.push(format!("dut.{}.valid_{}.value", module_name, exposed));
      let base = format!("dut.{}.expose_{}.value", module_name, exposed);
      let dtype = arg.get_dtype(sys).unwrap();
      if dtype.is_signed() {
        let bits = dtype.get_bits();
        arg_snippets.push(format!(
          "({base} - (1 << {bits}) if ({base} >> ({bits} - 1)) & 1 else int({base}))",
          base = base,
          bits = bits
        ));
      } else {
        arg_snippets.push(format!("int({})", base));
      }
    }

    // Re-target the surrounding predicate stack at testbench scope.
    let mut conditions = Vec::new();
    for frame in self.cond_stack.iter() {
      match frame {
        CondFrame::Cycle { cycle, .. } => {
          conditions.push(format!("dut.global_cycle_count.value == {}", cycle));
        }
        CondFrame::Cond { cond, .. } => {
          let exposed = namify(&self.dump_rval(cond, true));
          conditions.push(format!(
            "(dut.{m}.valid_{c}.value) & (dut.{m}.expose_{c}.value)",
            m = module_name,
            c = exposed
          ));
        }
      }
    }
    if !validity.is_empty() {
      conditions.push(validity.join(" and "));
    }

    // Substitute the placeholders of the format string with the python snippets.
    let mut f_string = String::new();
    let mut args = arg_snippets.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
      if c == '{' {
        if chars.peek() == Some(&'{') {
          chars.next();
          f_string.push_str("{{");
          continue;
        }
        let mut spec = String::new();
        for c in chars.by_ref() {
          if c == '}' {
            break;
          }
          spec.push(c);
        }
        let arg = args.next().map(|x| x.as_str()).unwrap_or("0");
        if spec.is_empty() || spec == "?" {
          f_string.push_str(&format!("{{{}}}", arg));
        } else {
          f_string.push_str(&format!("{{{}{}}}", arg, spec));
        }
      } else if c == '}' {
        if chars.peek() == Some(&'}') {
          chars.next();
        }
        f_string.push_str("}}");
      } else {
        f_string.push(c);
      }
    }

    let line = format!(
      "f\"Cycle @{{float(dut.global_cycle_count.value):.2f}}: [{:<20}] {}\"",
      module_name, f_string
    );
    if conditions.is_empty() {
      self.logs.push(format!("print({})", line));
    } else {
      self.logs.push(format!("if ({}):", conditions.join(" and ")));
      self.logs.push(format!("    print({})", line));
    }
  }

  // -------------------------------------------------------------------------
  // Module classes.

  /// The `_executed` inputs a downstream needs: the shared downstream-dependency
  /// list (data upstreams plus `triggered()` probes).
  fn executed_inputs(&self, module: &BaseNode) -> Vec<BaseNode> {
    crate::analysis::downstream_dependencies(self.sys, module)
  }

  fn module_ports(&mut self, module: &BaseNode) {
    let sys = self.sys;
    let module_ref = module.as_ref::<Module>(sys).unwrap();
    let is_downstream = module_ref.is_downstream();
    let is_sram = matches!(module_ref.get_kind(), ModuleKind::Sram(_));
    self.append_code("clk = Clock()");
    self.append_code("rst = Reset()");
    self.append_code("executed = Output(Bits(1))");
    self.append_code("cycle_count = Input(UInt(64))");
    self.append_code("finish = Output(Bits(1))");

    if is_downstream {
      for dep in self.executed_inputs(module) {
        let dep = namify(dep.as_ref::<Module>(sys).unwrap().get_name());
        self.append_code(&format!("{}_executed = Input(Bits(1))", dep));
      }
      if is_sram {
        let payload = self
          .sram_payloads
          .iter()
          .find(|x| {
            self
              .analysis
              .matrix
              .record(module)
              .map(|r| {
                r.array_writes.iter().any(|w| {
                  w.as_inst::<ArrayWrite>(sys).unwrap().array_node() == **x
                })
              })
              .unwrap_or(false)
          })
          .copied();
        if let Some(payload) = payload {
          let array = payload.as_ref::<Array>(sys).unwrap();
          let index_bits = array.index_bits();
          self.append_code(&format!("mem_dataout = Input({})", dump_type(&array.scalar_ty())));
          self.append_code(&format!("mem_address = Output(Bits({}))", index_bits));
          self.append_code(&format!(
            "mem_write_data = Output({})",
            dump_type(&array.scalar_ty())
          ));
          self.append_code("mem_write_enable = Output(Bits(1))");
          self.append_code("mem_read_enable = Output(Bits(1))");
        }
      }
    } else {
      self.append_code("trigger_counter_pop_valid = Input(Bits(1))");
    }

    // Foreign values consumed combinationally arrive as expose/valid input pairs.
    let mut added = HashSet::new();
    let externals = module_ref
      .ext_iter()
      .map(|(value, _)| *value)
      .collect::<Vec<_>>();
    for value in externals {
      if value.get_kind() != NodeKind::Expr {
        continue;
      }
      let expr = value.as_ref::<Expr>(sys).unwrap();
      if matches!(expr.get_opcode(), Opcode::Bind | Opcode::FIFOPush) {
        continue;
      }
      let port = self.external_port_name(&value);
      if !added.insert(port.clone()) {
        continue;
      }
      let dtype = dump_type(&expr.dtype());
      self.append_code(&format!("{} = Input({})", port, dtype));
      self.append_code(&format!("{}_valid = Input(Bits(1))", port));
    }

    if !is_downstream {
      let record = self.analysis.matrix.record(module);
      let pops = record.map(|x| x.fifo_pops.clone()).unwrap_or_default();
      for port in module_ref.port_iter() {
        let name = namify(port.get_name());
        self.append_code(&format!("{} = Input({})", name, dump_type(&port.scalar_ty())));
        self.append_code(&format!("{}_valid = Input(Bits(1))", name));
        let popped = pops.iter().any(|x| {
          x.as_inst::<FIFOPop>(sys).unwrap().fifo().upcast() == port.upcast()
        });
        if popped {
          self.append_code(&format!("{}_pop_ready = Output(Bits(1))", name));
        }
      }
    }

    // Handshakes toward the modules this one pushes into or calls.
    let record = self.analysis.matrix.record(module);
    let pushes = record.map(|x| x.fifo_pushes.clone()).unwrap_or_default();
    let calls = record.map(|x| x.async_calls.clone()).unwrap_or_default();
    let mut push_targets = Vec::new();
    for push in pushes.iter() {
      let fifo = push.as_inst::<FIFOPush>(sys).unwrap().fifo().upcast();
      if !push_targets.contains(&fifo) {
        push_targets.push(fifo);
      }
    }
    let mut call_targets = Vec::new();
    for call in calls.iter() {
      let callee = call.as_inst::<AsyncCall>(sys).unwrap().callee().upcast();
      if !call_targets.contains(&callee) {
        call_targets.push(callee);
      }
    }
    for fifo in push_targets.iter() {
      let fifo_ref = fifo.as_ref::<FIFO>(sys).unwrap();
      let owner = namify(
        fifo_ref
          .get_parent()
          .as_ref::<Module>(sys)
          .unwrap()
          .get_name(),
      );
      let prefix = format!("{}_{}", owner, namify(fifo_ref.get_name()));
      self.append_code(&format!("fifo_{}_push_ready = Input(Bits(1))", prefix));
      self.append_code(&format!("{}_push_valid = Output(Bits(1))", prefix));
      self.append_code(&format!(
        "{}_push_data = Output({})",
        prefix,
        dump_type(&fifo_ref.scalar_ty())
      ));
    }
    for callee in call_targets.iter() {
      let name = namify(callee.as_ref::<Module>(sys).unwrap().get_name());
      self.append_code(&format!(
        "{}_trigger_counter_delta_ready = Input(Bits(1))",
        name
      ));
      self.append_code(&format!("{}_trigger = Output(UInt(8))", name));
    }

    // Array port bundles per the port allocation.
    for array in sys.array_iter() {
      let array_node = array.upcast();
      if self.sram_payloads.contains(&array_node) {
        continue;
      }
      let index_bits = array.index_bits();
      let name = namify(array.get_name());
      for read in self.analysis.ports.reads_of(&array_node) {
        let owner = read.as_ref::<Expr>(sys).unwrap().get_module();
        if owner != *module {
          continue;
        }
        let port = self.analysis.ports.read_port(read).unwrap();
        self.append_code(&format!(
          "{}_ridx_port{} = Output(Bits({}))",
          name, port, index_bits
        ));
        self.append_code(&format!(
          "{}_rdata_port{} = Input({})",
          name,
          port,
          dump_type(&array.scalar_ty())
        ));
      }
      if let Some(port) = self.analysis.ports.write_port(&array_node, module) {
        self.append_code(&format!("{}_w_port{} = Output(Bits(1))", name, port));
        self.append_code(&format!(
          "{}_wdata_port{} = Output({})",
          name,
          port,
          dump_type(&array.scalar_ty())
        ));
        self.append_code(&format!(
          "{}_widx_port{} = Output(Bits({}))",
          name, port, index_bits
        ));
      }
    }

    let exposed = std::mem::take(&mut self.exposed_ports);
    for port in exposed {
      self.append_code(&port);
    }
  }

  /// Aggregate the guarded effects collected during body generation: mux chains per
  /// resource, OR-of-predicates enables, everything gated by `executed_wire`.
  #[allow(clippy::too_many_lines)]
  fn cleanup(&mut self) {
    let sys = self.sys;
    let module = self.current_module;
    let module_ref = module.as_ref::<Module>(sys).unwrap();
    let is_downstream = module_ref.is_downstream();
    self.append_code("");

    if is_downstream {
      let deps = self.executed_inputs(&module);
      if deps.is_empty() {
        // The OR of an empty upstream set: this downstream never executes.
        self.append_code("executed_wire = Bits(1)(0)");
      } else {
        let signals = deps
          .iter()
          .map(|x| {
            format!(
              "self.{}_executed",
              namify(x.as_ref::<Module>(sys).unwrap().get_name())
            )
          })
          .collect::<Vec<_>>()
          .join(" | ");
        self.append_code(&format!("executed_wire = ({})", signals));
      }
    } else {
      let mut conds = vec!["self.trigger_counter_pop_valid".to_string()];
      if let Some(wait) = &self.wait_until {
        conds.push(format!("({})", wait));
      }
      self.append_code(&format!("executed_wire = {}", conds.join(" & ")));
    }

    if self.finish_conds.is_empty() {
      self.append_code("self.finish = Bits(1)(0)");
    } else {
      let terms = self
        .finish_conds
        .clone()
        .into_iter()
        .map(|x| format!("({} & executed_wire)", x))
        .collect::<Vec<_>>()
        .join(" | ");
      self.append_code(&format!("self.finish = {}", terms));
    }

    let exposes = std::mem::take(&mut self.exposes);
    for (key, sites) in exposes.iter() {
      match key.get_kind() {
        NodeKind::Array => {
          if self.sram_payloads.contains(key) {
            self.sram_cleanup(key, sites);
            continue;
          }
          self.array_cleanup(key, sites);
        }
        NodeKind::FIFO => self.fifo_cleanup(key, sites),
        NodeKind::Module => self.trigger_cleanup(key, sites),
        NodeKind::IntImm | NodeKind::StrImm => {}
        NodeKind::Expr => {
          let site = sites[0].0;
          let rval = self.dump_rval(&site, false);
          let exposed = if module_ref.get().externals.contains_key(&site) {
            self.external_port_name(&site)
          } else {
            namify(&self.dump_rval(&site, true))
          };
          let dtype = site.get_dtype(sys).unwrap();
          self
            .exposed_ports
            .push(format!("expose_{} = Output({})", exposed, dump_type(&dtype)));
          self
            .exposed_ports
            .push(format!("valid_{} = Output(Bits(1))", exposed));
          self.append_code(&format!("self.expose_{} = {}", exposed, rval));
          self.append_code(&format!("self.valid_{} = executed_wire", exposed));
        }
        _ => panic!("Unexpected expose key {:?}", key),
      }
    }

    self.append_code("self.executed = executed_wire");
  }

  fn array_cleanup(&mut self, array: &BaseNode, sites: &[(BaseNode, String)]) {
    let sys = self.sys;
    let module = self.current_module;
    let array_ref = array.as_ref::<Array>(sys).unwrap();
    let name = namify(array_ref.get_name());
    let dtype = array_ref.scalar_ty();
    let index_bits = array_ref.index_bits();
    let writes = sites
      .iter()
      .filter(|(site, _)| site.as_inst::<ArrayWrite>(sys).is_ok())
      .collect::<Vec<_>>();
    let reads = sites
      .iter()
      .filter(|(site, _)| site.as_inst::<ArrayRead>(sys).is_ok())
      .collect::<Vec<_>>();
    if !writes.is_empty() {
      let port = self
        .analysis
        .ports
        .write_port(array, &module)
        .expect("Write without an allocated port");
      let suffix = format!("_port{}", port);
      let enables = writes
        .iter()
        .map(|(_, pred)| pred.clone())
        .collect::<Vec<_>>()
        .join(" | ");
      self.append_code(&format!(
        "self.{}_w{} = executed_wire & ({})",
        name, suffix, enables
      ));
      // Innermost-first mux chains: the last write in program order wins the cycle.
      let first = writes[0].0.as_inst::<ArrayWrite>(sys).unwrap();
      let mut wdata = if writes.len() == 1 {
        self.dump_rval(&first.value(), false)
      } else {
        let mut chain = format!(
          "Mux({}, {}(0), {})",
          writes[0].1,
          dump_type(&dtype),
          self.dump_rval(&first.value(), false)
        );
        for (site, pred) in writes.iter().skip(1) {
          let write = site.as_inst::<ArrayWrite>(sys).unwrap();
          chain = format!(
            "Mux({}, {}, {})",
            pred,
            chain,
            self.dump_rval(&write.value(), false)
          );
        }
        chain
      };
      if !dtype.is_raw() {
        wdata = format!("{}.{}", wdata, dump_type_cast(&dtype));
      }
      self.append_code(&format!("self.{}_wdata{} = {}", name, suffix, wdata));
      let widx = if writes.len() == 1 {
        self.dump_rval(&first.idx(), false)
      } else {
        let mut chain = format!(
          "Mux({}, Bits({})(0).as_uint(), {})",
          writes[0].1,
          index_bits,
          self.dump_rval(&first.idx(), false)
        );
        for (site, pred) in writes.iter().skip(1) {
          let write = site.as_inst::<ArrayWrite>(sys).unwrap();
          chain = format!(
            "Mux({}, {}, {})",
            pred,
            chain,
            self.dump_rval(&write.idx(), false)
          );
        }
        chain
      };
      self.append_code(&format!(
        "self.{}_widx{} = {}.as_bits({})",
        name, suffix, widx, index_bits
      ));
    }
    for (site, _) in reads.iter() {
      let read = site.as_inst::<ArrayRead>(sys).unwrap();
      let port = self.analysis.ports.read_port(site).unwrap();
      let idx = self.dump_rval(&read.idx(), false);
      self.append_code(&format!(
        "self.{}_ridx_port{} = {}.as_bits({})",
        name, port, idx, index_bits
      ));
    }
  }

  fn sram_cleanup(&mut self, array: &BaseNode, sites: &[(BaseNode, String)]) {
    let sys = self.sys;
    let array_ref = array.as_ref::<Array>(sys).unwrap();
    let index_bits = array_ref.index_bits();
    let mut write: Option<(BaseNode, String)> = None;
    let mut read: Option<(BaseNode, String)> = None;
    for (site, pred) in sites.iter() {
      if site.as_inst::<ArrayWrite>(sys).is_ok() && write.is_none() {
        write = Some((*site, pred.clone()));
      }
      if site.as_inst::<ArrayRead>(sys).is_ok() && read.is_none() {
        read = Some((*site, pred.clone()));
      }
    }
    let write_enable = write
      .as_ref()
      .map(|(_, pred)| format!("executed_wire & ({})", pred))
      .unwrap_or_else(|| "Bits(1)(0)".to_string());
    self.append_code(&format!("self.mem_write_enable = {}", write_enable));
    let write_addr = write.as_ref().map(|(site, _)| {
      let w = site.as_inst::<ArrayWrite>(sys).unwrap();
      self.dump_rval(&w.idx(), false)
    });
    let read_addr = read.as_ref().map(|(site, _)| {
      let r = site.as_inst::<ArrayRead>(sys).unwrap();
      self.dump_rval(&r.idx(), false)
    });
    match (&write_addr, &read_addr) {
      (Some(w), Some(r)) if w != r => self.append_code(&format!(
        "self.mem_address = Mux({}, {}.as_bits({bits}), {}.as_bits({bits}))",
        write_enable,
        r,
        w,
        bits = index_bits
      )),
      (Some(w), _) => self.append_code(&format!("self.mem_address = {}.as_bits({})", w, index_bits)),
      (None, Some(r)) => {
        self.append_code(&format!("self.mem_address = {}.as_bits({})", r, index_bits))
      }
      (None, None) => self.append_code(&format!("self.mem_address = Bits({})(0)", index_bits)),
    }
    let wdata = write
      .as_ref()
      .map(|(site, _)| {
        let w = site.as_inst::<ArrayWrite>(sys).unwrap();
        self.dump_rval(&w.value(), false)
      })
      .unwrap_or_else(|| format!("{}(0)", dump_type(&array_ref.scalar_ty())));
    self.append_code(&format!("self.mem_write_data = {}", wdata));
    self.append_code("self.mem_read_enable = Bits(1)(1)");
  }

  fn fifo_cleanup(&mut self, fifo: &BaseNode, sites: &[(BaseNode, String)]) {
    let sys = self.sys;
    let fifo_ref = fifo.as_ref::<FIFO>(sys).unwrap();
    let owner = namify(
      fifo_ref
        .get_parent()
        .as_ref::<Module>(sys)
        .unwrap()
        .get_name(),
    );
    let local = namify(fifo_ref.get_name());
    let prefix = format!("{}_{}", owner, local);
    let pushes = sites
      .iter()
      .filter(|(site, _)| site.as_inst::<FIFOPush>(sys).is_ok())
      .collect::<Vec<_>>();
    let pops = sites
      .iter()
      .filter(|(site, _)| site.as_inst::<FIFOPop>(sys).is_ok())
      .collect::<Vec<_>>();
    if !pushes.is_empty() {
      let preds = pushes
        .iter()
        .map(|(_, pred)| format!("({})", pred))
        .collect::<Vec<_>>()
        .join(" | ");
      let data = if pushes.len() == 1 {
        let push = pushes[0].0.as_inst::<FIFOPush>(sys).unwrap();
        self.dump_rval(&push.value(), false)
      } else {
        let mut chain = format!("{}(0)", dump_type(&fifo_ref.scalar_ty()));
        for (site, pred) in pushes.iter() {
          let push = site.as_inst::<FIFOPush>(sys).unwrap();
          chain = format!(
            "Mux({}, {}, {})",
            pred,
            chain,
            self.dump_rval(&push.value(), false)
          );
        }
        chain
      };
      self.append_code(&format!("# Push logic for port {}", prefix));
      self.append_code(&format!(
        "self.{}_push_valid = executed_wire & ({}) & self.fifo_{}_push_ready",
        prefix, preds, prefix
      ));
      self.append_code(&format!("self.{}_push_data = {}", prefix, data));
    }
    if !pops.is_empty() {
      let preds = pops
        .iter()
        .map(|(_, pred)| format!("({})", pred))
        .collect::<Vec<_>>()
        .join(" | ");
      self.append_code(&format!(
        "self.{}_pop_ready = executed_wire & ({})",
        local, preds
      ));
    }
  }

  fn trigger_cleanup(&mut self, callee: &BaseNode, sites: &[(BaseNode, String)]) {
    let sys = self.sys;
    let name = namify(callee.as_ref::<Module>(sys).unwrap().get_name());
    let terms = sites
      .iter()
      .map(|(_, pred)| format!("Mux({}, UInt(8)(0), UInt(8)(1))", pred))
      .collect::<Vec<_>>();
    self.append_code(&format!("# Summing triggers for {}", name));
    let sum = if terms.len() == 1 {
      terms[0].clone()
    } else {
      format!("({})", terms.join(" + "))
    };
    self.append_code(&format!(
      "self.{}_trigger = Mux(executed_wire, UInt(8)(0), (({}).as_bits()[0:8].as_uint()))",
      name, sum
    ));
  }

  pub(crate) fn visit_module(&mut self, module: &BaseNode) {
    // Stage 1: generate the construct body into a scratch buffer; this also collects
    // the exposes and the extra ports they need.
    let outer_code = std::mem::take(&mut self.code);
    let outer_indent = self.indent;
    self.indent = outer_indent + 8;
    self.wait_until = None;
    self.exposes.clear();
    self.cond_stack.clear();
    self.finish_conds.clear();
    self.exposed_ports.clear();
    self.current_module = *module;

    let body = module.as_ref::<Module>(self.sys).unwrap().get_body().upcast();
    self.visit_block(&body);
    self.cleanup();
    let construct_body = std::mem::replace(&mut self.code, outer_code);
    self.indent = outer_indent;

    // Stage 2: the class itself.
    let name = namify(module.as_ref::<Module>(self.sys).unwrap().get_name());
    self.append_code(&format!("class {}(Module):", name));
    self.indent += 4;
    self.module_ports(module);
    self.append_code("");
    self.append_code("@generator");
    self.append_code("def construct(self):");
    self.code.extend(construct_body);
    self.indent -= 4;
    self.append_code("");
  }

  /// A register-file class per array: one write bundle per allocated port, one
  /// read bundle per read site. Ports are applied in ascending index order, so the
  /// highest-indexed writer wins same-cycle conflicts.
  pub(crate) fn visit_array(&mut self, array: &BaseNode) {
    let sys = self.sys;
    let array_ref = array.as_ref::<Array>(sys).unwrap();
    let name = namify(array_ref.get_name());
    let size = array_ref.get_size();
    let dtype = array_ref.scalar_ty();
    let index_bits = array_ref.index_bits();
    let num_write_ports = self.analysis.ports.num_writers(array);
    let reads = self.analysis.ports.reads_of(array).to_vec();
    let dim_ty = format!("dim({}, {})", dump_type(&dtype), size);

    self.append_code(&format!("class {}(Module):", name));
    self.indent += 4;
    self.append_code("clk = Clock()");
    self.append_code("rst = Reset()");
    self.append_code("");
    for port in 0..num_write_ports {
      self.append_code(&format!("w_port{} = Input(Bits(1))", port));
      self.append_code(&format!("widx_port{} = Input(Bits({}))", port, index_bits));
      self.append_code(&format!("wdata_port{} = Input({})", port, dump_type(&dtype)));
    }
    for (port, _) in reads.iter().enumerate() {
      self.append_code(&format!("ridx_port{} = Input(Bits({}))", port, index_bits));
      self.append_code(&format!("rdata_port{} = Output({})", port, dump_type(&dtype)));
    }
    self.append_code("");
    self.append_code("@generator");
    self.append_code("def construct(self):");
    self.indent += 4;
    let rst_value = if let Some(init) = array_ref.get_initializer() {
      format!(
        "[{}]",
        init.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", ")
      )
    } else {
      format!("[0] * {}", size)
    };
    if array_ref.is_partitioned() {
      // Fully partitioned: every element is its own register. Writers are declared to
      // hit disjoint elements, so no per-element priority network is needed and each
      // register sees at most one live write port.
      self.append_code(&format!("rst_values = {}", rst_value));
      self.append_code("element_regs = []");
      self.append_code(&format!("for i in range({}):", size));
      self.indent += 4;
      self.append_code(&format!(
        "elem = Reg({}, clk=self.clk, rst=self.rst, rst_value=rst_values[i])",
        dump_type(&dtype)
      ));
      self.append_code("element_value = elem");
      for port in 0..num_write_ports {
        self.append_code(&format!(
          "hit_port{port} = (self.w_port{port} & (self.widx_port{port} == \
           Bits({bits})(i)))",
          port = port,
          bits = index_bits
        ));
        self.append_code(&format!(
          "element_value = Mux(hit_port{port}, element_value, self.wdata_port{port})",
          port = port
        ));
      }
      self.append_code("elem.assign(element_value)");
      self.append_code("element_regs.append(elem)");
      self.indent -= 4;
      self.append_code(&format!("data_view = {}(element_regs)", dim_ty));
      for (port, _) in reads.iter().enumerate() {
        self.append_code(&format!(
          "self.rdata_port{port} = data_view[self.ridx_port{port}.as_uint()]",
          port = port
        ));
      }
    } else {
      self.append_code(&format!(
        "data_reg = Reg({}, clk=self.clk, rst=self.rst, rst_value={})",
        dim_ty, rst_value
      ));
      if num_write_ports != 0 {
        self.append_code("next_data_values = []");
        self.append_code(&format!("for i in range({}):", size));
        self.indent += 4;
        self.append_code("element_value = data_reg[i]");
        for port in 0..num_write_ports {
          self.append_code(&format!(
            "hit_port{port} = (self.w_port{port} & (self.widx_port{port} == \
             Bits({bits})(i)))",
            port = port,
            bits = index_bits
          ));
          self.append_code(&format!(
            "element_value = Mux(hit_port{port}, element_value, self.wdata_port{port})",
            port = port
          ));
        }
        self.append_code("next_data_values.append(element_value)");
        self.indent -= 4;
        self.append_code(&format!("next_data = {}(next_data_values)", dim_ty));
      } else {
        self.append_code("next_data = data_reg");
      }
      self.append_code("data_reg.assign(next_data)");
      for (port, _) in reads.iter().enumerate() {
        self.append_code(&format!(
          "self.rdata_port{port} = data_reg[self.ridx_port{port}.as_uint()]",
          port = port
        ));
      }
    }
    self.indent -= 8;
    self.append_code("");
  }
}
