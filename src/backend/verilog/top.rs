use crate::ir::instructions::{ArrayWrite, AsyncCall, FIFOPop, FIFOPush};
use crate::ir::node::*;
use crate::ir::*;

use super::design::VerilogDumper;
use super::utils::{dump_type, dump_type_cast, namify};

/// Generate the Top harness: every module instantiated exactly once, FIFOs and
/// trigger counters between them per the interaction matrix, arrays wired to their
/// allocated ports, and the OR of every `finish` as `global_finish`.
#[allow(clippy::too_many_lines)]
pub(crate) fn generate_top(dumper: &mut VerilogDumper<'_>) {
  let sys = dumper.sys;

  dumper.append_code("class Top(Module):");
  dumper.indent += 4;
  dumper.append_code("clk = Clock()");
  dumper.append_code("rst = Reset()");
  dumper.append_code("global_cycle_count = Output(UInt(64))");
  dumper.append_code("global_finish = Output(Bits(1))");
  dumper.append_code("");
  dumper.append_code("@generator");
  dumper.append_code("def construct(self):");
  dumper.indent += 4;

  // SRAM payloads become external memory blackboxes.
  let srams = sys
    .downstream_iter()
    .filter(|x| matches!(x.get_kind(), ModuleKind::Sram(_)))
    .map(|x| x.upcast())
    .collect::<Vec<_>>();
  for sram in srams.iter() {
    let module = sram.as_ref::<Module>(sys).unwrap();
    let params = module.get_kind().memory_params().unwrap().clone();
    let record = dumper.analysis.matrix.record(sram).unwrap();
    let payload = record.array_writes[0]
      .as_inst::<ArrayWrite>(sys)
      .unwrap()
      .array_node();
    let array = payload.as_ref::<Array>(sys).unwrap();
    let name = namify(array.get_name());
    let data_width = params.width;
    let addr_width = array.index_bits();
    dumper.append_code(&format!("mem_{}_dataout = Wire(Bits({}))", name, data_width));
    dumper.append_code(&format!("mem_{}_address = Wire(Bits({}))", name, addr_width));
    dumper.append_code(&format!("mem_{}_write_data = Wire(Bits({}))", name, data_width));
    dumper.append_code(&format!("mem_{}_write_enable = Wire(Bits(1))", name));
    dumper.append_code(&format!("mem_{}_read_enable = Wire(Bits(1))", name));
    dumper.append_code(&format!(
      "mem_{name}_inst = sramBlackbox_{name}()(clk=self.clk, rst_n=~self.rst, \
       address=mem_{name}_address, wd=mem_{name}_write_data, banksel=Bits(1)(1), \
       read=mem_{name}_read_enable, write=mem_{name}_write_enable)",
      name = name
    ));
    dumper.append_code(&format!("mem_{name}_dataout.assign(mem_{name}_inst.dataout)", name = name));
    dumper.append_code("");
  }

  // A free-running cycle counter for testbench control.
  dumper.append_code("cycle_count = Reg(UInt(64), clk=self.clk, rst=self.rst, rst_value=0)");
  dumper
    .append_code("cycle_count.assign((cycle_count + UInt(64)(1)).as_bits()[0:64].as_uint())");
  dumper.append_code("self.global_cycle_count = cycle_count");
  dumper.append_code("");

  // Wires for FIFOs, trigger counters, and array ports.
  for module in sys.module_iter() {
    let module_name = namify(module.get_name());
    for port in module.port_iter() {
      let prefix = format!("fifo_{}_{}", module_name, namify(port.get_name()));
      let bits = port.scalar_ty().get_bits();
      dumper.append_code(&format!("{}_push_valid = Wire(Bits(1))", prefix));
      dumper.append_code(&format!("{}_push_data = Wire(Bits({}))", prefix, bits));
      dumper.append_code(&format!("{}_push_ready = Wire(Bits(1))", prefix));
      dumper.append_code(&format!("{}_pop_valid = Wire(Bits(1))", prefix));
      dumper.append_code(&format!("{}_pop_data = Wire(Bits({}))", prefix, bits));
      dumper.append_code(&format!("{}_pop_ready = Wire(Bits(1))", prefix));
    }
    let prefix = format!("{}_trigger_counter", module_name);
    dumper.append_code(&format!("{}_delta = Wire(Bits(8))", prefix));
    dumper.append_code(&format!("{}_delta_ready = Wire(Bits(1))", prefix));
    dumper.append_code(&format!("{}_pop_valid = Wire(Bits(1))", prefix));
    dumper.append_code(&format!("{}_pop_ready = Wire(Bits(1))", prefix));
  }
  for array in sys.array_iter() {
    let array_node = array.upcast();
    if dumper.sram_payloads.contains(&array_node) {
      continue;
    }
    let name = namify(array.get_name());
    let index_bits = array.index_bits();
    let num_ports = dumper.analysis.ports.num_writers(&array_node);
    let reads = dumper.analysis.ports.reads_of(&array_node).to_vec();
    dumper.append_code(&format!(
      "# Array {} with {} write port(s), {} read port(s)",
      name,
      num_ports,
      reads.len()
    ));
    for port in 0..num_ports {
      dumper.append_code(&format!("aw_{}_w_port{} = Wire(Bits(1))", name, port));
      dumper.append_code(&format!(
        "aw_{}_wdata_port{} = Wire({})",
        name,
        port,
        dump_type(&array.scalar_ty())
      ));
      dumper.append_code(&format!(
        "aw_{}_widx_port{} = Wire(Bits({}))",
        name, port, index_bits
      ));
    }
    for (port, _) in reads.iter().enumerate() {
      dumper.append_code(&format!(
        "aw_{}_ridx_port{} = Wire(Bits({}))",
        name, port, index_bits
      ));
    }
    let mut conns = vec!["clk=self.clk".to_string(), "rst=self.rst".to_string()];
    for port in 0..num_ports {
      conns.push(format!("w_port{p}=aw_{}_w_port{p}", name, p = port));
      conns.push(format!("widx_port{p}=aw_{}_widx_port{p}", name, p = port));
      conns.push(format!("wdata_port{p}=aw_{}_wdata_port{p}", name, p = port));
    }
    for (port, _) in reads.iter().enumerate() {
      conns.push(format!("ridx_port{p}=aw_{}_ridx_port{p}", name, p = port));
    }
    dumper.append_code(&format!(
      "array_writer_{} = {}({})",
      name,
      name,
      conns.join(", ")
    ));
  }
  dumper.append_code("");

  // FIFO instances: the depth is the largest per-binding hint against the port.
  for module in sys.module_iter() {
    let module_name = namify(module.get_name());
    for port in module.port_iter() {
      let port_node = port.upcast();
      let mut depth = dumper.config.default_fifo_depth;
      for pusher in sys.module_iter().chain(sys.downstream_iter()) {
        let record = match dumper.analysis.matrix.record(&pusher.upcast()) {
          Some(record) => record,
          None => continue,
        };
        for push in record.fifo_pushes.iter() {
          let target = push.as_inst::<FIFOPush>(sys).unwrap().fifo().upcast();
          if target == port_node {
            if let Some(hint) = sys.fifo_depth_of(push) {
              depth = depth.max(hint);
            }
          }
        }
      }
      let prefix = format!("fifo_{}_{}", module_name, namify(port.get_name()));
      dumper.append_code(&format!(
        "{prefix}_inst = FIFO(WIDTH={}, DEPTH_LOG2={})(clk=self.clk, rst_n=~self.rst, \
         push_valid={prefix}_push_valid, push_data={prefix}_push_data, \
         pop_ready={prefix}_pop_ready)",
        port.scalar_ty().get_bits(),
        depth,
        prefix = prefix
      ));
      dumper.append_code(&format!("{prefix}_push_ready.assign({prefix}_inst.push_ready)", prefix = prefix));
      dumper.append_code(&format!("{prefix}_pop_valid.assign({prefix}_inst.pop_valid)", prefix = prefix));
      dumper.append_code(&format!("{prefix}_pop_data.assign({prefix}_inst.pop_data)", prefix = prefix));
    }
  }

  // Trigger counters: one per sequential module.
  for module in sys.module_iter() {
    let prefix = format!("{}_trigger_counter", namify(module.get_name()));
    dumper.append_code(&format!(
      "{prefix}_inst = TriggerCounter(WIDTH=8)(clk=self.clk, rst_n=~self.rst, \
       delta={prefix}_delta, pop_ready={prefix}_pop_ready)",
      prefix = prefix
    ));
    dumper.append_code(&format!("{prefix}_delta_ready.assign({prefix}_inst.delta_ready)", prefix = prefix));
    dumper.append_code(&format!("{prefix}_pop_valid.assign({prefix}_inst.pop_valid)", prefix = prefix));
  }
  dumper.append_code("");

  // Module instances: sequential modules first, then downstreams in topological
  // order, so downstream port maps can reference their upstream instances.
  let ordered = sys
    .modules
    .iter()
    .copied()
    .chain(dumper.analysis.topo.iter().copied())
    .collect::<Vec<_>>();
  let mut driven_ports: Vec<BaseNode> = Vec::new();
  let mut connections: Vec<(String, Vec<String>)> = Vec::new();
  for module in ordered.iter() {
    let module_ref = module.as_ref::<Module>(sys).unwrap();
    let module_name = namify(module_ref.get_name());
    let is_downstream = module_ref.is_downstream();
    let is_sram = matches!(module_ref.get_kind(), ModuleKind::Sram(_));
    let record = dumper.analysis.matrix.record(module);
    let pushes = record.map(|x| x.fifo_pushes.clone()).unwrap_or_default();
    let calls = record.map(|x| x.async_calls.clone()).unwrap_or_default();
    let pops = record.map(|x| x.fifo_pops.clone()).unwrap_or_default();

    dumper.append_code(&format!("# Instantiation of {}", module_name));
    let mut port_map = vec![
      "clk=self.clk".to_string(),
      "rst=self.rst".to_string(),
      "cycle_count=cycle_count".to_string(),
    ];
    if !is_downstream {
      port_map.push(format!(
        "trigger_counter_pop_valid={}_trigger_counter_pop_valid",
        module_name
      ));
      for port in module_ref.port_iter() {
        let prefix = format!("fifo_{}_{}", module_name, namify(port.get_name()));
        let name = namify(port.get_name());
        if port.scalar_ty().is_raw() || port.scalar_ty().is_record() {
          port_map.push(format!("{}={}_pop_data", name, prefix));
        } else {
          port_map.push(format!(
            "{}={}_pop_data.{}",
            name,
            prefix,
            dump_type_cast(&port.scalar_ty())
          ));
        }
        port_map.push(format!("{}_valid={}_pop_valid", name, prefix));
      }
    } else {
      for dep in dumper_executed_inputs(dumper, module) {
        let dep_name = namify(dep.as_ref::<Module>(sys).unwrap().get_name());
        port_map.push(format!("{}_executed=inst_{}.executed", dep_name, dep_name));
      }
      for (value, _) in module_ref.ext_iter() {
        if value.get_kind() != NodeKind::Expr {
          continue;
        }
        let expr = value.as_ref::<Expr>(sys).unwrap();
        if matches!(expr.get_opcode(), Opcode::Bind | Opcode::FIFOPush) {
          continue;
        }
        let producer = namify(
          expr
            .get_module()
            .as_ref::<Module>(sys)
            .unwrap()
            .get_name(),
        );
        let port_name = dumper.external_port_name(value);
        let exposed = namify(&dumper.dump_rval(value, true));
        port_map.push(format!("{}=inst_{}.expose_{}", port_name, producer, exposed));
        port_map.push(format!(
          "{}_valid=inst_{}.valid_{}",
          port_name, producer, exposed
        ));
      }
      if is_sram {
        let payload = record.unwrap().array_writes[0]
          .as_inst::<ArrayWrite>(sys)
          .unwrap()
          .array_node();
        let payload = namify(payload.as_ref::<Array>(sys).unwrap().get_name());
        port_map.push(format!("mem_dataout=mem_{}_dataout", payload));
      }
    }
    // Array read data and handshake inputs.
    for array in sys.array_iter() {
      let array_node = array.upcast();
      if dumper.sram_payloads.contains(&array_node) {
        continue;
      }
      let name = namify(array.get_name());
      for read in dumper.analysis.ports.reads_of(&array_node) {
        let owner = read.as_ref::<Expr>(sys).unwrap().get_module();
        if owner != *module {
          continue;
        }
        let port = dumper.analysis.ports.read_port(read).unwrap();
        port_map.push(format!(
          "{}_rdata_port{}=array_writer_{}.rdata_port{}",
          name, port, name, port
        ));
      }
    }
    let mut push_targets = Vec::new();
    for push in pushes.iter() {
      let fifo = push.as_inst::<FIFOPush>(sys).unwrap().fifo().upcast();
      if !push_targets.contains(&fifo) {
        push_targets.push(fifo);
      }
      if !driven_ports.contains(&fifo) {
        driven_ports.push(fifo);
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
      port_map.push(format!(
        "fifo_{prefix}_push_ready=fifo_{prefix}_push_ready",
        prefix = prefix
      ));
    }
    for callee in call_targets.iter() {
      let callee_name = namify(callee.as_ref::<Module>(sys).unwrap().get_name());
      port_map.push(format!(
        "{name}_trigger_counter_delta_ready={name}_trigger_counter_delta_ready",
        name = callee_name
      ));
    }

    dumper.append_code(&format!(
      "inst_{} = {}({})",
      module_name,
      module_name,
      port_map.join(", ")
    ));

    // Deferred connections out of this instance.
    let mut lines = Vec::new();
    if is_sram {
      let payload = record.unwrap().array_writes[0]
        .as_inst::<ArrayWrite>(sys)
        .unwrap()
        .array_node();
      let payload = namify(payload.as_ref::<Array>(sys).unwrap().get_name());
      lines.push(format!("mem_{}_address.assign(inst_{}.mem_address)", payload, module_name));
      lines.push(format!(
        "mem_{}_write_data.assign(inst_{}.mem_write_data)",
        payload, module_name
      ));
      lines.push(format!(
        "mem_{}_write_enable.assign(inst_{}.mem_write_enable)",
        payload, module_name
      ));
      lines.push(format!(
        "mem_{}_read_enable.assign(inst_{}.mem_read_enable)",
        payload, module_name
      ));
    }
    if !is_downstream {
      lines.push(format!(
        "{}_trigger_counter_pop_ready.assign(inst_{}.executed)",
        module_name, module_name
      ));
      for port in module_ref.port_iter() {
        let popped = pops.iter().any(|x| {
          x.as_inst::<FIFOPop>(sys).unwrap().fifo().upcast() == port.upcast()
        });
        let prefix = format!("fifo_{}_{}", module_name, namify(port.get_name()));
        if popped {
          lines.push(format!(
            "{}_pop_ready.assign(inst_{}.{}_pop_ready)",
            prefix,
            module_name,
            namify(port.get_name())
          ));
        } else {
          lines.push(format!("{}_pop_ready.assign(Bits(1)(0))", prefix));
        }
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
      lines.push(format!(
        "fifo_{prefix}_push_valid.assign(inst_{m}.{prefix}_push_valid)",
        prefix = prefix,
        m = module_name
      ));
      lines.push(format!(
        "fifo_{prefix}_push_data.assign(inst_{m}.{prefix}_push_data.as_bits())",
        prefix = prefix,
        m = module_name
      ));
    }
    // Array write-back wiring per allocated port.
    for array in sys.array_iter() {
      let array_node = array.upcast();
      if dumper.sram_payloads.contains(&array_node) {
        continue;
      }
      let name = namify(array.get_name());
      if let Some(port) = dumper.analysis.ports.write_port(&array_node, module) {
        lines.push(format!(
          "aw_{name}_w_port{p}.assign(inst_{m}.{name}_w_port{p})",
          name = name,
          p = port,
          m = module_name
        ));
        lines.push(format!(
          "aw_{name}_wdata_port{p}.assign(inst_{m}.{name}_wdata_port{p})",
          name = name,
          p = port,
          m = module_name
        ));
        lines.push(format!(
          "aw_{name}_widx_port{p}.assign(inst_{m}.{name}_widx_port{p})",
          name = name,
          p = port,
          m = module_name
        ));
      }
      for read in dumper.analysis.ports.reads_of(&array_node) {
        let owner = read.as_ref::<Expr>(sys).unwrap().get_module();
        if owner != *module {
          continue;
        }
        let port = dumper.analysis.ports.read_port(read).unwrap();
        lines.push(format!(
          "aw_{name}_ridx_port{p}.assign(inst_{m}.{name}_ridx_port{p})",
          name = name,
          p = port,
          m = module_name
        ));
      }
    }
    connections.push((module_name, lines));
  }

  dumper.append_code("");
  dumper.append_code("# Deferred connections");
  for (module_name, lines) in connections {
    dumper.append_code(&format!("# Connections of {}", module_name));
    for line in lines {
      dumper.append_code(&line);
    }
  }

  // Tie off ports no one pushes into.
  for module in sys.module_iter() {
    let module_name = namify(module.get_name());
    for port in module.port_iter() {
      if driven_ports.contains(&port.upcast()) {
        continue;
      }
      let prefix = format!("fifo_{}_{}", module_name, namify(port.get_name()));
      dumper.append_code(&format!("{}_push_valid.assign(Bits(1)(0))", prefix));
      dumper.append_code(&format!(
        "{}_push_data.assign(Bits({})(0))",
        prefix,
        port.scalar_ty().get_bits()
      ));
    }
  }

  // Trigger counter deltas: the sum of every caller's trigger output. Uncalled
  // modules (the driver) self-trigger every cycle.
  dumper.append_code("");
  for module in sys.module_iter() {
    let module_node = module.upcast();
    let module_name = namify(module.get_name());
    let callers = dumper.analysis.matrix.callers_of(&module_node);
    if callers.is_empty() {
      dumper.append_code(&format!(
        "{}_trigger_counter_delta.assign(Bits(8)(1))",
        module_name
      ));
    } else {
      let terms = callers
        .iter()
        .map(|x| {
          format!(
            "inst_{}.{}_trigger",
            namify(x.as_ref::<Module>(sys).unwrap().get_name()),
            module_name
          )
        })
        .collect::<Vec<_>>();
      let sum = if terms.len() == 1 {
        terms[0].clone()
      } else {
        format!("({})", terms.join(" + "))
      };
      dumper.append_code(&format!(
        "{}_trigger_counter_delta.assign({}.as_bits(8))",
        module_name, sum
      ));
    }
  }

  // The global finish: the OR of every module that may call finish.
  let mut finish_signals = Vec::new();
  for module in ordered.iter() {
    if dumper.analysis.matrix.has_finish(module) {
      let name = namify(module.as_ref::<Module>(sys).unwrap().get_name());
      finish_signals.push(format!("inst_{}.finish", name));
    }
  }
  dumper.append_code("");
  if finish_signals.is_empty() {
    dumper.append_code("self.global_finish = Bits(1)(0)");
  } else {
    dumper.append_code(&format!("self.global_finish = {}", finish_signals.join(" | ")));
  }

  dumper.indent -= 8;
  dumper.append_code("");
  dumper.append_code("system = System([Top], name=\"Top\", output_directory=\"sv\")");
  dumper.append_code("system.compile()");
}

/// The `_executed` inputs of a downstream, mirroring the module-port generation.
fn dumper_executed_inputs(dumper: &VerilogDumper<'_>, module: &BaseNode) -> Vec<BaseNode> {
  crate::analysis::downstream_dependencies(dumper.sys, module)
}
