use std::fs;
use std::path::PathBuf;

use eventide::analysis::Analysis;
use eventide::backend::{self, Config};
use eventide::builder::{namify_exprs, verify, PortInfo, SysBuilder};
use eventide::ir::expr::subcode;
use eventide::ir::DataType;

fn u32_ty() -> DataType {
  DataType::uint_ty(32)
}

fn elaborate(sys: &SysBuilder, config: &Config) -> (PathBuf, String) {
  let analysis = Analysis::of(sys);
  let design = backend::verilog::elaborate(sys, &analysis, config).unwrap();
  let code = fs::read_to_string(&design).unwrap();
  (design.parent().unwrap().to_path_buf(), code)
}

fn adder_system(name: &str) -> SysBuilder {
  let mut sys = SysBuilder::new(name);
  let adder = sys.create_module(
    "adder",
    vec![PortInfo::new("a", u32_ty()), PortInfo::new("b", u32_ty())],
  );
  sys.in_module(adder, |sys| {
    let popped = sys.pop_all_ports(true);
    let c = sys.create_binary(subcode::Binary::Add, popped[0], popped[1]);
    sys.create_log("adder: {}", vec![c]);
  });
  let driver = sys.create_module("driver", vec![]);
  sys.in_module(driver, |sys| {
    let one = sys.get_const_int(u32_ty(), 1);
    let two = sys.get_const_int(u32_ty(), 2);
    let bind = sys.create_bind(adder, vec![("a", one), ("b", two)]);
    sys.create_async_call(bind);
  });
  namify_exprs(&mut sys);
  verify(&sys);
  sys
}

#[test]
fn design_declares_classes_and_compiles_a_system() {
  let sys = adder_system("hw_adder");
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);

  assert!(code.contains("class adder(Module):"));
  assert!(code.contains("class driver(Module):"));
  assert!(code.contains("class Top(Module):"));
  assert!(code.contains("system = System([Top], name=\"Top\", output_directory=\"sv\")"));
  assert!(code.contains("system.compile()"));
}

#[test]
fn sequential_modules_gate_on_trigger_counters() {
  let sys = adder_system("hw_trigger");
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);

  // Each sequential module consumes its trigger counter...
  assert!(code.contains("trigger_counter_pop_valid = Input(Bits(1))"));
  assert!(code.contains("executed_wire = self.trigger_counter_pop_valid"));
  assert!(code.contains("self.executed = executed_wire"));
  // ...and the harness instantiates one counter per module.
  assert!(code.contains("adder_trigger_counter_inst = TriggerCounter(WIDTH=8)"));
  assert!(code.contains("driver_trigger_counter_inst = TriggerCounter(WIDTH=8)"));
  assert!(code.contains("adder_trigger_counter_pop_ready.assign(inst_adder.executed)"));
  // The adder's pending invocations come from the driver's trigger output.
  assert!(code.contains("adder_trigger_counter_delta.assign(inst_driver.adder_trigger"));
  // Uncalled modules self-trigger every cycle.
  assert!(code.contains("driver_trigger_counter_delta.assign(Bits(8)(1))"));
}

#[test]
fn backpressure_becomes_wait_until_and_pop_ready() {
  let sys = adder_system("hw_backpressure");
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);

  // validate_all_ports lowered into the executed gate.
  assert!(code.contains("a_valid"));
  assert!(code.contains("executed_wire = self.trigger_counter_pop_valid & ("));
  // Popped ports expose a pop_ready handshake driven by execution.
  assert!(code.contains("a_pop_ready = Output(Bits(1))"));
  assert!(code.contains("self.a_pop_ready = executed_wire"));
}

#[test]
fn fifo_instances_honor_depth_hints() {
  let mut sys = SysBuilder::new("hw_depth");
  let callee = sys.create_module("callee", vec![PortInfo::new("a", u32_ty())]);
  let caller = sys.create_module("caller", vec![]);
  sys.in_module(caller, |sys| {
    let one = sys.get_const_int(u32_ty(), 1);
    let bind = sys.create_bind(callee, vec![("a", one)]);
    sys.set_fifo_depth(bind, "a", 6);
    sys.create_async_call(bind);
  });
  namify_exprs(&mut sys);
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);
  assert!(code.contains("FIFO(WIDTH=32, DEPTH_LOG2=6)"));
}

#[test]
fn multi_writer_arrays_get_one_port_per_writer() {
  let mut sys = SysBuilder::new("hw_ports");
  let arr = sys.create_array(u32_ty(), "shared", 4, None);
  let w0 = sys.create_module("writer0", vec![]);
  sys.in_module(w0, |sys| {
    let zero = sys.get_const_int(u32_ty(), 0);
    let one = sys.get_const_int(u32_ty(), 1);
    sys.create_array_write(arr, zero, one);
  });
  let w1 = sys.create_module("writer1", vec![]);
  sys.in_module(w1, |sys| {
    let zero = sys.get_const_int(u32_ty(), 0);
    let two = sys.get_const_int(u32_ty(), 2);
    sys.create_array_write(arr, zero, two);
  });
  namify_exprs(&mut sys);
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);

  // The array class carries both write bundles, applied in ascending port order so
  // the highest port index wins same-cycle conflicts.
  assert!(code.contains("class shared(Module):"));
  assert!(code.contains("w_port0 = Input(Bits(1))"));
  assert!(code.contains("w_port1 = Input(Bits(1))"));
  let p0 = code.find("element_value = Mux(hit_port0").unwrap();
  let p1 = code.find("element_value = Mux(hit_port1").unwrap();
  assert!(p0 < p1);
  // Each writer drives its own allocated port.
  assert!(code.contains("shared_w_port0 = Output(Bits(1))"));
  assert!(code.contains("shared_w_port1 = Output(Bits(1))"));
  assert!(code.contains("aw_shared_w_port0.assign(inst_writer0.shared_w_port0)"));
  assert!(code.contains("aw_shared_w_port1.assign(inst_writer1.shared_w_port1)"));
}

#[test]
fn partitioned_arrays_become_independent_registers() {
  let mut sys = SysBuilder::new("hw_partition");
  let arr = sys.create_array(u32_ty(), "lanes", 4, None);
  sys.set_array_partitioned(arr);
  let w0 = sys.create_module("lane0", vec![]);
  sys.in_module(w0, |sys| {
    let zero = sys.get_const_int(u32_ty(), 0);
    let one = sys.get_const_int(u32_ty(), 1);
    sys.create_array_write(arr, zero, one);
  });
  let w1 = sys.create_module("lane1", vec![]);
  sys.in_module(w1, |sys| {
    let one = sys.get_const_int(u32_ty(), 1);
    let two = sys.get_const_int(u32_ty(), 2);
    sys.create_array_write(arr, one, two);
  });
  namify_exprs(&mut sys);
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);
  // One standalone register per element instead of one dim register.
  assert!(code.contains("element_regs"));
  assert!(code.contains("elem = Reg(UInt(32)"));
  assert!(!code.contains("data_reg = Reg(dim(UInt(32), 4)"));
}

#[test]
fn guarded_writes_mux_on_their_predicates() {
  let mut sys = SysBuilder::new("hw_pred");
  let arr = sys.create_array(u32_ty(), "regs", 2, None);
  let driver = sys.create_module("driver", vec![]);
  sys.in_module(driver, |sys| {
    let zero = sys.get_const_int(u32_ty(), 0);
    let one = sys.get_const_int(u32_ty(), 1);
    let cond = sys.create_compare(subcode::Compare::EQ, zero, zero);
    sys.in_condition(cond, |sys| {
      sys.create_array_write(arr, zero, one);
    });
  });
  namify_exprs(&mut sys);
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);

  // The write enable is the predicate under the executed gate.
  assert!(code.contains("self.regs_w_port0 = executed_wire & ("));
  assert!(code.contains("self.regs_wdata_port0"));
  assert!(code.contains("self.regs_widx_port0"));
}

#[test]
fn downstream_modules_or_their_upstream_executed() {
  let mut sys = SysBuilder::new("hw_downstream");
  let producer = sys.create_module("producer", vec![]);
  let value = {
    sys.enter_module(producer);
    let one = sys.get_const_int(u32_ty(), 1);
    let v = sys.create_binary(subcode::Binary::Add, one, one);
    sys.exit_module();
    v
  };
  let ds = sys.create_downstream("sink");
  sys.in_module(ds, |sys| {
    let one = sys.get_const_int(u32_ty(), 1);
    sys.create_binary(subcode::Binary::Add, value, one);
  });
  namify_exprs(&mut sys);
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);

  // The downstream executes exactly when an upstream fired this cycle.
  assert!(code.contains("producer_executed = Input(Bits(1))"));
  assert!(code.contains("executed_wire = (self.producer_executed)"));
  // The foreign value arrives as an expose/valid pair wired from the producer.
  assert!(code.contains("= Input(UInt(32))"));
  assert!(code.contains("expose_"));
  assert!(code.contains("producer_executed=inst_producer.executed"));
}

#[test]
fn finish_intrinsics_or_into_global_finish() {
  let mut sys = SysBuilder::new("hw_finish");
  let driver = sys.create_module("driver", vec![]);
  sys.in_module(driver, |sys| {
    let one = sys.get_const_int(DataType::uint_ty(1), 1);
    let cond = sys.create_compare(subcode::Compare::EQ, one, one);
    sys.in_condition(cond, |sys| {
      sys.create_finish();
    });
  });
  namify_exprs(&mut sys);
  let config = Config::default();
  let (_, code) = elaborate(&sys, &config);
  assert!(code.contains("& executed_wire)"));
  assert!(code.contains("self.global_finish = inst_driver.finish"));
}

#[test]
fn support_primitives_are_emitted() {
  let sys = adder_system("hw_files");
  let config = Config::default();
  let (dir, _) = elaborate(&sys, &config);
  let fifo = fs::read_to_string(dir.join("fifo.sv")).unwrap();
  assert!(fifo.contains("module fifo #("));
  assert!(fifo.contains("push_valid"));
  let counter = fs::read_to_string(dir.join("trigger_counter.sv")).unwrap();
  assert!(counter.contains("module trigger_counter #("));
  let tb = fs::read_to_string(dir.join("tb.py")).unwrap();
  assert!(tb.contains("async def test_tb(dut):"));
  assert!(tb.contains("global_finish"));
}

#[test]
fn logs_replay_in_the_testbench() {
  let sys = adder_system("hw_logs");
  let config = Config::default();
  let (dir, _) = elaborate(&sys, &config);
  let tb = fs::read_to_string(dir.join("tb.py")).unwrap();
  // The adder's log line replays from its exposed value, guarded by validity.
  assert!(tb.contains("dut.adder.valid_"));
  assert!(tb.contains("dut.adder.expose_"));
  assert!(tb.contains("adder: "));
}

#[test]
fn sram_lowers_to_a_memory_blackbox() {
  let mut sys = SysBuilder::new("hw_sram");
  let driver = sys.create_module("driver", vec![]);
  let (we, re, addr, wdata) = {
    sys.enter_module(driver);
    let t = sys.get_const_int(DataType::bits_ty(1), 1);
    let f = sys.get_const_int(DataType::bits_ty(1), 0);
    let addr = sys.get_const_int(DataType::uint_ty(8), 3);
    let wdata = sys.get_const_int(DataType::bits_ty(32), 0xdead);
    // Anchor the handles in the driver so the SRAM sees them as upstream values.
    let we = sys.create_binary(subcode::Binary::BitwiseAnd, t, t);
    let re = sys.create_binary(subcode::Binary::BitwiseAnd, f, t);
    let addr = sys.create_binary(subcode::Binary::Add, addr, addr);
    let addr = sys.create_cast(subcode::Cast::ZExt, addr, DataType::uint_ty(8));
    let wdata = sys.create_binary(subcode::Binary::BitwiseOr, wdata, wdata);
    sys.exit_module();
    (we, re, addr, wdata)
  };
  let (sram, _rdata) =
    sys.create_sram("buffer", 32, 256, Some("image.hex".into()), we, re, addr, wdata);
  let _ = sram;
  namify_exprs(&mut sys);
  let config = Config::default();
  let (dir, code) = elaborate(&sys, &config);

  assert!(code.contains("sramBlackbox_buffer_val"));
  assert!(code.contains("mem_dataout = Input(Bits(32))"));
  assert!(code.contains("self.mem_write_enable"));
  assert!(code.contains("self.mem_read_enable = Bits(1)(1)"));
  let blackbox = fs::read_to_string(dir.join("sram_blackbox_buffer_val.sv")).unwrap();
  assert!(blackbox.contains("module sram_blackbox_buffer_val"));
  assert!(blackbox.contains("$readmemh"));
}
