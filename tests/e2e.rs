use std::fs;

use eventide::analysis::Analysis;
use eventide::backend::{self, Config};
use eventide::builder::{namify_exprs, verify, PortInfo, SysBuilder};
use eventide::ir::expr::subcode;
use eventide::ir::DataType;

fn u16_ty() -> DataType {
  DataType::uint_ty(16)
}

/// A ping-pong pair bouncing a transformed token, a downstream observer, and a
/// testbench kick-off: most of the opcode surface in one system.
fn ping_pong(name: &str) -> SysBuilder {
  let mut sys = SysBuilder::new(name);

  let ping = sys.create_module("ping", vec![PortInfo::new("token", u16_ty())]);
  let pong = sys.create_module("pong", vec![PortInfo::new("token", u16_ty())]);

  sys.in_module(ping, |sys| {
    let token = {
      let port = sys.get_module("ping").unwrap().get_port(0).unwrap().upcast();
      let valid = sys.create_fifo_valid(port);
      sys.create_wait_until(valid);
      sys.create_fifo_pop(port)
    };
    let one = sys.get_const_int(u16_ty(), 1);
    let bumped = sys.create_binary(subcode::Binary::Add, token, one);
    let bumped = sys.create_cast(subcode::Cast::Bitcast, bumped, u16_ty());
    let low = sys.create_slice(bumped, 0, 7);
    let high = sys.create_slice(bumped, 8, 15);
    let swapped = sys.create_concat(low, high);
    let swapped = sys.create_cast(subcode::Cast::Bitcast, swapped, u16_ty());
    sys.create_log("ping: {:x} -> {:x}", vec![token, swapped]);
    let bind = sys.create_bind(pong, vec![("token", swapped)]);
    sys.create_async_call(bind);
  });

  sys.in_module(pong, |sys| {
    let token = sys.pop_all_ports(false).remove(0);
    let zero = sys.get_const_int(u16_ty(), 0);
    let is_zero = sys.create_compare(subcode::Compare::EQ, token, zero);
    let one = sys.get_const_int(u16_ty(), 1);
    let next = sys.create_select(is_zero, one, token);
    sys.in_condition(is_zero, |sys| {
      sys.create_finish();
    });
    let bind = sys.create_bind(ping, vec![("token", next)]);
    sys.create_async_call(bind);
  });

  let observer = sys.create_downstream("observer");
  sys.in_module(observer, |sys| {
    let fired = sys.create_triggered(ping);
    sys.in_condition(fired, |sys| {
      sys.create_log("observer saw ping fire", vec![]);
    });
  });

  let tb = sys.create_module("testbench", vec![]);
  sys.in_module(tb, |sys| {
    sys.at_cycle(1, |sys| {
      let seed = sys.get_const_int(u16_ty(), 0x2dc1);
      let bind = sys.create_bind(ping, vec![("token", seed)]);
      sys.set_fifo_depth(bind, "token", 4);
      sys.create_async_call(bind);
    });
  });

  namify_exprs(&mut sys);
  verify(&sys);
  sys
}

#[test]
fn the_printer_round_trips_the_structure() {
  let sys = ping_pong("ping_pong");
  let dump = format!("{}", sys);
  assert!(dump.contains("module ping"));
  assert!(dump.contains("module pong"));
  assert!(dump.contains("downstream observer"));
  assert!(dump.contains("timing: systolic"));
  assert!(dump.contains("async_call"));
  assert!(dump.contains("cycle 1 {"));
  assert!(dump.contains("intrinsic.wait_until"));
}

#[test]
fn both_backends_consume_one_analysis_snapshot() {
  let sys = ping_pong("ping_pong_both");
  let config = Config {
    sim_threshold: 200,
    ..Config::default()
  };
  let analysis = Analysis::of(&sys);
  let manifest = backend::simulator::elaborate(&sys, &analysis, &config).unwrap();
  let design = backend::verilog::elaborate(&sys, &analysis, &config).unwrap();

  let modules = fs::read_to_string(manifest.parent().unwrap().join("src/modules.rs")).unwrap();
  let code = fs::read_to_string(&design).unwrap();

  // The same async-call graph appears in both lowerings.
  assert!(modules.contains("sim.pong_event.push_back"));
  assert!(modules.contains("sim.ping_event.push_back"));
  assert!(code.contains("pong_trigger = Output(UInt(8))"));
  assert!(code.contains("ping_trigger = Output(UInt(8))"));

  // The systolic pong pops without a wait_until gate; ping waits on validity.
  assert!(modules.contains("pub fn pong"));
  assert!(code.contains("class pong(Module):"));

  // The depth hint on the testbench binding reaches the FIFO instantiation.
  assert!(code.contains("DEPTH_LOG2=4"));

  // The observer gates on ping's executed wire in hardware, and on the triggered
  // flag in the simulation.
  assert!(code.contains("ping_executed = Input(Bits(1))"));
  assert!(modules.contains("sim.ping_triggered"));
}

#[test]
fn generated_manifest_points_at_the_runtime() {
  let sys = ping_pong("ping_pong");
  let config = Config::default();
  let analysis = Analysis::of(&sys);
  let manifest = backend::simulator::elaborate(&sys, &analysis, &config).unwrap();
  let cargo = fs::read_to_string(&manifest).unwrap();
  assert!(cargo.contains("name = \"ping_pong_simulator\""));
  assert!(cargo.contains("sim-runtime"));
  let main = fs::read_to_string(manifest.parent().unwrap().join("src/main.rs")).unwrap();
  assert!(main.contains("simulator :: simulate"));
}
