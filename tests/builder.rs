use eventide::builder::{verify, PortInfo, SysBuilder};
use eventide::ir::expr::subcode;
use eventide::ir::{DataType, Expr, Module, Opcode, RecordLayout, Timing};

fn u32_ty() -> DataType {
  DataType::uint_ty(32)
}

#[test]
fn helloworld_constructs() {
  let mut sys = SysBuilder::new("helloworld");
  let driver = sys.create_module("driver", vec![]);
  sys.in_module(driver, |sys| {
    sys.create_log("Hello, world!", vec![]);
  });
  verify(&sys);
  let dump = format!("{}", sys);
  assert!(dump.contains("module driver"));
  assert!(dump.contains("log("));
}

#[test]
fn predicate_carry_is_the_conjunction() {
  let mut sys = SysBuilder::new("carry");
  let driver = sys.create_module("driver", vec![]);
  let arr = sys.create_array(u32_ty(), "mem", 4, None);
  sys.enter_module(driver);
  let zero = sys.get_const_int(u32_ty(), 0);
  let one = sys.get_const_int(u32_ty(), 1);
  let c1 = sys.create_compare(subcode::Compare::IGT, one, zero);
  let c2 = sys.create_compare(subcode::Compare::ILT, zero, one);
  let write = {
    sys.enter_condition(c1);
    sys.enter_condition(c2);
    let w = sys.create_array_write(arr, zero, one);
    sys.exit_condition();
    sys.exit_condition();
    w
  };
  sys.exit_module();
  verify(&sys);

  let meta = write
    .as_ref::<Expr>(&sys)
    .unwrap()
    .get_meta_cond()
    .expect("guarded write must carry its predicate");
  let carry = meta.as_ref::<Expr>(&sys).unwrap();
  assert!(matches!(
    carry.get_opcode(),
    Opcode::Binary {
      binop: subcode::Binary::BitwiseAnd
    }
  ));
  assert_eq!(carry.get_operand_value(0).unwrap(), c1);
  assert_eq!(carry.get_operand_value(1).unwrap(), c2);
}

#[test]
fn single_condition_carries_itself() {
  let mut sys = SysBuilder::new("carry1");
  let driver = sys.create_module("driver", vec![]);
  let arr = sys.create_array(u32_ty(), "mem", 4, None);
  sys.enter_module(driver);
  let zero = sys.get_const_int(u32_ty(), 0);
  let one = sys.get_const_int(u32_ty(), 1);
  let cond = sys.create_compare(subcode::Compare::EQ, zero, zero);
  let mut write = None;
  sys.in_condition(cond, |sys| {
    write = Some(sys.create_array_write(arr, zero, one));
  });
  sys.exit_module();
  let meta = write.unwrap().as_ref::<Expr>(&sys).unwrap().get_meta_cond();
  assert_eq!(meta, Some(cond));
}

#[test]
fn unguarded_effects_have_no_carry() {
  let mut sys = SysBuilder::new("nocarry");
  let driver = sys.create_module("driver", vec![]);
  let arr = sys.create_array(u32_ty(), "mem", 4, None);
  sys.enter_module(driver);
  let zero = sys.get_const_int(u32_ty(), 0);
  let write = sys.create_array_write(arr, zero, zero);
  sys.exit_module();
  assert_eq!(write.as_ref::<Expr>(&sys).unwrap().get_meta_cond(), None);
}

#[test]
fn array_reads_are_reused_within_a_scope() {
  let mut sys = SysBuilder::new("readcache");
  let driver = sys.create_module("driver", vec![]);
  let arr = sys.create_array(u32_ty(), "mem", 4, None);
  sys.enter_module(driver);
  let zero = sys.get_const_int(u32_ty(), 0);
  let a = sys.create_array_read(arr, zero);
  let b = sys.create_array_read(arr, zero);
  assert_eq!(a, b);
  // An enclosing-scope read is reused inside a nested condition...
  let cond = sys.create_compare(subcode::Compare::EQ, zero, zero);
  sys.enter_condition(cond);
  let c = sys.create_array_read(arr, zero);
  assert_eq!(a, c);
  sys.exit_condition();
  sys.exit_module();

  // ...but a read cached in an exited scope is not.
  let consumer = sys.create_module("consumer", vec![]);
  sys.enter_module(consumer);
  let cond = {
    let one = sys.get_const_int(u32_ty(), 1);
    sys.create_compare(subcode::Compare::EQ, one, one)
  };
  let idx = sys.get_const_int(u32_ty(), 2);
  sys.enter_condition(cond);
  let inner = sys.create_array_read(arr, idx);
  sys.exit_condition();
  let outer = sys.create_array_read(arr, idx);
  assert_ne!(inner, outer);
  sys.exit_module();
}

#[test]
#[should_panic(expected = "dangling condition scope")]
fn unbalanced_condition_scope_panics() {
  let mut sys = SysBuilder::new("dangling");
  let driver = sys.create_module("driver", vec![]);
  sys.enter_module(driver);
  let zero = sys.get_const_int(DataType::uint_ty(1), 0);
  let cond = sys.create_compare(subcode::Compare::EQ, zero, zero);
  sys.enter_condition(cond);
  sys.exit_module();
}

#[test]
#[should_panic(expected = "cannot set it twice")]
fn timing_policy_is_set_once() {
  let mut sys = SysBuilder::new("timing");
  let m = sys.create_module("worker", vec![PortInfo::new("a", u32_ty())]);
  sys.enter_module(m);
  sys.pop_all_ports(false);
  {
    let mut module = m.as_mut::<Module>(&mut sys).unwrap();
    module.set_timing(Timing::Backpressure);
  }
}

#[test]
fn pop_all_ports_fixes_the_policy() {
  let mut sys = SysBuilder::new("timing2");
  let systolic = sys.create_module("systolic", vec![PortInfo::new("a", u32_ty())]);
  sys.in_module(systolic, |sys| {
    sys.pop_all_ports(false);
  });
  let backpressure = sys.create_module("backpressure", vec![PortInfo::new("a", u32_ty())]);
  sys.in_module(backpressure, |sys| {
    sys.pop_all_ports(true);
  });
  assert_eq!(
    sys.get_module("systolic").unwrap().get_timing(),
    Some(Timing::Systolic)
  );
  assert_eq!(
    sys.get_module("backpressure").unwrap().get_timing(),
    Some(Timing::Backpressure)
  );
}

#[test]
fn bind_type_check_leaves_no_partial_state() {
  let mut sys = SysBuilder::new("bind");
  let callee = sys.create_module(
    "callee",
    vec![
      PortInfo::new("a", u32_ty()),
      PortInfo::new("b", DataType::uint_ty(8)),
    ],
  );
  let caller = sys.create_module("caller", vec![]);
  sys.enter_module(caller);
  let ok = sys.get_const_int(u32_ty(), 1);
  let bad = sys.get_const_int(DataType::uint_ty(16), 2);
  let before = sys
    .get_module("caller")
    .unwrap()
    .get_body()
    .get_num_exprs();
  let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
    // `a` matches but `b` does not; the bind must reject before emitting anything.
    sys.create_bind(callee, vec![("a", ok), ("b", bad)]);
  }));
  assert!(result.is_err());
  let after = sys
    .get_module("caller")
    .unwrap()
    .get_body()
    .get_num_exprs();
  assert_eq!(before, after, "a failed bind must not leave partial pushes");
  sys.exit_module();
}

#[test]
#[should_panic(expected = "partially bound")]
fn async_call_requires_full_binding() {
  let mut sys = SysBuilder::new("partial");
  let callee = sys.create_module(
    "callee",
    vec![
      PortInfo::new("a", u32_ty()),
      PortInfo::new("b", u32_ty()),
    ],
  );
  let caller = sys.create_module("caller", vec![]);
  sys.enter_module(caller);
  let v = sys.get_const_int(u32_ty(), 1);
  let bind = sys.create_bind(callee, vec![("a", v)]);
  sys.create_async_call(bind);
}

#[test]
#[should_panic(expected = "No push found for FIFO named")]
fn fifo_depth_on_unknown_port_panics() {
  let mut sys = SysBuilder::new("depth");
  let callee = sys.create_module("callee", vec![PortInfo::new("a", u32_ty())]);
  let caller = sys.create_module("caller", vec![]);
  sys.enter_module(caller);
  let v = sys.get_const_int(u32_ty(), 1);
  let bind = sys.create_bind(callee, vec![("a", v)]);
  sys.set_fifo_depth(bind, "nonexistent", 8);
}

#[test]
#[should_panic(expected = "only downstream modules may consume foreign values")]
fn cross_module_operand_is_rejected_in_sequential_modules() {
  let mut sys = SysBuilder::new("crossmod");
  let producer = sys.create_module("producer", vec![]);
  let value = {
    sys.enter_module(producer);
    let one = sys.get_const_int(u32_ty(), 1);
    let v = sys.create_binary(subcode::Binary::Add, one, one);
    sys.exit_module();
    v
  };
  let consumer = sys.create_module("consumer", vec![]);
  sys.enter_module(consumer);
  let one = sys.get_const_int(u32_ty(), 1);
  sys.create_binary(subcode::Binary::Add, value, one);
}

#[test]
fn downstreams_may_consume_foreign_values() {
  let mut sys = SysBuilder::new("downstream");
  let producer = sys.create_module("producer", vec![]);
  let value = {
    sys.enter_module(producer);
    let one = sys.get_const_int(u32_ty(), 1);
    let v = sys.create_binary(subcode::Binary::Add, one, one);
    sys.exit_module();
    v
  };
  let ds = sys.create_downstream("combiner");
  sys.in_module(ds, |sys| {
    let one = sys.get_const_int(u32_ty(), 1);
    sys.create_binary(subcode::Binary::Add, value, one);
  });
  let module = sys.get_module("combiner").unwrap();
  assert!(module.ext_iter().any(|(ext, _)| *ext == value));
}

#[test]
#[should_panic(expected = "Type mismatch in array write")]
fn array_write_type_mismatch_panics() {
  let mut sys = SysBuilder::new("wmismatch");
  let driver = sys.create_module("driver", vec![]);
  let arr = sys.create_array(u32_ty(), "mem", 4, None);
  sys.enter_module(driver);
  let zero = sys.get_const_int(u32_ty(), 0);
  let bad = sys.get_const_int(DataType::uint_ty(8), 1);
  sys.create_array_write(arr, zero, bad);
}

#[test]
fn record_array_accepts_width_matched_bits() {
  let layout = RecordLayout::packed(vec![
    ("hi".into(), DataType::bits_ty(8)),
    ("lo".into(), DataType::bits_ty(8)),
  ]);
  let mut sys = SysBuilder::new("recordw");
  let driver = sys.create_module("driver", vec![]);
  let arr = sys.create_array(DataType::record(layout), "mem", 2, None);
  sys.enter_module(driver);
  let zero = sys.get_const_int(u32_ty(), 0);
  let raw = sys.get_const_int(DataType::bits_ty(16), 0xabcd);
  sys.create_array_write(arr, zero, raw);
  sys.exit_module();
}

#[test]
fn record_field_access_desugars_to_slice() {
  let layout = RecordLayout::packed(vec![
    ("hi".into(), DataType::uint_ty(8)),
    ("lo".into(), DataType::bits_ty(8)),
  ]);
  let mut sys = SysBuilder::new("recordf");
  let driver = sys.create_module("driver", vec![]);
  sys.enter_module(driver);
  let value = sys.get_const_int(DataType::record(layout.clone()), 0x1234);
  let hi = sys.get_record_field(value, "hi");
  // `hi` is a typed field: slice then bitcast back to its declared type.
  let hi_expr = hi.as_ref::<Expr>(&sys).unwrap();
  assert!(matches!(hi_expr.get_opcode(), Opcode::Cast { .. }));
  let lo = sys.get_record_field(value, "lo");
  let lo_expr = lo.as_ref::<Expr>(&sys).unwrap();
  assert!(matches!(lo_expr.get_opcode(), Opcode::Slice));
  sys.exit_module();
}

#[test]
fn deterministic_naming_across_identical_builds() {
  let build = || {
    let mut sys = SysBuilder::new("naming");
    let driver = sys.create_module("driver", vec![]);
    sys.in_module(driver, |sys| {
      let a = sys.get_const_int(u32_ty(), 1);
      let b = sys.get_const_int(u32_ty(), 2);
      let c = sys.create_binary(subcode::Binary::Add, a, b);
      let d = sys.create_binary(subcode::Binary::Add, c, b);
      sys.create_binary(subcode::Binary::Mul, c, d);
    });
    eventide::builder::namify_exprs(&mut sys);
    format!("{}", sys)
  };
  let first = build();
  let second = build();
  assert_eq!(first, second);
  assert!(first.contains("add"));
  assert!(first.contains("add_1"));
  assert!(first.contains("mul"));
}

#[test]
fn binary_type_inference_rules() {
  use eventide::ir::Typed;
  let mut sys = SysBuilder::new("types");
  let driver = sys.create_module("driver", vec![]);
  sys.enter_module(driver);
  let a = sys.get_const_int(u32_ty(), 3);
  let b = sys.get_const_int(DataType::uint_ty(8), 4);
  let add = sys.create_binary(subcode::Binary::Add, a, b);
  assert_eq!(add.as_ref::<Expr>(&sys).unwrap().dtype(), u32_ty());
  let mul = sys.create_binary(subcode::Binary::Mul, a, b);
  assert_eq!(
    mul.as_ref::<Expr>(&sys).unwrap().dtype(),
    DataType::uint_ty(40)
  );
  let shl = sys.create_binary(subcode::Binary::Shl, a, b);
  assert_eq!(
    shl.as_ref::<Expr>(&sys).unwrap().dtype(),
    DataType::bits_ty(32)
  );
  let cmp = sys.create_compare(subcode::Compare::ILT, a, b);
  assert_eq!(
    cmp.as_ref::<Expr>(&sys).unwrap().dtype(),
    DataType::bits_ty(1)
  );
  sys.exit_module();
}

#[test]
fn fsm_desugars_to_condition_blocks() {
  use eventide::builder::Fsm;
  let mut sys = SysBuilder::new("fsm");
  let driver = sys.create_module("driver", vec![]);
  let state = sys.create_array(DataType::bits_ty(1), "state", 1, None);
  sys.enter_module(driver);
  let one = sys.get_const_int(DataType::uint_ty(1), 1);
  let go = sys.create_compare(subcode::Compare::EQ, one, one);
  let fsm = Fsm::new(state, vec![("idle", vec![(go, "busy")]), ("busy", vec![(go, "idle")])]);
  assert_eq!(fsm.state_bits(), 1);
  assert_eq!(fsm.state_value("idle"), 0);
  assert_eq!(fsm.state_value("busy"), 1);
  let mut actions = Vec::new();
  fsm.generate(&mut sys, |_, name| actions.push(name.to_string()));
  sys.exit_module();
  assert_eq!(actions, vec!["idle".to_string(), "busy".to_string()]);
  let dump = format!("{}", sys);
  // Two state scopes, each containing a transition scope writing the state register.
  assert!(dump.matches("when ").count() >= 4);
  assert!(dump.contains("state["));
}
