use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use proc_macro2::Span;
use quote::quote;
use syn::Ident;

use crate::analysis::{expr_externally_used, Analysis};
use crate::backend::common::{create_and_clean_dir, read_init_file, Config};
use crate::builder::SysBuilder;
use crate::ir::node::*;
use crate::ir::visitor::Visitor;
use crate::ir::*;

use super::dumper::fifo_name;
use super::modules::ElaborateModule;
use super::utils::{dtype_to_rust_type, int_imm_dumper_impl, namify};

/// Valued expressions consumed outside their owning module, in walk order. These get an
/// `Option` cache in the simulator struct so downstream consumers observe exactly the
/// values of the producers that fired this cycle.
struct ExposureCollector<'a> {
  sys: &'a SysBuilder,
  module: BaseNode,
  exposed: Vec<(BaseNode, BaseNode)>,
  by_module: HashMap<BaseNode, Vec<BaseNode>>,
}

impl Visitor<()> for ExposureCollector<'_> {
  fn visit_module(&mut self, module: &ModuleRef<'_>) -> Option<()> {
    self.module = module.upcast();
    self.visit_block(&module.get_body())
  }

  fn visit_expr(&mut self, expr: &ExprRef<'_>) -> Option<()> {
    let node = expr.get().upcast();
    if !matches!(expr.get_opcode(), Opcode::Bind)
      && expr.get_opcode().is_valued()
      && expr_externally_used(self.sys, &node, true)
    {
      self.exposed.push((node, self.module));
      self.by_module.entry(self.module).or_default().push(node);
    }
    None
  }
}

fn gather_exposures(sys: &SysBuilder) -> ExposureCollector<'_> {
  let mut collector = ExposureCollector {
    sys,
    module: BaseNode::unknown(),
    exposed: Vec::new(),
    by_module: HashMap::new(),
  };
  collector.enter(sys);
  collector
}

fn dram_modules(sys: &SysBuilder) -> Vec<BaseNode> {
  sys
    .downstream_iter()
    .filter(|x| matches!(x.get_kind(), ModuleKind::Dram(_)))
    .map(|x| x.upcast())
    .collect()
}

/// Dump `src/simulator.rs`: the `Simulator` state struct, the per-module gated step
/// functions, and the evaluate-then-tick main loop.
#[allow(clippy::too_many_lines)]
fn dump_simulator(
  sys: &SysBuilder,
  analysis: &Analysis,
  config: &Config,
  fd: &mut File,
) -> std::io::Result<()> {
  let exposures = gather_exposures(sys);
  let drams = dram_modules(sys);

  fd.write_all(
    quote! {
      use sim_runtime::*;
      use sim_runtime::num_bigint::{BigInt, BigUint};
      use sim_runtime::rand::seq::SliceRandom;
      use std::collections::HashMap;
      use std::collections::VecDeque;

      use crate::modules;
    }
    .to_string()
    .as_bytes(),
  )?;
  fd.write_all(b"\n\n")?;

  let mut init = Vec::<String>::new();
  let mut downstream_reset = Vec::<String>::new();
  let mut registers = Vec::<String>::new();

  // The state struct.
  fd.write_all(b"pub struct Simulator {\n")?;
  fd.write_all(b"  pub stamp: usize,\n")?;
  fd.write_all(b"  pub request_stamp_map_table: HashMap<i64, usize>,\n")?;
  init.push("stamp: 0,".into());
  init.push("request_stamp_map_table: HashMap::new(),".into());
  for dram in drams.iter() {
    let name = namify(dram.as_ref::<Module>(sys).unwrap().get_name());
    fd.write_all(format!("  pub mi_{}: MemoryInterface,\n", name).as_bytes())?;
    fd.write_all(format!("  pub {}_response: Response,\n", name).as_bytes())?;
    init.push(format!(
      "mi_{}: unsafe {{ MemoryInterface::new_from_cwrapper_path().expect(\"memory shim\") }},",
      name
    ));
    init.push(format!("{}_response: Response::default(),", name));
  }
  for array in sys.array_iter() {
    let name = namify(array.get_name());
    let ty = dtype_to_rust_type(&array.scalar_ty());
    let ports = analysis.ports.write_port_count(&array.upcast());
    fd.write_all(format!("  pub {}: Array<{}>,\n", name, ty).as_bytes())?;
    if let Some(values) = array.get_initializer() {
      let values = values
        .iter()
        .map(|x| int_imm_dumper_impl(&array.scalar_ty(), *x))
        .collect::<Vec<_>>()
        .join(", ");
      init.push(format!(
        "{}: Array::new_with_init_and_ports(vec![{}], {}),",
        name, values, ports
      ));
    } else {
      init.push(format!(
        "{}: Array::new_with_ports({}, {}),",
        name,
        array.get_size(),
        ports
      ));
    }
    registers.push(name);
  }
  for module in sys.module_iter().chain(sys.downstream_iter()) {
    let name = namify(module.get_name());
    fd.write_all(format!("  pub {}_triggered: bool,\n", name).as_bytes())?;
    init.push(format!("{}_triggered: false,", name));
    downstream_reset.push(format!("self.{}_triggered = false;", name));
    if !module.is_downstream() {
      fd.write_all(format!("  pub {}_event: VecDeque<usize>,\n", name).as_bytes())?;
      init.push(format!("{}_event: VecDeque::new(),", name));
      for port in module.port_iter() {
        let fifo = fifo_name(sys, &port);
        let ty = dtype_to_rust_type(&port.scalar_ty());
        fd.write_all(format!("  pub {}: FIFO<{}>,\n", fifo, ty).as_bytes())?;
        init.push(format!("{}: FIFO::new(),", fifo));
        registers.push(fifo);
      }
    }
  }
  for (expr, _) in exposures.exposed.iter() {
    let name = namify(&expr.as_ref::<Expr>(sys).unwrap().get_name());
    let ty = dtype_to_rust_type(&expr.get_dtype(sys).unwrap());
    fd.write_all(format!("  pub {}_value: Option<{}>,\n", name, ty).as_bytes())?;
    init.push(format!("{}_value: None,", name));
    downstream_reset.push(format!("self.{}_value = None;", name));
  }
  fd.write_all(b"}\n\n")?;

  // Construction and the per-cycle maintenance methods.
  fd.write_all(b"impl Simulator {\n")?;
  fd.write_all(b"  pub fn new() -> Self {\n    Simulator {\n")?;
  for line in init.iter() {
    fd.write_all(format!("      {}\n", line).as_bytes())?;
  }
  fd.write_all(b"    }\n  }\n\n")?;

  fd.write_all(
    quote! {
      fn event_valid(&self, event: &VecDeque<usize>) -> bool {
        event.front().map_or(false, |x| *x <= self.stamp)
      }
    }
    .to_string()
    .as_bytes(),
  )?;
  fd.write_all(b"\n\n  pub fn reset_downstream(&mut self) {\n")?;
  for line in downstream_reset.iter() {
    fd.write_all(format!("    {}\n", line).as_bytes())?;
  }
  fd.write_all(b"  }\n\n")?;

  fd.write_all(b"  pub fn tick_registers(&mut self) {\n")?;
  for reg in registers.iter() {
    fd.write_all(format!("    self.{}.tick(self.stamp);\n", reg).as_bytes())?;
  }
  fd.write_all(b"  }\n\n")?;

  fd.write_all(b"  pub fn reset_dram(&mut self) {\n")?;
  for dram in drams.iter() {
    let name = namify(dram.as_ref::<Module>(sys).unwrap().get_name());
    fd.write_all(format!("    self.{}_response.valid = false;\n", name).as_bytes())?;
  }
  fd.write_all(b"  }\n\n")?;

  // Gated step functions. Sequential modules consume events; downstreams re-evaluate
  // whenever any upstream fired this cycle.
  let mut simulators = Vec::<String>::new();
  for module in sys.module_iter() {
    let name = namify(module.get_name());
    let fn_id = Ident::new(&format!("simulate_{}", name), Span::call_site());
    let event_id = Ident::new(&format!("{}_event", name), Span::call_site());
    let triggered_id = Ident::new(&format!("{}_triggered", name), Span::call_site());
    let module_id = Ident::new(&name, Span::call_site());
    let resets = exposures
      .by_module
      .get(&module.upcast())
      .map(|x| x.as_slice())
      .unwrap_or(&[])
      .iter()
      .map(|expr| {
        let value = namify(&expr.as_ref::<Expr>(sys).unwrap().get_name());
        Ident::new(&format!("{}_value", value), Span::call_site())
      })
      .collect::<Vec<_>>();
    fd.write_all(
      quote! {
        fn #fn_id(&mut self) {
          if self.event_valid(&self.#event_id) {
            let succ = modules::#module_id(self);
            if succ {
              self.#event_id.pop_front();
            } else {
              #( self.#resets = None; )*
            }
            self.#triggered_id = succ;
          }
        }
      }
      .to_string()
      .as_bytes(),
    )?;
    fd.write_all(b"\n\n")?;
    simulators.push(name);
  }
  for module in analysis.topo.iter() {
    let module = module.as_ref::<Module>(sys).unwrap();
    let name = namify(module.get_name());
    let upstreams = crate::analysis::downstream_dependencies(sys, &module.upcast());
    let conds = if upstreams.is_empty() {
      // No upstream: the OR of an empty set never fires.
      "false".to_string()
    } else {
      upstreams
        .iter()
        .map(|x| {
          format!(
            "self.{}_triggered",
            namify(x.as_ref::<Module>(sys).unwrap().get_name())
          )
        })
        .collect::<Vec<_>>()
        .join(" || ")
    };
    fd.write_all(format!("  fn simulate_{}(&mut self) {{\n", name).as_bytes())?;
    fd.write_all(format!("    if {} {{\n", conds).as_bytes())?;
    fd.write_all(format!("      let succ = modules::{}(self);\n", name).as_bytes())?;
    fd.write_all(format!("      self.{}_triggered = succ;\n", name).as_bytes())?;
    fd.write_all(b"    }\n  }\n\n")?;
  }
  fd.write_all(b"}\n\n")?;

  // The C-ABI completion callbacks of the memory shim.
  for dram in drams.iter() {
    let name = namify(dram.as_ref::<Module>(sys).unwrap().get_name());
    fd.write_all(
      format!(
        "extern \"C\" fn rust_callback_{name}(req: *mut Request, ctx: *mut \
         std::ffi::c_void) {{\n  unsafe {{\n    let sim = &mut *(ctx as *mut Simulator);\n    \
         sim.{name}_response.valid = true;\n    sim.{name}_response.addr = (*req).addr;\n  \
         }}\n}}\n\n",
        name = name
      )
      .as_bytes(),
    )?;
  }

  // The driver function of the whole simulation.
  fd.write_all(b"pub fn simulate() {\n")?;
  fd.write_all(b"  let mut sim = Simulator::new();\n")?;
  for dram in drams.iter() {
    let module = dram.as_ref::<Module>(sys).unwrap();
    let name = namify(module.get_name());
    fd.write_all(
      format!("  unsafe {{ sim.mi_{}.init(\"configs/dram_config.yaml\"); }}\n", name).as_bytes(),
    )?;
  }
  if config.random {
    fd.write_all(b"  let mut rng = rand::thread_rng();\n")?;
    fd.write_all(b"  let mut simulators: Vec<fn(&mut Simulator)> = vec![")?;
  } else {
    fd.write_all(b"  let simulators: Vec<fn(&mut Simulator)> = vec![")?;
  }
  for sim in simulators.iter() {
    fd.write_all(format!("Simulator::simulate_{}, ", sim).as_bytes())?;
  }
  fd.write_all(b"];\n")?;
  fd.write_all(b"  let downstreams: Vec<fn(&mut Simulator)> = vec![")?;
  for module in analysis.topo.iter() {
    let name = namify(module.as_ref::<Module>(sys).unwrap().get_name());
    fd.write_all(format!("Simulator::simulate_{}, ", name).as_bytes())?;
  }
  fd.write_all(b"];\n")?;

  // Memory initialization images.
  for module in sys.downstream_iter() {
    let params = match module.get_kind() {
      ModuleKind::Sram(params) => params.clone(),
      _ => continue,
    };
    let init_file = match &params.init_file {
      Some(init_file) => init_file.clone(),
      None => continue,
    };
    let path = config.resource_base.join(&init_file);
    // Surface malformed images at elaboration time already; bad lines only warn.
    match read_init_file(&path, params.depth) {
      Ok(_) => {}
      Err(err) => log::warn!("Cannot read memory image {}: {}", path.display(), err),
    }
    let payload = sram_payload(sys, analysis, &module.upcast());
    let payload = namify(payload.as_ref::<Array>(sys).unwrap().get_name());
    fd.write_all(
      format!(
        "  load_hex_file(&mut sim.{}.payload, {:?});\n",
        payload,
        path.to_str().unwrap()
      )
      .as_bytes(),
    )?;
  }

  let sim_threshold = config.sim_threshold;
  let idle_threshold = config.idle_threshold;
  if sys.has_driver() {
    fd.write_all(
      format!(
        "  for i in 1..={} {{ sim.driver_event.push_back(i * 100); }}\n",
        sim_threshold
      )
      .as_bytes(),
    )?;
  }
  if let Some(testbench) = sys.get_module("testbench") {
    let cycles = testbench
      .get_body()
      .body_iter()
      .filter_map(|x| match x.get_kind() {
        NodeKind::Block => x.as_ref::<Block>(sys).unwrap().get_cycle(),
        _ => None,
      })
      .collect::<Vec<_>>();
    if !cycles.is_empty() {
      let cycles = cycles.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", ");
      fd.write_all(
        format!(
          "  for cycle in [{}] {{ sim.testbench_event.push_back(cycle * 100); }}\n",
          cycles
        )
        .as_bytes(),
      )?;
    }
  }

  let any_triggered = sys
    .module_iter()
    .map(|x| format!("sim.{}_triggered", namify(x.get_name())))
    .collect::<Vec<_>>()
    .join(" || ");
  let any_triggered = if any_triggered.is_empty() {
    "false".to_string()
  } else {
    any_triggered
  };
  let shuffle = if config.random {
    "    simulators.shuffle(&mut rng);\n"
  } else {
    ""
  };
  let mut dram_ticks = String::new();
  for dram in drams.iter() {
    let name = namify(dram.as_ref::<Module>(sys).unwrap().get_name());
    dram_ticks.push_str(&format!(
      "    unsafe {{ sim.mi_{name}.frontend_tick(); sim.mi_{name}.memory_system_tick(); }}\n",
      name = name
    ));
  }
  fd.write_all(
    format!(
      r#"  let mut idle_count = 0;
  for i in 1..={sim_threshold} {{
    sim.stamp = i * 100;
    sim.reset_downstream();
{shuffle}    for simulate in simulators.iter() {{
      simulate(&mut sim);
    }}
    for simulate in downstreams.iter() {{
      simulate(&mut sim);
    }}
    let any_module_triggered = {any_triggered};
    if !any_module_triggered {{
      idle_count += 1;
      if idle_count >= {idle_threshold} {{
        println!("Simulation stopped due to reaching idle threshold of {idle_threshold}");
        break;
      }}
    }} else {{
      idle_count = 0;
    }}
    // The tick phase strictly follows the evaluate phase: every mutation committed in
    // this cycle becomes visible at the start of the next one.
    sim.stamp += 50;
    sim.tick_registers();
    sim.reset_dram();
{dram_ticks}  }}
}}
"#,
      sim_threshold = sim_threshold,
      idle_threshold = idle_threshold,
      shuffle = shuffle,
      any_triggered = any_triggered,
      dram_ticks = dram_ticks,
    )
    .as_bytes(),
  )?;
  Ok(())
}

/// The hidden payload array of an SRAM: the target of its first write site.
fn sram_payload(sys: &SysBuilder, analysis: &Analysis, module: &BaseNode) -> BaseNode {
  let record = analysis
    .matrix
    .record(module)
    .expect("SRAM with no interaction record");
  let write = record
    .array_writes
    .first()
    .expect("SRAM with no payload write");
  write
    .as_inst::<crate::ir::instructions::ArrayWrite>(sys)
    .unwrap()
    .array_node()
}

fn dump_modules(sys: &SysBuilder, analysis: &Analysis, fd: &mut File) -> std::io::Result<()> {
  fd.write_all(b"#![allow(unused)]\n")?;
  fd.write_all(
    quote! {
      use sim_runtime::*;
      use sim_runtime::num_bigint::{BigInt, BigUint};

      use crate::simulator::*;
    }
    .to_string()
    .as_bytes(),
  )?;
  fd.write_all(b"\n")?;
  let mut em = ElaborateModule::new(sys, analysis);
  for module in sys.module_iter().chain(sys.downstream_iter()) {
    if let Some(buffer) = em.visit_module(&module) {
      fd.write_all(buffer.as_bytes())?;
    }
  }
  Ok(())
}

fn dump_main(fd: &mut File) -> std::io::Result<()> {
  let src = quote! {
    mod modules;
    mod simulator;

    fn main() {
      simulator::simulate();
    }
  };
  fd.write_all(src.to_string().as_bytes())?;
  fd.write_all(b"\n")
}

fn dump_manifest(sys: &SysBuilder, config: &Config, dir: &PathBuf) -> std::io::Result<()> {
  let mut cargo = File::create(dir.join("Cargo.toml"))?;
  writeln!(cargo, "[package]")?;
  writeln!(cargo, "name = \"{}_simulator\"", sys.get_name())?;
  writeln!(cargo, "version = \"0.1.0\"")?;
  writeln!(cargo, "edition = \"2021\"")?;
  writeln!(cargo)?;
  writeln!(cargo, "[dependencies]")?;
  writeln!(
    cargo,
    "sim-runtime = {{ path = {:?} }}",
    config.runtime_path.to_str().unwrap()
  )?;
  let mut fmt = File::create(dir.join("rustfmt.toml"))?;
  writeln!(fmt, "max_width = 100")?;
  writeln!(fmt, "tab_spaces = 2")?;
  Ok(())
}

/// Emit the whole simulator crate. Returns the path of the generated manifest.
pub fn elaborate(
  sys: &SysBuilder,
  analysis: &Analysis,
  config: &Config,
) -> std::io::Result<PathBuf> {
  let dir = config.dir_name(sys, "simulator");
  create_and_clean_dir(&dir, config.override_dump)?;
  fs::create_dir_all(dir.join("src"))?;
  log::info!("Writing simulator code to rust project: {}", dir.display());
  dump_manifest(sys, config, &dir)?;
  {
    let mut fd = File::create(dir.join("src/modules.rs"))?;
    dump_modules(sys, analysis, &mut fd)?;
  }
  {
    let mut fd = File::create(dir.join("src/simulator.rs"))?;
    dump_simulator(sys, analysis, config, &mut fd)?;
  }
  {
    let mut fd = File::create(dir.join("src/main.rs"))?;
    dump_main(&mut fd)?;
  }
  Ok(dir.join("Cargo.toml"))
}
