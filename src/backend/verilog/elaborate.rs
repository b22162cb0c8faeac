use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use crate::analysis::Analysis;
use crate::backend::common::{create_and_clean_dir, Config};
use crate::builder::SysBuilder;
use crate::ir::instructions::ArrayWrite;
use crate::ir::node::*;
use crate::ir::*;

use super::design::VerilogDumper;
use super::top::generate_top;
use super::utils::{namify, FIFO_SV, HEADER, TRIGGER_COUNTER_SV};

/// The cocotb replay harness: drives clock/reset, replays the collected log
/// statements against the exposed signals, and stops on `global_finish`.
fn dump_testbench(fd: &mut File, sim_threshold: usize, logs: &[String]) -> std::io::Result<()> {
  let logs = if logs.is_empty() {
    "pass".to_string()
  } else {
    logs.join("\n        ")
  };
  write!(
    fd,
    r#"import glob
from pathlib import Path

import cocotb
from cocotb.triggers import Timer
from cocotb.runner import get_runner


@cocotb.test()
async def test_tb(dut):
    dut.clk.value = 1
    dut.rst.value = 1
    await Timer(500, units="ns")
    dut.clk.value = 0
    dut.rst.value = 0
    await Timer(500, units="ns")
    for cycle in range({}):
        dut.clk.value = 1
        await Timer(500, units="ns")
        dut.clk.value = 0
        await Timer(500, units="ns")
        {}
        if dut.global_finish.value == 1:
            break


def runner():
    sim = 'verilator'
    path = Path('./sv/hw')
    with open(path / 'filelist.f', 'r') as f:
        srcs = [path / i.strip() for i in f.readlines()]
    srcs = srcs + glob.glob('sram_blackbox_*.sv')
    srcs = srcs + ['fifo.sv', 'trigger_counter.sv']
    runner = get_runner(sim)
    runner.build(sources=srcs, hdl_toplevel='Top', always=True)
    runner.test(hdl_toplevel='Top', test_module='tb')


if __name__ == "__main__":
    runner()
"#,
    sim_threshold, logs
  )
}

/// One memory blackbox source per SRAM, loaded with `$readmemh` when an image is given.
fn dump_sram_blackboxes(
  sys: &SysBuilder,
  analysis: &Analysis,
  config: &Config,
  dir: &PathBuf,
) -> std::io::Result<()> {
  for module in sys.downstream_iter() {
    let params = match module.get_kind() {
      ModuleKind::Sram(params) => params.clone(),
      _ => continue,
    };
    let record = analysis.matrix.record(&module.upcast()).unwrap();
    let payload = record.array_writes[0]
      .as_inst::<ArrayWrite>(sys)
      .unwrap()
      .array_node();
    let array = payload.as_ref::<Array>(sys).unwrap();
    let name = namify(array.get_name());
    let data_width = params.width;
    let addr_width = array.index_bits();
    let init = match &params.init_file {
      Some(init_file) => {
        let path = config.resource_base.join(init_file);
        format!(
          "\n  initial begin\n    $readmemh(\"{}\", mem);\n  end\n",
          path.display()
        )
      }
      None => String::new(),
    };
    let mut fd = File::create(dir.join(format!("sram_blackbox_{}.sv", name)))?;
    write!(
      fd,
      r#"`ifdef SYNTHESIS
(* blackbox *)
`endif
module sram_blackbox_{name} #(
    parameter DATA_WIDTH = {data_width},
    parameter ADDR_WIDTH = {addr_width}
)(
    input clk,
    input [ADDR_WIDTH-1:0] address,
    input [DATA_WIDTH-1:0] wd,
    input banksel,
    input read,
    input write,
    output reg [DATA_WIDTH-1:0] dataout,
    input rst_n
);

  localparam DEPTH = 1 << ADDR_WIDTH;
  reg [DATA_WIDTH-1:0] mem [DEPTH-1:0];
{init}
  always @ (posedge clk) begin
    if (write & banksel) begin
      mem[address] <= wd;
    end
  end

  assign dataout = (read & banksel) ? mem[address] : {{DATA_WIDTH{{1'b0}}}};

endmodule
"#,
      name = name,
      data_width = data_width,
      addr_width = addr_width,
      init = init
    )?;
  }
  Ok(())
}

/// Emit the whole hardware project: `design.py` (the PyCDE program ending in
/// `System([Top]).compile()`), the support SystemVerilog primitives, the SRAM
/// blackboxes, and the cocotb testbench.
pub fn elaborate(
  sys: &SysBuilder,
  analysis: &Analysis,
  config: &Config,
) -> std::io::Result<PathBuf> {
  let dir = config.dir_name(sys, "verilog");
  create_and_clean_dir(&dir, config.override_dump)?;
  log::info!("Writing hardware description to {}", dir.display());

  let mut dumper = VerilogDumper::new(sys, analysis, config);

  // The modparams wrapper per SRAM blackbox goes right after the header.
  let mut blackbox_decls = String::new();
  for module in sys.downstream_iter() {
    let params = match module.get_kind() {
      ModuleKind::Sram(params) => params.clone(),
      _ => continue,
    };
    let record = analysis.matrix.record(&module.upcast()).unwrap();
    let payload = record.array_writes[0]
      .as_inst::<ArrayWrite>(sys)
      .unwrap()
      .array_node();
    let array = payload.as_ref::<Array>(sys).unwrap();
    let name = namify(array.get_name());
    blackbox_decls.push_str(&format!(
      r#"@modparams
def sramBlackbox_{name}():
    class sramBlackboxImpl(Module):
        module_name = "sram_blackbox_{name}"
        clk = Clock()
        rst_n = Input(Bits(1))
        address = Input(Bits({addr}))
        wd = Input(Bits({data}))
        banksel = Input(Bits(1))
        read = Input(Bits(1))
        write = Input(Bits(1))
        dataout = Output(Bits({data}))
    return sramBlackboxImpl


"#,
      name = name,
      addr = array.index_bits(),
      data = params.width
    ));
  }

  // Register arrays first (their classes are referenced by Top), then every module,
  // then the harness.
  for array in sys.array_iter() {
    let node = array.upcast();
    if dumper.sram_payloads.contains(&node) {
      continue;
    }
    dumper.visit_array(&node);
  }
  let modules = sys
    .modules
    .iter()
    .copied()
    .chain(sys.downstreams.iter().copied())
    .collect::<Vec<_>>();
  for module in modules {
    dumper.visit_module(&module);
  }
  dumper.is_top = true;
  generate_top(&mut dumper);
  dumper.is_top = false;

  {
    let mut fd = File::create(dir.join("design.py"))?;
    fd.write_all(HEADER.as_bytes())?;
    fd.write_all(blackbox_decls.as_bytes())?;
    fd.write_all(dumper.code.join("\n").as_bytes())?;
    fd.write_all(b"\n")?;
  }
  {
    let mut fd = File::create(dir.join("tb.py"))?;
    dump_testbench(&mut fd, config.sim_threshold, &dumper.logs)?;
  }
  fs::write(dir.join("fifo.sv"), FIFO_SV)?;
  fs::write(dir.join("trigger_counter.sv"), TRIGGER_COUNTER_SV)?;
  dump_sram_blackboxes(sys, analysis, config, &dir)?;

  Ok(dir.join("design.py"))
}
