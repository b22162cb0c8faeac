use crate::ir::DataType;

pub(crate) fn namify(name: &str) -> String {
  name.replace('.', "_")
}

/// The PyCDE type of an IR type. Records travel as raw bit vectors.
pub(crate) fn dump_type(dtype: &DataType) -> String {
  match dtype {
    DataType::Int(bits) => format!("SInt({})", bits),
    DataType::UInt(bits) => format!("UInt({})", bits),
    DataType::Bits(bits) => format!("Bits({})", bits),
    DataType::Record(layout) => format!("Bits({})", layout.get_bits()),
    _ => panic!("No PyCDE type for {}", dtype.to_string()),
  }
}

/// The signal-cast method producing the given type.
pub(crate) fn dump_type_cast(dtype: &DataType) -> String {
  match dtype {
    DataType::Int(bits) => format!("as_sint({})", bits),
    DataType::UInt(bits) => format!("as_uint({})", bits),
    DataType::Bits(bits) => format!("as_bits({})", bits),
    DataType::Record(layout) => format!("as_bits({})", layout.get_bits()),
    _ => panic!("No PyCDE cast for {}", dtype.to_string()),
  }
}

/// The import prologue of the generated PyCDE program, plus the wrappers of the
/// external FIFO and trigger-counter SystemVerilog primitives.
pub(crate) const HEADER: &str = r#"# Generated hardware description. Do not edit.
from pycde import (
    Clock,
    Input,
    Output,
    Module,
    Reset,
    System,
    generator,
    modparams,
)
from pycde.constructs import Mux, Reg, Wire
from pycde.signals import BitsSignal
from pycde.types import Bits, SInt, UInt, dim
from pycde.dialects import comb


@modparams
def FIFO(WIDTH, DEPTH_LOG2):
    class FIFOImpl(Module):
        module_name = "fifo"
        clk = Clock()
        rst_n = Input(Bits(1))
        push_valid = Input(Bits(1))
        push_data = Input(Bits(WIDTH))
        push_ready = Output(Bits(1))
        pop_valid = Output(Bits(1))
        pop_data = Output(Bits(WIDTH))
        pop_ready = Input(Bits(1))
    return FIFOImpl


@modparams
def TriggerCounter(WIDTH):
    class TriggerCounterImpl(Module):
        module_name = "trigger_counter"
        clk = Clock()
        rst_n = Input(Bits(1))
        delta = Input(Bits(WIDTH))
        delta_ready = Output(Bits(1))
        pop_valid = Output(Bits(1))
        pop_ready = Input(Bits(1))
    return TriggerCounterImpl


"#;

/// The FIFO handshake primitive instantiated once per module port.
pub(crate) const FIFO_SV: &str = r#"// FIFO with a push/pop handshake on both sides.
module fifo #(
    parameter WIDTH = 8,
    parameter DEPTH_LOG2 = 2
) (
  input  logic               clk,
  input  logic               rst_n,

  input  logic               push_valid,
  input  logic [WIDTH - 1:0] push_data,
  output logic               push_ready,

  output logic               pop_valid,
  output logic [WIDTH - 1:0] pop_data,
  input  logic               pop_ready
);

  localparam DEPTH = 1 << DEPTH_LOG2;

  logic [WIDTH - 1:0] q [DEPTH];
  logic [DEPTH_LOG2:0] count;
  logic [DEPTH_LOG2 - 1:0] rd_ptr, wr_ptr;

  wire do_push = push_valid && push_ready;
  wire do_pop = pop_valid && pop_ready;

  always_ff @(posedge clk or negedge rst_n) begin
    if (!rst_n) begin
      count <= '0;
      rd_ptr <= '0;
      wr_ptr <= '0;
    end else begin
      if (do_push) begin
        q[wr_ptr] <= push_data;
        wr_ptr <= wr_ptr + 1'b1;
      end
      if (do_pop) rd_ptr <= rd_ptr + 1'b1;
      count <= count + do_push - do_pop;
    end
  end

  assign push_ready = count != DEPTH;
  assign pop_valid = count != 0;
  assign pop_data = q[rd_ptr];

endmodule // fifo
"#;

/// The trigger counter: the hardware stand-in for the simulator's event queue. It
/// accumulates pending invocations (delta per cycle) and exposes a pop handshake the
/// module consumes once per executed cycle.
pub(crate) const TRIGGER_COUNTER_SV: &str = r#"// Counts pending invocations of a module.
module trigger_counter #(
    parameter WIDTH = 8
) (
  input  logic               clk,
  input  logic               rst_n,

  input  logic [WIDTH - 1:0] delta,
  output logic               delta_ready,

  output logic               pop_valid,
  input  logic               pop_ready
);

  logic [WIDTH - 1:0] count;

  wire do_pop = pop_valid && pop_ready;

  always_ff @(posedge clk or negedge rst_n) begin
    if (!rst_n) count <= '0;
    else count <= count + delta - (do_pop ? 1'b1 : 1'b0);
  end

  assign delta_ready = 1'b1;
  assign pop_valid = count != 0;

endmodule // trigger_counter
"#;
