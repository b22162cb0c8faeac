// The hardware backend: lowers the analyzed system into a PyCDE program (one class
// per module, one per register array, a Top harness) plus the SystemVerilog FIFO and
// trigger-counter primitives it instantiates.

mod design;
mod elaborate;
mod top;
mod utils;

pub use elaborate::elaborate;
