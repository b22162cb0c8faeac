// The simulator backend: lowers the analyzed system into a standalone Rust crate that
// implements the cycle-accurate execution model against the external `sim-runtime`
// library.

mod dumper;
mod elaborate;
mod modules;
mod utils;

pub use elaborate::elaborate;
