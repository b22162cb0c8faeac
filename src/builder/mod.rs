// The IR builder: the system owner plus the construction API.

pub mod fsm;
pub mod namer;
pub mod symbol_table;
pub mod system;
pub mod verify;

pub use fsm::Fsm;
pub use namer::namify_exprs;
pub use system::{InsertPoint, PortInfo, SysBuilder, WritePort};
pub use verify::verify;
